//! Supervisor: connects the shared clients, provisions collections, and
//! keeps one watcher task per configured collection alive.

use crate::config::{Collection, Settings};
use crate::metrics::Metrics;
use crate::mongo::provision::{CreateCollectionOptions, Provisioner};
use crate::mongo::watcher::{self, Watcher};
use lapin::{Connection, ConnectionProperties};
use mongodb::Client;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not connect to MongoDB: {0}")]
    Mongo(#[from] mongodb::error::Error),
    #[error("could not connect to RabbitMQ: {0}")]
    RabbitMq(#[from] lapin::Error),
    #[error("could not provision collections: {0}")]
    Provision(#[from] crate::mongo::provision::Error),
}

const INITIAL_CONNECT_BACKOFF: Duration = Duration::from_millis(500);
const MAX_CONNECT_BACKOFF: Duration = Duration::from_secs(30);
const MAX_CONNECT_ATTEMPTS: u32 = 8;

/// Resume-token collections default to a small capped log when no size is
/// configured.
const DEFAULT_TOKENS_SIZE_IN_BYTES: u64 = 4096;

pub struct Server {
    settings: Settings,
    metrics: Metrics,
}

impl Server {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            metrics: Metrics::new(),
        }
    }

    pub fn with_metrics(settings: Settings, metrics: Metrics) -> Self {
        Self { settings, metrics }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    async fn connect_to_mongo(settings: &Settings) -> Result<Client, Error> {
        let uri = &settings.connections().mongo_uri;
        connect_with_backoff(|| Client::with_uri_str(uri), "mongodb")
            .await
            .map_err(Error::Mongo)
    }

    async fn connect_to_rabbitmq(settings: &Settings) -> Result<Arc<Connection>, Error> {
        let uri = &settings.connections().rabbitmq_uri;
        let connection = connect_with_backoff(
            || Connection::connect(uri, ConnectionProperties::default()),
            "rabbitmq",
        )
        .await
        .map_err(Error::RabbitMq)?;
        Ok(Arc::new(connection))
    }

    /// Connect to MongoDB and RabbitMQ concurrently, each with bounded
    /// retries. The daemon also hands these clients to the health monitor.
    pub async fn connect_clients(settings: &Settings) -> Result<(Client, Arc<Connection>), Error> {
        let (mongo_client, rabbitmq_client) = tokio::try_join!(
            Self::connect_to_mongo(settings),
            Self::connect_to_rabbitmq(settings)
        )?;
        Ok((mongo_client, rabbitmq_client))
    }

    async fn provision(client: &Client, collection: &Collection) -> Result<(), Error> {
        let provisioner = Provisioner::new(client.clone());
        provisioner
            .create_collection(&watched_options(collection))
            .await?;
        provisioner
            .create_collection(&resume_tokens_options(collection))
            .await?;
        Ok(())
    }

    async fn run_watcher(
        collection: Collection,
        mongo_client: Client,
        rabbitmq_client: Arc<Connection>,
        shutdown: CancellationToken,
    ) -> (Collection, Result<(), watcher::Error>) {
        let watcher =
            match Watcher::with_clients(mongo_client, rabbitmq_client, &collection).await {
                Ok(watcher) => watcher,
                Err(e) => return (collection, Err(e)),
            };
        let result = watcher.watch(shutdown).await;
        (collection, result)
    }

    /// Run the connector, supervising one watcher task per collection.
    ///
    /// Failed watchers are restarted after reconnecting whichever client
    /// their error implicates. Once `shutdown` is cancelled, watchers drain
    /// out without being respawned and the call returns `Ok`.
    pub async fn serve(
        &self,
        mongo_client: Client,
        rabbitmq_client: Arc<Connection>,
        shutdown: CancellationToken,
    ) -> Result<(), Error> {
        let mut mongo_client = mongo_client;
        let mut rabbitmq_client = rabbitmq_client;

        for collection in self.settings.collections() {
            Self::provision(&mongo_client, collection).await?;
        }

        let mut join_set = JoinSet::new();
        for collection in self.settings.collections() {
            info!(collection = %collection.watched.coll_name, "Starting watcher for collection");
            join_set.spawn(Self::run_watcher(
                collection.clone(),
                mongo_client.clone(),
                rabbitmq_client.clone(),
                shutdown.child_token(),
            ));
            self.metrics.record_start();
        }
        self.metrics.set_running(join_set.len());

        info!("Connector server started");
        while let Some(res) = join_set.join_next().await {
            self.metrics.set_running(join_set.len());

            match res {
                Ok((collection, Ok(()))) => {
                    // Clean exit: cancellation, or the stream closed because
                    // the collection went away.
                    info!(collection = %collection.watched.coll_name, "Watcher finished, not restarting");
                }
                Ok((collection, Err(e))) => {
                    let coll_name = &collection.watched.coll_name;
                    let db_name = &collection.watched.db_name;
                    self.metrics.record_failure(coll_name, db_name, e.kind());

                    if shutdown.is_cancelled() {
                        warn!(error = %e, collection = %coll_name, "Watcher failed during shutdown, not restarting");
                        continue;
                    }
                    error!(error = %e, collection = %coll_name, "Watcher failed, restarting");

                    if e.is_bus_error() {
                        info!("Reconnecting RabbitMQ client");
                        rabbitmq_client = Self::connect_to_rabbitmq(&self.settings).await?;
                    } else if e.is_db_error() {
                        info!("Reconnecting MongoDB client");
                        mongo_client = Self::connect_to_mongo(&self.settings).await?;
                    } else {
                        warn!(error = %e, "Unhandled watcher error, reusing existing clients");
                    }

                    self.metrics.record_restart(coll_name, db_name, e.kind());
                    join_set.spawn(Self::run_watcher(
                        collection.clone(),
                        mongo_client.clone(),
                        rabbitmq_client.clone(),
                        shutdown.child_token(),
                    ));
                    self.metrics.record_start();
                    self.metrics.set_running(join_set.len());
                }
                Err(e) => {
                    error!(error = ?e, "Watcher task panicked, not restarting");
                    self.metrics.record_failure("unknown", "unknown", "task_panic");
                }
            }
        }

        info!("Connector server tasks are finished");
        Ok(())
    }
}

/// Dial a client with exponential backoff: 500ms, 1s, 2s, ... capped at
/// [`MAX_CONNECT_BACKOFF`], giving up after [`MAX_CONNECT_ATTEMPTS`] attempts
/// with the last error.
async fn connect_with_backoff<T, F, Fut, E>(mut dial: F, target: &str) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = INITIAL_CONNECT_BACKOFF;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match dial().await {
            Ok(client) => {
                info!(target = %target, attempt = attempt, "Connected");
                return Ok(client);
            }
            Err(e) if attempt >= MAX_CONNECT_ATTEMPTS => {
                error!(target = %target, attempt = attempt, error = %e, "Giving up on connection");
                return Err(e);
            }
            Err(e) => {
                warn!(target = %target, attempt = attempt, backoff_ms = backoff.as_millis() as u64,
                    error = %e, "Connection attempt failed, backing off");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_CONNECT_BACKOFF);
            }
        }
    }
}

fn watched_options(collection: &Collection) -> CreateCollectionOptions {
    CreateCollectionOptions {
        db_name: collection.watched.db_name.clone(),
        coll_name: collection.watched.coll_name.clone(),
        capped: false,
        size_in_bytes: 0,
        change_stream_pre_and_post_images: collection.watched.change_stream_pre_and_post_images,
    }
}

fn resume_tokens_options(collection: &Collection) -> CreateCollectionOptions {
    CreateCollectionOptions {
        db_name: collection.resume_tokens.db_name.clone(),
        coll_name: collection.resume_tokens.coll_name.clone(),
        capped: collection.resume_tokens.capped.unwrap_or(false),
        size_in_bytes: collection
            .resume_tokens
            .size_in_bytes
            .unwrap_or(DEFAULT_TOKENS_SIZE_IN_BYTES),
        change_stream_pre_and_post_images: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RabbitMq, ResumeTokensDb, WatchedDb};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn collection() -> Collection {
        Collection {
            watched: WatchedDb {
                db_name: "app".to_owned(),
                coll_name: "orders".to_owned(),
                change_stream_pre_and_post_images: true,
            },
            resume_tokens: ResumeTokensDb {
                db_name: "resume".to_owned(),
                coll_name: "orders_tokens".to_owned(),
                capped: Some(true),
                size_in_bytes: Some(1 << 20),
            },
            rabbitmq: RabbitMq {
                exchange: "cdc".to_owned(),
            },
        }
    }

    #[test]
    fn watched_collection_gets_images_but_not_capping() {
        let opts = watched_options(&collection());
        assert!(opts.change_stream_pre_and_post_images);
        assert!(!opts.capped);
        assert_eq!(opts.coll_name, "orders");
    }

    #[test]
    fn resume_tokens_collection_is_capped_to_the_configured_size() {
        let opts = resume_tokens_options(&collection());
        assert!(opts.capped);
        assert_eq!(opts.size_in_bytes, 1 << 20);
        assert!(!opts.change_stream_pre_and_post_images);
    }

    #[test]
    fn resume_tokens_size_defaults_when_unset() {
        let mut collection = collection();
        collection.resume_tokens.capped = Some(true);
        collection.resume_tokens.size_in_bytes = None;

        let opts = resume_tokens_options(&collection);
        assert_eq!(opts.size_in_bytes, DEFAULT_TOKENS_SIZE_IN_BYTES);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_backs_off_until_a_dial_succeeds() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, String> = connect_with_backoff(
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(format!("refused on attempt {n}"))
                    } else {
                        Ok(n)
                    }
                }
            },
            "test",
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_gives_up_after_the_attempt_budget() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, String> = connect_with_backoff(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("refused".to_owned()) }
            },
            "test",
        )
        .await;

        assert_eq!(result, Err("refused".to_owned()));
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_CONNECT_ATTEMPTS);
    }
}
