use crate::config;
use crate::mongo::event::ChangeEvent;
use crate::mongo::resume_tokens::ResumeTokens;
use crate::rabbitmq::{amqp, Publisher};
use bson::{doc, Bson, Document};
use futures_util::stream::StreamExt;
use mongodb::change_stream::event::{ChangeStreamEvent, ResumeToken};
use mongodb::options::{FullDocumentBeforeChangeType, FullDocumentType};
use mongodb::Client;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not fetch or decode resume token: {0}")]
    ResumeLookup(#[source] mongodb::error::Error),
    #[error("could not watch collection '{coll_name}': {source}")]
    Subscribe {
        coll_name: String,
        #[source]
        source: mongodb::error::Error,
    },
    #[error("change stream error: {0}")]
    Stream(#[source] mongodb::error::Error),
    #[error("could not decode change event: {0}")]
    Decode(#[from] bson::de::Error),
    #[error("could not marshal change event: {0}")]
    Serialize(#[from] bson::ser::Error),
    #[error("could not encode change event as json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("could not publish change event: {0}")]
    Publish(#[from] crate::rabbitmq::Error),
    #[error("could not insert resume token: {0}")]
    Checkpoint(#[source] mongodb::error::Error),
}

impl Error {
    /// Stable label for metrics and restart decisions.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResumeLookup(_) => "resume_lookup",
            Self::Subscribe { .. } => "subscribe",
            Self::Stream(_) => "stream",
            Self::Decode(_) => "decode",
            Self::Serialize(_) | Self::Json(_) => "serialize",
            Self::Publish(_) => "publish",
            Self::Checkpoint(_) => "checkpoint",
        }
    }

    pub fn is_bus_error(&self) -> bool {
        matches!(self, Self::Publish(_))
    }

    pub fn is_db_error(&self) -> bool {
        matches!(
            self,
            Self::ResumeLookup(_) | Self::Subscribe { .. } | Self::Stream(_) | Self::Checkpoint(_)
        )
    }
}

/// Tails one collection's change stream and republishes every event to the
/// bus, checkpointing the resume token after each successful publish. The
/// token log is always a prefix of the published sequence: a publish failure
/// stops the watcher before the checkpoint, a checkpoint failure stops it
/// after, and the next run republishes at most one duplicate, which
/// consumers drop by message id.
pub struct Watcher {
    client: Client,
    watched: config::WatchedDb,
    resume_tokens: ResumeTokens,
    publisher: Publisher,
}

impl Watcher {
    pub fn new(
        client: Client,
        watched: config::WatchedDb,
        resume_tokens: ResumeTokens,
        publisher: Publisher,
    ) -> Self {
        Self {
            client,
            watched,
            resume_tokens,
            publisher,
        }
    }

    /// Build a watcher from shared clients, creating a dedicated AMQP channel
    /// on the given connection.
    pub async fn with_clients(
        client: Client,
        amqp: Arc<lapin::Connection>,
        settings: &config::Collection,
    ) -> Result<Self, Error> {
        let publisher = amqp::Publisher::with_connection(settings.rabbitmq.clone(), amqp).await?;
        let resume_tokens = ResumeTokens::new(&client, &settings.resume_tokens);
        Ok(Self::new(
            client,
            settings.watched.clone(),
            resume_tokens,
            Publisher::new(Arc::new(publisher)),
        ))
    }

    /// Watch until the stream closes, a fatal error occurs, or `shutdown` is
    /// cancelled. Cancellation exits cleanly with `Ok(())`; an in-flight
    /// publish or checkpoint is allowed to finish first.
    pub async fn watch(&self, shutdown: CancellationToken) -> Result<(), Error> {
        let collection = self
            .client
            .database(&self.watched.db_name)
            .collection::<Document>(&self.watched.coll_name);

        let previous = self
            .resume_tokens
            .last_event()
            .await
            .map_err(|e| {
                error!(error = %e, "Resume token lookup failed");
                Error::ResumeLookup(e)
            })?;

        let mut watch = collection
            .watch()
            .full_document(FullDocumentType::UpdateLookup)
            .full_document_before_change(FullDocumentBeforeChangeType::WhenAvailable);
        if let Some(target) = resume_target(previous.as_ref()) {
            debug!(token = %target, "Resuming after token");
            let token: ResumeToken = bson::from_slice(&bson::to_vec(&doc! { "_data": target })?)?;
            watch = watch.resume_after(token);
        }

        let mut change_stream = watch.await.map_err(|source| Error::Subscribe {
            coll_name: self.watched.coll_name.clone(),
            source,
        })?;
        info!(db = %self.watched.db_name, coll = %self.watched.coll_name, "Started watching collection");

        loop {
            let next = tokio::select! {
                () = shutdown.cancelled() => break,
                next = change_stream.next() => next,
            };
            let Some(event) = next.transpose().map_err(|e| {
                error!(error = %e, "Change stream error");
                Error::Stream(e)
            })?
            else {
                break;
            };
            self.forward(event).await?;
        }

        // Dropping the stream releases the server-side cursor from the
        // driver's own runtime, independent of the cancelled token.
        info!(db = %self.watched.db_name, coll = %self.watched.coll_name, "Stopped watching collection");
        Ok(())
    }

    async fn forward(&self, event: ChangeStreamEvent<Document>) -> Result<(), Error> {
        // Envelope and payload are both derived from this one document so
        // the published body always matches the checkpointed position.
        let raw = bson::to_document(&event)?;
        let envelope: ChangeEvent = bson::from_document(raw.clone())?;
        let payload = encode_payload(raw)?;

        let subject = subject(&self.watched.coll_name, &envelope.operation_type);
        debug!(subject = %subject, message_id = %envelope.id.data, "Received change event");

        self.publisher
            .publish(&subject, &envelope.id.data, &payload)
            .await
            .map_err(|e| {
                error!(error = %e, subject = %subject, "Failed to publish change event");
                Error::Publish(e)
            })?;

        self.resume_tokens.append(&envelope).await.map_err(|e| {
            // The event is already on the bus; the next run republishes it
            // and consumers dedupe by message id.
            error!(error = %e, "Failed to save resume token");
            Error::Checkpoint(e)
        })?;

        Ok(())
    }
}

/// Routing key for a change event: uppercased collection name, then the
/// operation type verbatim.
pub fn subject(coll_name: &str, operation_type: &str) -> String {
    format!("{}.{}", coll_name.to_uppercase(), operation_type)
}

/// The token to resume after, if the latest checkpointed envelope carries a
/// non-empty one.
fn resume_target(previous: Option<&ChangeEvent>) -> Option<&str> {
    previous.and_then(ChangeEvent::resume_point)
}

/// Relaxed extended JSON of the raw event, no indentation. Everything the
/// server emitted stays in the payload.
fn encode_payload(raw: Document) -> Result<Vec<u8>, Error> {
    Ok(serde_json::to_vec(&Bson::Document(raw).into_relaxed_extjson())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mongo::event::ChangeEventId;
    use bson::oid::ObjectId;

    #[test]
    fn subject_is_uppercased_collection_then_operation() {
        assert_eq!(subject("orders", "insert"), "ORDERS.insert");
        assert_eq!(subject("user_events", "update"), "USER_EVENTS.update");
        assert_eq!(subject("orders", "dropDatabase"), "ORDERS.dropDatabase");
    }

    #[test]
    fn resume_target_skips_empty_tokens() {
        assert_eq!(resume_target(None), None);

        let empty = ChangeEvent {
            id: ChangeEventId::default(),
            operation_type: "insert".to_owned(),
        };
        assert_eq!(resume_target(Some(&empty)), None);

        let event = ChangeEvent {
            id: ChangeEventId {
                data: "t7".to_owned(),
            },
            operation_type: "insert".to_owned(),
        };
        assert_eq!(resume_target(Some(&event)), Some("t7"));
    }

    #[test]
    fn payload_is_relaxed_extended_json() {
        let oid = ObjectId::parse_str("507f1f77bcf86cd799439011").unwrap();
        let raw = doc! {
            "_id": { "_data": "t1" },
            "operationType": "insert",
            "fullDocument": { "_id": oid, "qty": 42_i64 },
        };

        let payload = encode_payload(raw).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();

        assert_eq!(json["operationType"], "insert");
        assert_eq!(json["_id"]["_data"], "t1");
        assert_eq!(
            json["fullDocument"]["_id"]["$oid"],
            "507f1f77bcf86cd799439011"
        );
        // Relaxed mode keeps plain numbers plain.
        assert_eq!(json["fullDocument"]["qty"], 42);
    }

    #[test]
    fn error_kinds_are_stable() {
        use serde::de::Error as _;
        use serde::ser::Error as _;

        let err = Error::Decode(bson::de::Error::custom("truncated"));
        assert_eq!(err.kind(), "decode");
        assert!(!err.is_bus_error());
        assert!(!err.is_db_error());

        let err = Error::Serialize(bson::ser::Error::custom("unrepresentable"));
        assert_eq!(err.kind(), "serialize");
        assert!(!err.is_db_error());

        let err = Error::Publish(crate::rabbitmq::Error::Unconfirmed(
            "nack".to_owned(),
        ));
        assert_eq!(err.kind(), "publish");
        assert!(err.is_bus_error());
        assert!(!err.is_db_error());
    }
}
