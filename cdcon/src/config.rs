use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error(
        "resume token collection '{db_name}.{coll_name}' must be distinct from the watched collection"
    )]
    ResumeTokensOverlapWatched { db_name: String, coll_name: String },
    #[error("no collections configured")]
    NoCollections,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Connections {
    pub mongo_uri: String,
    pub rabbitmq_uri: String,
}

/// The collection whose change stream is tailed.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct WatchedDb {
    pub db_name: String,
    pub coll_name: String,
    #[serde(default)]
    pub change_stream_pre_and_post_images: bool,
}

/// Storage for resume tokens. Usually capped so the token log stays bounded.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ResumeTokensDb {
    pub db_name: String,
    pub coll_name: String,
    #[serde(default)]
    pub capped: Option<bool>,
    #[serde(default)]
    pub size_in_bytes: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RabbitMq {
    pub exchange: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Collection {
    pub watched: WatchedDb,
    pub resume_tokens: ResumeTokensDb,
    pub rabbitmq: RabbitMq,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Http {
    #[serde(default = "Http::default_addr")]
    pub addr: String,
    /// When set, the aggregate health status reports DOWN if any monitored
    /// component is down. The reference behavior (off) always reports UP and
    /// leaves the per-component map as the diagnostic signal.
    #[serde(default)]
    pub strict_health: bool,
}

impl Http {
    fn default_addr() -> String {
        "0.0.0.0:3000".to_owned()
    }
}

impl Default for Http {
    fn default() -> Self {
        Self {
            addr: Self::default_addr(),
            strict_health: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    connections: Connections,
    collections: Vec<Collection>,
    #[serde(default)]
    http: Http,
}

impl Settings {
    pub fn new(
        connections: Connections,
        collections: Vec<Collection>,
        http: Http,
    ) -> Result<Self, ValidationError> {
        let settings = Self {
            connections,
            collections,
            http,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// The resume-token collection must be a different collection than the
    /// watched one; the same name in another database is fine.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.collections.is_empty() {
            return Err(ValidationError::NoCollections);
        }
        for collection in &self.collections {
            let tokens = &collection.resume_tokens;
            if tokens.db_name == collection.watched.db_name
                && tokens.coll_name == collection.watched.coll_name
            {
                return Err(ValidationError::ResumeTokensOverlapWatched {
                    db_name: tokens.db_name.clone(),
                    coll_name: tokens.coll_name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn connections(&self) -> &Connections {
        &self.connections
    }

    pub fn collections(&self) -> &[Collection] {
        &self.collections
    }

    pub fn http(&self) -> &Http {
        &self.http
    }
}
