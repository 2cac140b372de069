use crate::config;
use crate::mongo::event::ChangeEvent;
use bson::doc;
use mongodb::{Client, Collection};

/// Append-only log of published change events, one record per successful
/// publish. The latest record (reverse natural order) is where the stream
/// resumes; capping the collection is a storage policy applied at
/// provisioning time, not here.
pub struct ResumeTokens {
    collection: Collection<ChangeEvent>,
}

impl ResumeTokens {
    pub fn new(client: &Client, config: &config::ResumeTokensDb) -> Self {
        let collection = client
            .database(&config.db_name)
            .collection::<ChangeEvent>(&config.coll_name);
        Self { collection }
    }

    /// The most recently appended envelope, or `None` for a fresh log.
    /// "No documents" is a clean start, not an error.
    pub async fn last_event(&self) -> mongodb::error::Result<Option<ChangeEvent>> {
        self.collection
            .find_one(doc! {})
            .sort(doc! { "$natural": -1 })
            .await
    }

    pub async fn append(&self, event: &ChangeEvent) -> mongodb::error::Result<()> {
        self.collection.insert_one(event).await?;
        Ok(())
    }
}
