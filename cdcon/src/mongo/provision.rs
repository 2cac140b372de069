use bson::doc;
use mongodb::Client;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not list collection names in '{db_name}': {source}")]
    ListCollections {
        db_name: String,
        #[source]
        source: mongodb::error::Error,
    },
    #[error("could not create collection '{coll_name}': {source}")]
    CreateCollection {
        coll_name: String,
        #[source]
        source: mongodb::error::Error,
    },
    #[error("could not enable changeStreamPreAndPostImages on '{coll_name}': {source}")]
    EnablePrePostImages {
        coll_name: String,
        #[source]
        source: mongodb::error::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCollectionOptions {
    pub db_name: String,
    pub coll_name: String,
    pub capped: bool,
    pub size_in_bytes: u64,
    pub change_stream_pre_and_post_images: bool,
}

/// Idempotently sets up a collection: creates it when missing (capped when
/// asked) and enables pre/post-image capture. The pre-check on the collection
/// name is the only idempotence mechanism; racing a concurrent creator is a
/// caller error.
pub struct Provisioner {
    client: Client,
}

impl Provisioner {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn create_collection(&self, opts: &CreateCollectionOptions) -> Result<(), Error> {
        let db = self.client.database(&opts.db_name);

        let names = db
            .list_collection_names()
            .filter(doc! { "name": &opts.coll_name })
            .await
            .map_err(|source| Error::ListCollections {
                db_name: opts.db_name.clone(),
                source,
            })?;

        if names.is_empty() {
            let mut create = db.create_collection(&opts.coll_name);
            if opts.capped {
                create = create.capped(true).size(opts.size_in_bytes);
            }
            create.await.map_err(|source| Error::CreateCollection {
                coll_name: opts.coll_name.clone(),
                source,
            })?;
            debug!(db = %opts.db_name, coll = %opts.coll_name, "Created collection");
        }

        // Applied even when the collection already existed.
        if opts.change_stream_pre_and_post_images {
            db.run_command(doc! {
                "collMod": &opts.coll_name,
                "changeStreamPreAndPostImages": { "enabled": true },
            })
            .await
            .map_err(|source| Error::EnablePrePostImages {
                coll_name: opts.coll_name.clone(),
                source,
            })?;
            debug!(db = %opts.db_name, coll = %opts.coll_name, "Enabled pre/post images");
        }

        Ok(())
    }
}
