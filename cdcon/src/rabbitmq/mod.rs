pub mod amqp;
pub mod error;
pub mod publish;

pub use error::Error;

use crate::rabbitmq::publish::Publish;
use std::sync::Arc;

/// The injected publishing capability the watcher talks to. Anything that
/// can durably accept `(subject, message_id, payload)` fits behind it; the
/// AMQP implementation lives in [`amqp`].
pub struct Publisher {
    inner: Arc<dyn Publish>,
}

impl Publisher {
    pub fn new(inner: Arc<dyn Publish>) -> Self {
        Self { inner }
    }

    pub async fn publish(
        &self,
        subject: &str,
        message_id: &str,
        payload: &[u8],
    ) -> Result<(), Error> {
        self.inner.publish(subject, message_id, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        messages: Mutex<Vec<(String, String, Vec<u8>)>>,
        fail: bool,
    }

    #[async_trait]
    impl Publish for Recording {
        async fn publish(
            &self,
            subject: &str,
            message_id: &str,
            payload: &[u8],
        ) -> Result<(), Error> {
            if self.fail {
                return Err(Error::Unconfirmed("broker unavailable".to_owned()));
            }
            self.messages.lock().unwrap().push((
                subject.to_owned(),
                message_id.to_owned(),
                payload.to_vec(),
            ));
            Ok(())
        }
    }

    #[tokio::test]
    async fn forwards_subject_message_id_and_payload() {
        let recording = Arc::new(Recording::default());
        let publisher = Publisher::new(recording.clone());

        publisher
            .publish("ORDERS.insert", "t1", b"{\"a\":1}")
            .await
            .unwrap();

        let messages = recording.messages.lock().unwrap();
        assert_eq!(
            messages.as_slice(),
            &[(
                "ORDERS.insert".to_owned(),
                "t1".to_owned(),
                b"{\"a\":1}".to_vec()
            )]
        );
    }

    #[tokio::test]
    async fn surfaces_publish_failures() {
        let publisher = Publisher::new(Arc::new(Recording {
            fail: true,
            ..Default::default()
        }));

        let err = publisher.publish("ORDERS.insert", "t1", b"{}").await;
        assert!(matches!(err, Err(Error::Unconfirmed(_))));
    }
}
