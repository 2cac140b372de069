use async_trait::async_trait;

/// A single-operation capability: hand a message to the bus under a routing
/// subject. An `Err` means "not durably accepted" and the message will be
/// redelivered on the next run; consumers deduplicate by `message_id`.
#[async_trait]
pub trait Publish: Send + Sync {
    async fn publish(
        &self,
        subject: &str,
        message_id: &str,
        payload: &[u8],
    ) -> Result<(), crate::rabbitmq::Error>;
}
