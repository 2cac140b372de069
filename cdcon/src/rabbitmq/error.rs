use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("AMQP error: {0}")]
    Lapin(#[from] lapin::Error),
    /// The broker did not durably accept the message; the watcher treats
    /// this the same as a transport failure and stops without checkpointing.
    #[error("message was not confirmed by the broker: {0}")]
    Unconfirmed(String),
}
