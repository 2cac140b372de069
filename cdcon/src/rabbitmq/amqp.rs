use super::error::Error;
use super::publish::Publish;
use crate::config::RabbitMq;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions},
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::Arc;
use tracing::trace;

/// RabbitMQ publisher for change events.
///
/// Publishes to a durable topic exchange with the change subject as routing
/// key and the resume token as the AMQP `message_id`, so consumers can
/// deduplicate redelivered events. The channel runs in confirm mode; a
/// publish only succeeds once the broker acks it.
pub struct Publisher {
    config: RabbitMq,
    channel: Channel,
    // Holds the connection while the channel is alive.
    _connection: Arc<Connection>,
}

impl Publisher {
    /// Connect to RabbitMQ and set up a confirmed channel on the configured
    /// exchange.
    ///
    /// # Errors
    /// Returns an error if the connection, channel, confirm mode, or
    /// exchange declaration fails.
    pub async fn new(config: RabbitMq, rabbitmq_uri: &str) -> Result<Self, Error> {
        let conn = Connection::connect(rabbitmq_uri, ConnectionProperties::default()).await?;
        Self::with_connection(config, Arc::new(conn)).await
    }

    /// Create a `Publisher` on an existing, shared RabbitMQ connection.
    ///
    /// This is the preferred constructor when several watchers publish over
    /// one TCP connection: each gets its own channel.
    ///
    /// # Errors
    /// Returns an error if the channel creation, confirm mode, or exchange
    /// declaration fails.
    pub async fn with_connection(
        config: RabbitMq,
        connection: Arc<Connection>,
    ) -> Result<Self, Error> {
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(Self {
            config,
            channel,
            _connection: connection,
        })
    }
}

#[async_trait::async_trait]
impl Publish for Publisher {
    async fn publish(
        &self,
        subject: &str,
        message_id: &str,
        payload: &[u8],
    ) -> Result<(), Error> {
        let confirm: Confirmation = self
            .channel
            .basic_publish(
                &self.config.exchange,
                subject,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_message_id(message_id.to_owned().into()),
            )
            .await?
            .await?;

        if let Confirmation::Nack(..) = confirm {
            return Err(Error::Unconfirmed(format!(
                "broker nacked message '{message_id}' on subject '{subject}'"
            )));
        }

        trace!(exchange = %self.config.exchange, subject = %subject, message_id = %message_id,
            "Published change event");
        Ok(())
    }
}
