use std::time::Duration;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties};
use serde::Serialize;

use crate::QueueError;

#[async_trait]
pub trait QueuePublisher: Send + Sync {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError>;
}

pub async fn publish_json<P, T>(publisher: &P, queue: &str, message: &T) -> Result<(), QueueError>
where
    P: QueuePublisher + ?Sized,
    T: Serialize + Sync,
{
    let payload =
        serde_json::to_vec(message).map_err(|error| QueueError::Encode(error.to_string()))?;
    publisher.publish(queue, &payload).await
}

/// Publishes over AMQP 0-9-1 with one connection per message.
#[derive(Debug, Clone)]
pub struct AmqpPublisher {
    url: String,
    timeout: Duration,
}

impl AmqpPublisher {
    #[must_use]
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    async fn publish_once(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|error| QueueError::Connect(error.to_string()))?;
        let result = Self::publish_on(&connection, queue, payload).await;
        if let Err(error) = connection.close(200, "OK").await {
            tracing::debug!(error = %error, "closing broker connection failed");
        }
        result
    }

    async fn publish_on(
        connection: &Connection,
        queue: &str,
        payload: &[u8],
    ) -> Result<(), QueueError> {
        let publish_error = |error: lapin::Error| QueueError::Publish(error.to_string());

        let channel = connection.create_channel().await.map_err(publish_error)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(publish_error)?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(publish_error)?;

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);
        let confirmation = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(publish_error)?
            .await
            .map_err(publish_error)?;
        if confirmation.is_nack() {
            return Err(QueueError::Rejected);
        }
        Ok(())
    }
}

#[async_trait]
impl QueuePublisher for AmqpPublisher {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        match tokio::time::timeout(self.timeout, self.publish_once(queue, payload)).await {
            Ok(result) => {
                if result.is_ok() {
                    tracing::debug!(queue, bytes = payload.len(), "message published");
                }
                result
            }
            Err(_) => Err(QueueError::Timeout(self.timeout)),
        }
    }
}

/// Drops every message. Used when no broker is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

#[async_trait]
impl QueuePublisher for NoopPublisher {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        tracing::warn!(queue, bytes = payload.len(), "no queue configured, message dropped");
        Ok(())
    }
}
