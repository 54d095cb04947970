pub mod rabbitmq;

#[cfg(feature = "kafka")]
pub mod kafka;

use std::time::Duration;

use async_trait::async_trait;
use guardian_common::{api::message::GuardianMessage, tokio::time::timeout};
use metrics::counter;
use thiserror::Error;

use super::backoff::{retry, Backoff};
use crate::config::{BUS_PUBLISH_TIMEOUT_SECS, METRIC_BUS_RETRIES};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connect(String),
    #[error("broker publish error: {0}")]
    Publish(String),
    #[error("broker publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("broker misconfigured: {0}")]
    Config(String),
}

/// Transport publishing signed guardian messages to the bus.
/// Delivery is at-least-once; consumers dedupe
#[async_trait]
pub trait MessageBroker: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn publish(&self, message: &GuardianMessage) -> Result<(), BrokerError>;
}

pub fn encode_message(message: &GuardianMessage) -> Result<String, BrokerError> {
    serde_json::to_string(message).map_err(|e| BrokerError::Publish(e.to_string()))
}

/// Publish with the standard deadline and capped exponential backoff.
/// Exhausting the retries surfaces the last error to the caller; for the
/// pause path that means another full round on the next block.
pub async fn publish_with_retry<M: MessageBroker + ?Sized>(
    broker: &M,
    message: &GuardianMessage,
) -> Result<(), BrokerError> {
    let deadline = Duration::from_secs(BUS_PUBLISH_TIMEOUT_SECS);
    retry(
        Backoff::default(),
        |_e: &BrokerError| {
            counter!(METRIC_BUS_RETRIES).increment(1);
            true
        },
        || async {
            match timeout(deadline, broker.publish(message)).await {
                Ok(result) => result,
                Err(_) => Err(BrokerError::Timeout(deadline)),
            }
        },
    )
    .await
}
