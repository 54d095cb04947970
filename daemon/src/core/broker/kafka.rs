use std::time::Duration;

use async_trait::async_trait;
use guardian_common::api::message::GuardianMessage;
use rdkafka::{
    config::ClientConfig,
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
};

use super::{encode_message, BrokerError, MessageBroker};
use crate::config::{BrokerConfig, BUS_PUBLISH_TIMEOUT_SECS};

/// Kafka transport built on librdkafka's asynchronous producer
pub struct KafkaBroker {
    producer: FutureProducer,
    topic: String,
}

impl KafkaBroker {
    pub fn new(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let brokers: Vec<&str> = [
            config.kafka_broker_address_1.as_deref(),
            config.kafka_broker_address_2.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect();
        if brokers.is_empty() {
            return Err(BrokerError::Config(
                "KAFKA_BROKER_ADDRESS_1 is required for kafka".into(),
            ));
        }

        let mut client = ClientConfig::new();
        client.set("bootstrap.servers", brokers.join(","));
        if let Some(client_id) = &config.kafka_client_id {
            client.set("client.id", client_id);
        }
        match (config.kafka_ssl, config.kafka_sasl_mechanism.as_ref()) {
            (true, Some(mechanism)) => {
                client.set("security.protocol", "sasl_ssl");
                client.set("sasl.mechanisms", mechanism);
            }
            (true, None) => {
                client.set("security.protocol", "ssl");
            }
            (false, Some(mechanism)) => {
                client.set("security.protocol", "sasl_plaintext");
                client.set("sasl.mechanisms", mechanism);
            }
            (false, None) => {}
        }
        if let Some(username) = &config.kafka_username {
            client.set("sasl.username", username);
        }
        if let Some(password) = &config.kafka_password {
            client.set("sasl.password", password);
        }

        let producer = client
            .create()
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        Ok(Self {
            producer,
            topic: config.broker_topic.clone(),
        })
    }
}

#[async_trait]
impl MessageBroker for KafkaBroker {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn publish(&self, message: &GuardianMessage) -> Result<(), BrokerError> {
        let payload = encode_message(message)?;
        let key = format!("{}-{}", message.kind(), message.block_number());
        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);
        self.producer
            .send(
                record,
                Timeout::After(Duration::from_secs(BUS_PUBLISH_TIMEOUT_SECS)),
            )
            .await
            .map(|_| ())
            .map_err(|(e, _)| BrokerError::Publish(e.to_string()))
    }
}
