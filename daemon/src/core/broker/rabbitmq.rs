use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use guardian_common::{
    api::message::GuardianMessage, tokio::sync::Mutex, utils::sanitize_ws_address,
};
use tokio_tungstenite_wasm::{connect, Message, WebSocketStream};

use super::{encode_message, BrokerError, MessageBroker};
use crate::config::BrokerConfig;

/// RabbitMQ transport speaking STOMP 1.2 over the broker's Web-STOMP
/// WebSocket endpoint.
///
/// The connection is lazy and re-established on the next publish after any
/// send failure.
pub struct RabbitMqBroker {
    url: String,
    login: Option<String>,
    passcode: Option<String>,
    destination: String,
    socket: Mutex<Option<WebSocketStream>>,
}

impl RabbitMqBroker {
    pub fn new(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let url = config
            .rabbitmq_url
            .as_ref()
            .ok_or_else(|| BrokerError::Config("RABBITMQ_URL is required for rabbitmq".into()))?;
        Ok(Self {
            url: sanitize_ws_address(url),
            login: config.rabbitmq_login.clone(),
            passcode: config.rabbitmq_passcode.clone(),
            destination: format!("/topic/{}", config.broker_topic),
            socket: Mutex::new(None),
        })
    }

    async fn open_socket(&self) -> Result<WebSocketStream, BrokerError> {
        debug!("connecting to rabbitmq at {}", self.url);
        let mut socket = connect(&self.url)
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        let mut headers = vec![
            ("accept-version".to_string(), "1.2".to_string()),
            ("host".to_string(), "/".to_string()),
            ("heart-beat".to_string(), "0,0".to_string()),
        ];
        if let Some(login) = &self.login {
            headers.push(("login".to_string(), login.clone()));
        }
        if let Some(passcode) = &self.passcode {
            headers.push(("passcode".to_string(), passcode.clone()));
        }

        socket
            .send(Message::text(stomp_frame("CONNECT", &headers, "")))
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        // The server answers CONNECTED (or ERROR) before anything else
        while let Some(incoming) = socket.next().await {
            let message = incoming.map_err(|e| BrokerError::Connect(e.to_string()))?;
            if let Message::Text(text) = message {
                // Bare newlines are heartbeats
                if text.trim_matches(['\n', '\0']).is_empty() {
                    continue;
                }
                if text.starts_with("CONNECTED") {
                    info!("rabbitmq STOMP session established");
                    return Ok(socket);
                }
                return Err(BrokerError::Connect(format!(
                    "unexpected STOMP reply: {}",
                    text.lines().next().unwrap_or_default()
                )));
            }
        }
        Err(BrokerError::Connect(
            "connection closed during STOMP handshake".into(),
        ))
    }
}

#[async_trait]
impl MessageBroker for RabbitMqBroker {
    fn name(&self) -> &'static str {
        "rabbitmq"
    }

    async fn publish(&self, message: &GuardianMessage) -> Result<(), BrokerError> {
        let body = encode_message(message)?;
        let headers = vec![
            ("destination".to_string(), self.destination.clone()),
            ("content-type".to_string(), "application/json".to_string()),
            ("content-length".to_string(), body.len().to_string()),
        ];
        let frame = stomp_frame("SEND", &headers, &body);

        let mut guard = self.socket.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_socket().await?);
        }
        let socket = guard.as_mut().expect("socket just ensured");

        if let Err(e) = socket.send(Message::text(frame)).await {
            // Drop the broken connection; the retry layer will reconnect
            *guard = None;
            return Err(BrokerError::Publish(e.to_string()));
        }
        trace!("published {} message to {}", message.kind(), self.destination);
        Ok(())
    }
}

fn stomp_frame(command: &str, headers: &[(String, String)], body: &str) -> String {
    let mut frame = String::with_capacity(command.len() + body.len() + 64);
    frame.push_str(command);
    frame.push('\n');
    for (name, value) in headers {
        frame.push_str(name);
        frame.push(':');
        frame.push_str(value);
        frame.push('\n');
    }
    frame.push('\n');
    frame.push_str(body);
    frame.push('\0');
    frame
}
