use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info};
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use serde_derive::Serialize;
use tokio::sync::mpsc;

use crate::{
    config,
    messages::{PresenceChange, ScanRequest},
};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

#[derive(Debug, Serialize)]
struct DeviceMqttMessage {
    name: String,
    #[serde(rename = "id")]
    mac_address: String,
    confidence: u8,
    retained: bool,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "proximity".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config
                    .topic_path
                    .clone()
                    .unwrap_or_else(|| "proximity".to_string()),
            },
            eventloop,
        )
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe_many(vec![
                SubscribeFilter::new(format!("{}/scan/arrive", self.topic_path), QoS::AtMostOnce),
                SubscribeFilter::new(format!("{}/scan/depart", self.topic_path), QoS::AtMostOnce),
            ])
            .await?;

        Ok(())
    }

    /// Drives the connection and forwards scan requests until the poll loop
    /// goes away.
    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        tx: mpsc::Sender<ScanRequest>,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        let Some(request) = scan_request_for(&p.topic) else {
                            continue;
                        };

                        if tx.send(request).await.is_err() {
                            debug!("Scan request receiver closed, stopping MQTT event loop");
                            return;
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe().await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    pub async fn announce(&self, change: &PresenceChange) -> Result<()> {
        let device = change.device();
        let confidence = change.confidence();
        info!(
            "Announcing device {} (confidence: {}) on MQTT",
            device.name, confidence
        );
        let message = DeviceMqttMessage {
            name: device.name.clone(),
            mac_address: device.address.clone(),
            confidence,
            retained: false,
        };
        let payload =
            serde_json::to_string(&message).context("Failed to encode presence message")?;
        self.client
            .publish(self.device_topic(&device.name), QoS::AtMostOnce, false, payload)
            .await
            .context("Failed to publish presence message")
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }

    fn device_topic(&self, name: &str) -> String {
        format!("{}/{}/{}", self.topic_path, self.publisher_id, sanitize_name(name))
    }
}

fn scan_request_for(topic: &str) -> Option<ScanRequest> {
    if topic.ends_with("/scan/arrive") {
        Some(ScanRequest::Arrive)
    } else if topic.ends_with("/scan/depart") {
        Some(ScanRequest::Depart)
    } else {
        None
    }
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}
