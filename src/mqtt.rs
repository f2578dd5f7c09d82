use std::time::Duration;

use log::{debug, error, info};
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use tokio::sync::broadcast;

use crate::config;
use crate::messages::{DeviceRecord, ScanCommand};
use crate::session::Sink;

/// MQTT subscriber sink: device snapshots go out on `{topic}/devices`, and
/// publishes on `{topic}/scan/start` / `{topic}/scan/stop` come back in as
/// [`ScanCommand`]s for the session.
#[derive(Debug, Clone)]
pub struct MqttSink {
    client: rumqttc::AsyncClient,
    topic_path: String,
}

impl MqttSink {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .as_ref()
            .unwrap_or(&"minew-monitor".to_string())
            .to_string();

        let mut mqttoptions = MqttOptions::new(
            publisher_id,
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
            MqttSink {
                client,
                topic_path: config.topic_path.clone().unwrap_or("minew".to_string()),
            },
            eventloop,
        )
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe_many(vec![
                SubscribeFilter::new(format!("{}/scan/start", self.topic_path), QoS::AtMostOnce),
                SubscribeFilter::new(format!("{}/scan/stop", self.topic_path), QoS::AtMostOnce),
            ])
            .await?;

        Ok(())
    }

    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        tx: broadcast::Sender<ScanCommand>,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}", p.topic);

                        let command = match p.topic {
                            t if t.ends_with("/scan/start") => ScanCommand::Start,
                            _ => ScanCommand::Stop,
                        };

                        if let Err(err) = tx.send(command) {
                            error!("Error forwarding scan command: {err:?}");
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe().await {
                            error!("Error subscribing to MQTT topics: {err:?}");
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {e:?}");
                }
            }
        }
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

impl Sink for MqttSink {
    async fn publish(&self, devices: Vec<DeviceRecord>) -> anyhow::Result<()> {
        info!("Publishing snapshot of {} device(s)", devices.len());
        self.client
            .publish(
                format!("{}/devices", self.topic_path),
                QoS::AtMostOnce,
                false,
                serde_json::to_vec(&devices)?,
            )
            .await?;
        Ok(())
    }
}
