use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use serde_derive::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config;
use crate::messages::{EngineEvent, Input, SessionId};

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
    connected: bool,
    retained: bool,
}

#[derive(Debug, Deserialize)]
struct ConfirmCommand {
    session: SessionId,
    in_car: bool,
}

#[derive(Debug, Deserialize)]
struct SafeCommand {
    session: SessionId,
}

/// Translate an inbound user action into an engine input. Malformed
/// payloads are logged and dropped.
fn parse_command(topic: &str, payload: &[u8]) -> Option<Input> {
    let result = match topic.rsplit('/').next() {
        Some("confirm") => serde_json::from_slice::<ConfirmCommand>(payload).map(|c| {
            Input::UserConfirmsPresence {
                session: c.session,
                in_car: c.in_car,
            }
        }),
        Some("safe") => serde_json::from_slice::<SafeCommand>(payload)
            .map(|c| Input::UserMarksSafe { session: c.session }),
        Some("activate") => Ok(Input::UserDeclaresInCar),
        _ => {
            debug!("Ignoring message on unexpected topic {}", topic);
            return None;
        }
    };
    match result {
        Ok(input) => Some(input),
        Err(err) => {
            warn!("Malformed payload on {}: {}", topic, err);
            None
        }
    }
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .as_ref()
            .unwrap_or(&"carseat-guard".to_string())
            .to_string();

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
                topic_path: config.topic_path.clone().unwrap_or("carseat".to_string()),
            },
            eventloop,
        )
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe_many(
                ["confirm", "safe", "activate"]
                    .iter()
                    .map(|t| SubscribeFilter::new(format!("{}/{}", self.topic_path, t), QoS::AtLeastOnce)),
            )
            .await?;

        Ok(())
    }

    pub async fn event_loop(&self, eventloop: &mut rumqttc::EventLoop, tx: mpsc::Sender<Input>) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        if let Some(input) = parse_command(&p.topic, &p.payload)
                            && tx.send(input).await.is_err()
                        {
                            info!("Engine gone, stopping MQTT event loop");
                            break;
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
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn announce_device(
        &self,
        name: &str,
        mac_address: &str,
        connected: bool,
    ) -> Result<(), rumqttc::ClientError> {
        info!("Announcing device {} (connected: {}) on MQTT", name, connected);
        let message = DeviceMqttMessage {
            name: name.to_string(),
            mac_address: mac_address.to_string(),
            connected,
            retained: true,
        };
        let payload = serde_json::to_string(&message).unwrap_or_default();
        self.client.try_publish(
            format!("{}/{}/{}", self.topic_path, self.publisher_id, sanitize_name(name)),
            QoS::AtLeastOnce,
            true,
            payload,
        )
    }

    /// Queue an event for the broker without waiting. Fails when the
    /// request queue is full, which is what a broker outage looks like
    /// from here.
    fn publish_event(&self, event: &EngineEvent) -> Result<(), rumqttc::ClientError> {
        if let EngineEvent::DevicePresence {
            device_id,
            name,
            connected,
        } = event
        {
            self.announce_device(name, device_id, *connected)?;
        }

        let payload = serde_json::to_string(event).unwrap_or_default();
        self.client.try_publish(
            format!("{}/{}/events", self.topic_path, self.publisher_id),
            QoS::AtLeastOnce,
            false,
            payload,
        )
    }

    /// Publish one event. Returns the input the engine must see when the
    /// event never made it out.
    fn deliver(&self, event: &EngineEvent) -> Option<Input> {
        match self.publish_event(event) {
            Ok(()) => None,
            Err(err) => {
                error!("Error publishing {:?}: {}", event, err);
                undelivered_input(event)
            }
        }
    }

    /// Publish engine events until the engine shuts down. A prompt that
    /// cannot be handed to the broker is reported back so the engine can
    /// fall back to assuming occupancy.
    pub async fn notify_loop(self, mut rx: mpsc::Receiver<EngineEvent>, inputs: mpsc::Sender<Input>) {
        while let Some(event) = rx.recv().await {
            if let Some(input) = self.deliver(&event)
                && let Err(err) = inputs.try_send(input)
            {
                // The prompt window still expires into the same fallback.
                error!("Error reporting undeliverable prompt: {:?}", err);
            }
        }
        debug!("Notifier stopped");
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

/// Only a lost prompt has a fallback; everything else is just logged.
fn undelivered_input(event: &EngineEvent) -> Option<Input> {
    match event {
        EngineEvent::PromptOccupancy { session, .. } => {
            Some(Input::PromptUndeliverable { session: *session })
        }
        _ => None,
    }
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}
