use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{error, info, warn};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task;

use crate::config::MqttConfig;
use crate::error::AppError;
use crate::faults::{ErrorBus, Priority, keys};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 100;

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

/// Connection changes and inbound messages, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    ConnectFailed(String),
    Disconnected(String),
    Message { topic: String, payload: String },
}

/// Pub/sub session. Everything goes out at QoS 1.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), AppError>;
    async fn subscribe(&self, topic: &str) -> Result<(), AppError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), AppError>;
    async fn disconnect(&self) -> Result<(), AppError>;
}

/// Requests are queued without waiting. While the session is down they fail
/// at once instead of filling the client queue.
pub struct MqttTransport {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
}

impl MqttTransport {
    /// Spawns the event loop and returns the session with its event stream.
    /// The broker gets `offline` on the availability topic as last will.
    pub fn start(
        cfg: &MqttConfig,
        client_id: &str,
        availability_topic: &str,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let mut options = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
        options.set_clean_session(true);
        if !cfg.username.is_empty() {
            options.set_credentials(cfg.username.clone(), cfg.password.clone());
        }
        options.set_last_will(LastWill::new(
            availability_topic,
            PAYLOAD_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let connected_flag = connected.clone();
        let closing = Arc::new(AtomicBool::new(false));
        let closing_flag = closing.clone();

        task::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            connected_flag.store(true, Ordering::Release);
                            info!("MQTT connected");
                            let _ = tx.send(TransportEvent::Connected);
                        } else {
                            let reason = format!("{:?}", ack.code);
                            let _ = tx.send(TransportEvent::ConnectFailed(reason));
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                        let _ = tx.send(TransportEvent::Message {
                            topic: publish.topic,
                            payload,
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if closing_flag.load(Ordering::Relaxed) {
                            info!("MQTT event loop stopped");
                            break;
                        }
                        let reason = e.to_string();
                        let event = if connected_flag.swap(false, Ordering::AcqRel) {
                            warn!("MQTT disconnected: {reason}");
                            TransportEvent::Disconnected(reason)
                        } else {
                            error!("MQTT connect failed: {reason}");
                            TransportEvent::ConnectFailed(reason)
                        };
                        if tx.send(event).is_err() {
                            break;
                        }
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        (
            Self {
                client,
                connected,
                closing,
            },
            rx,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn ensure_connected(&self) -> Result<(), AppError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(AppError::Transport("session not connected".into()))
        }
    }
}

#[async_trait::async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), AppError> {
        self.ensure_connected()?;
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.as_bytes().to_vec())
            .map_err(|e| AppError::Transport(format!("publish {topic}: {e}")))
    }

    async fn subscribe(&self, topic: &str) -> Result<(), AppError> {
        self.ensure_connected()?;
        self.client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| AppError::Transport(format!("subscribe {topic}: {e}")))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), AppError> {
        self.ensure_connected()?;
        self.client
            .try_unsubscribe(topic)
            .map_err(|e| AppError::Transport(format!("unsubscribe {topic}: {e}")))
    }

    async fn disconnect(&self) -> Result<(), AppError> {
        self.closing.store(true, Ordering::Relaxed);
        self.client
            .try_disconnect()
            .map_err(|e| AppError::Transport(format!("disconnect: {e}")))
    }
}

/// Publishing front for the bridge. Failed sends raise `mqtt.publish`; the
/// next successful one clears it.
#[derive(Clone)]
pub struct Outbox {
    transport: Arc<dyn Transport>,
    faults: Arc<ErrorBus>,
}

impl Outbox {
    pub fn new(transport: Arc<dyn Transport>, faults: Arc<ErrorBus>) -> Self {
        Self { transport, faults }
    }

    pub async fn publish(&self, topic: &str, payload: &str, retain: bool) -> bool {
        match self.transport.publish(topic, payload, retain).await {
            Ok(()) => {
                self.faults.clear(keys::MQTT_PUBLISH);
                true
            }
            Err(e) => {
                self.faults.raise(
                    keys::MQTT_PUBLISH,
                    format!("MQTT publish failed: {e}"),
                    Priority::HIGH,
                    None,
                );
                false
            }
        }
    }

    pub async fn publish_retained(&self, topic: &str, payload: &str) -> bool {
        self.publish(topic, payload, true).await
    }

    pub async fn subscribe(&self, topic: &str) -> bool {
        match self.transport.subscribe(topic).await {
            Ok(()) => true,
            Err(e) => {
                warn!("{e}");
                false
            }
        }
    }

    pub async fn unsubscribe(&self, topic: &str) -> bool {
        match self.transport.unsubscribe(topic).await {
            Ok(()) => true,
            Err(e) => {
                warn!("{e}");
                false
            }
        }
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.transport.disconnect().await {
            warn!("{e}");
        }
    }
}
