use crate::config::BrokerConfig;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Capacity of the client's outgoing request channel
const REQUEST_CHANNEL_CAPACITY: usize = 16;

/// How long to keep polling for the DISCONNECT packet to go out
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that can occur on the broker link
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Invalid QoS level: {0}")]
    InvalidQos(u8),

    #[error("Ingest queue closed")]
    QueueClosed,
}

/// A message received from the broker, queued for the ingest worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Map a numeric QoS level to the client type
pub fn qos_from_level(level: u8) -> Result<QoS, BrokerError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(BrokerError::InvalidQos(other)),
    }
}

/// Owns the MQTT connection lifecycle and hands every publish to the ingest queue.
///
/// Reconnection is left to the client: after an event loop error the next
/// `poll` reconnects, and the subscription is renewed on every `ConnAck`.
/// The client only pings while `poll` is driven, so publishes are handed off
/// without waiting and dropped when the queue is full.
pub struct BrokerLink {
    client: AsyncClient,
    eventloop: EventLoop,
    topic: String,
    qos: QoS,
    config: BrokerConfig,
    queue: mpsc::Sender<InboundMessage>,
}

impl BrokerLink {
    pub fn new(config: &BrokerConfig, queue: mpsc::Sender<InboundMessage>) -> Result<Self, BrokerError> {
        let qos = qos_from_level(config.qos)?;
        let (client, eventloop) = AsyncClient::new(Self::mqtt_options(config), REQUEST_CHANNEL_CAPACITY);

        Ok(Self {
            client,
            eventloop,
            topic: config.topic.clone(),
            qos,
            config: config.clone(),
            queue,
        })
    }

    pub fn mqtt_options(config: &BrokerConfig) -> MqttOptions {
        let mut options = MqttOptions::new(config.client_id(), &config.host, config.port);
        options.set_keep_alive(config.keep_alive());
        options.set_clean_session(true);

        if let Some(ref username) = config.username {
            options.set_credentials(username, config.password.clone().unwrap_or_default());
        }

        options
    }

    /// Poll the broker until shutdown or until the ingest queue closes.
    #[instrument(skip_all, fields(host = %self.config.host, port = self.config.port, topic = %self.topic))]
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), BrokerError> {
        info!("Connecting to MQTT broker");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Shutdown signal received, disconnecting from broker");
                    self.disconnect().await;
                    return Ok(());
                }
                event = self.eventloop.poll() => {
                    match event {
                        Ok(event) => self.handle_event(event).await?,
                        Err(e) => {
                            warn!(error = %e, "Connection to MQTT broker lost");
                            metrics::counter!("bridge.broker.disconnects").increment(1);

                            // The next poll reconnects; don't spin against a dead broker
                            tokio::select! {
                                _ = shutdown.cancelled() => return Ok(()),
                                _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: Event) -> Result<(), BrokerError> {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("Connected to MQTT broker");
                    self.subscribe();
                } else {
                    warn!(code = ?ack.code, "MQTT broker refused connection");
                }
            }
            Event::Incoming(Packet::SubAck(_)) => {
                debug!(topic = %self.topic, "Subscription acknowledged");
            }
            Event::Incoming(Packet::Publish(publish)) => {
                debug!(topic = %publish.topic, "Message received from broker");
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                match self.queue.try_send(message) {
                    Ok(()) => {}
                    Err(TrySendError::Full(message)) => {
                        warn!(topic = %message.topic, "Ingest queue full, dropping message");
                        metrics::counter!("bridge.messages.dropped").increment(1);
                    }
                    Err(TrySendError::Closed(_)) => return Err(BrokerError::QueueClosed),
                }
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("MQTT broker closed the connection");
                metrics::counter!("bridge.broker.disconnects").increment(1);
            }
            _ => {}
        }

        Ok(())
    }

    /// Request a clean disconnect and poll until the packet has been written.
    async fn disconnect(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            warn!(error = %e, "Failed to request MQTT disconnect");
            return;
        }

        let eventloop = &mut self.eventloop;
        let flush = async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => return true,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "Connection closed while disconnecting");
                        return false;
                    }
                }
            }
        };

        match tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, flush).await {
            Ok(true) => info!("Disconnected from MQTT broker"),
            Ok(false) => {}
            Err(_) => warn!("Timed out waiting for MQTT disconnect to flush"),
        }
    }

    fn subscribe(&self) {
        // try_subscribe: the request channel is drained by this same event loop
        match self.client.try_subscribe(&self.topic, self.qos) {
            Ok(()) => info!(topic = %self.topic, qos = ?self.qos, "Subscribed to MQTT topic"),
            Err(e) => error!(topic = %self.topic, error = %e, "Failed to subscribe to MQTT topic"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, Publish};

    fn broker_config() -> BrokerConfig {
        BrokerConfig {
            host: "broker.local".to_string(),
            port: 1883,
            topic: "sensors/#".to_string(),
            client_id: Some("bridge-test".to_string()),
            qos: 1,
            keep_alive_secs: 45,
            username: None,
            password: None,
            reconnect_delay_secs: 5,
            queue_capacity: 8,
        }
    }

    #[test]
    fn test_qos_from_level() {
        assert_eq!(qos_from_level(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2).unwrap(), QoS::ExactlyOnce);
        assert!(matches!(qos_from_level(3), Err(BrokerError::InvalidQos(3))));
    }

    #[test]
    fn test_mqtt_options() {
        let options = BrokerLink::mqtt_options(&broker_config());
        assert_eq!(options.client_id(), "bridge-test");
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(45));
    }

    #[test]
    fn test_rejects_invalid_qos() {
        let mut config = broker_config();
        config.qos = 7;
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            BrokerLink::new(&config, tx),
            Err(BrokerError::InvalidQos(7))
        ));
    }

    #[tokio::test]
    async fn test_publish_is_queued() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut link = BrokerLink::new(&broker_config(), tx).unwrap();

        let publish = Publish::new("sensors/device7/temp", QoS::AtLeastOnce, "22.5");
        link.handle_event(Event::Incoming(Packet::Publish(publish)))
            .await
            .unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, "sensors/device7/temp");
        assert_eq!(message.payload, b"22.5".to_vec());
    }

    #[tokio::test]
    async fn test_closed_queue_stops_link() {
        let (tx, rx) = mpsc::channel(8);
        let mut link = BrokerLink::new(&broker_config(), tx).unwrap();
        drop(rx);

        let publish = Publish::new("sensors/device7/temp", QoS::AtLeastOnce, "22.5");
        let result = link
            .handle_event(Event::Incoming(Packet::Publish(publish)))
            .await;
        assert!(matches!(result, Err(BrokerError::QueueClosed)));
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut link = BrokerLink::new(&broker_config(), tx).unwrap();

        for payload in ["first", "second"] {
            let publish = Publish::new("sensors/device7/temp", QoS::AtLeastOnce, payload);
            link.handle_event(Event::Incoming(Packet::Publish(publish)))
                .await
                .unwrap();
        }

        assert_eq!(rx.recv().await.unwrap().payload, b"first".to_vec());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_returns_without_broker() {
        let mut config = broker_config();
        config.host = "127.0.0.1".to_string();
        config.port = 1;
        let (tx, _rx) = mpsc::channel(1);
        let link = BrokerLink::new(&config, tx).unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(10), link.run(shutdown)).await;
        assert!(matches!(result, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_connack_triggers_subscribe() {
        let (tx, _rx) = mpsc::channel(8);
        let mut link = BrokerLink::new(&broker_config(), tx).unwrap();

        let ack = ConnAck::new(ConnectReturnCode::Success, false);
        link.handle_event(Event::Incoming(Packet::ConnAck(ack)))
            .await
            .unwrap();

        let ack = ConnAck::new(ConnectReturnCode::NotAuthorized, false);
        link.handle_event(Event::Incoming(Packet::ConnAck(ack)))
            .await
            .unwrap();
    }
}
