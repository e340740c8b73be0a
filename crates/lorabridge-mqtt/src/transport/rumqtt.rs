//! MQTT transport built on `rumqttc`
//!
//! Each connect creates a fresh client and spawns a task that drives its
//! event loop. The first ConnAck (or error) resolves `connect`; afterwards
//! errors are reported as [`TransportEvent::ConnectionLost`] and polling
//! continues, which makes `rumqttc` reconnect.
//!
//! `subscribe` resolves on the broker's SUBACK. Requests leave the client
//! in the order they were queued, so the driver pairs each outgoing
//! SUBSCRIBE packet id with the oldest waiting subscriber.

use crate::address::BrokerAddress;
use crate::config::{ConnectConfig, ConnectionSettings, TlsConfig};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS, SubAck,
    SubscribeReasonCode, Transport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Acknowledger, BrokerMessage, BrokerTransport, TransportEvent};

type SubAckResult = std::result::Result<(), String>;

/// Subscribers waiting on a SUBACK
#[derive(Default)]
struct PendingSubAcks {
    // Queued on the client, packet id not yet assigned
    queued: VecDeque<oneshot::Sender<SubAckResult>>,
    // Sent to the broker, keyed by packet id
    sent: HashMap<u16, oneshot::Sender<SubAckResult>>,
}

impl PendingSubAcks {
    fn on_sent(&mut self, pkid: u16) {
        if let Some(waiter) = self.queued.pop_front() {
            self.sent.insert(pkid, waiter);
        }
    }

    fn on_suback(&mut self, suback: &SubAck) {
        let rejected = suback
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure));
        if rejected {
            warn!("Broker rejected subscription: pkid={}", suback.pkid);
        }

        if let Some(waiter) = self.sent.remove(&suback.pkid) {
            let result = if rejected {
                Err("broker rejected subscription (SUBACK 0x80)".to_string())
            } else {
                Ok(())
            };
            let _ = waiter.send(result);
        }
    }

    fn fail_sent(&mut self, reason: &str) {
        for (_, waiter) in self.sent.drain() {
            let _ = waiter.send(Err(reason.to_string()));
        }
    }
}

struct Session {
    client: AsyncClient,
    cancel: CancellationToken,
    subacks: Arc<Mutex<PendingSubAcks>>,
}

/// `rumqttc`-backed broker transport
pub struct MqttTransport {
    settings: ConnectionSettings,
    address: BrokerAddress,
    name: String,
    reconnect_delay: Duration,
    subscribe_timeout: Duration,
    capacity: usize,
    session: Mutex<Option<Session>>,
    // Keeps request order equal to the order of pending SUBACK waiters
    subscribe_order: tokio::sync::Mutex<()>,
}

impl MqttTransport {
    /// Create a transport; the address is validated here, TLS files are read on connect
    pub fn new(settings: ConnectionSettings, connect: &ConnectConfig) -> Result<Self> {
        let address = BrokerAddress::parse(&settings.address)?;
        Ok(Self {
            name: address.to_string(),
            address,
            settings,
            reconnect_delay: connect.reconnect_delay,
            subscribe_timeout: connect.subscribe_timeout,
            capacity: connect.request_capacity.max(1),
            session: Mutex::new(None),
            subscribe_order: tokio::sync::Mutex::new(()),
        })
    }

    fn options(&self) -> Result<MqttOptions> {
        let mut options = MqttOptions::new(
            self.settings.client_id.clone(),
            self.address.host.clone(),
            self.address.port,
        );

        // rumqttc rejects sub-second keep-alives other than zero
        let keep_alive = self.settings.keep_alive;
        if keep_alive.is_zero() {
            options.set_keep_alive(keep_alive);
        } else {
            options.set_keep_alive(keep_alive.max(Duration::from_secs(1)));
        }
        options.set_clean_session(true);
        options.set_manual_acks(true);

        if let Some(username) = &self.settings.username {
            options.set_credentials(username.clone(), self.settings.password.clone());
        }

        if self.address.is_tls() {
            options.set_transport(tls_transport(&self.settings.tls)?);
        }

        Ok(options)
    }

    fn client(&self) -> Result<AsyncClient> {
        self.session
            .lock()
            .as_ref()
            .map(|session| session.client.clone())
            .ok_or(BridgeError::NotConnected)
    }

    fn subscriber(&self) -> Result<(AsyncClient, Arc<Mutex<PendingSubAcks>>)> {
        self.session
            .lock()
            .as_ref()
            .map(|session| (session.client.clone(), session.subacks.clone()))
            .ok_or(BridgeError::NotConnected)
    }
}

fn tls_transport(tls: &TlsConfig) -> Result<Transport> {
    let client_auth = match (&tls.client_cert_path, &tls.client_key_path) {
        (Some(cert), Some(key)) => Some((std::fs::read(cert)?, std::fs::read(key)?)),
        (None, None) => None,
        _ => {
            return Err(BridgeError::InvalidConfig(
                "client_cert_path and client_key_path must be set together".to_string(),
            ))
        }
    };

    match (&tls.ca_path, client_auth) {
        (Some(ca), client_auth) => Ok(Transport::tls(std::fs::read(ca)?, client_auth, None)),
        (None, None) => Ok(Transport::tls_with_default_config()),
        (None, Some(_)) => Err(BridgeError::InvalidConfig(
            "a client certificate requires ca_path".to_string(),
        )),
    }
}

struct PublishAck {
    client: AsyncClient,
    publish: Publish,
}

#[async_trait]
impl Acknowledger for PublishAck {
    async fn ack(&self) -> Result<()> {
        Ok(self.client.ack(&self.publish).await?)
    }
}

async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    events: mpsc::Sender<TransportEvent>,
    ready: oneshot::Sender<Result<()>>,
    subacks: Arc<Mutex<PendingSubAcks>>,
    cancel: CancellationToken,
    reconnect_delay: Duration,
) {
    let mut ready = Some(ready);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => match ready.take() {
                Some(ready) => {
                    if ready.send(Ok(())).is_err() {
                        break;
                    }
                }
                None => {
                    if events.send(TransportEvent::Connected).await.is_err() {
                        break;
                    }
                }
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = BrokerMessage::with_acknowledger(
                    publish.topic.clone(),
                    publish.payload.clone(),
                    Arc::new(PublishAck {
                        client: client.clone(),
                        publish,
                    }),
                );
                // Blocks the event loop when handlers are full
                if events.send(TransportEvent::Message(message)).await.is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => subacks.lock().on_suback(&suback),
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => subacks.lock().on_sent(pkid),
            Ok(_) => {}
            Err(e) => match ready.take() {
                Some(ready) => {
                    let _ = ready.send(Err(BridgeError::Connection(e.to_string())));
                    break;
                }
                None => {
                    subacks.lock().fail_sent("connection lost before SUBACK");
                    if events
                        .send(TransportEvent::ConnectionLost(e.to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(reconnect_delay) => {}
                    }
                }
            },
        }
    }

    debug!("MQTT event loop stopped");
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    async fn connect(&self, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        let options = self.options()?;
        let (client, eventloop) = AsyncClient::new(options, self.capacity);
        let cancel = CancellationToken::new();
        let subacks = Arc::new(Mutex::new(PendingSubAcks::default()));
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(drive(
            eventloop,
            client.clone(),
            events,
            ready_tx,
            subacks.clone(),
            cancel.clone(),
            self.reconnect_delay,
        ));

        match ready_rx.await {
            Ok(Ok(())) => {
                let previous = self.session.lock().replace(Session {
                    client,
                    cancel,
                    subacks,
                });
                if let Some(previous) = previous {
                    previous.cancel.cancel();
                }
                info!("Connected to MQTT broker: {}", self.name);
                Ok(())
            }
            Ok(Err(e)) => {
                cancel.cancel();
                Err(e)
            }
            Err(_) => Err(BridgeError::Connection(
                "event loop stopped before connecting".to_string(),
            )),
        }
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        let suback = {
            let _order = self.subscribe_order.lock().await;
            let (client, subacks) = self.subscriber()?;
            let (tx, rx) = oneshot::channel();
            subacks.lock().queued.push_back(tx);

            if let Err(e) = client.subscribe(topic, qos).await {
                // Never reached the event loop, so it is still the newest waiter
                subacks.lock().queued.pop_back();
                return Err(BridgeError::subscription(topic, e));
            }
            rx
        };

        match tokio::time::timeout(self.subscribe_timeout, suback).await {
            Ok(Ok(Ok(()))) => {
                debug!("SUBACK received: topic={}", topic);
                Ok(())
            }
            Ok(Ok(Err(reason))) => Err(BridgeError::subscription(topic, reason)),
            Ok(Err(_)) => Err(BridgeError::subscription(topic, "event loop stopped")),
            Err(_) => Err(BridgeError::subscription(
                topic,
                format!("no SUBACK within {:?}", self.subscribe_timeout),
            )),
        }
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.client()?
            .unsubscribe(topic)
            .await
            .map_err(|e| BridgeError::subscription(topic, e))
    }

    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<()> {
        self.client()?
            .publish_bytes(topic, qos, false, payload)
            .await
            .map_err(|e| BridgeError::publish(topic, e))
    }

    async fn disconnect(&self) -> Result<()> {
        let session = self.session.lock().take();
        if let Some(session) = session {
            let result = session.client.disconnect().await;
            session.cancel.cancel();
            result?;
            info!("Disconnected from MQTT broker: {}", self.name);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
