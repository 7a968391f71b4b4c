//! Thin async wrapper over `rumqttc`: connect/disconnect/subscribe/publish,
//! per-filter incoming streams, and in-place credential refresh (spec §4.3).
//!
//! The poll loop shape — `select!` over cancellation and
//! `rumqttc::EventLoop::poll()`, dispatching `Event::Incoming`/`Outgoing` and
//! reacting to `ConnectReturnCode` rejections — is carried over from
//! `spotflow::iothub::eventloop::EventLoop::run`/`process_notification`. QoS 2
//! packets are unreachable here for the same reason the teacher gives:
//! Azure IoT Hub does not support QoS 2.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport,
};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::{ConnectionDroppedError, MqttConnectionFailedError, MqttError};
use crate::tls_context::TlsContext;

/// Mirrors spec §3's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reauthorizing,
    Disconnecting,
    Dropped,
}

/// A packet delivered on a subscribed filter.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Lazy, ordered, possibly-infinite stream of packets for one filter; ends
/// with a single `Err` item on connection drop, never a silent close.
pub type IncomingStream = UnboundedReceiverStream<Result<IncomingMessage, ConnectionDroppedError>>;

struct FilterSubscription {
    prefix: String,
    sender: mpsc::UnboundedSender<Result<IncomingMessage, ConnectionDroppedError>>,
}

struct PendingPublish {
    topic: String,
    payload: Vec<u8>,
    ack: oneshot::Sender<Result<(), ConnectionDroppedError>>,
}

/// Connection parameters for a single MQTT session (spec §4.6).
#[derive(Clone)]
pub struct MqttClientOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub use_websockets: bool,
    pub keepalive: Duration,
    /// Caller-supplied X.509 client certificate context (spec §4.6
    /// `ssl_context`); when set, takes precedence over `use_websockets`'s
    /// plain-TLS default.
    pub tls: Option<TlsContext>,
}

struct Shared {
    filters: Mutex<Vec<FilterSubscription>>,
    pending_publishes: Mutex<VecDeque<PendingPublish>>,
    pending_subacks: Mutex<VecDeque<oneshot::Sender<Result<(), MqttError>>>>,
    state: watch::Sender<MqttConnectionState>,
    cancellation: CancellationToken,
}

/// The public MQTT wrapper. Cloning shares the same underlying connection;
/// `client` sits behind a `Mutex` (rather than a bare field) specifically
/// so that `reauthorize`'s swap to a freshly-reconnected `AsyncClient` is
/// visible to every clone, not just the handle that called it.
#[derive(Clone)]
pub struct MqttClient {
    client: Arc<Mutex<AsyncClient>>,
    shared: Arc<Shared>,
    poll_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MqttClient {
    /// Connect and block until the broker accepts the session (spec §4.3).
    pub async fn connect(options: MqttClientOptions) -> Result<Self, MqttConnectionFailedError> {
        let mqtt_options = build_mqtt_options(&options, true);
        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);

        let shared = Arc::new(Shared {
            filters: Mutex::new(Vec::new()),
            pending_publishes: Mutex::new(VecDeque::new()),
            pending_subacks: Mutex::new(VecDeque::new()),
            state: watch::channel(MqttConnectionState::Connecting).0,
            cancellation: CancellationToken::new(),
        });

        let (connected_tx, connected_rx) = oneshot::channel();
        let poll_task = tokio::spawn(run_poll_loop(eventloop, shared.clone(), Some(connected_tx)));

        connected_rx
            .await
            .map_err(|_| MqttConnectionFailedError::Transport(anyhow::anyhow!(
                "event loop stopped before CONNACK was received"
            )))??;

        shared.state.send_replace(MqttConnectionState::Connected);

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
            shared,
            poll_task: Arc::new(Mutex::new(Some(poll_task))),
        })
    }

    pub fn state(&self) -> watch::Receiver<MqttConnectionState> {
        self.shared.state.subscribe()
    }

    /// Idempotent from any state.
    pub async fn disconnect(&self) {
        self.shared.state.send_replace(MqttConnectionState::Disconnecting);
        let _ = self.client.lock().await.disconnect().await;
        self.shared.cancellation.cancel();
        if let Some(task) = self.poll_task.lock().await.take() {
            let _ = task.await;
        }
        self.shared.state.send_replace(MqttConnectionState::Disconnected);
    }

    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<IncomingStream, MqttError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.filters.lock().await.push(FilterSubscription {
            prefix: strip_wildcard(filter),
            sender: tx,
        });

        let (ack_tx, ack_rx) = oneshot::channel();
        self.shared.pending_subacks.lock().await.push_back(ack_tx);

        self.client
            .lock()
            .await
            .subscribe(filter, qos)
            .await
            .map_err(|e| MqttError::Subscribe(e.into()))?;

        ack_rx
            .await
            .map_err(|_| MqttError::Subscribe(anyhow::anyhow!("connection closed before SUBACK")))??;

        Ok(UnboundedReceiverStream::new(rx))
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<(), MqttError> {
        self.client
            .lock()
            .await
            .unsubscribe(filter)
            .await
            .map_err(|e| MqttError::Unsubscribe(e.into()))?;
        self.shared
            .filters
            .lock()
            .await
            .retain(|f| f.prefix != strip_wildcard(filter));
        Ok(())
    }

    /// QoS 0 returns after write; QoS 1 returns after PUBACK (spec §4.3).
    pub async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), MqttError> {
        match qos {
            QoS::AtMostOnce => {
                self.client
                    .lock()
                    .await
                    .publish(topic, qos, false, payload)
                    .await
                    .map_err(|e| MqttError::Publish(e.into()))?;
                Ok(())
            }
            _ => {
                let (ack_tx, ack_rx) = oneshot::channel();
                self.shared.pending_publishes.lock().await.push_back(PendingPublish {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                    ack: ack_tx,
                });
                self.client
                    .lock()
                    .await
                    .publish(topic, qos, false, payload)
                    .await
                    .map_err(|e| MqttError::Publish(e.into()))?;
                ack_rx
                    .await
                    .map_err(|_| MqttError::Publish(anyhow::anyhow!("connection closed before PUBACK")))?
                    .map_err(MqttError::from)
            }
        }
    }

    /// In-place credential refresh (spec §4.3, §9). `rumqttc` only speaks
    /// MQTT 3.1.1, so this is always path (b): close and reopen with
    /// `clean_session=false`, preserving the filter/pending-publish state
    /// held in `self.shared` and re-subscribing every open filter before the
    /// new connection is handed back to callers (DESIGN.md Open Question 2).
    /// Takes `&self`, not `&mut self`: `client` lives behind a `Mutex` so
    /// every clone of this handle observes the swapped connection, not just
    /// the one that happened to drive the reauthorize.
    pub async fn reauthorize(&self, new_password: &str, options: &MqttClientOptions) -> Result<(), MqttConnectionFailedError> {
        self.shared.state.send_replace(MqttConnectionState::Reauthorizing);

        let reopened = options.clone_with_password(new_password);
        let mqtt_options = build_mqtt_options(&reopened, false);
        let (new_client, eventloop) = AsyncClient::new(mqtt_options, 100);

        let (connected_tx, connected_rx) = oneshot::channel();
        let new_poll_task = tokio::spawn(run_poll_loop(eventloop, self.shared.clone(), Some(connected_tx)));

        connected_rx
            .await
            .map_err(|_| MqttConnectionFailedError::Transport(anyhow::anyhow!(
                "event loop stopped before CONNACK was received"
            )))??;

        let old_poll_task = {
            let mut slot = self.poll_task.lock().await;
            let old = slot.take();
            *slot = Some(new_poll_task);
            old
        };
        if let Some(task) = old_poll_task {
            task.abort();
        }

        *self.client.lock().await = new_client;

        let filters: Vec<String> = self
            .shared
            .filters
            .lock()
            .await
            .iter()
            .map(|f| format!("{}#", f.prefix))
            .collect();
        {
            let client = self.client.lock().await;
            for filter in filters {
                if let Err(e) = client.subscribe(&filter, QoS::AtLeastOnce).await {
                    log::warn!("failed to re-subscribe to `{filter}` after reauthorize: {e:?}");
                }
            }
        }

        let pending: Vec<(String, Vec<u8>)> = self
            .shared
            .pending_publishes
            .lock()
            .await
            .iter()
            .map(|p| (p.topic.clone(), p.payload.clone()))
            .collect();
        {
            let client = self.client.lock().await;
            for (topic, payload) in pending {
                if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, payload).await {
                    log::warn!("failed to re-publish unacked message after reauthorize: {e:?}");
                }
            }
        }

        self.shared.state.send_replace(MqttConnectionState::Connected);
        Ok(())
    }
}

impl MqttClientOptions {
    fn clone_with_password(&self, password: &str) -> Self {
        Self {
            host: self.host.clone(),
            port: self.port,
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            password: password.to_string(),
            use_websockets: self.use_websockets,
            keepalive: self.keepalive,
            tls: self.tls.clone(),
        }
    }
}

fn build_mqtt_options(options: &MqttClientOptions, clean_session: bool) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(&options.client_id, &options.host, options.port);
    mqtt_options.set_credentials(&options.username, &options.password);
    mqtt_options.set_keep_alive(options.keepalive);
    mqtt_options.set_clean_session(clean_session);
    mqtt_options.set_manual_acks(false);

    if let Some(tls) = &options.tls {
        mqtt_options.set_transport(Transport::Tls(TlsConfiguration::NativeConnector(
            tls.connector.clone(),
        )));
    } else if options.use_websockets {
        mqtt_options.set_transport(Transport::wss_with_default_config());
    } else {
        mqtt_options.set_transport(Transport::Tls(TlsConfiguration::Native));
    }

    mqtt_options
}

fn strip_wildcard(filter: &str) -> String {
    filter.trim_end_matches('#').trim_end_matches('+').to_string()
}

async fn run_poll_loop(
    mut eventloop: rumqttc::EventLoop,
    shared: Arc<Shared>,
    mut connected_signal: Option<oneshot::Sender<Result<(), MqttConnectionFailedError>>>,
) {
    loop {
        tokio::select! {
            _ = shared.cancellation.cancelled() => {
                log::debug!("stopping MQTT poll loop because of cancellation");
                break;
            }
            notification = eventloop.poll() => {
                match notification {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            if let Some(tx) = connected_signal.take() {
                                let _ = tx.send(Ok(()));
                            }
                        } else if let Some(tx) = connected_signal.take() {
                            let _ = tx.send(Err(MqttConnectionFailedError::ConnackRejected(ack.code)));
                            return;
                        }
                    }
                    Ok(Event::Incoming(packet)) => process_incoming(&shared, packet).await,
                    Ok(Event::Outgoing(packet)) => process_outgoing(&shared, packet),
                    Err(e) => {
                        log::debug!("error in MQTT event loop: {e:?}");
                        if let Some(tx) = connected_signal.take() {
                            let _ = tx.send(Err(MqttConnectionFailedError::Transport(e.into())));
                            return;
                        }
                        handle_connection_error(&shared, e).await;
                        return;
                    }
                }
            }
        }
    }
}

async fn process_incoming(shared: &Arc<Shared>, packet: Packet) {
    match packet {
        Packet::Publish(publish) => {
            let filters = shared.filters.lock().await;
            let matched = filters.iter().find(|f| publish.topic.starts_with(&f.prefix));
            match matched {
                Some(f) => {
                    let _ = f.sender.send(Ok(IncomingMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    }));
                }
                None => log::warn!("ignoring message received on unexpected topic {:?}", publish.topic),
            }
        }
        Packet::PubAck(ack) => {
            let mut pending = shared.pending_publishes.lock().await;
            if let Some(entry) = pending.pop_front() {
                let _ = entry.ack.send(Ok(()));
            } else {
                log::trace!("received PUBACK (pkid {}) with no pending publish tracked", ack.pkid);
            }
        }
        Packet::SubAck(ack) => {
            let failed = ack
                .return_codes
                .iter()
                .any(|r| matches!(r, rumqttc::SubscribeReasonCode::Failure));
            let mut pending = shared.pending_subacks.lock().await;
            if let Some(tx) = pending.pop_front() {
                let result = if failed {
                    Err(MqttError::Subscribe(anyhow::anyhow!("broker rejected one or more filters")))
                } else {
                    Ok(())
                };
                let _ = tx.send(result);
            }
        }
        Packet::PubRec(_) | Packet::PubRel(_) | Packet::PubComp(_) => {
            unreachable!("Azure IoT Hub does not support QoS 2")
        }
        _ => {}
    }
}

fn process_outgoing(shared: &Arc<Shared>, packet: Outgoing) {
    if let Outgoing::Disconnect = packet {
        log::debug!("stopping MQTT poll loop because of outgoing disconnect");
        shared.cancellation.cancel();
    }
}

async fn handle_connection_error(shared: &Arc<Shared>, error: ConnectionError) {
    let reason = ConnectionDroppedError::new(anyhow::anyhow!(error));
    fail_everything(shared, reason).await;
}

/// Completes every outstanding subscribe/publish/twin waiter with
/// `reason` and clears the filter table, so a dropped connection is never
/// silently swallowed (spec §5).
async fn fail_everything(shared: &Arc<Shared>, reason: ConnectionDroppedError) {
    shared.state.send_replace(MqttConnectionState::Dropped);

    let mut filters = shared.filters.lock().await;
    for f in filters.drain(..) {
        let _ = f.sender.send(Err(reason.clone()));
    }
    drop(filters);

    let mut pending = shared.pending_publishes.lock().await;
    for entry in pending.drain(..) {
        let _ = entry.ack.send(Err(reason.clone()));
    }
    drop(pending);

    let mut subacks = shared.pending_subacks.lock().await;
    for tx in subacks.drain(..) {
        let _ = tx.send(Err(MqttError::ConnectionDropped(reason.clone())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_shared() -> Arc<Shared> {
        Arc::new(Shared {
            filters: Mutex::new(Vec::new()),
            pending_publishes: Mutex::new(VecDeque::new()),
            pending_subacks: Mutex::new(VecDeque::new()),
            state: watch::channel(MqttConnectionState::Connected).0,
            cancellation: CancellationToken::new(),
        })
    }

    #[test]
    fn strip_wildcard_removes_trailing_hash_and_plus() {
        assert_eq!(strip_wildcard("a/b/#"), "a/b/");
        assert_eq!(strip_wildcard("a/+"), "a/");
        assert_eq!(strip_wildcard("a/b"), "a/b");
    }

    #[tokio::test]
    async fn fail_everything_completes_every_outstanding_waiter() {
        let shared = fresh_shared();
        let (filter_tx, mut filter_rx) = mpsc::unbounded_channel();
        shared.filters.lock().await.push(FilterSubscription {
            prefix: "devices/d1/".to_string(),
            sender: filter_tx,
        });

        let (publish_ack_tx, publish_ack_rx) = oneshot::channel();
        shared.pending_publishes.lock().await.push_back(PendingPublish {
            topic: "t".to_string(),
            payload: Vec::new(),
            ack: publish_ack_tx,
        });

        let (suback_tx, suback_rx) = oneshot::channel();
        shared.pending_subacks.lock().await.push_back(suback_tx);

        let reason = ConnectionDroppedError::new(anyhow::anyhow!("boom"));
        fail_everything(&shared, reason).await;

        assert!(matches!(filter_rx.recv().await, Some(Err(_))));
        assert!(publish_ack_rx.await.unwrap().is_err());
        assert!(suback_rx.await.unwrap().is_err());
        assert_eq!(*shared.state.subscribe().borrow(), MqttConnectionState::Dropped);
        assert!(shared.filters.lock().await.is_empty());
    }
}


