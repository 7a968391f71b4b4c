//! Thin async wrapper over `rumqttc`: connect/disconnect/subscribe/publish,
//! per-filter incoming streams, and in-place credential refresh.
//!
//! The poll loop `select!`s over cancellation and `rumqttc::EventLoop::poll()`,
//! dispatching `Event::Incoming`/`Outgoing` and reacting to
//! `ConnectReturnCode` rejections. QoS 2 packets are unreachable here:
//! Azure IoT Hub does not support QoS 2.
//!
//! `reauthorize` spawns a new poll loop against the same `Shared` before the
//! old one is aborted, so there's a window where both are running against
//! the same filter/pending tables. Each loop is tagged with the generation
//! it was spawned with; `Shared::generation` is bumped before the new loop
//! starts, so the old loop's error/disconnect handling sees a stale
//! generation and no-ops instead of cancelling or failing the connection the
//! new loop just established. If the new connection never comes up,
//! `reauthorize` rolls the generation bump back and restores `Connected`
//! state, since the old loop is still the one actually driving traffic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
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

/// The connection's lifecycle state, observable via `MqttClient::state`.
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
    id: u64,
    prefix: String,
    sender: mpsc::UnboundedSender<Result<IncomingMessage, ConnectionDroppedError>>,
}

struct PendingPublish {
    id: u64,
    topic: String,
    payload: Vec<u8>,
    ack: oneshot::Sender<Result<(), ConnectionDroppedError>>,
}

/// Connection parameters for a single MQTT session.
#[derive(Clone)]
pub struct MqttClientOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub use_websockets: bool,
    pub keepalive: Duration,
    /// Caller-supplied X.509 client certificate context; when set, takes
    /// precedence over `use_websockets`'s plain-TLS default.
    pub tls: Option<TlsContext>,
}

struct Shared {
    filters: Mutex<Vec<FilterSubscription>>,
    pending_publishes: Mutex<VecDeque<PendingPublish>>,
    pending_subacks: Mutex<VecDeque<(u64, oneshot::Sender<Result<(), MqttError>>)>>,
    state: watch::Sender<MqttConnectionState>,
    cancellation: CancellationToken,
    /// Bumped by `reauthorize` each time it spawns a new poll loop. A poll
    /// loop only acts on connection-level errors/disconnects (cancelling
    /// everything, failing outstanding waiters) if its own generation still
    /// matches this value — otherwise it has already been superseded by a
    /// reauthorize swap and its error is stale, not a failure of the
    /// connection callers are now using.
    generation: AtomicU64,
    /// Tags each queued publish/suback waiter so a failed `client.publish`/
    /// `client.subscribe` call can remove exactly its own entry, even if
    /// other calls have queued their own waiters in the meantime.
    next_ack_id: AtomicU64,
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
    /// Connect and block until the broker accepts the session.
    pub async fn connect(options: MqttClientOptions) -> Result<Self, MqttConnectionFailedError> {
        let mqtt_options = build_mqtt_options(&options, true);
        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);

        let shared = Arc::new(Shared {
            filters: Mutex::new(Vec::new()),
            pending_publishes: Mutex::new(VecDeque::new()),
            pending_subacks: Mutex::new(VecDeque::new()),
            state: watch::channel(MqttConnectionState::Connecting).0,
            cancellation: CancellationToken::new(),
            generation: AtomicU64::new(0),
            next_ack_id: AtomicU64::new(0),
        });

        let (connected_tx, connected_rx) = oneshot::channel();
        let poll_task = tokio::spawn(run_poll_loop(eventloop, shared.clone(), 0, Some(connected_tx)));

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

    /// Signal the poll loop to stop without waiting for it, and without
    /// sending an MQTT DISCONNECT. A synchronous counterpart to `disconnect`
    /// for callers (namely `Drop` impls) that can't await.
    pub fn cancel(&self) {
        self.shared.cancellation.cancel();
    }

    /// Idempotent from any state.
    pub async fn disconnect(&self) {
        self.shared.state.send_replace(MqttConnectionState::Disconnecting);
        let _ = self.client.lock().await.disconnect().await;
        self.shared.cancellation.cancel();
        if let Some(task) = self.poll_task.lock().await.take() {
            let _ = task.await;
        }
        // The poll loop exits cooperatively on cancellation, without ever
        // reaching the error path that normally fails outstanding waiters —
        // do it here so a stream reader blocked on `.next()` (or a caller
        // awaiting a publish/subscribe ack) completes instead of hanging.
        let reason = ConnectionDroppedError::new(anyhow::anyhow!("connection was disconnected"));
        fail_outstanding_waiters(&self.shared, reason).await;
        self.shared.state.send_replace(MqttConnectionState::Disconnected);
    }

    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<IncomingStream, MqttError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.next_ack_id.fetch_add(1, Ordering::SeqCst);
        let prefix = strip_wildcard(filter);

        let (ack_tx, ack_rx) = oneshot::channel();

        // Hold `client` across the queue push and the wire write: two
        // concurrent subscribes could otherwise queue their waiters in one
        // order but reach the broker in the other, and `process_incoming`'s
        // SUBACK handling matches purely by FIFO position, so it would hand
        // the wrong caller the wrong SUBACK result.
        let send_result = {
            let client = self.client.lock().await;
            self.shared.pending_subacks.lock().await.push_back((id, ack_tx));
            client.subscribe(filter, qos).await
        };

        if let Err(e) = send_result {
            self.shared
                .pending_subacks
                .lock()
                .await
                .retain(|(entry_id, _)| *entry_id != id);
            return Err(MqttError::Subscribe(e.into()));
        }

        // Only register the routing entry once the broker has the subscribe
        // call in flight: a failed `client.subscribe` above never leaves a
        // `FilterSubscription` behind whose receiver nobody holds, and `id`
        // lets a later SUBACK-wait failure remove exactly this entry without
        // disturbing a concurrent subscribe to the same filter.
        self.shared.filters.lock().await.push(FilterSubscription {
            id,
            prefix: prefix.clone(),
            sender: tx,
        });

        let ack_result = ack_rx
            .await
            .map_err(|_| MqttError::Subscribe(anyhow::anyhow!("connection closed before SUBACK")))
            .and_then(|inner| inner);

        if let Err(e) = ack_result {
            self.shared.filters.lock().await.retain(|f| f.id != id);
            return Err(e);
        }

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

    /// QoS 0 returns after write; QoS 1 returns after PUBACK.
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
                let id = self.shared.next_ack_id.fetch_add(1, Ordering::SeqCst);
                let (ack_tx, ack_rx) = oneshot::channel();

                // Same ordering concern as `subscribe`: push and send under
                // the same `client` lock acquisition so the PUBACK queue
                // order matches the order PUBLISH packets hit the wire.
                let send_result = {
                    let client = self.client.lock().await;
                    self.shared.pending_publishes.lock().await.push_back(PendingPublish {
                        id,
                        topic: topic.to_string(),
                        payload: payload.clone(),
                        ack: ack_tx,
                    });
                    client.publish(topic, qos, false, payload).await
                };

                if let Err(e) = send_result {
                    self.shared
                        .pending_publishes
                        .lock()
                        .await
                        .retain(|entry| entry.id != id);
                    return Err(MqttError::Publish(e.into()));
                }
                ack_rx
                    .await
                    .map_err(|_| MqttError::Publish(anyhow::anyhow!("connection closed before PUBACK")))?
                    .map_err(MqttError::from)
            }
        }
    }

    /// In-place credential refresh. `rumqttc` only speaks MQTT 3.1.1, which
    /// has no mechanism to swap credentials on a live connection, so this
    /// closes and reopens with `clean_session=false`, preserving the
    /// filter/pending-publish state held in `self.shared` and re-subscribing
    /// every open filter before the new connection is handed back to
    /// callers. Takes `&self`, not `&mut self`: `client` lives behind a `Mutex` so
    /// every clone of this handle observes the swapped connection, not just
    /// the one that happened to drive the reauthorize.
    pub async fn reauthorize(&self, new_password: &str, options: &MqttClientOptions) -> Result<(), MqttConnectionFailedError> {
        self.shared.state.send_replace(MqttConnectionState::Reauthorizing);

        let reopened = options.clone_with_password(new_password);
        let mqtt_options = build_mqtt_options(&reopened, false);
        let (new_client, eventloop) = AsyncClient::new(mqtt_options, 100);

        // Bump first so the old loop's generation is stale the instant the new
        // one starts polling, even before its task is aborted below.
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (connected_tx, connected_rx) = oneshot::channel();
        let new_poll_task = tokio::spawn(run_poll_loop(eventloop, self.shared.clone(), generation, Some(connected_tx)));

        let connect_result: Result<(), MqttConnectionFailedError> = match connected_rx.await {
            Ok(inner) => inner,
            Err(_) => Err(MqttConnectionFailedError::Transport(anyhow::anyhow!(
                "event loop stopped before CONNACK was received"
            ))),
        };

        if let Err(e) = connect_result {
            // The new connection never came up. Undo the generation bump
            // (unless someone else has already moved it further) so the old
            // loop's error handling stops being stale.
            new_poll_task.abort();
            let _ = self.shared.generation.compare_exchange(
                generation,
                generation - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );

            // The rollback above only helps if the old loop is still running.
            // It shared `generation`'s stale window too: a real error on the
            // old connection during that window would have been silently
            // ignored by its own `handle_connection_error`/outgoing-disconnect
            // check, so its task may have already returned without ever
            // failing outstanding waiters. Check before claiming `Connected`.
            let old_loop_alive = match self.poll_task.lock().await.as_ref() {
                Some(task) => !task.is_finished(),
                None => false,
            };

            if old_loop_alive {
                self.shared.state.send_replace(MqttConnectionState::Connected);
            } else {
                let reason = ConnectionDroppedError::new(anyhow::anyhow!(
                    "the original connection also failed while reauthorize was in flight"
                ));
                fail_everything(&self.shared, reason).await;
            }
            return Err(e);
        }

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
                // A throwaway placeholder: nothing awaits this resubscribe's
                // SUBACK, but `process_incoming` matches SUBACKs by blind FIFO
                // position, so skipping the queue push here would let this
                // SUBACK steal a real, concurrently-queued `subscribe()`
                // call's ack slot. Pushed under the same `client` lock as the
                // wire write so its position in the queue matches the order
                // this resubscribe's SUBACK actually comes back in.
                let id = self.shared.next_ack_id.fetch_add(1, Ordering::SeqCst);
                let (ack_tx, _ack_rx) = oneshot::channel();
                self.shared.pending_subacks.lock().await.push_back((id, ack_tx));
                if let Err(e) = client.subscribe(&filter, QoS::AtLeastOnce).await {
                    self.shared
                        .pending_subacks
                        .lock()
                        .await
                        .retain(|(entry_id, _)| *entry_id != id);
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
    generation: u64,
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
                    Ok(Event::Outgoing(packet)) => process_outgoing(&shared, generation, packet),
                    Err(e) => {
                        log::debug!("error in MQTT event loop: {e:?}");
                        if let Some(tx) = connected_signal.take() {
                            let _ = tx.send(Err(MqttConnectionFailedError::Transport(e.into())));
                            return;
                        }
                        handle_connection_error(&shared, generation, e).await;
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
            if let Some((_, tx)) = pending.pop_front() {
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

fn process_outgoing(shared: &Arc<Shared>, generation: u64, packet: Outgoing) {
    if let Outgoing::Disconnect = packet {
        if shared.generation.load(Ordering::SeqCst) != generation {
            log::debug!("ignoring outgoing disconnect from a superseded MQTT connection");
            return;
        }
        log::debug!("stopping MQTT poll loop because of outgoing disconnect");
        shared.cancellation.cancel();
    }
}

async fn handle_connection_error(shared: &Arc<Shared>, generation: u64, error: ConnectionError) {
    if shared.generation.load(Ordering::SeqCst) != generation {
        log::debug!("ignoring error from a superseded MQTT connection: {error:?}");
        return;
    }
    let reason = ConnectionDroppedError::new(anyhow::anyhow!(error));
    fail_everything(shared, reason).await;
}

/// Completes every outstanding subscribe/publish/twin waiter with
/// `reason` and transitions to `Dropped`, so a dropped connection is never
/// silently swallowed.
async fn fail_everything(shared: &Arc<Shared>, reason: ConnectionDroppedError) {
    shared.state.send_replace(MqttConnectionState::Dropped);
    fail_outstanding_waiters(shared, reason).await;
}

/// Completes every outstanding subscribe/publish/twin waiter with `reason`
/// and clears the filter table, without touching connection state — callers
/// that have their own terminal state to set (`disconnect`'s `Disconnected`,
/// `fail_everything`'s `Dropped`) set it themselves.
async fn fail_outstanding_waiters(shared: &Arc<Shared>, reason: ConnectionDroppedError) {
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
    for (_, tx) in subacks.drain(..) {
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
            generation: AtomicU64::new(0),
            next_ack_id: AtomicU64::new(0),
        })
    }

    #[tokio::test]
    async fn handle_connection_error_from_a_superseded_generation_is_ignored() {
        let shared = fresh_shared();
        shared.generation.store(1, Ordering::SeqCst);

        let (filter_tx, _filter_rx) = mpsc::unbounded_channel();
        shared.filters.lock().await.push(FilterSubscription {
            id: 0,
            prefix: "devices/d1/".to_string(),
            sender: filter_tx,
        });

        handle_connection_error(
            &shared,
            0,
            ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized),
        )
        .await;

        assert_eq!(*shared.state.subscribe().borrow(), MqttConnectionState::Connected);
        assert!(!shared.filters.lock().await.is_empty());
    }

    #[tokio::test]
    async fn handle_connection_error_from_the_current_generation_fails_everything() {
        let shared = fresh_shared();
        shared.generation.store(3, Ordering::SeqCst);

        handle_connection_error(
            &shared,
            3,
            ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized),
        )
        .await;

        assert_eq!(*shared.state.subscribe().borrow(), MqttConnectionState::Dropped);
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
            id: 0,
            prefix: "devices/d1/".to_string(),
            sender: filter_tx,
        });

        let (publish_ack_tx, publish_ack_rx) = oneshot::channel();
        shared.pending_publishes.lock().await.push_back(PendingPublish {
            id: 0,
            topic: "t".to_string(),
            payload: Vec::new(),
            ack: publish_ack_tx,
        });

        let (suback_tx, suback_rx) = oneshot::channel();
        shared.pending_subacks.lock().await.push_back((0, suback_tx));

        let reason = ConnectionDroppedError::new(anyhow::anyhow!("boom"));
        fail_everything(&shared, reason).await;

        assert!(matches!(filter_rx.recv().await, Some(Err(_))));
        assert!(publish_ack_rx.await.unwrap().is_err());
        assert!(suback_rx.await.unwrap().is_err());
        assert_eq!(*shared.state.subscribe().borrow(), MqttConnectionState::Dropped);
        assert!(shared.filters.lock().await.is_empty());
    }

    #[tokio::test]
    async fn pending_publish_removed_by_id_does_not_disturb_other_entries() {
        let shared = fresh_shared();

        let (tx1, rx1) = oneshot::channel();
        shared.pending_publishes.lock().await.push_back(PendingPublish {
            id: 1,
            topic: "a".to_string(),
            payload: Vec::new(),
            ack: tx1,
        });
        let (tx2, rx2) = oneshot::channel();
        shared.pending_publishes.lock().await.push_back(PendingPublish {
            id: 2,
            topic: "b".to_string(),
            payload: Vec::new(),
            ack: tx2,
        });

        // Simulate id 1's underlying client.publish() call failing: only its
        // entry is removed, id 2 is untouched and still resolvable by a real
        // PUBACK.
        shared.pending_publishes.lock().await.retain(|entry| entry.id != 1);

        assert_eq!(shared.pending_publishes.lock().await.len(), 1);
        drop(rx1);

        let mut pending = shared.pending_publishes.lock().await;
        let entry = pending.pop_front().unwrap();
        assert_eq!(entry.id, 2);
        let _ = entry.ack.send(Ok(()));
        drop(pending);
        assert!(rx2.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn filter_removed_by_id_does_not_disturb_other_entries() {
        let shared = fresh_shared();

        let (tx1, _rx1) = mpsc::unbounded_channel();
        shared.filters.lock().await.push(FilterSubscription {
            id: 1,
            prefix: "devices/d1/".to_string(),
            sender: tx1,
        });
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        shared.filters.lock().await.push(FilterSubscription {
            id: 2,
            prefix: "devices/d1/".to_string(),
            sender: tx2,
        });

        // Simulate id 1's SUBACK wait failing (broker rejected or the
        // connection dropped before it arrived): only its entry is removed,
        // id 2's identical-prefix subscription keeps routing messages.
        shared.filters.lock().await.retain(|f| f.id != 1);

        let filters = shared.filters.lock().await;
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].id, 2);
        drop(filters);

        let message = IncomingMessage { topic: "devices/d1/x".to_string(), payload: Vec::new() };
        shared
            .filters
            .lock()
            .await
            .iter()
            .find(|f| message.topic.starts_with(&f.prefix))
            .unwrap()
            .sender
            .send(Ok(message.clone()))
            .unwrap();
        assert_eq!(rx2.recv().await.unwrap().unwrap().topic, "devices/d1/x");
    }
}
