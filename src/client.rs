//! The session-managed MQTT client.
//!
//! Per connection the client runs a receive task (frames packets off the
//! transport and dispatches them to handlers) and a dispatcher task (drains
//! the send queue onto the wire, moving QoS 1/2 messages into the in-flight
//! queue). Timers for CONNACK, SUBACK/UNSUBACK, keep alive, and
//! retransmission run as their own tasks, all tied to one cancellation
//! token per connection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use color_eyre::eyre::WrapErr;
use rand::distributions::{Alphanumeric, DistString};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::packet_id::{IdGuard, PacketIds};
use crate::protocol::{
    self, ConnAck, Connect, ConnectReturnCode, LastWill, Login, Packet, PacketType, PubAck,
    PubComp, PubRec, PubRel, Publish, QoS, SubAck, Subscribe, SubscribeFilter, UnsubAck,
    Unsubscribe,
};
use crate::session::{MessageContext, PacketState, Session};
use crate::settings::Settings;
use crate::transport::{BoxedStream, Dialer, TcpDialer};

const CONNACK_TIMEOUT: Duration = Duration::from_secs(5);
const ACK_TIMEOUT: Duration = Duration::from_secs(1);
const PING_RESP_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a single inbound frame. The remaining-length encoding
/// allows up to 256 MiB; a broker pushing anything near that at us is
/// broken.
const MAX_INCOMING_PACKET_SIZE: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("a connection attempt is already waiting for its CONNACK")]
    ConnectPending,
    #[error("already connected")]
    AlreadyConnected,
    #[error("a subscribe is already waiting for its SUBACK")]
    SubscribePending,
    #[error("an unsubscribe is already waiting for its UNSUBACK")]
    UnsubscribePending,
    #[error("connection refused by broker: {0:?}")]
    Refused(ConnectReturnCode),
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error(transparent)]
    Protocol(#[from] protocol::Error),
    #[error("transport error")]
    Transport(#[from] std::io::Error),
}

/// Callbacks invoked from the client's tasks.
///
/// The default implementations do nothing; override the ones you care
/// about. Keep them quick: they run on the receive path.
#[allow(unused_variables)]
pub trait EventHooks: Send + Sync + 'static {
    fn on_connack(&self, session_present: bool, code: ConnectReturnCode) {}
    fn on_publish(&self, publish: &Publish) {}
    fn on_suback(&self, suback: &SubAck) {}
    fn on_unsuback(&self, pkid: u16) {}
    fn on_pingresp(&self) {}
    fn on_disconnect(&self) {}
}

/// Hooks that ignore every event.
pub struct NoHooks;

impl EventHooks for NoHooks {}

/// An MQTT 3.1.1 client. Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct MqttClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    settings: Settings,
    session: Session,
    hooks: Box<dyn EventHooks>,
    dialer: Box<dyn Dialer>,
    /// Writer plus its reusable encode buffer. The lock is held for a whole
    /// frame, so packets from different tasks never interleave.
    writer: tokio::sync::Mutex<Option<WriteChannel>>,
    state: Mutex<ConnState>,
}

struct WriteChannel {
    stream: WriteHalf<BoxedStream>,
    buffer: Vec<u8>,
}

struct ConnState {
    /// Cancelling this stops every task of the current connection.
    token: CancellationToken,
    connected: bool,
    connack_pending: bool,
    ping_outstanding: bool,
    /// Ensures the disconnect handler runs once per connection.
    disconnect_called: bool,
    connack_timer: Option<AbortHandle>,
    ping_timeout: Option<AbortHandle>,
    sub_pending: Option<PendingAck>,
    unsub_pending: Option<PendingAck>,
    receive_task: Option<JoinHandle<()>>,
}

/// A SUBSCRIBE or UNSUBSCRIBE waiting for its acknowledgment.
struct PendingAck {
    id: IdGuard,
    timer: AbortHandle,
}

impl MqttClient {
    pub fn new(settings: Settings) -> MqttClient {
        Self::with_hooks(settings, NoHooks)
    }

    pub fn with_hooks(settings: Settings, hooks: impl EventHooks) -> MqttClient {
        Self::with_dialer(settings, hooks, TcpDialer)
    }

    /// Build a client that opens its transport through `dialer` instead of
    /// dialing TCP/TLS per the settings.
    pub fn with_dialer(
        settings: Settings,
        hooks: impl EventHooks,
        dialer: impl Dialer,
    ) -> MqttClient {
        let session = Session::new(settings.send_queue_size, settings.inflight_queue_size);

        MqttClient {
            inner: Arc::new(ClientInner {
                settings,
                session,
                hooks: Box::new(hooks),
                dialer: Box::new(dialer),
                writer: tokio::sync::Mutex::new(None),
                state: Mutex::new(ConnState {
                    token: CancellationToken::new(),
                    connected: false,
                    connack_pending: false,
                    ping_outstanding: false,
                    disconnect_called: true,
                    connack_timer: None,
                    ping_timeout: None,
                    sub_pending: None,
                    unsub_pending: None,
                    receive_task: None,
                }),
            }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Whether a CONNACK has been accepted on a live transport.
    pub fn connected(&self) -> bool {
        self.inner.state.lock().expect("client state lock poisoned").connected
    }

    /// Open the transport, start the connection tasks, and send CONNECT.
    ///
    /// Returns once CONNECT is on the wire; the broker's CONNACK is
    /// reported through [`EventHooks::on_connack`]. If it does not arrive
    /// within five seconds the connection is dropped.
    pub async fn connect(&self) -> crate::Result<()> {
        self.inner.connect_impl().await
    }

    /// Send DISCONNECT (when connected), close the transport, and stop the
    /// connection tasks.
    pub async fn disconnect(&self) {
        let connected = self.connected();

        if connected {
            // The broker hangs up on DISCONNECT; a write error here changes
            // nothing about what comes next.
            let _ = self.inner.send_packet(Packet::Disconnect).await;
        }

        self.inner.on_disconnect().await;

        let receive_task = self
            .inner
            .state
            .lock()
            .expect("client state lock poisoned")
            .receive_task
            .take();
        if let Some(receive_task) = receive_task {
            let _ = receive_task.await;
        }
    }

    /// Queue a PUBLISH.
    ///
    /// QoS 1/2 publishes reserve a packet identifier (waiting for one if
    /// the space is exhausted) and wait for room in the send queue. A QoS 0
    /// publish offered to a full send queue is dropped; the return value
    /// says whether the message was actually queued.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> crate::Result<bool> {
        let id = match qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce | QoS::ExactlyOnce => Some(PacketIds::global().next().await),
        };

        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic: topic.into(),
            pkid: id.as_ref().map_or(0, IdGuard::get),
            payload: payload.into(),
        };

        let ctx = MessageContext::outbound(publish, id);
        Ok(self.inner.session.send.add(ctx).await)
    }

    /// Subscribe to `topics` at the given maximum QoS.
    ///
    /// Only one subscribe may be waiting for its SUBACK at a time; the
    /// granted QoS per filter arrives via [`EventHooks::on_suback`].
    pub async fn subscribe(&self, topics: &[&str], qos: QoS) -> crate::Result<()> {
        if topics.is_empty() {
            return Err(protocol::Error::MalformedPacket).wrap_err("no topics to subscribe to");
        }

        {
            let state = self.inner.state.lock().expect("client state lock poisoned");
            if !state.connected {
                return Err(ClientError::NotConnected.into());
            }
            if state.sub_pending.is_some() {
                return Err(ClientError::SubscribePending.into());
            }
        }

        let id = PacketIds::global().next().await;
        let subscribe = Subscribe {
            pkid: id.get(),
            filters: topics
                .iter()
                .map(|path| SubscribeFilter {
                    path: (*path).to_string(),
                    qos,
                })
                .collect(),
        };

        // Register the pending acknowledgment first so even an immediate
        // SUBACK finds it.
        let token = self.inner.current_token();
        let timer = self.inner.spawn_disconnect_timer(token, ACK_TIMEOUT, "SUBACK");
        self.inner
            .state
            .lock()
            .expect("client state lock poisoned")
            .sub_pending = Some(PendingAck { id, timer });

        if let Err(e) = self.inner.send_packet(Packet::Subscribe(subscribe)).await {
            let pending = self
                .inner
                .state
                .lock()
                .expect("client state lock poisoned")
                .sub_pending
                .take();
            if let Some(pending) = pending {
                pending.timer.abort();
            }
            return Err(e).wrap_err("failed to send SUBSCRIBE");
        }

        Ok(())
    }

    /// Unsubscribe from `topics`. Only one unsubscribe may be waiting for
    /// its UNSUBACK at a time.
    pub async fn unsubscribe(&self, topics: &[&str]) -> crate::Result<()> {
        if topics.is_empty() {
            return Err(protocol::Error::MalformedPacket).wrap_err("no topics to unsubscribe from");
        }

        {
            let state = self.inner.state.lock().expect("client state lock poisoned");
            if !state.connected {
                return Err(ClientError::NotConnected.into());
            }
            if state.unsub_pending.is_some() {
                return Err(ClientError::UnsubscribePending.into());
            }
        }

        let id = PacketIds::global().next().await;
        let unsubscribe = Unsubscribe {
            pkid: id.get(),
            filters: topics.iter().map(|path| (*path).to_string()).collect(),
        };

        let token = self.inner.current_token();
        let timer = self
            .inner
            .spawn_disconnect_timer(token, ACK_TIMEOUT, "UNSUBACK");
        self.inner
            .state
            .lock()
            .expect("client state lock poisoned")
            .unsub_pending = Some(PendingAck { id, timer });

        if let Err(e) = self.inner.send_packet(Packet::Unsubscribe(unsubscribe)).await {
            let pending = self
                .inner
                .state
                .lock()
                .expect("client state lock poisoned")
                .unsub_pending
                .take();
            if let Some(pending) = pending {
                pending.timer.abort();
            }
            return Err(e).wrap_err("failed to send UNSUBSCRIBE");
        }

        Ok(())
    }
}

impl ClientInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConnState> {
        self.state.lock().expect("client state lock poisoned")
    }

    fn current_token(&self) -> CancellationToken {
        self.lock_state().token.clone()
    }

    fn connect_impl<'a>(
        self: &'a Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = crate::Result<()>> + Send + 'a>> {
        Box::pin(self.connect_impl_inner())
    }

    async fn connect_impl_inner(self: &Arc<Self>) -> crate::Result<()> {
        {
            let state = self.lock_state();
            if state.connack_pending {
                return Err(ClientError::ConnectPending.into());
            }
            if state.connected {
                return Err(ClientError::AlreadyConnected.into());
            }
        }

        if self.settings.clean_session {
            self.session.clear();
        }

        let stream = self
            .dialer
            .dial(&self.settings)
            .await
            .wrap_err("failed to open transport")?;
        let (reader, writer) = tokio::io::split(stream);

        *self.writer.lock().await = Some(WriteChannel {
            stream: writer,
            buffer: Vec::with_capacity(8 * 1024),
        });

        let token = CancellationToken::new();
        {
            let mut state = self.lock_state();
            state.token = token.clone();
            state.connack_pending = true;
            state.connected = false;
            state.ping_outstanding = false;
            state.disconnect_called = false;
        }

        let receive_task = tokio::spawn({
            let inner = self.clone();
            let token = token.clone();
            async move { inner.receive_loop(token, reader).await }
        });
        self.lock_state().receive_task = Some(receive_task);

        tokio::spawn({
            let inner = self.clone();
            let token = token.clone();
            async move { inner.dispatcher(token).await }
        });

        if self.settings.retry_delay_ms > 0 {
            tokio::spawn({
                let inner = self.clone();
                let token = token.clone();
                async move { inner.retransmit_loop(token).await }
            });
        }

        let connect = self.build_connect()?;
        tracing::debug!(
            client_id = %connect.client_id,
            broker_window = ?self.settings.keep_alive().as_timeout(),
            "sending CONNECT"
        );
        self.send_packet(Packet::Connect(connect)).await?;

        let timer = self.spawn_disconnect_timer(token, CONNACK_TIMEOUT, "CONNACK");
        self.lock_state().connack_timer = Some(timer);

        Ok(())
    }

    fn build_connect(&self) -> crate::Result<Connect> {
        let last_will = self
            .settings
            .will
            .as_ref()
            .map(|will| {
                Ok::<_, protocol::Error>(LastWill {
                    topic: will.topic.clone(),
                    message: Bytes::from(will.message.clone().into_bytes()),
                    qos: protocol::qos(will.qos)?,
                    retain: will.retain,
                })
            })
            .transpose()
            .wrap_err("invalid last will QoS in settings")?;

        let login = (!self.settings.user_name.is_empty()).then(|| Login {
            username: self.settings.user_name.clone(),
            password: (!self.settings.password.is_empty())
                .then(|| Bytes::from(self.settings.password.clone().into_bytes())),
        });

        Ok(Connect {
            keep_alive: self.settings.keep_alive().as_seconds(),
            client_id: self.effective_client_id(),
            clean_session: self.settings.clean_session,
            last_will,
            login,
        })
    }

    fn effective_client_id(&self) -> String {
        if !self.settings.client_id.is_empty() {
            return self.settings.client_id.clone();
        }

        if let Ok(hostname) = std::env::var("HOSTNAME") {
            if !hostname.is_empty() {
                return hostname;
            }
        }

        // Brokers only have to accept 1..=23 alphanumeric bytes
        // [MQTT-3.1.3-5], so the generated fallback stays within that.
        Alphanumeric.sample_string(&mut rand::thread_rng(), 23)
    }

    /// Serialize `packet` and write it under the write lock.
    async fn write_frame(&self, packet: &Packet) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().await;
        let channel = writer.as_mut().ok_or(ClientError::NotConnected)?;

        channel.buffer.clear();
        packet.write(&mut channel.buffer)?;
        channel.stream.write_all(&channel.buffer).await?;

        Ok(())
    }

    /// Write `packet`; any failure (other than for DISCONNECT, where the
    /// connection is going away regardless) drops the connection.
    async fn send_packet(self: &Arc<Self>, packet: Packet) -> Result<(), ClientError> {
        tracing::trace!(?packet, "sending");

        match self.write_frame(&packet).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if packet.packet_type() != PacketType::Disconnect {
                    tracing::error!(error = %e, "failed to write packet, dropping connection");
                    self.on_disconnect().await;
                }
                Err(e)
            }
        }
    }

    async fn receive_loop(
        self: Arc<Self>,
        token: CancellationToken,
        mut reader: ReadHalf<BoxedStream>,
    ) {
        let mut buf = BytesMut::with_capacity(8 * 1024);

        loop {
            loop {
                match Packet::read(&mut buf, MAX_INCOMING_PACKET_SIZE) {
                    Ok(packet) => {
                        tracing::trace!(?packet, "received");
                        if let Err(e) = self.handle_packet(packet).await {
                            tracing::error!(error = %e, "failing connection");
                            self.on_disconnect().await;
                            return;
                        }
                    }
                    Err(protocol::Error::InsufficientBytes(_)) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "unreadable packet from broker");
                        self.on_disconnect().await;
                        return;
                    }
                }
            }

            tokio::select! {
                _ = token.cancelled() => return,
                read = reader.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        tracing::debug!("connection closed by broker");
                        self.on_disconnect().await;
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "error reading from transport");
                        self.on_disconnect().await;
                        return;
                    }
                },
            }
        }
    }

    async fn handle_packet(self: &Arc<Self>, packet: Packet) -> Result<(), ClientError> {
        match packet {
            Packet::ConnAck(connack) => self.handle_connack(connack).await,
            Packet::Publish(publish) => self.handle_publish(publish).await,
            Packet::PubAck(PubAck { pkid }) => {
                if self
                    .session
                    .inflight
                    .remove(pkid, &[PacketState::WaitPubAck])
                    .is_none()
                {
                    tracing::warn!(pkid, "PUBACK for unknown packet ID");
                }
                Ok(())
            }
            Packet::PubRec(PubRec { pkid }) => {
                if !self.session.inflight.set_state(
                    pkid,
                    &[PacketState::WaitPubRec, PacketState::WaitPubComp],
                    PacketState::WaitPubComp,
                ) {
                    tracing::warn!(pkid, "PUBREC for unknown packet ID");
                }
                // Sent regardless, so the broker's half of the handshake can
                // still complete. Written directly: queueing acknowledgments
                // behind a full send queue would deadlock the handshake.
                self.send_packet(Packet::PubRel(PubRel { pkid })).await?;
                Ok(())
            }
            Packet::PubRel(PubRel { pkid }) => {
                if self
                    .session
                    .inflight
                    .remove(pkid, &[PacketState::WaitPubRel])
                    .is_none()
                {
                    tracing::warn!(pkid, "PUBREL for unknown packet ID");
                }
                self.send_packet(Packet::PubComp(PubComp { pkid })).await?;
                Ok(())
            }
            Packet::PubComp(PubComp { pkid }) => {
                if self
                    .session
                    .inflight
                    .remove(pkid, &[PacketState::WaitPubComp])
                    .is_none()
                {
                    tracing::warn!(pkid, "PUBCOMP for unknown packet ID");
                }
                Ok(())
            }
            Packet::SubAck(suback) => {
                let pending = {
                    let mut state = self.lock_state();
                    match &state.sub_pending {
                        Some(pending) if pending.id.get() == suback.pkid => {
                            state.sub_pending.take()
                        }
                        _ => None,
                    }
                };

                match pending {
                    Some(pending) => {
                        pending.timer.abort();
                        self.hooks.on_suback(&suback);
                    }
                    None => tracing::warn!(pkid = suback.pkid, "SUBACK with unexpected packet ID"),
                }
                Ok(())
            }
            Packet::UnsubAck(UnsubAck { pkid }) => {
                let pending = {
                    let mut state = self.lock_state();
                    match &state.unsub_pending {
                        Some(pending) if pending.id.get() == pkid => state.unsub_pending.take(),
                        _ => None,
                    }
                };

                match pending {
                    Some(pending) => {
                        pending.timer.abort();
                        self.hooks.on_unsuback(pkid);
                    }
                    None => tracing::warn!(pkid, "UNSUBACK with unexpected packet ID"),
                }
                Ok(())
            }
            Packet::PingResp => {
                let timer = {
                    let mut state = self.lock_state();
                    state.ping_outstanding = false;
                    state.ping_timeout.take()
                };
                if let Some(timer) = timer {
                    timer.abort();
                }
                self.hooks.on_pingresp();
                Ok(())
            }
            Packet::Connect(_)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::PingReq
            | Packet::Disconnect => Err(ClientError::ProtocolViolation(
                "client-to-broker packet received from broker",
            )),
        }
    }

    async fn handle_connack(self: &Arc<Self>, connack: ConnAck) -> Result<(), ClientError> {
        let timer = {
            let mut state = self.lock_state();
            if !state.connack_pending {
                return Err(ClientError::ProtocolViolation(
                    "CONNACK without a pending CONNECT",
                ));
            }
            state.connack_pending = false;
            state.connack_timer.take()
        };
        if let Some(timer) = timer {
            timer.abort();
        }

        self.hooks.on_connack(connack.session_present, connack.code);

        if connack.code != ConnectReturnCode::Accepted {
            return Err(ClientError::Refused(connack.code));
        }

        let token = {
            let mut state = self.lock_state();
            state.connected = true;
            state.token.clone()
        };

        if let Some(interval) = self.settings.keep_alive().as_interval() {
            let inner = self.clone();
            tokio::spawn(async move { inner.keep_alive_loop(token, interval).await });
        }

        tracing::info!(
            host = %self.settings.host,
            session_present = connack.session_present,
            "connected"
        );

        // Unblock the dispatcher: it holds the send queue back until the
        // CONNACK is in.
        self.session.send.emit();

        Ok(())
    }

    async fn handle_publish(self: &Arc<Self>, publish: Publish) -> Result<(), ClientError> {
        let pkid = publish.pkid;

        match publish.qos {
            QoS::AtMostOnce => {
                self.hooks.on_publish(&publish);
            }
            QoS::AtLeastOnce => {
                self.hooks.on_publish(&publish);
                self.send_packet(Packet::PubAck(PubAck { pkid })).await?;
            }
            QoS::ExactlyOnce => {
                // A redelivery of an identifier we already hold must not
                // reach the application twice; only the PUBREC is repeated.
                let duplicate = self
                    .session
                    .inflight
                    .find(pkid, &[PacketState::WaitPubRel])
                    .is_some();

                if !duplicate {
                    self.hooks.on_publish(&publish);
                }

                self.send_packet(Packet::PubRec(PubRec { pkid })).await?;

                if !duplicate {
                    self.session
                        .inflight
                        .add(MessageContext::inbound(publish))
                        .await;
                }
            }
        }

        Ok(())
    }

    async fn dispatcher(self: Arc<Self>, token: CancellationToken) {
        loop {
            // Register before draining so a publish queued mid-drain still
            // wakes us.
            let notified = self.session.send.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Err(e) = self.drain_send_queue(&token).await {
                tracing::error!(error = %e, "dispatcher stopped");
                return;
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = &mut notified => {}
            }
        }
    }

    async fn drain_send_queue(self: &Arc<Self>, token: &CancellationToken) -> Result<(), ClientError> {
        loop {
            if token.is_cancelled() {
                return Ok(());
            }

            {
                let state = self.lock_state();
                if !state.connected || state.connack_pending {
                    return Ok(());
                }
            }

            let Some(mut ctx) = self.session.send.try_pop_front() else {
                return Ok(());
            };

            let (wait_state, queued_state) = match ctx.state {
                PacketState::QueuedQoS0 => {
                    self.send_packet(Packet::Publish(ctx.publish)).await?;
                    continue;
                }
                PacketState::QueuedQoS1 => (PacketState::WaitPubAck, PacketState::QueuedQoS1),
                PacketState::QueuedQoS2 => (PacketState::WaitPubRec, PacketState::QueuedQoS2),
                state => {
                    tracing::error!(?state, "unexpected state in send queue");
                    continue;
                }
            };

            ctx.state = wait_state;
            ctx.attempts = 1;
            ctx.last_activity = Instant::now();
            let publish = ctx.publish.clone();

            // The context has to be in flight before the frame is on the
            // wire; otherwise a fast acknowledgment could find nothing to
            // acknowledge.
            match self.session.inflight.try_push(ctx) {
                Ok(()) => {
                    self.send_packet(Packet::Publish(publish)).await?;
                }
                Err(mut ctx) => {
                    // No room in flight: restore the head and wait for an
                    // acknowledgment to open a slot.
                    ctx.state = queued_state;
                    self.session.send.undo_pop(ctx);

                    let inflight_open = self.session.inflight.notified();
                    tokio::pin!(inflight_open);
                    inflight_open.as_mut().enable();

                    if self.session.inflight.is_full() {
                        tokio::select! {
                            _ = token.cancelled() => return Ok(()),
                            _ = &mut inflight_open => {}
                        }
                    }
                }
            }
        }
    }

    async fn keep_alive_loop(self: Arc<Self>, token: CancellationToken, interval: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if self.lock_state().ping_outstanding {
                // The response timeout is already ticking; piling up
                // PINGREQs would not help.
                continue;
            }

            if self.send_packet(Packet::PingReq).await.is_err() {
                return;
            }

            let timer =
                self.spawn_disconnect_timer(token.clone(), PING_RESP_TIMEOUT, "PINGRESP");
            let mut state = self.lock_state();
            state.ping_outstanding = true;
            state.ping_timeout = Some(timer);
        }
    }

    async fn retransmit_loop(self: Arc<Self>, token: CancellationToken) {
        let delay = Duration::from_millis(self.settings.retry_delay_ms.into());
        let mut ticker = tokio::time::interval_at(Instant::now() + delay, delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let (resend, exhausted) = self
                .session
                .inflight
                .sweep_stale(delay, self.settings.retry_attempts);

            if !exhausted.is_empty() {
                tracing::error!(
                    pkids = ?exhausted,
                    attempts = self.settings.retry_attempts,
                    "publishes kept going unacknowledged, dropping connection"
                );
                self.on_disconnect().await;
                return;
            }

            for publish in resend {
                tracing::warn!(pkid = publish.pkid, "retransmitting unacknowledged publish");
                if self.send_packet(Packet::Publish(publish)).await.is_err() {
                    return;
                }
            }
        }
    }

    /// One-shot timer that drops the connection when it fires. Abort the
    /// returned handle to cancel it.
    fn spawn_disconnect_timer(
        self: &Arc<Self>,
        token: CancellationToken,
        timeout: Duration,
        what: &'static str,
    ) -> AbortHandle {
        let inner = self.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    tracing::error!(error = %ClientError::Timeout(what), "dropping connection");
                    inner.on_disconnect().await;
                }
            }
        })
        .abort_handle()
    }

    /// Tear down the current connection: cancel its tasks and timers, close
    /// the transport, wake everything parked on the session, and (when
    /// configured) schedule a reconnect. Runs at most once per connection.
    async fn on_disconnect(self: &Arc<Self>) {
        let (token, timers) = {
            let mut state = self.lock_state();
            if state.disconnect_called {
                return;
            }
            state.disconnect_called = true;
            state.connected = false;
            state.connack_pending = false;
            state.ping_outstanding = false;

            let timers: Vec<AbortHandle> = [state.connack_timer.take(), state.ping_timeout.take()]
                .into_iter()
                .flatten()
                // Dropping the pending acknowledgments releases their
                // packet identifiers.
                .chain(state.sub_pending.take().map(|pending| pending.timer))
                .chain(state.unsub_pending.take().map(|pending| pending.timer))
                .collect();

            (state.token.clone(), timers)
        };

        token.cancel();
        for timer in timers {
            timer.abort();
        }

        if let Some(mut channel) = self.writer.lock().await.take() {
            let _ = channel.stream.flush().await;
            let _ = channel.stream.shutdown().await;
        }

        // Parked producers and the dispatcher check their surroundings on
        // every wakeup; let them observe the dead connection.
        self.session.send.emit();
        self.session.inflight.emit();

        self.hooks.on_disconnect();

        if self.settings.reconnect_s > 0 {
            let delay = Duration::from_secs(self.settings.reconnect_s.into());
            let inner = self.clone();
            tokio::spawn(async move { inner.reconnect_loop(delay).await });
        }
    }

    async fn reconnect_loop(self: Arc<Self>, delay: Duration) {
        loop {
            tokio::time::sleep(delay).await;

            {
                let state = self.lock_state();
                if state.connected || state.connack_pending {
                    // Somebody reconnected in the meantime.
                    return;
                }
            }

            tracing::info!(host = %self.settings.host, "reconnecting");
            match self.connect_impl().await {
                Ok(()) => return,
                Err(e) => tracing::error!(error = %e, "reconnect attempt failed"),
            }
        }
    }
}
