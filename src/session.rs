//! In-memory session state: the send queue and the in-flight queue.
//!
//! A QoS 1/2 message lives in exactly one of the two queues at a time and
//! carries its packet identifier reservation with it; completing (or
//! abandoning) the handshake drops the context, which returns the
//! identifier to the pool.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::packet_id::IdGuard;
use crate::protocol::{Publish, QoS};

/// Where a message sits in its delivery handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
    /// Waiting in the send queue, fire and forget.
    QueuedQoS0,
    /// Waiting in the send queue for the two-step handshake.
    QueuedQoS1,
    /// Waiting in the send queue for the four-step handshake.
    QueuedQoS2,
    /// PUBLISH sent, PUBACK outstanding.
    WaitPubAck,
    /// PUBLISH sent, PUBREC outstanding.
    WaitPubRec,
    /// Inbound QoS 2 PUBLISH acknowledged with PUBREC, PUBREL outstanding.
    WaitPubRel,
    /// PUBREL sent, PUBCOMP outstanding.
    WaitPubComp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Client,
    Broker,
}

/// A PUBLISH moving through a delivery handshake.
#[derive(Debug)]
pub struct MessageContext {
    pub publish: Publish,
    pub state: PacketState,
    pub attempts: u32,
    pub last_activity: Instant,
    pub origin: Origin,
    // Present for client-originated QoS 1/2 messages. Dropping the context
    // releases the identifier.
    id: Option<IdGuard>,
}

impl MessageContext {
    /// Context for a client-originated PUBLISH entering the send queue.
    pub fn outbound(publish: Publish, id: Option<IdGuard>) -> MessageContext {
        debug_assert_eq!(publish.qos == QoS::AtMostOnce, id.is_none());
        if let Some(id) = &id {
            debug_assert_eq!(publish.pkid, id.get());
        }

        let state = match publish.qos {
            QoS::AtMostOnce => PacketState::QueuedQoS0,
            QoS::AtLeastOnce => PacketState::QueuedQoS1,
            QoS::ExactlyOnce => PacketState::QueuedQoS2,
        };

        MessageContext {
            publish,
            state,
            attempts: 0,
            last_activity: Instant::now(),
            origin: Origin::Client,
            id,
        }
    }

    /// Context for a broker-originated QoS 2 PUBLISH whose PUBREL is
    /// outstanding. The broker owns the identifier, so there is nothing to
    /// release on drop.
    pub fn inbound(publish: Publish) -> MessageContext {
        debug_assert_eq!(publish.qos, QoS::ExactlyOnce);

        MessageContext {
            publish,
            state: PacketState::WaitPubRel,
            attempts: 0,
            last_activity: Instant::now(),
            origin: Origin::Broker,
            id: None,
        }
    }

    pub fn pkid(&self) -> u16 {
        self.publish.pkid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Send,
    InFlight,
}

/// Bounded FIFO of [`MessageContext`]s with a change notification.
///
/// Every mutation emits the notification, which wakes both parked `add`
/// callers and anyone in [`PacketQueue::wait`].
pub struct PacketQueue {
    kind: QueueKind,
    capacity: usize,
    inner: Mutex<VecDeque<MessageContext>>,
    event: Notify,
}

impl PacketQueue {
    pub fn new(kind: QueueKind, capacity: usize) -> PacketQueue {
        assert!(capacity > 0, "queue capacity must be nonzero");

        PacketQueue {
            kind,
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            event: Notify::new(),
        }
    }

    /// Append `ctx`, waiting for space if the queue is full.
    ///
    /// A fire-and-forget context offered to a full send queue is dropped
    /// silently instead of blocking; returns whether the context was
    /// actually enqueued.
    pub async fn add(&self, ctx: MessageContext) -> bool {
        debug_assert!(ctx.state == PacketState::QueuedQoS0 || ctx.pkid() != 0);
        match self.kind {
            QueueKind::Send => debug_assert!(
                ctx.origin == Origin::Client
                    && matches!(
                        ctx.state,
                        PacketState::QueuedQoS0
                            | PacketState::QueuedQoS1
                            | PacketState::QueuedQoS2
                    )
            ),
            QueueKind::InFlight => debug_assert!(matches!(
                ctx.state,
                PacketState::WaitPubAck
                    | PacketState::WaitPubRec
                    | PacketState::WaitPubRel
                    | PacketState::WaitPubComp
            )),
        }

        let mut ctx = Some(ctx);
        loop {
            // Register interest before the capacity check so a pop between
            // the check and the await still wakes us.
            let notified = self.event.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut queue = self.lock();
                if queue.len() < self.capacity {
                    queue.push_back(ctx.take().expect("context consumed twice"));
                    drop(queue);
                    self.event.notify_waiters();
                    return true;
                }

                if self.kind == QueueKind::Send
                    && ctx.as_ref().expect("context consumed twice").state
                        == PacketState::QueuedQoS0
                {
                    tracing::debug!("send queue full, dropping QoS 0 publish");
                    return false;
                }
            }

            notified.await;
        }
    }

    /// Append without waiting; hands the context back if the queue is full.
    pub(crate) fn try_push(&self, ctx: MessageContext) -> Result<(), MessageContext> {
        let mut queue = self.lock();
        if queue.len() >= self.capacity {
            return Err(ctx);
        }
        queue.push_back(ctx);
        drop(queue);

        self.event.notify_waiters();
        Ok(())
    }

    /// Put a just-popped context back at the head of the queue.
    pub(crate) fn undo_pop(&self, ctx: MessageContext) {
        self.lock().push_front(ctx);
        self.event.notify_waiters();
    }

    pub fn try_pop_front(&self) -> Option<MessageContext> {
        let ctx = self.lock().pop_front();
        if ctx.is_some() {
            self.event.notify_waiters();
        }
        ctx
    }

    /// Index of the first context with `pkid` whose state is one of
    /// `states`. An empty state list matches any state.
    pub fn find(&self, pkid: u16, states: &[PacketState]) -> Option<usize> {
        self.lock()
            .iter()
            .position(|ctx| ctx.pkid() == pkid && (states.is_empty() || states.contains(&ctx.state)))
    }

    /// Remove and return the first context matching `pkid` and `states`.
    pub fn remove(&self, pkid: u16, states: &[PacketState]) -> Option<MessageContext> {
        let mut queue = self.lock();
        let index = queue
            .iter()
            .position(|ctx| ctx.pkid() == pkid && (states.is_empty() || states.contains(&ctx.state)))?;
        let ctx = queue.remove(index);
        drop(queue);

        self.event.notify_waiters();
        ctx
    }

    /// Advance the first context matching `pkid` and `from` to state `to`,
    /// stamping its activity time. Returns whether a context matched.
    pub fn set_state(&self, pkid: u16, from: &[PacketState], to: PacketState) -> bool {
        let mut queue = self.lock();
        let Some(ctx) = queue
            .iter_mut()
            .find(|ctx| ctx.pkid() == pkid && (from.is_empty() || from.contains(&ctx.state)))
        else {
            return false;
        };

        ctx.state = to;
        ctx.last_activity = Instant::now();
        drop(queue);

        self.event.notify_waiters();
        true
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().len() >= self.capacity
    }

    /// Future resolving at the next queue change. Create (and poll or
    /// `enable`) it *before* inspecting the queue to avoid missing a change.
    pub fn notified(&self) -> Notified<'_> {
        self.event.notified()
    }

    /// Park until the next queue change.
    pub async fn wait(&self) {
        self.event.notified().await;
    }

    /// Wake everything parked on this queue without changing it.
    pub fn emit(&self) {
        self.event.notify_waiters();
    }

    /// Drop every context (releasing owned packet identifiers) and wake all
    /// waiters.
    pub fn clear(&self) {
        self.lock().clear();
        self.event.notify_waiters();
    }

    /// Retransmission sweep: client-originated contexts still waiting for
    /// their first acknowledgment and idle longer than `older_than` are
    /// stamped and returned for resending with the DUP flag. Contexts that
    /// have already been sent `max_attempts` times are reported in the
    /// second list instead.
    pub fn sweep_stale(&self, older_than: Duration, max_attempts: u32) -> (Vec<Publish>, Vec<u16>) {
        let now = Instant::now();
        let mut resend = Vec::new();
        let mut exhausted = Vec::new();

        let mut queue = self.lock();
        for ctx in queue.iter_mut() {
            if !matches!(ctx.state, PacketState::WaitPubAck | PacketState::WaitPubRec) {
                continue;
            }
            if now.saturating_duration_since(ctx.last_activity) < older_than {
                continue;
            }

            if ctx.attempts >= max_attempts {
                exhausted.push(ctx.pkid());
                continue;
            }

            ctx.attempts += 1;
            ctx.last_activity = now;

            let mut publish = ctx.publish.clone();
            publish.dup = true;
            resend.push(publish);
        }

        (resend, exhausted)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<MessageContext>> {
        self.inner.lock().expect("packet queue lock poisoned")
    }
}

/// The per-client session: everything queued plus everything in flight.
pub struct Session {
    pub send: PacketQueue,
    pub inflight: PacketQueue,
}

impl Session {
    pub fn new(send_capacity: usize, inflight_capacity: usize) -> Session {
        Session {
            send: PacketQueue::new(QueueKind::Send, send_capacity),
            inflight: PacketQueue::new(QueueKind::InFlight, inflight_capacity),
        }
    }

    /// Discard all queued and in-flight state, releasing packet
    /// identifiers.
    pub fn clear(&self) {
        self.send.clear();
        self.inflight.clear();
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::packet_id::PacketIds;

    fn publish(qos: QoS, pkid: u16) -> Publish {
        Publish {
            dup: false,
            qos,
            retain: false,
            topic: "t".into(),
            pkid,
            payload: Bytes::from_static(b"x"),
        }
    }

    fn ids() -> &'static PacketIds {
        Box::leak(Box::new(PacketIds::new()))
    }

    #[tokio::test]
    async fn qos0_is_dropped_when_send_queue_full() {
        let ids = ids();
        let queue = PacketQueue::new(QueueKind::Send, 2);

        for _ in 0..2 {
            let guard = ids.next().await;
            let publish = publish(QoS::AtLeastOnce, guard.get());
            assert!(queue.add(MessageContext::outbound(publish, Some(guard))).await);
        }
        assert!(queue.is_full());

        let dropped = queue
            .add(MessageContext::outbound(publish(QoS::AtMostOnce, 0), None))
            .await;
        assert!(!dropped);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn qos1_add_parks_until_space() {
        let ids = ids();
        let queue = std::sync::Arc::new(PacketQueue::new(QueueKind::Send, 2));

        for _ in 0..2 {
            let guard = ids.next().await;
            let publish = publish(QoS::AtLeastOnce, guard.get());
            queue.add(MessageContext::outbound(publish, Some(guard))).await;
        }

        let guard = ids.next().await;
        let blocked_pkid = guard.get();
        let publish = publish(QoS::AtLeastOnce, blocked_pkid);
        let adder = tokio::spawn({
            let queue = queue.clone();
            async move { queue.add(MessageContext::outbound(publish, Some(guard))).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!adder.is_finished());
        assert_eq!(queue.len(), 2);

        let popped = queue.try_pop_front().expect("queue is full");
        assert_eq!(popped.pkid(), 1);

        assert!(adder.await.unwrap());
        assert_eq!(queue.len(), 2);
        assert!(queue.find(blocked_pkid, &[]).is_some());
    }

    #[tokio::test]
    async fn find_filters_by_state() {
        let ids = ids();
        let queue = PacketQueue::new(QueueKind::InFlight, 4);

        let guard = ids.next().await;
        let pkid = guard.get();
        let mut ctx = MessageContext::outbound(publish(QoS::ExactlyOnce, pkid), Some(guard));
        ctx.state = PacketState::WaitPubRec;
        queue.add(ctx).await;

        assert_eq!(queue.find(pkid, &[]), Some(0));
        assert_eq!(queue.find(pkid, &[PacketState::WaitPubRec]), Some(0));
        assert_eq!(queue.find(pkid, &[PacketState::WaitPubAck]), None);
        assert_eq!(queue.find(pkid + 1, &[]), None);

        assert!(queue.set_state(
            pkid,
            &[PacketState::WaitPubRec, PacketState::WaitPubComp],
            PacketState::WaitPubComp,
        ));
        assert_eq!(queue.find(pkid, &[PacketState::WaitPubComp]), Some(0));

        let removed = queue.remove(pkid, &[PacketState::WaitPubComp]).unwrap();
        assert_eq!(removed.pkid(), pkid);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn clear_releases_packet_ids() {
        let ids = ids();
        let queue = PacketQueue::new(QueueKind::Send, 4);

        let guard = ids.next().await;
        let pkid = guard.get();
        queue
            .add(MessageContext::outbound(publish(QoS::AtLeastOnce, pkid), Some(guard)))
            .await;
        assert!(ids.is_used(pkid));

        queue.clear();
        assert!(queue.is_empty());
        assert!(!ids.is_used(pkid));
    }

    #[tokio::test]
    async fn sweep_resends_then_exhausts() {
        tokio::time::pause();

        let ids = ids();
        let queue = PacketQueue::new(QueueKind::InFlight, 4);

        let guard = ids.next().await;
        let pkid = guard.get();
        let mut ctx = MessageContext::outbound(publish(QoS::AtLeastOnce, pkid), Some(guard));
        ctx.state = PacketState::WaitPubAck;
        ctx.attempts = 1;
        queue.add(ctx).await;

        // Nothing is stale yet.
        let (resend, exhausted) = queue.sweep_stale(Duration::from_secs(10), 3);
        assert!(resend.is_empty() && exhausted.is_empty());

        tokio::time::advance(Duration::from_secs(11)).await;
        let (resend, exhausted) = queue.sweep_stale(Duration::from_secs(10), 3);
        assert_eq!(resend.len(), 1);
        assert!(resend[0].dup);
        assert!(exhausted.is_empty());

        tokio::time::advance(Duration::from_secs(11)).await;
        let (resend, _) = queue.sweep_stale(Duration::from_secs(10), 3);
        assert_eq!(resend.len(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        let (resend, exhausted) = queue.sweep_stale(Duration::from_secs(10), 3);
        assert!(resend.is_empty());
        assert_eq!(exhausted, [pkid]);
    }
}
