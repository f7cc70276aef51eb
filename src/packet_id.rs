//! Packet identifier allocation.
//!
//! QoS 1/2 PUBLISH, SUBSCRIBE, and UNSUBSCRIBE packets each need a currently
//! unused nonzero identifier [MQTT-2.3.1-2]. One allocator is shared by
//! every client in the process; identifiers stay reserved until the
//! handshake that used them completes.

use std::fmt::{self, Debug, Formatter};
use std::num::NonZeroU16;
use std::sync::{Mutex, OnceLock};

use tokio::sync::Notify;

#[derive(Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash, Debug)]
pub struct PacketId(NonZeroU16);

impl PacketId {
    pub fn new(id: u16) -> Option<PacketId> {
        NonZeroU16::new(id).map(Self)
    }

    pub fn get(self) -> u16 {
        self.0.get()
    }
}

/// Process-wide pool of the 65 535 usable packet identifiers.
pub struct PacketIds {
    state: Mutex<Bitmap>,
    freed: Notify,
}

/// One bit per identifier. Bit 0 is permanently reserved; identifier 0 is
/// never issued [MQTT-2.3.1-1].
struct Bitmap {
    words: Box<[u64; 1024]>,
    /// The most recently issued identifier; scans resume just past it so
    /// recently released identifiers are not immediately reused.
    last: u16,
}

impl PacketIds {
    pub(crate) fn new() -> PacketIds {
        PacketIds {
            state: Mutex::new(Bitmap {
                words: Box::new([0; 1024]),
                last: 0,
            }),
            freed: Notify::new(),
        }
    }

    pub fn global() -> &'static PacketIds {
        static GLOBAL: OnceLock<PacketIds> = OnceLock::new();
        GLOBAL.get_or_init(PacketIds::new)
    }

    /// Reserve the next free identifier.
    ///
    /// If all 65 535 identifiers are in use this waits until one is
    /// released. The reservation is returned as a guard that releases the
    /// identifier when dropped.
    pub async fn next(&'static self) -> IdGuard {
        loop {
            // Register interest before checking so a release between the
            // check and the await is not missed.
            let notified = self.freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(id) = self.state.lock().expect("packet ID lock poisoned").allocate() {
                return IdGuard { id, ids: self };
            }

            tracing::warn!("packet ID space exhausted, waiting for a release");
            notified.await;
        }
    }

    /// Reserve a specific identifier. The identifier must not already be
    /// in use.
    pub fn mark_used(&self, id: u16) {
        assert_ne!(id, 0, "packet ID 0 is reserved");

        let mut state = self.state.lock().expect("packet ID lock poisoned");
        debug_assert!(!state.is_set(id), "packet ID {id} is already in use");
        state.set(id);
        drop(state);

        self.freed.notify_waiters();
    }

    /// Release an identifier reserved by [`Self::next`] or
    /// [`Self::mark_used`].
    pub fn mark_free(&self, id: u16) {
        assert_ne!(id, 0, "packet ID 0 is reserved");

        let mut state = self.state.lock().expect("packet ID lock poisoned");
        debug_assert!(state.is_set(id), "packet ID {id} is not in use");
        state.clear(id);
        drop(state);

        self.freed.notify_waiters();
    }

    pub(crate) fn is_used(&self, id: u16) -> bool {
        self.state.lock().expect("packet ID lock poisoned").is_set(id)
    }
}

impl Bitmap {
    fn allocate(&mut self) -> Option<PacketId> {
        let mut id = self.last;
        for _ in 0..u16::MAX {
            id = if id == u16::MAX { 1 } else { id + 1 };

            if !self.is_set(id) {
                self.set(id);
                self.last = id;
                return PacketId::new(id);
            }
        }

        None
    }

    fn is_set(&self, id: u16) -> bool {
        self.words[usize::from(id >> 6)] & (1 << (id & 63)) != 0
    }

    fn set(&mut self, id: u16) {
        self.words[usize::from(id >> 6)] |= 1 << (id & 63);
    }

    fn clear(&mut self, id: u16) {
        self.words[usize::from(id >> 6)] &= !(1 << (id & 63));
    }
}

/// An issued packet identifier. Dropping the guard returns the identifier
/// to the pool.
pub struct IdGuard {
    id: PacketId,
    ids: &'static PacketIds,
}

impl IdGuard {
    pub fn id(&self) -> PacketId {
        self.id
    }

    pub fn get(&self) -> u16 {
        self.id.get()
    }
}

impl Drop for IdGuard {
    fn drop(&mut self) {
        self.ids.mark_free(self.id.get());
    }
}

impl Debug for IdGuard {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IdGuard").field(&self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn leaked() -> &'static PacketIds {
        Box::leak(Box::new(PacketIds::new()))
    }

    #[tokio::test]
    async fn issues_sequential_nonzero_ids() {
        let ids = leaked();

        let first = ids.next().await;
        let second = ids.next().await;
        let third = ids.next().await;

        assert_eq!(first.get(), 1);
        assert_eq!(second.get(), 2);
        assert_eq!(third.get(), 3);
    }

    #[tokio::test]
    async fn skips_used_ids_and_wraps() {
        let ids = leaked();

        ids.mark_used(1);
        ids.mark_used(2);
        let id = ids.next().await;
        assert_eq!(id.get(), 3);

        // Force the scan to the end of the space and check it wraps past 0.
        ids.state.lock().unwrap().last = u16::MAX - 1;
        let high = ids.next().await;
        assert_eq!(high.get(), u16::MAX);
        let wrapped = ids.next().await;
        assert_eq!(wrapped.get(), 4);
    }

    #[tokio::test]
    async fn guard_drop_releases_id() {
        let ids = leaked();

        let guard = ids.next().await;
        let id = guard.get();
        assert!(ids.is_used(id));

        drop(guard);
        assert!(!ids.is_used(id));
    }

    #[tokio::test]
    async fn exhaustion_blocks_until_release() {
        let ids = leaked();

        {
            let mut state = ids.state.lock().unwrap();
            for id in 1..=u16::MAX {
                state.set(id);
            }
        }

        let waiter = tokio::spawn(ids.next());

        // The allocator has nothing to hand out yet.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        ids.mark_free(0x1234);
        let guard = waiter.await.unwrap();
        assert_eq!(guard.get(), 0x1234);
    }

    #[test]
    fn full_bitmap_allocate_returns_none() {
        let mut bitmap = Bitmap {
            words: Box::new([u64::MAX; 1024]),
            last: 0,
        };
        assert!(bitmap.allocate().is_none());
    }
}
