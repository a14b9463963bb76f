//! Buffer-change subscriptions, owned by the session manager.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::session::{SessionId, SharedBuffer};

pub type SubscriptionId = u64;

/// Called after a session's buffer changes. Runs on the pump task with no
/// buffer lock held.
pub type BufferChangeHandler = Arc<dyn Fn(SessionId, &SharedBuffer) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Subscribers {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<SubscriptionId, (SessionId, BufferChangeHandler)>>,
}

impl Subscribers {
    pub(crate) fn subscribe(&self, session_id: SessionId, handler: BufferChangeHandler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.handlers.write().insert(id, (session_id, handler));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.handlers.write().remove(&id).is_some()
    }

    /// Drop every subscription for `session_id`. Returns how many were removed.
    pub(crate) fn remove_session(&self, session_id: SessionId) -> usize {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|_, (owner, _)| *owner != session_id);
        before - handlers.len()
    }

    pub(crate) fn count_for(&self, session_id: SessionId) -> usize {
        self.handlers
            .read()
            .values()
            .filter(|(owner, _)| *owner == session_id)
            .count()
    }

    pub(crate) fn notify(&self, session_id: SessionId, buffer: &SharedBuffer) {
        let handlers: Vec<BufferChangeHandler> = self
            .handlers
            .read()
            .values()
            .filter(|(owner, _)| *owner == session_id)
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            handler(session_id, buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devmux_terminal::TerminalBuffer;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    fn counter() -> (Arc<AtomicUsize>, BufferChangeHandler) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        (
            hits,
            Arc::new(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn notifies_only_the_matching_session() {
        let subscribers = Subscribers::default();
        let buffer: SharedBuffer = Arc::new(RwLock::new(TerminalBuffer::default()));
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (hits_a, handler_a) = counter();
        let (hits_b, handler_b) = counter();
        subscribers.subscribe(a, handler_a);
        subscribers.subscribe(b, handler_b);

        subscribers.notify(a, &buffer);
        subscribers.notify(a, &buffer);

        assert_eq!(hits_a.load(Ordering::SeqCst), 2);
        assert_eq!(hits_b.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_and_session_removal() {
        let subscribers = Subscribers::default();
        let buffer: SharedBuffer = Arc::new(RwLock::new(TerminalBuffer::default()));
        let session = Uuid::new_v4();
        let (hits, handler) = counter();
        let first = subscribers.subscribe(session, handler.clone());
        subscribers.subscribe(session, handler);
        assert_ne!(first, 0);

        assert!(subscribers.unsubscribe(first));
        assert!(!subscribers.unsubscribe(first));
        subscribers.notify(session, &buffer);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert_eq!(subscribers.remove_session(session), 1);
        assert_eq!(subscribers.count_for(session), 0);
    }

    #[test]
    fn handler_may_read_the_buffer() {
        let subscribers = Subscribers::default();
        let buffer: SharedBuffer = Arc::new(RwLock::new(TerminalBuffer::new(10, 2)));
        let session = Uuid::new_v4();
        let seen_rows = Arc::new(AtomicUsize::new(0));
        let rows = seen_rows.clone();
        subscribers.subscribe(
            session,
            Arc::new(move |_, buffer| {
                let lines = buffer.read().get_visible_lines(2);
                rows.store(lines.len(), Ordering::SeqCst);
            }),
        );

        subscribers.notify(session, &buffer);
        assert_eq!(seen_rows.load(Ordering::SeqCst), 2);
    }
}
