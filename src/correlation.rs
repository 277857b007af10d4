//! Request/response correlation over the duplex transport.
//!
//! Every outbound request gets a fresh nonzero id from [`CorrelationTable`]
//! and a one-shot [`ResponseHandle`]. The read loop hands inbound messages to
//! [`CorrelationTable::resolve`], which routes them to the registered waiter;
//! messages whose id has no waiter are returned to the caller for the
//! unsolicited-event path. Each id is resolved exactly once, with a response
//! or with a cancellation, and resolving an already-resolved id is a broken
//! invariant inside this layer, so it panics rather than being papered over.

use crate::protocol::Message;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// How many recently-resolved ids to remember. Needed only to tell a
/// double-resolve (fatal) apart from a genuinely unknown id (event path).
const RESOLVED_MEMORY: usize = 1024;

/// Terminal state of a pending request.
#[derive(Debug, Clone)]
pub enum Resolution {
    Response(Message),
    Cancelled,
}

/// Why a wait ended without a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("request was cancelled before a response arrived")]
    Cancelled,
    #[error("timed out waiting for a response")]
    TimedOut,
}

/// One-shot handle for a registered request. Consumed by `wait`.
pub struct ResponseHandle {
    pub id: u32,
    rx: Receiver<Resolution>,
}

impl ResponseHandle {
    /// Block until the response, cancellation, or timeout.
    ///
    /// On timeout the caller still owns the table entry and must call
    /// [`CorrelationTable::cancel`] with this handle's id.
    pub fn wait(self, timeout: Duration) -> Result<Message, WaitError> {
        match self.rx.recv_timeout(timeout) {
            Ok(Resolution::Response(msg)) => Ok(msg),
            Ok(Resolution::Cancelled) => Err(WaitError::Cancelled),
            Err(RecvTimeoutError::Timeout) => Err(WaitError::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(WaitError::Cancelled),
        }
    }
}

struct Inner {
    next_id: u32,
    waiters: HashMap<u32, Sender<Resolution>>,
    resolved_order: VecDeque<u32>,
    resolved: HashSet<u32>,
}

/// Lock-guarded id → waiter table. The single lock is held only for
/// lookup/mutation, never across a network call.
pub struct CorrelationTable {
    inner: Mutex<Inner>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                waiters: HashMap::new(),
                resolved_order: VecDeque::new(),
                resolved: HashSet::new(),
            }),
        }
    }

    /// Allocate the next id and register a waiter for it. Must happen before
    /// the request is transmitted, so a fast response cannot arrive first.
    pub fn register(&self) -> ResponseHandle {
        let mut inner = self.inner.lock().unwrap();
        let id = loop {
            inner.next_id = inner.next_id.wrapping_add(1);
            let candidate = inner.next_id;
            // Skip 0 (reserved for unsolicited) and any id still in flight.
            if candidate != 0 && !inner.waiters.contains_key(&candidate) {
                break candidate;
            }
        };
        // Recycling an id after resolution is fine; forget its history.
        inner.resolved.remove(&id);
        let (tx, rx) = bounded(1);
        if inner.waiters.insert(id, tx).is_some() {
            panic!("correlation id {} registered twice", id);
        }
        ResponseHandle { id, rx }
    }

    /// Route an inbound message to its waiter.
    ///
    /// Returns the message back when no waiter is registered for its id, so
    /// the caller can dispatch it on the unsolicited-event path. Panics if
    /// the id was already resolved; that is a protocol-layer bug, not an
    /// external condition.
    pub fn resolve(&self, id: u32, msg: Message) -> Option<Message> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(waiter) = inner.waiters.remove(&id) {
            mark_resolved(&mut inner, id);
            // Waiter may have timed out and dropped its receiver; fine.
            let _ = waiter.send(Resolution::Response(msg));
            None
        } else if inner.resolved.contains(&id) {
            panic!("correlation id {} resolved twice", id);
        } else {
            Some(msg)
        }
    }

    /// Cancel a pending request (send timeout, disconnect). A no-op when the
    /// id was already resolved: the response simply won the race.
    pub fn cancel(&self, id: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(waiter) = inner.waiters.remove(&id) {
            mark_resolved(&mut inner, id);
            let _ = waiter.send(Resolution::Cancelled);
        }
    }

    /// Cancel every pending request. Called when the transport goes away.
    pub fn cancel_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<u32> = inner.waiters.keys().copied().collect();
        for id in ids {
            if let Some(waiter) = inner.waiters.remove(&id) {
                mark_resolved(&mut inner, id);
                let _ = waiter.send(Resolution::Cancelled);
            }
        }
    }

    /// Number of requests currently awaiting a response.
    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap().waiters.len()
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

fn mark_resolved(inner: &mut Inner, id: u32) {
    inner.resolved_order.push_back(id);
    inner.resolved.insert(id);
    while inner.resolved_order.len() > RESOLVED_MEMORY {
        if let Some(old) = inner.resolved_order.pop_front() {
            inner.resolved.remove(&old);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_ids_start_at_one_and_skip_zero() {
        let table = CorrelationTable::new();
        let h = table.register();
        assert_eq!(h.id, 1);
        table.cancel(h.id);
        let h2 = table.register();
        assert_eq!(h2.id, 2);
        table.cancel(h2.id);
    }

    #[test]
    fn test_resolve_routes_to_waiter() {
        let table = CorrelationTable::new();
        let handle = table.register();
        let id = handle.id;
        assert!(table.resolve(id, Message::Ok { id }).is_none());
        let msg = handle.wait(Duration::from_millis(100)).unwrap();
        assert_eq!(msg, Message::Ok { id });
        assert_eq!(table.pending(), 0);
    }

    #[test]
    fn test_unregistered_id_routes_to_event_path() {
        let table = CorrelationTable::new();
        let msg = Message::ScanningFinished { id: 0 };
        let returned = table.resolve(999, msg.clone());
        assert_eq!(returned, Some(msg));
    }

    #[test]
    #[should_panic(expected = "resolved twice")]
    fn test_double_resolve_is_fatal() {
        let table = CorrelationTable::new();
        let handle = table.register();
        let id = handle.id;
        let _ = table.resolve(id, Message::Ok { id });
        let _ = table.resolve(id, Message::Ok { id });
    }

    #[test]
    fn test_cancel_wakes_waiter_with_cancelled() {
        let table = CorrelationTable::new();
        let handle = table.register();
        table.cancel(handle.id);
        assert_eq!(
            handle.wait(Duration::from_millis(100)),
            Err(WaitError::Cancelled)
        );
    }

    #[test]
    fn test_cancel_after_resolve_is_noop() {
        let table = CorrelationTable::new();
        let handle = table.register();
        let id = handle.id;
        let _ = table.resolve(id, Message::Ok { id });
        table.cancel(id); // response won the race; must not panic
        assert!(handle.wait(Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn test_wait_times_out() {
        let table = CorrelationTable::new();
        let handle = table.register();
        let id = handle.id;
        assert_eq!(
            handle.wait(Duration::from_millis(10)),
            Err(WaitError::TimedOut)
        );
        table.cancel(id);
        assert_eq!(table.pending(), 0);
    }

    #[test]
    fn test_concurrent_interleaved_resolution() {
        // N requests resolved from another thread in reverse order: each
        // waiter still gets exactly its own response.
        let table = Arc::new(CorrelationTable::new());
        let handles: Vec<ResponseHandle> = (0..32).map(|_| table.register()).collect();
        let ids: Vec<u32> = handles.iter().map(|h| h.id).collect();

        let resolver = {
            let table = table.clone();
            let mut ids = ids.clone();
            thread::spawn(move || {
                ids.reverse();
                for id in ids {
                    assert!(table.resolve(id, Message::Ok { id }).is_none());
                }
            })
        };

        for handle in handles {
            let expect = handle.id;
            match handle.wait(Duration::from_secs(1)).unwrap() {
                Message::Ok { id } => assert_eq!(id, expect),
                other => panic!("unexpected message {:?}", other),
            }
        }
        resolver.join().unwrap();
        assert_eq!(table.pending(), 0);
    }

    #[test]
    fn test_cancel_all_clears_table() {
        let table = CorrelationTable::new();
        let handles: Vec<ResponseHandle> = (0..4).map(|_| table.register()).collect();
        table.cancel_all();
        assert_eq!(table.pending(), 0);
        for handle in handles {
            assert_eq!(
                handle.wait(Duration::from_millis(50)),
                Err(WaitError::Cancelled)
            );
        }
    }
}
