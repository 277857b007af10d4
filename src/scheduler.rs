//! Rate-limited command queue between the playback driver and the device
//! link.
//!
//! Producers (the real-time playback path) enqueue without blocking; a
//! single consumer thread drains the queue into an output channel, sleeping
//! between dispatches to honor the minimum inter-command gap the device
//! firmware imposes. `replace_existing` coalesces: when playback produces a
//! newer command while older ones are still queued, the stale ones are
//! dropped rather than executed out of date.

use crate::types::DeviceCommand;
use crossbeam_channel::Sender;
use log::{debug, info};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct Shared {
    queue: Mutex<VecDeque<DeviceCommand>>,
    ready: Condvar,
    closed: AtomicBool,
}

/// Cloneable handle to the shared queue. All clones refer to the same
/// scheduler; `close` through any of them shuts the consumer down.
#[derive(Clone)]
pub struct CommandScheduler {
    shared: Arc<Shared>,
    min_gap: Duration,
}

impl CommandScheduler {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
                closed: AtomicBool::new(false),
            }),
            min_gap,
        }
    }

    /// Append a command. Silently dropped after `close`.
    pub fn enqueue(&self, cmd: DeviceCommand) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back(cmd);
        self.shared.ready.notify_one();
    }

    /// Drop every queued command the predicate marks as superseded by
    /// `cmd`, then append `cmd`. Silently dropped after `close`.
    pub fn replace_existing<F>(&self, cmd: DeviceCommand, superseded: F)
    where
        F: Fn(&DeviceCommand) -> bool,
    {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        let mut queue = self.shared.queue.lock().unwrap();
        let before = queue.len();
        queue.retain(|queued| !superseded(queued));
        let dropped = before - queue.len();
        if dropped > 0 {
            debug!("Coalesced {} stale command(s)", dropped);
        }
        queue.push_back(cmd);
        self.shared.ready.notify_one();
    }

    /// Commands currently queued (diagnostics).
    pub fn len(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One-way shutdown: release the consumer, discard whatever is queued.
    /// Safe to call more than once.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut queue = self.shared.queue.lock().unwrap();
        if !queue.is_empty() {
            debug!("Discarding {} queued command(s) on close", queue.len());
        }
        queue.clear();
        drop(queue);
        self.shared.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Spawn the consumer thread. Dispatched commands go to `out`; the
    /// thread exits when the scheduler closes or the receiver side of `out`
    /// is gone. Call once.
    pub fn start(&self, out: Sender<DeviceCommand>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let min_gap = self.min_gap;
        thread::Builder::new()
            .name("cmd-scheduler".into())
            .spawn(move || {
                let mut last_dispatch: Option<Instant> = None;
                let mut dispatched: u64 = 0;
                loop {
                    let cmd = {
                        let mut queue = shared.queue.lock().unwrap();
                        loop {
                            if shared.closed.load(Ordering::Acquire) {
                                info!("Scheduler closed after {} dispatched", dispatched);
                                return;
                            }
                            if let Some(cmd) = queue.pop_front() {
                                break cmd;
                            }
                            queue = shared.ready.wait(queue).unwrap();
                        }
                    };

                    // Hardware can't absorb commands faster than min_gap.
                    if let Some(prev) = last_dispatch {
                        let since = prev.elapsed();
                        if since < min_gap {
                            thread::sleep(min_gap - since);
                        }
                    }
                    if shared.closed.load(Ordering::Acquire) {
                        return;
                    }
                    last_dispatch = Some(Instant::now());
                    dispatched += 1;
                    if out.send(cmd).is_err() {
                        debug!("Command sink gone; scheduler consumer exiting");
                        return;
                    }
                }
            })
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn cmd(position: u8) -> DeviceCommand {
        DeviceCommand::new(position, 50)
    }

    #[test]
    fn test_fifo_order_without_coalescing() {
        let sched = CommandScheduler::new(Duration::ZERO);
        sched.enqueue(cmd(10));
        sched.enqueue(cmd(20));
        sched.enqueue(cmd(30));

        let (tx, rx) = unbounded();
        let handle = sched.start(tx);
        let got: Vec<u8> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap().position)
            .collect();
        assert_eq!(got, vec![10, 20, 30]);
        sched.close();
        handle.join().unwrap();
    }

    #[test]
    fn test_coalescing_supersedes_queued_commands() {
        // B supersedes A before the consumer starts: only B is dispatched.
        let sched = CommandScheduler::new(Duration::ZERO);
        sched.enqueue(cmd(10)); // A
        sched.replace_existing(cmd(90), |_| true); // B
        assert_eq!(sched.len(), 1);

        let (tx, rx) = unbounded();
        let handle = sched.start(tx);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap().position,
            90
        );
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        sched.close();
        handle.join().unwrap();
    }

    #[test]
    fn test_coalescing_respects_predicate() {
        let sched = CommandScheduler::new(Duration::ZERO);
        sched.enqueue(cmd(10));
        sched.enqueue(cmd(20));
        // Only supersede commands targeting the lower half.
        sched.replace_existing(cmd(99), |queued| queued.position < 15);
        assert_eq!(sched.len(), 2);

        let (tx, rx) = unbounded();
        let handle = sched.start(tx);
        let got: Vec<u8> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap().position)
            .collect();
        assert_eq!(got, vec![20, 99]);
        sched.close();
        handle.join().unwrap();
    }

    #[test]
    fn test_min_gap_paces_dispatch() {
        let gap = Duration::from_millis(40);
        let sched = CommandScheduler::new(gap);
        for p in [10, 20, 30] {
            sched.enqueue(cmd(p));
        }
        let (tx, rx) = unbounded();
        let handle = sched.start(tx);
        let start = Instant::now();
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        // Three dispatches: at least two full gaps between them.
        assert!(
            start.elapsed() >= gap * 2,
            "dispatches too fast: {:?}",
            start.elapsed()
        );
        sched.close();
        handle.join().unwrap();
    }

    #[test]
    fn test_close_releases_consumer_and_discards_queue() {
        let sched = CommandScheduler::new(Duration::ZERO);
        let (tx, rx) = unbounded();
        let handle = sched.start(tx);
        // Consumer is blocked on the empty queue; close must release it.
        std::thread::sleep(Duration::from_millis(20));
        sched.enqueue(cmd(10)); // racing close; either dispatched or dropped
        sched.close();
        handle.join().unwrap();
        // After close nothing more is ever dispatched.
        sched.enqueue(cmd(50));
        assert_eq!(sched.len(), 0, "enqueue after close must be dropped");
        drop(rx);
    }

    #[test]
    fn test_double_close_is_safe() {
        let sched = CommandScheduler::new(Duration::ZERO);
        sched.close();
        sched.close();
        assert!(sched.is_closed());
    }
}
