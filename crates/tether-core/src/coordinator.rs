//! Lifetime coordinator
//!
//! One background thread per engine reconciles the host's view of an
//! object's liveness with the native collector's:
//!
//! ```text
//!   HostRef dropped ──► ToMarkWeak ──► host.mark_weak(id)      Strong → Weak
//!   native GC fired ──► ToFinalize ──► host.finalize(slot, id) Weak → PendingFinalize → Finalized
//! ```
//!
//! Both queues are bounded crossbeam channels with an overflow list behind
//! them, so producers (the scripting thread, native GC callbacks) never
//! block. The loop pops at most one item per queue, runs it without holding
//! any queue lock, and yields before the next round. When both queues are
//! empty it nudges the native engine's idle collector and sleeps until work
//! or a control message arrives.
//!
//! Shutdown is a handshake: `Terminate(ack)` → wait up to the configured
//! timeout → on silence the thread is abandoned (flagged and detached).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Select, Sender, TryRecvError, TrySendError};
use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use tether_sdk::{ObjectId, SlotId};

use crate::config::CoordinatorOptions;

/// Result of a mark-weak request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MarkOutcome {
    /// The object is now weak
    Marked,
    /// Nothing to do (already weak, re-acquired by the host, or gone)
    Skipped,
}

/// Result of a finalize request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FinalizeOutcome {
    /// Teardown ran and the registry entry was released
    Finalized,
    /// No tracked object matched; only the native slot was released
    Orphan,
}

/// The side of the engine the coordinator drives
pub(crate) trait LifetimeHost: Send + Sync {
    fn mark_weak(&self, id: ObjectId) -> MarkOutcome;
    fn finalize(&self, slot: SlotId, id: ObjectId) -> FinalizeOutcome;
    fn idle_gc_step(&self) -> bool;
}

/// How [`LifetimeCoordinator::terminate`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The loop acknowledged and the thread was joined
    Stopped,
    /// The loop did not acknowledge in time; the thread was abandoned
    Forced,
    /// No thread was running
    NotRunning,
}

/// Coordinator counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Objects moved to `Weak`
    pub marked_weak: usize,
    /// Objects moved to `Finalized`
    pub finalized: usize,
    /// GC callbacks for slots with no tracked object
    pub orphans: usize,
    /// Mark-weak requests that found nothing to do
    pub skipped: usize,
    /// Idle steps that ran a native collection
    pub idle_collections: usize,
    /// Items that spilled into an overflow list
    pub overflowed: usize,
    /// Mark-weak requests waiting
    pub pending_mark_weak: usize,
    /// Finalize requests waiting
    pub pending_finalize: usize,
}

struct WorkQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    overflow: Mutex<VecDeque<T>>,
}

impl<T> WorkQueue<T> {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = channel::bounded(capacity);
        Self {
            tx,
            rx,
            overflow: Mutex::new(VecDeque::new()),
        }
    }

    /// Returns true if the item spilled into the overflow list
    fn push(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => false,
            Err(TrySendError::Full(item)) | Err(TrySendError::Disconnected(item)) => {
                self.overflow.lock().push_back(item);
                true
            }
        }
    }

    fn pop(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(_) => self.overflow.lock().pop_front(),
        }
    }

    fn len(&self) -> usize {
        self.rx.len() + self.overflow.lock().len()
    }

    fn has_overflow(&self) -> bool {
        !self.overflow.lock().is_empty()
    }
}

enum Control {
    Pause(Sender<()>),
    Resume,
    Flush(Sender<()>),
    Terminate(Sender<()>),
}

#[derive(Default)]
struct Counters {
    marked_weak: AtomicUsize,
    finalized: AtomicUsize,
    orphans: AtomicUsize,
    skipped: AtomicUsize,
    idle_collections: AtomicUsize,
    overflowed: AtomicUsize,
}

struct Shared {
    mark_weak: WorkQueue<ObjectId>,
    finalize: WorkQueue<(SlotId, ObjectId)>,
    counters: Counters,
    abandoned: AtomicBool,
}

impl Shared {
    /// One item from each queue. Returns false if both were empty.
    fn run_once(&self, host: &dyn LifetimeHost) -> bool {
        let mut worked = false;
        if let Some(id) = self.mark_weak.pop() {
            worked = true;
            match host.mark_weak(id) {
                MarkOutcome::Marked => {
                    trace!("Object {} marked weak", id);
                    self.counters.marked_weak.fetch_add(1, Ordering::Relaxed);
                }
                MarkOutcome::Skipped => {
                    trace!("Mark-weak of {} skipped", id);
                    self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        if let Some((slot, id)) = self.finalize.pop() {
            worked = true;
            match host.finalize(slot, id) {
                FinalizeOutcome::Finalized => {
                    trace!("Object {} finalized ({})", id, slot);
                    self.counters.finalized.fetch_add(1, Ordering::Relaxed);
                }
                FinalizeOutcome::Orphan => {
                    trace!("Released orphan {} (object {})", slot, id);
                    self.counters.orphans.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        worked
    }
}

/// Granularity of handshake waits; an exited loop is noticed within it
const ACK_POLL: Duration = Duration::from_millis(10);

/// Wait for `done` until `timeout`. Returns `None` if the loop thread exits
/// without answering.
fn await_ack(done: &Receiver<()>, exited: impl Fn() -> bool, timeout: Duration) -> Option<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Some(false);
        }
        match done.recv_timeout(ACK_POLL.min(deadline - now)) {
            Ok(()) => return Some(true),
            Err(RecvTimeoutError::Disconnected) => return None,
            Err(RecvTimeoutError::Timeout) if exited() => return None,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

/// Background reconciler of host and native lifetimes
pub struct LifetimeCoordinator {
    index: usize,
    options: CoordinatorOptions,
    shared: Arc<Shared>,
    control: Sender<Control>,
    control_rx: Receiver<Control>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LifetimeCoordinator {
    pub(crate) fn new(options: CoordinatorOptions, index: usize) -> Self {
        let (control, control_rx) = channel::unbounded();
        Self {
            index,
            shared: Arc::new(Shared {
                mark_weak: WorkQueue::new(options.queue_capacity),
                finalize: WorkQueue::new(options.queue_capacity),
                counters: Counters::default(),
                abandoned: AtomicBool::new(false),
            }),
            options,
            control,
            control_rx,
            thread: Mutex::new(None),
        }
    }

    /// Spawn the loop. The loop exits once `host` is gone.
    pub(crate) fn start(&self, host: Weak<dyn LifetimeHost>) {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return;
        }
        let shared = self.shared.clone();
        let control = self.control_rx.clone();
        let options = self.options.clone();
        let handle = thread::Builder::new()
            .name(format!("tether-coordinator-{}", self.index))
            .spawn(move || run_loop(shared, control, host, options))
            .expect("Failed to spawn lifetime coordinator thread");
        debug!("Lifetime coordinator {} started", self.index);
        *thread = Some(handle);
    }

    /// True while the loop thread is alive
    pub fn is_running(&self) -> bool {
        self.thread.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    pub(crate) fn enqueue_mark_weak(&self, id: ObjectId) {
        if self.shared.mark_weak.push(id) {
            self.shared.counters.overflowed.fetch_add(1, Ordering::Relaxed);
            warn!("Mark-weak queue full; object {} spilled to overflow", id);
        }
    }

    /// Safe to call from native GC callbacks: never blocks, never runs
    /// teardown inline.
    pub(crate) fn enqueue_finalize(&self, slot: SlotId, id: ObjectId) {
        if self.shared.finalize.push((slot, id)) {
            self.shared.counters.overflowed.fetch_add(1, Ordering::Relaxed);
            warn!("Finalize queue full; {} (object {}) spilled to overflow", slot, id);
        }
    }

    fn request(&self, make: impl FnOnce(Sender<()>) -> Control, timeout: Duration) -> bool {
        if !self.is_running() {
            return false;
        }
        let (ack, done) = channel::bounded(1);
        if self.control.send(make(ack)).is_err() {
            return false;
        }
        await_ack(&done, || !self.is_running(), timeout).unwrap_or(false)
    }

    /// Stop processing work until [`resume`](Self::resume). Returns true
    /// once the loop acknowledged.
    pub fn pause(&self, timeout: Duration) -> bool {
        self.request(Control::Pause, timeout)
    }

    /// Continue after [`pause`](Self::pause)
    pub fn resume(&self) {
        let _ = self.control.send(Control::Resume);
    }

    /// Wait until everything queued before the call has been processed.
    /// A paused loop flushes only after it is resumed.
    pub fn flush(&self, timeout: Duration) -> bool {
        self.request(Control::Flush, timeout)
    }

    /// Stop the loop, waiting at most `timeout`. A loop that does not
    /// acknowledge in time is abandoned: flagged to exit at its next check
    /// and detached.
    pub fn terminate(&self, timeout: Duration) -> TerminateOutcome {
        let Some(handle) = self.thread.lock().take() else {
            return TerminateOutcome::NotRunning;
        };
        if handle.thread().id() == thread::current().id() {
            // Called from teardown on the loop itself
            self.shared.abandoned.store(true, Ordering::Release);
            return TerminateOutcome::Stopped;
        }

        let (ack, done) = channel::bounded(1);
        if !handle.is_finished() {
            let _ = self.control.send(Control::Terminate(ack));
        }
        match await_ack(&done, || handle.is_finished(), timeout) {
            Some(true) | None => {
                let _ = handle.join();
                // An unanswered Terminate left behind by an exited loop
                while self.control_rx.try_recv().is_ok() {}
                debug!("Lifetime coordinator {} stopped", self.index);
                TerminateOutcome::Stopped
            }
            Some(false) => {
                self.shared.abandoned.store(true, Ordering::Release);
                error!(
                    "Lifetime coordinator {} did not stop within {:?}; abandoning its thread",
                    self.index, timeout
                );
                drop(handle);
                TerminateOutcome::Forced
            }
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> CoordinatorStats {
        let c = &self.shared.counters;
        CoordinatorStats {
            marked_weak: c.marked_weak.load(Ordering::Relaxed),
            finalized: c.finalized.load(Ordering::Relaxed),
            orphans: c.orphans.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            idle_collections: c.idle_collections.load(Ordering::Relaxed),
            overflowed: c.overflowed.load(Ordering::Relaxed),
            pending_mark_weak: self.shared.mark_weak.len(),
            pending_finalize: self.shared.finalize.len(),
        }
    }

    /// Drain queued finalize requests without running them (engine shutdown)
    pub(crate) fn take_pending_finalize(&self) -> Vec<(SlotId, ObjectId)> {
        std::iter::from_fn(|| self.shared.finalize.pop()).collect()
    }
}

impl Drop for LifetimeCoordinator {
    fn drop(&mut self) {
        self.terminate(self.options.terminate_timeout());
    }
}

fn run_loop(shared: Arc<Shared>, control: Receiver<Control>, host: Weak<dyn LifetimeHost>, options: CoordinatorOptions) {
    let mut paused = false;
    let mut flushes: Vec<Sender<()>> = Vec::new();
    let mut terminate_ack = None;

    'run: loop {
        loop {
            let message = if paused {
                match control.recv() {
                    Ok(message) => message,
                    Err(_) => break 'run,
                }
            } else {
                match control.try_recv() {
                    Ok(message) => message,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'run,
                }
            };
            match message {
                Control::Pause(ack) => {
                    paused = true;
                    let _ = ack.send(());
                }
                Control::Resume => paused = false,
                Control::Flush(ack) => flushes.push(ack),
                Control::Terminate(ack) => {
                    terminate_ack = Some(ack);
                    break 'run;
                }
            }
        }
        if shared.abandoned.load(Ordering::Acquire) {
            break;
        }
        let Some(host) = host.upgrade() else {
            break;
        };

        if !flushes.is_empty() {
            while shared.run_once(host.as_ref()) {
                if shared.abandoned.load(Ordering::Acquire) {
                    break 'run;
                }
            }
            for ack in flushes.drain(..) {
                let _ = ack.send(());
            }
            continue;
        }

        if shared.run_once(host.as_ref()) {
            drop(host);
            thread::sleep(options.yield_interval());
            continue;
        }

        if options.idle_gc_enabled && host.idle_gc_step() {
            shared.counters.idle_collections.fetch_add(1, Ordering::Relaxed);
        }
        drop(host);
        if shared.mark_weak.has_overflow() || shared.finalize.has_overflow() {
            continue;
        }

        let mut select = Select::new();
        select.recv(&control);
        select.recv(&shared.mark_weak.rx);
        select.recv(&shared.finalize.rx);
        let _ = select.ready_timeout(options.idle_interval());
    }

    trace!("Lifetime coordinator loop exiting");
    if let Some(ack) = terminate_ack {
        let _ = ack.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[derive(Default)]
    struct FakeHost {
        marked: Mutex<Vec<ObjectId>>,
        finalized: Mutex<Vec<(SlotId, ObjectId)>>,
        mark_delay: Option<Duration>,
    }

    impl LifetimeHost for FakeHost {
        fn mark_weak(&self, id: ObjectId) -> MarkOutcome {
            if let Some(delay) = self.mark_delay {
                thread::sleep(delay);
            }
            self.marked.lock().push(id);
            MarkOutcome::Marked
        }

        fn finalize(&self, slot: SlotId, id: ObjectId) -> FinalizeOutcome {
            self.finalized.lock().push((slot, id));
            if id.is_tracked() {
                FinalizeOutcome::Finalized
            } else {
                FinalizeOutcome::Orphan
            }
        }

        fn idle_gc_step(&self) -> bool {
            false
        }
    }

    fn options() -> CoordinatorOptions {
        CoordinatorOptions {
            idle_interval_ms: 1,
            yield_interval_us: 0,
            terminate_timeout_ms: 500,
            queue_capacity: 4,
            idle_gc_enabled: true,
        }
    }

    fn started(host: &Arc<FakeHost>, options: CoordinatorOptions) -> LifetimeCoordinator {
        let coordinator = LifetimeCoordinator::new(options, 0);
        let weak: Weak<dyn LifetimeHost> = Arc::downgrade(host) as Weak<dyn LifetimeHost>;
        coordinator.start(weak);
        coordinator
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_processes_both_queues() {
        let host = Arc::new(FakeHost::default());
        let coordinator = started(&host, options());
        coordinator.enqueue_mark_weak(ObjectId::new(3));
        coordinator.enqueue_finalize(SlotId::new(1, 0), ObjectId::new(3));
        coordinator.enqueue_finalize(SlotId::new(2, 0), ObjectId::UNSET);
        assert!(coordinator.flush(WAIT));

        assert_eq!(*host.marked.lock(), vec![ObjectId::new(3)]);
        assert_eq!(host.finalized.lock().len(), 2);
        let stats = coordinator.stats();
        assert_eq!(stats.marked_weak, 1);
        assert_eq!(stats.finalized, 1);
        assert_eq!(stats.orphans, 1);
        assert_eq!(stats.pending_finalize, 0);
        assert_eq!(coordinator.terminate(WAIT), TerminateOutcome::Stopped);
    }

    #[test]
    fn test_overflow_never_blocks() {
        let host = Arc::new(FakeHost::default());
        let coordinator = started(&host, options());
        assert!(coordinator.pause(WAIT));
        for i in 0..10 {
            coordinator.enqueue_mark_weak(ObjectId::new(i));
        }
        let stats = coordinator.stats();
        assert_eq!(stats.pending_mark_weak, 10);
        assert_eq!(stats.overflowed, 6);

        coordinator.resume();
        assert!(coordinator.flush(WAIT));
        assert_eq!(host.marked.lock().len(), 10);
    }

    #[test]
    fn test_paused_loop_defers_flush() {
        let host = Arc::new(FakeHost::default());
        let coordinator = started(&host, options());
        assert!(coordinator.pause(WAIT));
        coordinator.enqueue_mark_weak(ObjectId::new(1));
        assert!(!coordinator.flush(Duration::from_millis(50)));
        assert!(host.marked.lock().is_empty());

        coordinator.resume();
        assert!(coordinator.flush(WAIT));
        assert_eq!(host.marked.lock().len(), 1);
    }

    #[test]
    fn test_terminate_twice() {
        let host = Arc::new(FakeHost::default());
        let coordinator = started(&host, options());
        assert!(coordinator.is_running());
        assert_eq!(coordinator.terminate(WAIT), TerminateOutcome::Stopped);
        assert!(!coordinator.is_running());
        assert_eq!(coordinator.terminate(WAIT), TerminateOutcome::NotRunning);
        assert!(!coordinator.flush(Duration::from_millis(10)));
    }

    #[test]
    fn test_stuck_loop_is_abandoned() {
        let host = Arc::new(FakeHost {
            mark_delay: Some(Duration::from_millis(400)),
            ..FakeHost::default()
        });
        let coordinator = started(&host, options());
        coordinator.enqueue_mark_weak(ObjectId::new(0));
        coordinator.enqueue_mark_weak(ObjectId::new(1));
        thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        assert_eq!(coordinator.terminate(Duration::from_millis(100)), TerminateOutcome::Forced);
        assert!(start.elapsed() < Duration::from_millis(350));
        assert!(!coordinator.is_running());
    }

    #[test]
    fn test_loop_exits_when_host_dropped() {
        let host = Arc::new(FakeHost::default());
        let coordinator = started(&host, options());
        drop(host);
        thread::sleep(Duration::from_millis(50));
        assert!(!coordinator.is_running());
        assert!(!coordinator.flush(WAIT));

        let start = Instant::now();
        assert_eq!(coordinator.terminate(WAIT), TerminateOutcome::Stopped);
        assert!(start.elapsed() < Duration::from_millis(250), "{:?}", start.elapsed());
        assert_eq!(coordinator.terminate(WAIT), TerminateOutcome::NotRunning);
    }
}
