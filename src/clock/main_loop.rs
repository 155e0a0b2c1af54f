//! Cooperative single-threaded callback loop
//!
//! Video decoders and rendering contexts are thread-affine, so every
//! video-start command and every deferred callback runs on the thread that
//! owns the [`MainLoop`]. Other threads submit work through a cloneable
//! [`LoopHandle`].
//!
//! A render loop calls [`MainLoop::tick`] once per frame. A dedicated
//! dispatcher thread calls [`MainLoop::run_until`], which waits for the next
//! due callback with the hybrid clock so callbacks fire on time.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::Clock;

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Scheduled {
    due: Instant,
    seq: u64,
    callback: Callback,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// Reversed so the max-heap pops the earliest (due, seq) first.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Submission side of the loop. Clone freely; `Send + Sync`.
#[derive(Clone)]
pub struct LoopHandle {
    tx: Sender<Scheduled>,
    seq: Arc<AtomicU64>,
}

impl LoopHandle {
    /// Run `callback` on the loop thread once `due` is reached
    pub fn schedule_at<F>(&self, due: Instant, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let scheduled = Scheduled {
            due,
            seq,
            callback: Box::new(callback),
        };
        if self.tx.send(scheduled).is_err() {
            tracing::warn!("Main loop is gone, dropping callback #{}", seq);
        }
    }

    /// Run `callback` on the loop thread after `delay`
    pub fn schedule_after<F>(&self, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_at(Instant::now() + delay, callback);
    }

    /// Run `callback` on the next tick
    pub fn call_soon<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_at(Instant::now(), callback);
    }
}

/// Owner side of the loop. Lives on exactly one thread.
pub struct MainLoop {
    clock: Clock,
    rx: Receiver<Scheduled>,
    handle: LoopHandle,
    queue: BinaryHeap<Scheduled>,
}

impl MainLoop {
    pub fn new(clock: Clock) -> Self {
        let (tx, rx) = unbounded();
        Self {
            clock,
            rx,
            handle: LoopHandle {
                tx,
                seq: Arc::new(AtomicU64::new(0)),
            },
            queue: BinaryHeap::new(),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Callbacks submitted but not yet run
    pub fn pending(&mut self) -> usize {
        self.drain_submissions();
        self.queue.len()
    }

    /// Due instant of the earliest queued callback
    pub fn next_due(&mut self) -> Option<Instant> {
        self.drain_submissions();
        self.queue.peek().map(|s| s.due)
    }

    /// Run every callback that is already due. Never blocks.
    pub fn tick(&mut self) -> usize {
        self.drain_submissions();
        let now = self.clock.now();
        let mut ran = 0;
        while self.queue.peek().map_or(false, |s| s.due <= now) {
            if let Some(scheduled) = self.queue.pop() {
                (scheduled.callback)();
                ran += 1;
            }
        }
        ran
    }

    /// Service callbacks until `deadline`, returning how many ran
    pub fn run_until(&mut self, deadline: Instant) -> usize {
        let mut ran = 0;
        loop {
            ran += self.tick();

            let now = self.clock.now();
            if now >= deadline {
                return ran;
            }

            match self.queue.peek().map(|s| s.due) {
                Some(due) if due <= deadline => self.wait_for(due),
                _ => self.wait_for(deadline),
            }
        }
    }

    /// [`MainLoop::run_until`] for a relative duration
    pub fn run_for(&mut self, duration: Duration) -> usize {
        let deadline = self.clock.now() + duration;
        self.run_until(deadline)
    }

    /// Wait for `target`, waking early if new work arrives during the coarse phase
    fn wait_for(&mut self, target: Instant) {
        let remaining = self.clock.remaining(target);
        let coarse_limit = self.clock.coarse_limit();

        if remaining > coarse_limit {
            match self.rx.recv_timeout(remaining - self.clock.spin_threshold()) {
                Ok(scheduled) => self.queue.push(scheduled),
                Err(RecvTimeoutError::Timeout) => {}
                // Our own handle keeps the channel open.
                Err(RecvTimeoutError::Disconnected) => {}
            }
            return;
        }

        self.clock.wait_until(target);
    }

    fn drain_submissions(&mut self) {
        while let Ok(scheduled) = self.rx.try_recv() {
            self.queue.push(scheduled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_tick_runs_only_due_callbacks() {
        let mut main_loop = MainLoop::new(Clock::default());
        let handle = main_loop.handle();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = log.clone();
        handle.call_soon(move || l.lock().push("now"));
        let l = log.clone();
        handle.schedule_after(Duration::from_secs(60), move || l.lock().push("later"));

        assert_eq!(main_loop.tick(), 1);
        assert_eq!(*log.lock(), vec!["now"]);
        assert_eq!(main_loop.pending(), 1);
    }

    #[test]
    fn test_callbacks_run_in_due_then_submission_order() {
        let mut main_loop = MainLoop::new(Clock::default());
        let handle = main_loop.handle();
        let log = Arc::new(Mutex::new(Vec::new()));
        let due = Instant::now() + Duration::from_millis(15);

        for name in ["b1", "b2"] {
            let l = log.clone();
            handle.schedule_at(due, move || l.lock().push(name));
        }
        let l = log.clone();
        handle.schedule_at(due - Duration::from_millis(10), move || l.lock().push("a"));

        main_loop.run_for(Duration::from_millis(40));
        assert_eq!(*log.lock(), vec!["a", "b1", "b2"]);
    }

    #[test]
    fn test_run_until_fires_on_time() {
        let mut main_loop = MainLoop::new(Clock::default());
        let handle = main_loop.handle();
        let fired = Arc::new(Mutex::new(None));
        let due = Instant::now() + Duration::from_millis(30);

        let f = fired.clone();
        handle.schedule_at(due, move || *f.lock() = Some(Instant::now()));
        main_loop.run_for(Duration::from_millis(60));

        let fired = fired.lock().expect("callback did not run");
        assert!(fired >= due);
        assert!(fired - due < Duration::from_millis(5));
    }

    #[test]
    fn test_submissions_from_other_threads() {
        let mut main_loop = MainLoop::new(Clock::default());
        let handle = main_loop.handle();
        let count = Arc::new(AtomicU64::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let handle = handle.clone();
                let count = count.clone();
                std::thread::spawn(move || {
                    handle.call_soon(move || {
                        count.fetch_add(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        main_loop.run_for(Duration::from_millis(5));
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_run_until_returns_at_deadline_when_idle() {
        let mut main_loop = MainLoop::new(Clock::default());
        let start = Instant::now();
        main_loop.run_for(Duration::from_millis(20));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_millis(200));
    }
}
