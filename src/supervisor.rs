//! Deadline supervision for render workers.
//!
//! Every render runs on its own OS thread. The calling thread waits for the
//! first of {worker result, deadline}. When the deadline wins, the worker's
//! registered terminator is fired (for V8 this is
//! `IsolateHandle::terminate_execution`, which preempts running script
//! without its cooperation) and the worker is abandoned: its result, if it
//! ever produces one, is dropped together with its engine instance.
//!
//! Exactly one side may claim the outcome of a run. The worker claims
//! `COMPLETED` before it sends its result, the supervisor claims `TIMED_OUT`
//! before it terminates. A result that was claimed first is never discarded.

use crate::error::EngineError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const TIMED_OUT: u8 = 2;

type Terminator = Box<dyn Fn() + Send + Sync>;

struct Shared {
    outcome: AtomicU8,
    terminator: Mutex<Option<Terminator>>,
}

/// Handle given to the work running on a worker thread.
#[derive(Clone)]
pub struct WorkerToken {
    shared: Arc<Shared>,
}

impl WorkerToken {
    fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                outcome: AtomicU8::new(PENDING),
                terminator: Mutex::new(None),
            }),
        }
    }

    /// Register how to stop this work preemptively.
    ///
    /// If the deadline has already fired, `terminate` runs right away.
    pub fn on_terminate(&self, terminate: impl Fn() + Send + Sync + 'static) {
        let mut slot = self.shared.terminator.lock();
        if self.is_terminated() {
            terminate();
            return;
        }
        *slot = Some(Box::new(terminate));
    }

    /// Whether the supervisor has given up on this work.
    pub fn is_terminated(&self) -> bool {
        self.shared.outcome.load(Ordering::Acquire) == TIMED_OUT
    }

    fn claim(&self, outcome: u8) -> bool {
        self.shared
            .outcome
            .compare_exchange(PENDING, outcome, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn terminate(&self) {
        if let Some(terminate) = self.shared.terminator.lock().as_ref() {
            terminate();
        }
    }
}

/// Outcome of one supervised run.
#[derive(Debug)]
pub enum Supervised<T> {
    Completed(T),
    TimedOut { elapsed: Duration },
    Failed(EngineError),
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Spawns and supervises render workers.
#[derive(Default)]
pub struct Supervisor {
    live: Arc<AtomicUsize>,
    terminated: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` on a fresh worker thread, waiting at most `max_duration`.
    pub fn run_with_deadline<T, F>(&self, work: F, max_duration: Duration) -> Supervised<T>
    where
        F: FnOnce(&WorkerToken) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.reap();

        let started = Instant::now();
        let token = WorkerToken::new();
        let worker_token = token.clone();
        let (tx, rx) = mpsc::sync_channel::<T>(1);

        self.live.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(Arc::clone(&self.live));

        let spawned = thread::Builder::new()
            .name("ssr-render".to_string())
            .spawn(move || {
                let _guard = guard;
                let value = work(&worker_token);
                if worker_token.claim(COMPLETED) {
                    let _ = tx.send(value);
                }
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => return Supervised::Failed(EngineError::Spawn(e)),
        };

        match rx.recv_timeout(max_duration) {
            Ok(value) => {
                let _ = handle.join();
                Supervised::Completed(value)
            }
            Err(RecvTimeoutError::Disconnected) => Supervised::Failed(panicked(handle)),
            Err(RecvTimeoutError::Timeout) => {
                if !token.claim(TIMED_OUT) {
                    // The worker claimed completion while the deadline fired;
                    // its result is already on the way.
                    return match rx.recv() {
                        Ok(value) => {
                            let _ = handle.join();
                            Supervised::Completed(value)
                        }
                        Err(_) => Supervised::Failed(panicked(handle)),
                    };
                }

                token.terminate();
                let elapsed = started.elapsed();
                tracing::warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    deadline_ms = max_duration.as_millis() as u64,
                    "render deadline exceeded, worker terminated"
                );
                self.terminated.lock().push(handle);
                Supervised::TimedOut { elapsed }
            }
        }
    }

    /// Join terminated workers that have exited. Returns how many terminated
    /// workers are still running.
    pub fn reap(&self) -> usize {
        let mut terminated = self.terminated.lock();
        let (finished, running): (Vec<_>, Vec<_>) =
            terminated.drain(..).partition(|handle| handle.is_finished());
        *terminated = running;

        for handle in finished {
            if handle.join().is_err() {
                tracing::debug!("terminated worker panicked while unwinding");
            }
        }
        if !terminated.is_empty() {
            tracing::debug!(running = terminated.len(), "terminated workers still unwinding");
        }
        terminated.len()
    }

    /// Worker threads currently alive, supervised or terminated.
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

fn panicked(handle: JoinHandle<()>) -> EngineError {
    let message = match handle.join() {
        Ok(()) => "worker exited without a result".to_string(),
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string()),
    };
    EngineError::Panicked(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    /// Spin until the supervisor terminates the work.
    fn spin_until_terminated(token: &WorkerToken) -> u32 {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        token.on_terminate(move || flag.store(true, Ordering::SeqCst));
        while !stop.load(Ordering::SeqCst) {
            std::hint::spin_loop();
        }
        0
    }

    fn wait_for_no_workers(supervisor: &Supervisor) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while (supervisor.live_workers() > 0 || supervisor.reap() > 0) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(supervisor.live_workers(), 0);
        assert_eq!(supervisor.reap(), 0);
    }

    #[test]
    fn test_completes_within_deadline() {
        let supervisor = Supervisor::new();
        let result = supervisor.run_with_deadline(|_| 6 * 7, Duration::from_secs(5));
        assert!(matches!(result, Supervised::Completed(42)));
        assert_eq!(supervisor.live_workers(), 0);
    }

    #[test]
    fn test_slow_work_is_not_spuriously_timed_out() {
        let supervisor = Supervisor::new();
        let result = supervisor.run_with_deadline(
            |_| {
                thread::sleep(Duration::from_millis(30));
                "done"
            },
            Duration::from_secs(5),
        );
        assert!(matches!(result, Supervised::Completed("done")));
    }

    #[test]
    fn test_non_yielding_work_times_out() {
        let supervisor = Supervisor::new();
        let started = Instant::now();
        let result = supervisor.run_with_deadline(spin_until_terminated, Duration::from_millis(50));

        match result {
            Supervised::TimedOut { elapsed } => assert!(elapsed >= Duration::from_millis(50)),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
        wait_for_no_workers(&supervisor);
    }

    #[test]
    fn test_terminator_registered_late_fires_immediately() {
        let supervisor = Supervisor::new();
        let observed = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&observed);

        let result = supervisor.run_with_deadline(
            move |token| {
                thread::sleep(Duration::from_millis(60));
                let seen = Arc::clone(&seen);
                token.on_terminate(move || seen.store(true, Ordering::SeqCst));
            },
            Duration::from_millis(10),
        );

        assert!(matches!(result, Supervised::TimedOut { .. }));
        wait_for_no_workers(&supervisor);
        assert!(observed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_deadline_race_never_loses_claimed_result() {
        let supervisor = Supervisor::new();
        for _ in 0..200 {
            match supervisor.run_with_deadline(|_| 7u8, Duration::ZERO) {
                Supervised::Completed(v) => assert_eq!(v, 7),
                Supervised::TimedOut { .. } => {}
                Supervised::Failed(e) => panic!("unexpected failure: {}", e),
            }
        }
        wait_for_no_workers(&supervisor);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let token = WorkerToken::new();
        let racers: Vec<_> = [COMPLETED, TIMED_OUT]
            .into_iter()
            .map(|outcome| {
                let token = token.clone();
                thread::spawn(move || token.claim(outcome))
            })
            .collect();
        let wins = racers
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert!(!token.claim(COMPLETED));
    }

    #[test]
    fn test_worker_panic_is_contained() {
        let supervisor = Supervisor::new();
        let result: Supervised<()> =
            supervisor.run_with_deadline(|_| panic!("engine exploded"), Duration::from_secs(5));

        match result {
            Supervised::Failed(EngineError::Panicked(msg)) => assert!(msg.contains("engine exploded")),
            other => panic!("expected panic failure, got {:?}", other),
        }
        assert_eq!(supervisor.live_workers(), 0);
    }

    #[test]
    fn test_repeated_timeouts_release_threads() {
        let supervisor = Supervisor::new();
        for _ in 0..5 {
            let result = supervisor.run_with_deadline(spin_until_terminated, Duration::from_millis(10));
            assert!(matches!(result, Supervised::TimedOut { .. }));
        }
        wait_for_no_workers(&supervisor);
    }
}
