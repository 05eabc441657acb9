//! Wait strategies for empty-queue consumers.
//!
//! A wait strategy decides how a thread blocks while a predicate is false:
//! busy-spin (lowest latency, burns a core), cooperative yield, OS-level park
//! (Mutex + Condvar), or a hybrid that escalates spin → yield → park as the
//! wait drags on. The choice never affects correctness, only the
//! latency/CPU trade-off, so strategies are interchangeable behind the trait.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Park slice used so parked threads observe cancellation promptly.
const PARK_SLICE: Duration = Duration::from_millis(10);

/// Why a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The predicate became true.
    Ready,
    /// The cancellation token fired.
    Cancelled,
    /// The deadline passed before the predicate became true.
    TimedOut,
}

/// Policy for blocking until a predicate becomes true.
pub trait WaitStrategy: Send + Sync {
    /// Suspend the calling thread until `ready` returns true, `cancel`
    /// fires, or `deadline` passes.
    ///
    /// `ready` is invoked repeatedly and must be cheap and free of side
    /// effects.
    fn wait_for(
        &self,
        ready: &dyn Fn() -> bool,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> WaitOutcome;

    /// Wake all threads blocked in [`WaitStrategy::wait_for`].
    ///
    /// Producers call this after every state change the predicates observe.
    fn signal_all(&self);
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    matches!(deadline, Some(d) if Instant::now() >= d)
}

// ============================================================================
// Spin
// ============================================================================

/// Busy-spin strategy. Lowest wake latency, one core per waiter.
#[derive(Debug, Default)]
pub struct SpinWait;

impl WaitStrategy for SpinWait {
    fn wait_for(
        &self,
        ready: &dyn Fn() -> bool,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> WaitOutcome {
        loop {
            if ready() {
                return WaitOutcome::Ready;
            }
            if cancel.is_cancelled() {
                return WaitOutcome::Cancelled;
            }
            if deadline_passed(deadline) {
                return WaitOutcome::TimedOut;
            }
            std::hint::spin_loop();
        }
    }

    fn signal_all(&self) {
        // Spinners observe state directly.
    }
}

// ============================================================================
// Yield
// ============================================================================

/// Cooperative hand-off strategy. Spins with `thread::yield_now`.
#[derive(Debug, Default)]
pub struct YieldWait;

impl WaitStrategy for YieldWait {
    fn wait_for(
        &self,
        ready: &dyn Fn() -> bool,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> WaitOutcome {
        loop {
            if ready() {
                return WaitOutcome::Ready;
            }
            if cancel.is_cancelled() {
                return WaitOutcome::Cancelled;
            }
            if deadline_passed(deadline) {
                return WaitOutcome::TimedOut;
            }
            std::thread::yield_now();
        }
    }

    fn signal_all(&self) {
        // Yielding waiters observe state directly.
    }
}

// ============================================================================
// Park
// ============================================================================

/// OS-level wait via Mutex + Condvar.
///
/// Waiters re-check the predicate under the lock before parking and
/// `signal_all` notifies under the same lock, which closes the lost-wakeup
/// window. Parks are sliced so cancellation and deadlines are observed even
/// without a signal.
#[derive(Debug, Default)]
pub struct ParkWait {
    lock: Mutex<()>,
    cv: Condvar,
}

impl ParkWait {
    /// Create a park strategy.
    pub fn new() -> Self {
        Self::default()
    }
}

impl WaitStrategy for ParkWait {
    fn wait_for(
        &self,
        ready: &dyn Fn() -> bool,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> WaitOutcome {
        loop {
            if ready() {
                return WaitOutcome::Ready;
            }
            if cancel.is_cancelled() {
                return WaitOutcome::Cancelled;
            }
            if deadline_passed(deadline) {
                return WaitOutcome::TimedOut;
            }

            let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            // Re-check under the lock: a producer that changed state before we
            // acquired it has already notified, and one that changes state
            // after must wait for the lock to notify.
            if ready() {
                return WaitOutcome::Ready;
            }
            let slice = match deadline {
                Some(d) => d.saturating_duration_since(Instant::now()).min(PARK_SLICE),
                None => PARK_SLICE,
            };
            let _unused = self
                .cv
                .wait_timeout(guard, slice)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn signal_all(&self) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.cv.notify_all();
    }
}

// ============================================================================
// Hybrid
// ============================================================================

/// Default strategy: spin briefly, yield for a while, then park.
///
/// Keeps the fast path fast under load while releasing the core once the
/// queue has clearly gone quiet.
#[derive(Debug)]
pub struct HybridWait {
    spin_iterations: u32,
    yield_iterations: u32,
    park: ParkWait,
}

impl Default for HybridWait {
    fn default() -> Self {
        Self {
            spin_iterations: 100,
            yield_iterations: 20,
            park: ParkWait::new(),
        }
    }
}

impl HybridWait {
    /// Create a hybrid strategy with explicit escalation thresholds.
    pub fn new(spin_iterations: u32, yield_iterations: u32) -> Self {
        Self {
            spin_iterations,
            yield_iterations,
            park: ParkWait::new(),
        }
    }
}

impl WaitStrategy for HybridWait {
    fn wait_for(
        &self,
        ready: &dyn Fn() -> bool,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> WaitOutcome {
        for _ in 0..self.spin_iterations {
            if ready() {
                return WaitOutcome::Ready;
            }
            if cancel.is_cancelled() {
                return WaitOutcome::Cancelled;
            }
            if deadline_passed(deadline) {
                return WaitOutcome::TimedOut;
            }
            std::hint::spin_loop();
        }
        for _ in 0..self.yield_iterations {
            if ready() {
                return WaitOutcome::Ready;
            }
            if cancel.is_cancelled() {
                return WaitOutcome::Cancelled;
            }
            if deadline_passed(deadline) {
                return WaitOutcome::TimedOut;
            }
            std::thread::yield_now();
        }
        self.park.wait_for(ready, cancel, deadline)
    }

    fn signal_all(&self) {
        self.park.signal_all();
    }
}
