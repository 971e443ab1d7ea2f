use std::hint::spin_loop;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Stage-one spin iterations before a waiter starts yielding to the scheduler.
const SPIN_ROUNDS: u32 = 64;

/// Stage-two scheduler yields before a waiter parks on the condition variable.
const YIELD_ROUNDS: u32 = 8;

/// Wakes threads that are blocked waiting for a condition to become true.
///
/// This is the condition-variable axis of the threading policy. The predicate passed to the
/// wait operations must be driven entirely by state the notifier updates before notifying
/// (an atomic counter, typically); the signal itself carries no payload.
pub trait Signal: Default + Send + Sync + 'static {
    /// Wakes one waiting thread, if any.
    fn notify_one(&self);

    /// Wakes every waiting thread.
    fn notify_all(&self);

    /// Blocks until `ready` returns true.
    fn wait_until(&self, ready: impl FnMut() -> bool);

    /// Blocks until `ready` returns true or the timeout elapses.
    ///
    /// Returns `true` if the condition became true before the deadline, `false` on timeout.
    fn wait_timeout(&self, timeout: Duration, ready: impl FnMut() -> bool) -> bool;
}

/// The default [`Signal`]: an adaptive three-stage wait over a condition variable.
///
/// A waiter first spins briefly polling the condition, then yields to the scheduler a few
/// times, and only then parks on the condition variable. Short waits never pay for parking;
/// long waits do not burn CPU. The waiter count is guarded by the condvar mutex so a
/// notifier can skip the wakeup entirely when nobody is parked, and so the
/// check-then-park window is closed (no lost wakeups). Spurious wakeups are masked by
/// re-checking the condition under the lock.
#[derive(Debug, Default)]
pub struct CondvarSignal {
    waiters: Mutex<usize>,
    condvar: Condvar,
}

impl CondvarSignal {
    /// Stages one and two: polls without any lock. Returns whether the condition came true.
    fn spin_stage(ready: &mut impl FnMut() -> bool) -> bool {
        for _ in 0..SPIN_ROUNDS {
            if ready() {
                return true;
            }

            spin_loop();
        }

        for _ in 0..YIELD_ROUNDS {
            if ready() {
                return true;
            }

            thread::yield_now();
        }

        false
    }
}

impl Signal for CondvarSignal {
    fn notify_one(&self) {
        if *self.waiters.lock() > 0 {
            self.condvar.notify_one();
        }
    }

    fn notify_all(&self) {
        if *self.waiters.lock() > 0 {
            self.condvar.notify_all();
        }
    }

    fn wait_until(&self, mut ready: impl FnMut() -> bool) {
        if Self::spin_stage(&mut ready) {
            return;
        }

        let mut waiters = self.waiters.lock();
        *waiters += 1;

        while !ready() {
            self.condvar.wait(&mut waiters);
        }

        *waiters -= 1;
    }

    fn wait_timeout(&self, timeout: Duration, mut ready: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;

        if Self::spin_stage(&mut ready) {
            return true;
        }

        let mut waiters = self.waiters.lock();
        *waiters += 1;

        let satisfied = loop {
            if ready() {
                break true;
            }

            if self
                .condvar
                .wait_until(&mut waiters, deadline)
                .timed_out()
            {
                // One last check: the condition may have become true exactly at the deadline.
                break ready();
            }
        };

        *waiters -= 1;
        satisfied
    }
}
