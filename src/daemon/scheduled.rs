//! Deadline-driven sleep inhibition.
//!
//! Owns at most one inhibitor lock and the deadline it is held for. The
//! deadline only ever moves forward; a release timer fires when it is
//! reached and backs off if a later extension claimed the lock first.

use std::cmp;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;

use chrono::{DateTime, Utc};
use slog::{debug, o, warn, Logger};

use crate::logind::Inhibitor;

/// Sleep inhibition with a self-releasing deadline.
///
/// `set_inhibitor` starts or extends an inhibition; the lock is released by
/// a timer when the deadline passes, by `unset_inhibitor(force)`, or by
/// `close`. All state shared with the timer thread sits behind one mutex;
/// the timer re-resolves it through a weak reference and bails once the
/// instance has shut down.
pub struct ScheduledInhibition<L: Inhibitor + Send + 'static> {
    logger: Logger,
    inner: Arc<Mutex<Option<Inner<L>>>>,
}

struct Inner<L> {
    inhibit_until: DateTime<Utc>,
    lock: L,
    timer: ReleaseTimer,
}

impl<L: Inhibitor + Send + 'static> ScheduledInhibition<L> {
    pub fn new(parent_logger: &Logger, lock: L) -> ScheduledInhibition<L> {
        ScheduledInhibition {
            logger: parent_logger.new(o!("component" => "scheduled-inhibition")),
            inner: Arc::new(Mutex::new(Some(Inner {
                inhibit_until: Utc::now(),
                lock,
                timer: ReleaseTimer::idle(),
            }))),
        }
    }

    /// Inhibits sleep until `until`. Returns `true` iff a transition
    /// occurred: a new inhibition started or the deadline was extended.
    /// Requests at or before the current deadline (or in the past) are
    /// no-ops.
    pub fn set_inhibitor(&self, until: DateTime<Utc>) -> bool {
        let mut guard = lock_state(&self.inner);
        let inner = match guard.as_mut() {
            Some(inner) => inner,
            None => {
                warn!(&self.logger, "Refusing to set inhibitor, instance is shut down");
                return false;
            }
        };
        if cmp::max(Utc::now(), inner.inhibit_until) >= until {
            debug!(&self.logger, "Ignoring inhibition, already covered to an equal or later time");
            return false;
        }

        debug!(&self.logger, "Starting or extending inhibition"; "until" => %until);
        inner.timer.cancel();
        inner.inhibit_until = until;
        if !inner.lock.is_inhibiting() {
            if let Err(err) = inner.lock.inhibit() {
                // The deadline stays tracked so a later extension can retry
                warn!(&self.logger, "Could not take sleep lock, inhibition is ineffective"; "error" => %err);
            }
        }
        inner.timer = ReleaseTimer::schedule(self.logger.clone(), Arc::downgrade(&self.inner), until);
        true
    }

    /// Releases the lock if `expected` still matches the current deadline,
    /// or unconditionally with `force`. Returns whether a release was
    /// performed; `false` means a later extension owns the lock.
    pub fn unset_inhibitor(&self, expected: DateTime<Utc>, force: bool) -> bool {
        release_if_current(&self.logger, &self.inner, expected, force)
    }

    /// The current deadline, or `None` once closed.
    pub fn inhibit_until(&self) -> Option<DateTime<Utc>> {
        lock_state(&self.inner).as_ref().map(|inner| inner.inhibit_until)
    }

    pub fn is_inhibiting(&self) -> bool {
        lock_state(&self.inner)
            .as_ref()
            .map(|inner| inner.lock.is_inhibiting())
            .unwrap_or(false)
    }

    /// Cancels the timer, releases the lock, and nulls the shared state so
    /// concurrent timer callbacks observe shutdown and bail.
    pub fn close(&self) {
        let taken = lock_state(&self.inner).take();
        if let Some(mut inner) = taken {
            inner.timer.cancel();
            if let Err(err) = inner.lock.allow() {
                warn!(&self.logger, "Could not release sleep lock on shutdown"; "error" => %err);
            }
        }
    }
}

impl<L: Inhibitor + Send + 'static> Drop for ScheduledInhibition<L> {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock_state<L>(inner: &Mutex<Option<Inner<L>>>) -> MutexGuard<'_, Option<Inner<L>>> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn release_if_current<L: Inhibitor>(
    logger: &Logger,
    inner: &Mutex<Option<Inner<L>>>,
    expected: DateTime<Utc>,
    force: bool,
) -> bool {
    let mut guard = lock_state(inner);
    let state = match guard.as_mut() {
        Some(state) => state,
        None => {
            debug!(logger, "Not releasing, instance is shut down");
            return false;
        }
    };
    if !force && state.inhibit_until != expected {
        // A later extension re-armed the timer and owns the lock now
        debug!(logger, "Not releasing, another inhibition has been scheduled");
        return false;
    }
    match state.lock.allow() {
        Ok(true) => debug!(logger, "Released sleep lock"; "expected" => %expected),
        Ok(false) => debug!(logger, "Sleep lock was not held"),
        Err(err) => warn!(logger, "Could not release sleep lock"; "error" => %err),
    }
    true
}

/// One pending release, parked on a condvar until its deadline or until
/// cancelled. Holds only a weak reference to the owner's state so it never
/// extends the owner's lifetime.
struct ReleaseTimer {
    cancelled: Arc<(Mutex<bool>, Condvar)>,
}

impl ReleaseTimer {
    /// A timer that is already spent; used before the first scheduling.
    fn idle() -> ReleaseTimer {
        ReleaseTimer {
            cancelled: Arc::new((Mutex::new(true), Condvar::new())),
        }
    }

    fn schedule<L: Inhibitor + Send + 'static>(
        logger: Logger,
        state: Weak<Mutex<Option<Inner<L>>>>,
        until: DateTime<Utc>,
    ) -> ReleaseTimer {
        let cancelled = Arc::new((Mutex::new(false), Condvar::new()));
        let shared = Arc::clone(&cancelled);
        thread::spawn(move || {
            let (flag, condvar) = &*shared;
            let mut done = match flag.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            loop {
                if *done {
                    return;
                }
                let now = Utc::now();
                if now >= until {
                    break;
                }
                let wait = match (until - now).to_std() {
                    Ok(duration) => duration,
                    Err(_) => break,
                };
                let (guard, _) = condvar
                    .wait_timeout(done, wait)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                done = guard;
            }
            drop(done);
            if let Some(state) = state.upgrade() {
                release_if_current(&logger, &state, until, false);
            }
        });
        ReleaseTimer { cancelled }
    }

    /// Benign when the callback has already begun: the callback rechecks
    /// the deadline under the state mutex and bails on mismatch.
    fn cancel(&self) {
        let (flag, condvar) = &*self.cancelled;
        let mut done = match flag.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *done = true;
        condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logind::testing::FakeLock;
    use chrono::Duration;
    use std::time::Duration as StdDuration;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn inhibition() -> (ScheduledInhibition<FakeLock>, FakeLock) {
        let lock = FakeLock::default();
        (ScheduledInhibition::new(&test_logger(), lock.clone()), lock)
    }

    #[test]
    fn requests_for_the_past_are_noops() {
        let (inhibition, lock) = inhibition();
        assert!(!inhibition.set_inhibitor(Utc::now() - Duration::seconds(1)));
        assert!(!lock.held());
        assert_eq!(lock.acquires(), 0);
    }

    #[test]
    fn deadline_only_moves_forward() {
        let (inhibition, _lock) = inhibition();
        let far = Utc::now() + Duration::seconds(30);
        assert!(inhibition.set_inhibitor(far));
        assert_eq!(inhibition.inhibit_until(), Some(far));

        // An earlier request neither transitions nor rolls the deadline back
        assert!(!inhibition.set_inhibitor(Utc::now() + Duration::seconds(5)));
        assert_eq!(inhibition.inhibit_until(), Some(far));

        // Equal timestamps do not extend either
        assert!(!inhibition.set_inhibitor(far));
    }

    #[test]
    fn observed_deadlines_are_non_decreasing() {
        let (inhibition, _lock) = inhibition();
        let base = Utc::now();
        let offsets_sec = [20, 5, 40, 40, 1, 90, 60];

        let mut observed = Vec::new();
        for offset in offsets_sec {
            inhibition.set_inhibitor(base + Duration::seconds(offset));
            observed.push(inhibition.inhibit_until().unwrap());
        }
        assert!(observed.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn timer_releases_the_lock_at_the_deadline() {
        let (inhibition, lock) = inhibition();
        assert!(inhibition.set_inhibitor(Utc::now() + Duration::milliseconds(50)));
        assert!(lock.held());

        thread::sleep(StdDuration::from_millis(300));
        assert!(!lock.held());
        assert_eq!(lock.acquires(), 1);
        assert_eq!(lock.releases(), 1);
    }

    #[test]
    fn extension_keeps_the_lock_held_continuously() {
        let (inhibition, lock) = inhibition();
        assert!(inhibition.set_inhibitor(Utc::now() + Duration::milliseconds(50)));
        assert!(inhibition.set_inhibitor(Utc::now() + Duration::milliseconds(600)));

        // Well past the first deadline: the superseded timer must not fire
        thread::sleep(StdDuration::from_millis(250));
        assert!(lock.held());
        assert_eq!(lock.acquires(), 1);

        thread::sleep(StdDuration::from_millis(700));
        assert!(!lock.held());
        assert_eq!(lock.releases(), 1);
    }

    #[test]
    fn unset_with_stale_expectation_is_refused() {
        let (inhibition, lock) = inhibition();
        let until = Utc::now() + Duration::seconds(30);
        inhibition.set_inhibitor(until);

        assert!(!inhibition.unset_inhibitor(until - Duration::seconds(1), false));
        assert!(lock.held());

        assert!(inhibition.unset_inhibitor(until, false));
        assert!(!lock.held());
    }

    #[test]
    fn forced_unset_ignores_the_expectation() {
        let (inhibition, lock) = inhibition();
        inhibition.set_inhibitor(Utc::now() + Duration::seconds(30));
        assert!(inhibition.unset_inhibitor(Utc::now() - Duration::days(1), true));
        assert!(!lock.held());
    }

    #[test]
    fn close_releases_and_rejects_further_use() {
        let (inhibition, lock) = inhibition();
        inhibition.set_inhibitor(Utc::now() + Duration::seconds(30));
        inhibition.close();

        assert!(!lock.held());
        assert_eq!(inhibition.inhibit_until(), None);
        assert!(!inhibition.set_inhibitor(Utc::now() + Duration::seconds(60)));
        assert!(!inhibition.is_inhibiting());
    }
}
