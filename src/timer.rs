//! One-shot deadline timer backing the nack and relative-wait timers.
//!
//! Each timer owns a thread parked on a condition variable until its
//! deadline. The owner can stop, re-arm, or pause the timer and learns
//! whether it lost the race against the firing callback, which is the
//! distinction the ack path depends on.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    /// Counting down to the deadline.
    Armed(Instant),
    /// Held without a deadline until re-armed or stopped.
    Paused,
    /// Retired before firing; the callback will never run.
    Stopped,
    /// The deadline elapsed and the callback ran (or is running).
    Fired,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// Handle to a timer thread that runs its callback once the deadline
/// elapses, unless stopped or paused first.
pub(crate) struct DeadlineTimer {
    shared: Arc<TimerShared>,
}

impl DeadlineTimer {
    /// Arm a timer that runs `callback` after `delay`.
    pub fn spawn<F>(delay: Duration, callback: F) -> DeadlineTimer
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState::Armed(Instant::now() + delay)),
            cond: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        thread::spawn(move || run(&thread_shared, callback));
        DeadlineTimer { shared }
    }

    /// Retire the timer. Returns false if the callback already fired.
    pub fn stop(&self) -> bool {
        let mut state = self.shared.state.lock();
        match *state {
            TimerState::Fired => false,
            TimerState::Stopped => true,
            _ => {
                *state = TimerState::Stopped;
                self.shared.cond.notify_one();
                true
            }
        }
    }

    /// Re-arm for `delay` from now. Returns false if the callback already
    /// fired or the timer was retired.
    pub fn reset(&self, delay: Duration) -> bool {
        let mut state = self.shared.state.lock();
        match *state {
            TimerState::Fired | TimerState::Stopped => false,
            _ => {
                *state = TimerState::Armed(Instant::now() + delay);
                self.shared.cond.notify_one();
                true
            }
        }
    }

    /// Hold the timer without a deadline until [`Self::reset`] re-arms it.
    /// Returns false if the callback already fired or the timer was retired.
    pub fn pause(&self) -> bool {
        let mut state = self.shared.state.lock();
        match *state {
            TimerState::Fired | TimerState::Stopped => false,
            _ => {
                *state = TimerState::Paused;
                self.shared.cond.notify_one();
                true
            }
        }
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<F: FnOnce()>(shared: &TimerShared, callback: F) {
    let mut callback = Some(callback);
    let mut state = shared.state.lock();
    loop {
        match *state {
            TimerState::Armed(deadline) => {
                if Instant::now() >= deadline {
                    *state = TimerState::Fired;
                    drop(state);
                    if let Some(callback) = callback.take() {
                        callback();
                    }
                    return;
                }
                shared.cond.wait_until(&mut state, deadline);
            }
            TimerState::Paused => {
                shared.cond.wait(&mut state);
            }
            TimerState::Stopped | TimerState::Fired => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn fires_after_delay() {
        let (tx, rx) = bounded(1);
        let _timer = DeadlineTimer::spawn(Duration::from_millis(10), move || {
            let _ = tx.send(());
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn stop_prevents_firing() {
        let (tx, rx) = bounded(1);
        let timer = DeadlineTimer::spawn(Duration::from_millis(50), move || {
            let _ = tx.send(());
        });
        assert!(timer.stop());
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn stop_after_fire_reports_lost_race() {
        let (tx, rx) = bounded(1);
        let timer = DeadlineTimer::spawn(Duration::from_millis(10), move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!timer.stop());
    }

    #[test]
    fn reset_postpones_firing() {
        let (tx, rx) = bounded(1);
        let timer = DeadlineTimer::spawn(Duration::from_millis(40), move || {
            let _ = tx.send(());
        });
        assert!(timer.reset(Duration::from_millis(300)));
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn pause_holds_until_reset() {
        let (tx, rx) = bounded(1);
        let timer = DeadlineTimer::spawn(Duration::from_millis(20), move || {
            let _ = tx.send(());
        });
        assert!(timer.pause());
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(timer.reset(Duration::from_millis(10)));
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }
}
