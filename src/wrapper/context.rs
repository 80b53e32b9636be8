/// Cancellation token for the execution context running the target program.
///
/// Interrupting sets a flag and wakes anyone blocked in
/// [`MainContext::wait_interrupted`]; the target decides what to do about it.
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct State {
    interrupted: bool,
    running: bool,
}

#[derive(Debug)]
pub struct MainContext {
    state: Mutex<State>,
    changed: Condvar,
}

impl Default for MainContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MainContext {
    /// A running, uninterrupted context.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                interrupted: false,
                running: true,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Set the interrupted flag and wake waiters.
    pub fn interrupt(&self) {
        let mut state = self.lock();
        state.interrupted = true;
        self.changed.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        self.lock().interrupted
    }

    /// Clear the interrupted flag, returning whether it was set.
    pub fn clear_interrupt(&self) -> bool {
        std::mem::replace(&mut self.lock().interrupted, false)
    }

    /// Whether the target program is still executing.
    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub(crate) fn mark_finished(&self) {
        let mut state = self.lock();
        state.running = false;
        self.changed.notify_all();
    }

    /// Block until interrupted or `timeout` elapses. Returns the interrupted flag.
    pub fn wait_interrupted(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while !state.interrupted {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = match self.changed.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        state.interrupted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_new_context_is_running_and_clear() {
        let ctx = MainContext::new();
        assert!(ctx.is_running());
        assert!(!ctx.is_interrupted());
        assert!(!ctx.clear_interrupt());
    }

    #[test]
    fn test_interrupt_and_clear() {
        let ctx = MainContext::new();
        ctx.interrupt();
        assert!(ctx.is_interrupted());
        assert!(ctx.clear_interrupt());
        assert!(!ctx.is_interrupted());
    }

    #[test]
    fn test_wait_times_out() {
        let ctx = MainContext::new();
        let start = Instant::now();
        assert!(!ctx.wait_interrupted(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_wakes_on_interrupt() {
        let ctx = Arc::new(MainContext::new());
        let other = Arc::clone(&ctx);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            other.interrupt();
        });
        let start = Instant::now();
        assert!(ctx.wait_interrupted(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_mark_finished() {
        let ctx = MainContext::new();
        ctx.mark_finished();
        assert!(!ctx.is_running());
    }
}
