//! Build-progress reporting, decoupled from the executors that drive it.
//!
//! The local and distributed executors need to surface per-action progress (`[n/total]`
//! prefixed log blocks, spawn/failure notices) without hard-coding a particular UI: the CLI
//! wants it on stdout, a library embedder may want structured callbacks instead. This module
//! exposes a [`Reporter`] trait and a thread-scoped default, swappable via [`set_scoped`],
//! mirroring the reporter-dispatch shape used elsewhere in the ecosystem for decoupling a
//! library's progress output from its core logic (a thread-local override stack over a
//! tracing-backed default).

use std::cell::RefCell;
use std::sync::Arc;

/// Observes build progress. Implementations must be cheap to call from worker threads.
pub trait Reporter: Send + Sync {
    /// An action's child process is about to be spawned.
    fn action_spawn(&self, action_index: usize, status_description: &str);

    /// An action finished; `log` is its buffered stdout+stderr, to be emitted as one
    /// contiguous block (never interleaved with another action's output).
    fn action_output(&self, completed: usize, total: usize, log: &str);

    /// An action exited non-zero.
    fn action_failed(&self, action_index: usize, exit_status: i32);

    /// A line of distributed-coordinator output, already stripped of progress/timing
    /// markers by the caller.
    fn coordinator_line(&self, line: &str);
}

/// Default reporter: everything goes through `tracing`, matching how the rest of the crate
/// logs. No direct stdout writes here — the CLI controls how `tracing-subscriber` renders
/// these events (plain, JSON, filtered by `-LogSuffix`/`-NoLog`, etc).
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn action_spawn(&self, action_index: usize, status_description: &str) {
        tracing::debug!(action_index, status_description, "spawning action");
    }

    fn action_output(&self, completed: usize, total: usize, log: &str) {
        if log.trim().is_empty() {
            tracing::info!("[{completed}/{total}]");
        } else {
            tracing::info!("[{completed}/{total}] {}", log.trim_end());
        }
    }

    fn action_failed(&self, action_index: usize, exit_status: i32) {
        tracing::error!(action_index, exit_status, "action failed");
    }

    fn coordinator_line(&self, line: &str) {
        tracing::info!("{line}");
    }
}

thread_local! {
    static SCOPED: RefCell<Vec<Arc<dyn Reporter>>> = const { RefCell::new(Vec::new()) };
}

/// Returns the innermost scoped reporter for this thread, or the default [`TracingReporter`]
/// if none is set.
pub fn get_default<R>(f: impl FnOnce(&Arc<dyn Reporter>) -> R) -> R {
    SCOPED.with(|stack| match stack.borrow().last() {
        Some(reporter) => f(reporter),
        None => f(&(Arc::new(TracingReporter) as Arc<dyn Reporter>)),
    })
}

/// RAII guard restoring the previous scoped reporter (if any) on drop.
pub struct ScopedGuard;

impl Drop for ScopedGuard {
    fn drop(&mut self) {
        SCOPED.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Installs `reporter` as this thread's default for the lifetime of the returned guard.
pub fn set_scoped(reporter: &Arc<dyn Reporter>) -> ScopedGuard {
    SCOPED.with(|stack| stack.borrow_mut().push(reporter.clone()));
    ScopedGuard
}

pub fn action_spawn(action_index: usize, status_description: &str) {
    get_default(|r| r.action_spawn(action_index, status_description));
}

pub fn action_output(completed: usize, total: usize, log: &str) {
    get_default(|r| r.action_output(completed, total, log));
}

pub fn action_failed(action_index: usize, exit_status: i32) {
    get_default(|r| r.action_failed(action_index, exit_status));
}

pub fn coordinator_line(line: &str) {
    get_default(|r| r.coordinator_line(line));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingReporter {
        spawns: AtomicUsize,
    }

    impl Reporter for CountingReporter {
        fn action_spawn(&self, _action_index: usize, _status_description: &str) {
            self.spawns.fetch_add(1, Ordering::SeqCst);
        }
        fn action_output(&self, _completed: usize, _total: usize, _log: &str) {}
        fn action_failed(&self, _action_index: usize, _exit_status: i32) {}
        fn coordinator_line(&self, _line: &str) {}
    }

    #[test]
    fn scoped_reporter_overrides_default_and_restores_on_drop() {
        let counting = Arc::new(CountingReporter { spawns: AtomicUsize::new(0) });
        let as_trait = counting.clone() as Arc<dyn Reporter>;
        {
            let _guard = set_scoped(&as_trait);
            action_spawn(0, "Compile a.cpp");
            action_spawn(1, "Compile b.cpp");
        }
        assert_eq!(counting.spawns.load(Ordering::SeqCst), 2);
        // Default reporter is restored after the guard drops; this must not touch `counting`.
        action_spawn(2, "Compile c.cpp");
        assert_eq!(counting.spawns.load(Ordering::SeqCst), 2);
    }
}
