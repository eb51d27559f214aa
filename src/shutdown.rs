//! Shutdown hooks (C8): a process-wide, idempotent teardown registry.
//!
//! Several subsystems share third-party globals (the pool's sockets, the
//! backend registry, eventually a crypto library or locale init in a real
//! embedding); registering a named hook lets each subsystem claim its own
//! cleanup once, and `call_all` guarantees every hook fires exactly once in
//! total even if the process calls it more than once during shutdown.

use std::collections::HashMap;
use std::sync::Mutex;

/// A callback registered under a unique name. Boxed so the registry can hold
/// a heterogeneous collection of subsystem cleanups.
pub type HookFn = Box<dyn FnOnce() + Send>;

struct Hook {
    callback: Option<HookFn>,
    called: bool,
}

#[derive(Default)]
pub struct ShutdownHooks {
    hooks: Mutex<HashMap<String, Hook>>,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` under `name`. First writer wins: if `name` is
    /// already registered, this is a no-op and returns `false`.
    pub fn register(&self, name: impl Into<String>, callback: HookFn) -> bool {
        let mut hooks = self.hooks.lock().unwrap();
        let name = name.into();
        if hooks.contains_key(&name) {
            return false;
        }
        hooks.insert(
            name,
            Hook {
                callback: Some(callback),
                called: false,
            },
        );
        true
    }

    /// Invokes every hook that has not yet run, then marks it run. Calling
    /// this twice invokes each hook exactly once in total: the second call
    /// sees every `called` flag already set and does nothing.
    pub fn call_all(&self) {
        let mut hooks = self.hooks.lock().unwrap();
        for hook in hooks.values_mut() {
            if !hook.called {
                if let Some(callback) = hook.callback.take() {
                    callback();
                }
                hook.called = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn register_is_first_writer_wins() {
        let hooks = ShutdownHooks::new();
        assert!(hooks.register("a", Box::new(|| {})));
        assert!(!hooks.register("a", Box::new(|| {})));
    }

    #[test]
    fn call_all_runs_each_hook_exactly_once_across_two_calls() {
        let hooks = ShutdownHooks::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        hooks.register(
            "pool",
            Box::new(move || {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        hooks.call_all();
        hooks.call_all();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn multiple_hooks_all_run() {
        let hooks = ShutdownHooks::new();
        let count = Arc::new(AtomicUsize::new(0));

        for name in ["registry", "pool", "logging"] {
            let count_clone = count.clone();
            hooks.register(
                name,
                Box::new(move || {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        hooks.call_all();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
