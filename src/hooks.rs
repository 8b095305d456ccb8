//! Lifecycle extension points.
//!
//! Before-start hooks run in registration order before any listener binds; the
//! first failure aborts startup. After-stop hooks run once every listener has
//! returned and are best-effort: failures are logged, never propagated.

/// Error type returned by hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A hook run before the server binds.
pub type BeforeStartHook = Box<dyn FnMut() -> Result<(), BoxError> + Send + Sync>;

/// A hook run after the server has stopped.
pub type AfterStopHook = Box<dyn FnMut() -> Result<(), BoxError> + Send + Sync>;

/// Failure of a before-start hook, with its position in the registration order.
#[derive(Debug, thiserror::Error)]
#[error("before-start hook #{index} failed: {source}")]
pub struct HookError {
    pub index: usize,
    #[source]
    pub source: BoxError,
}

#[derive(Default)]
pub struct LifecycleHooks {
    before_start: Vec<BeforeStartHook>,
    after_stop: Vec<AfterStopHook>,
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_before_start<F>(&mut self, hook: F)
    where
        F: FnMut() -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.before_start.push(Box::new(hook));
    }

    pub fn add_after_stop<F>(&mut self, hook: F)
    where
        F: FnMut() -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.after_stop.push(Box::new(hook));
    }

    /// Run before-start hooks in order, stopping at the first failure.
    pub fn run_before_start(&mut self) -> Result<(), HookError> {
        for (index, hook) in self.before_start.iter_mut().enumerate() {
            hook().map_err(|source| HookError { index, source })?;
        }
        Ok(())
    }

    /// Run every after-stop hook, logging failures.
    pub fn run_after_stop(&mut self) {
        for (index, hook) in self.after_stop.iter_mut().enumerate() {
            if let Err(e) = hook() {
                tracing::warn!(hook = index, error = %e, "After-stop hook failed");
            }
        }
    }
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("before_start", &self.before_start.len())
            .field("after_stop", &self.after_stop.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_before_start_runs_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = LifecycleHooks::new();
        for i in 0..3 {
            let calls = calls.clone();
            hooks.add_before_start(move || {
                calls.lock().unwrap().push(i);
                Ok(())
            });
        }

        hooks.run_before_start().unwrap();
        assert_eq!(*calls.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_before_start_stops_at_first_failure() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = LifecycleHooks::new();

        let c = calls.clone();
        hooks.add_before_start(move || {
            c.lock().unwrap().push("first");
            Ok(())
        });
        hooks.add_before_start(|| Err("disk full".into()));
        let c = calls.clone();
        hooks.add_before_start(move || {
            c.lock().unwrap().push("third");
            Ok(())
        });

        let err = hooks.run_before_start().unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.source.to_string(), "disk full");
        assert_eq!(*calls.lock().unwrap(), vec!["first"]);
    }

    #[test]
    fn test_after_stop_failures_do_not_stop_later_hooks() {
        let ran = Arc::new(Mutex::new(0));
        let mut hooks = LifecycleHooks::new();
        hooks.add_after_stop(|| Err("flush failed".into()));
        let r = ran.clone();
        hooks.add_after_stop(move || {
            *r.lock().unwrap() += 1;
            Ok(())
        });

        hooks.run_after_stop();
        assert_eq!(*ran.lock().unwrap(), 1);
    }
}
