//! Caller-supplied progress callbacks.
//!
//! Every long-running operation reports through a [`ProgressCallback`]. The
//! boolean it returns is the only cancellation channel: `false` asks the
//! operation to stop at its next checkpoint.

use std::marker::PhantomData;

/// Receives progress reports of type `T`.
pub trait ProgressCallback<T>: Send + Sync {
    /// Called with progress updates.
    ///
    /// # Returns
    /// - `true` to continue the operation
    /// - `false` to cancel the operation
    fn on_progress(&self, progress: &T) -> bool;
}

/// Callback that ignores reports and never cancels.
pub struct NoOpProgress;

impl<T> ProgressCallback<T> for NoOpProgress {
    fn on_progress(&self, _progress: &T) -> bool {
        true
    }
}

/// Adapts a closure into a [`ProgressCallback`].
pub struct FnProgress<F, T> {
    callback: F,
    _marker: PhantomData<fn(&T)>,
}

impl<F, T> ProgressCallback<T> for FnProgress<F, T>
where
    F: Fn(&T) -> bool + Send + Sync,
{
    fn on_progress(&self, progress: &T) -> bool {
        (self.callback)(progress)
    }
}

/// Wrap a closure as a progress callback.
///
/// # Example
/// ```ignore
/// let cb = progress_fn(|report: &ProgressReportMetadata| {
///     println!("{}", report.progress_message);
///     true
/// });
/// ```
pub fn progress_fn<F, T>(f: F) -> FnProgress<F, T>
where
    F: Fn(&T) -> bool + Send + Sync,
{
    FnProgress {
        callback: f,
        _marker: PhantomData,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_noop_never_cancels() {
        assert!(ProgressCallback::<u64>::on_progress(&NoOpProgress, &42));
    }

    #[test]
    fn test_closure_decides_cancellation() {
        let callback = progress_fn(|percent: &f64| *percent < 50.0);
        assert!(callback.on_progress(&10.0));
        assert!(!callback.on_progress(&75.5));
    }

    #[test]
    fn test_closure_captures_state() {
        let calls: Arc<AtomicU64> = Arc::new(AtomicU64::new(0));
        let calls_clone: Arc<AtomicU64> = calls.clone();
        let callback = progress_fn(move |_: &u64| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            true
        });

        callback.on_progress(&1);
        callback.on_progress(&2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
