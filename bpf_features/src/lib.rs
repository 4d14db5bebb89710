//! # Feature Tests
//!
//! This crate provides the primitive behind runtime capability detection.
//!
//! ## Philosophy
//!
//! The kernel has no "what do you support?" query. The only reliable answer
//! comes from trying a minimal version of the real operation and looking at
//! how it fails. Such a trial is expensive and its answer never changes for
//! the lifetime of the process, so:
//! - **Run once**: a [`FeatureTest`] runs its trial at most once
//! - **Block, don't race**: concurrent first callers wait for the one trial
//! - **Keep failures**: an indeterminate trial is cached as a failure, never
//!   silently downgraded to "unsupported"
//!
//! ## Example
//!
//! ```
//! use bpf_features::{FeatureTest, Outcome};
//!
//! static BIG_KEYS: FeatureTest<String> = FeatureTest::new("big keys", "5.1");
//!
//! let outcome = BIG_KEYS.resolve(|| Ok(false));
//! assert_eq!(outcome, &Outcome::Unsupported);
//!
//! // The trial is not run again.
//! let outcome = BIG_KEYS.resolve(|| unreachable!());
//! assert_eq!(outcome, &Outcome::Unsupported);
//! assert_eq!(BIG_KEYS.trial_runs(), 1);
//! ```

use core::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use thiserror::Error;

/// The cached answer of a feature test
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<E> {
    /// The kernel performed the trial operation
    Supported,
    /// The kernel rejected the trial operation as malformed
    Unsupported,
    /// The trial ended in a way that says nothing about the feature
    Failed(E),
}

impl<E> Outcome<E> {
    /// Whether the feature is known to be present
    pub fn is_supported(&self) -> bool {
        matches!(self, Outcome::Supported)
    }
}

impl<E> From<Result<bool, E>> for Outcome<E> {
    fn from(result: Result<bool, E>) -> Self {
        match result {
            Ok(true) => Outcome::Supported,
            Ok(false) => Outcome::Unsupported,
            Err(err) => Outcome::Failed(err),
        }
    }
}

/// A feature is missing from the running kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{name} not supported (requires >= {minimum_version})")]
pub struct UnsupportedFeature {
    /// Human-readable feature name
    pub name: &'static str,
    /// First kernel version known to have the feature
    pub minimum_version: &'static str,
}

/// A memoized, execute-once feature test
///
/// `FeatureTest::new` is `const`, so tests can live in statics as well as
/// inside a longer-lived owner.
pub struct FeatureTest<E> {
    name: &'static str,
    minimum_version: &'static str,
    outcome: OnceLock<Outcome<E>>,
    trial_runs: AtomicUsize,
}

impl<E> FeatureTest<E> {
    /// Creates an unresolved feature test
    pub const fn new(name: &'static str, minimum_version: &'static str) -> Self {
        Self {
            name,
            minimum_version,
            outcome: OnceLock::new(),
            trial_runs: AtomicUsize::new(0),
        }
    }

    /// Human-readable feature name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// First kernel version known to have the feature
    ///
    /// Informational only, the trial decides.
    pub fn minimum_version(&self) -> &'static str {
        self.minimum_version
    }

    /// Runs `trial` unless an outcome is cached, and returns the outcome
    ///
    /// The trial answers `Ok(true)` for supported, `Ok(false)` for
    /// unsupported and `Err` when it could not tell.
    pub fn resolve<F>(&self, trial: F) -> &Outcome<E>
    where
        F: FnOnce() -> Result<bool, E>,
    {
        self.outcome.get_or_init(|| {
            self.trial_runs.fetch_add(1, Ordering::Relaxed);
            let outcome = Outcome::from(trial());
            match &outcome {
                Outcome::Supported => log::debug!("feature test '{}': supported", self.name),
                Outcome::Unsupported => log::debug!(
                    "feature test '{}': not supported (requires >= {})",
                    self.name,
                    self.minimum_version
                ),
                Outcome::Failed(_) => log::debug!("feature test '{}': failed", self.name),
            }
            outcome
        })
    }

    /// Returns the cached outcome without running the trial
    pub fn outcome(&self) -> Option<&Outcome<E>> {
        self.outcome.get()
    }

    /// How many times the trial has run, zero or one
    pub fn trial_runs(&self) -> usize {
        self.trial_runs.load(Ordering::Relaxed)
    }

    /// The error describing this feature as missing
    pub fn unsupported(&self) -> UnsupportedFeature {
        UnsupportedFeature {
            name: self.name,
            minimum_version: self.minimum_version,
        }
    }
}

impl<E: fmt::Debug> fmt::Debug for FeatureTest<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureTest")
            .field("name", &self.name)
            .field("minimum_version", &self.minimum_version)
            .field("outcome", &self.outcome.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_trial_runs_once() {
        let test: FeatureTest<String> = FeatureTest::new("thing", "4.0");
        assert!(test.outcome().is_none());

        assert!(test.resolve(|| Ok(true)).is_supported());
        assert!(test.resolve(|| Ok(false)).is_supported());
        assert_eq!(test.trial_runs(), 1);
        assert_eq!(test.outcome(), Some(&Outcome::Supported));
    }

    #[test]
    fn test_failure_is_cached() {
        let test: FeatureTest<String> = FeatureTest::new("thing", "4.0");
        let outcome = test.resolve(|| Err("out of memory".to_string()));
        assert_eq!(outcome, &Outcome::Failed("out of memory".to_string()));

        let outcome = test.resolve(|| Ok(true));
        assert!(matches!(outcome, Outcome::Failed(_)));
        assert_eq!(test.trial_runs(), 1);
    }

    #[test]
    fn test_concurrent_first_callers_share_one_trial() {
        let test: Arc<FeatureTest<String>> = Arc::new(FeatureTest::new("thing", "4.0"));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let test = Arc::clone(&test);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    test.resolve(|| {
                        thread::sleep(std::time::Duration::from_millis(10));
                        Ok(false)
                    })
                    .clone()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Outcome::Unsupported);
        }
        assert_eq!(test.trial_runs(), 1);
    }

    #[test]
    fn test_unsupported_display() {
        let test: FeatureTest<()> = FeatureTest::new("mmapable maps", "5.5");
        assert_eq!(
            test.unsupported().to_string(),
            "mmapable maps not supported (requires >= 5.5)"
        );
    }
}
