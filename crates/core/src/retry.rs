//! Retry/failure state machine.
//!
//! ```text
//! Delayed ──reaper──▶ Waiting ──pop──▶ Dispatching ──▶ Success (terminal)
//!                        ▲                  │
//!                        └──── Retry ◀──────┤
//!                                           └────────▶ Failed (terminal)
//! ```
//!
//! This module only decides where a failed package goes next; moving it is
//! the consumer's job.

use std::sync::Arc;

use tracing::error;

use crate::error::HandlerError;
use crate::package::Package;

/// Hook invoked on retryable failures before the attempt is counted.
///
/// Returning `Ok(Some(package))` overrides `data`, `attempts`,
/// `max_attempts` and `error` of the failed package; every other field of
/// the returned package is ignored. A hook error is logged and the original
/// package is kept.
pub type FailureHook =
    Arc<dyn Fn(&HandlerError, &Package) -> anyhow::Result<Option<Package>> + Send + Sync>;

/// Wrap a closure as a [`FailureHook`].
pub fn failure_hook<F>(hook: F) -> FailureHook
where
    F: Fn(&HandlerError, &Package) -> anyhow::Result<Option<Package>> + Send + Sync + 'static,
{
    Arc::new(hook)
}

/// Where a failed package goes next.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Back to the waiting list of its queue.
    Retry(Package),
    /// Terminal: the shared dead-letter list.
    DeadLetter(Package),
}

impl Disposition {
    pub fn package(&self) -> &Package {
        match self {
            Disposition::Retry(p) | Disposition::DeadLetter(p) => p,
        }
    }

    pub fn into_package(self) -> Package {
        match self {
            Disposition::Retry(p) | Disposition::DeadLetter(p) => p,
        }
    }

    pub fn is_dead_letter(&self) -> bool {
        matches!(self, Disposition::DeadLetter(_))
    }
}

/// Applies the consumer-side attempt ceiling to failed deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecider {
    max_attempts: u32,
}

impl RetryDecider {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Classify a failed delivery of `package`.
    pub fn decide(
        &self,
        mut package: Package,
        failure: &HandlerError,
        hook: Option<&FailureHook>,
    ) -> Disposition {
        package.max_attempts = Some(self.max_attempts);
        package.error = Some(failure.message().to_string());

        if !failure.is_retryable() {
            package.attempts = package.attempts.saturating_add(1);
            return Disposition::DeadLetter(package);
        }

        if let Some(hook) = hook {
            match hook(failure, &package) {
                Ok(Some(modified)) => merge_override(&mut package, modified),
                Ok(None) => {}
                Err(err) => {
                    error!(
                        package_id = %package.id,
                        queue = %package.queue,
                        error = %err,
                        "failure hook failed; keeping original package"
                    );
                }
            }
        }

        package.attempts = package.attempts.saturating_add(1);
        if package.is_exhausted() {
            Disposition::DeadLetter(package)
        } else {
            Disposition::Retry(package)
        }
    }
}

fn merge_override(package: &mut Package, modified: Package) {
    if !modified.data.is_null() {
        package.data = modified.data;
    }
    package.attempts = modified.attempts;
    if modified.max_attempts.is_some() {
        package.max_attempts = modified.max_attempts;
    }
    if modified.error.is_some() {
        package.error = modified.error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn package(attempts: u32) -> Package {
        let mut p = Package::new("jobs", json!({"n": 1}), 0);
        p.attempts = attempts;
        p
    }

    #[test]
    fn retryable_failure_under_ceiling_is_retried() {
        let decider = RetryDecider::new(2);
        let out = decider.decide(package(0), &HandlerError::retryable("boom"), None);

        let Disposition::Retry(p) = out else {
            panic!("expected retry, got {out:?}");
        };
        assert_eq!(p.attempts, 1);
        assert_eq!(p.max_attempts, Some(2));
        assert_eq!(p.error.as_deref(), Some("boom"));
    }

    #[test]
    fn always_failing_package_dead_letters_after_ceiling() {
        let decider = RetryDecider::new(2);
        let err = HandlerError::retryable("still broken");

        let mut current = package(0);
        let mut deliveries = 0;
        let last = loop {
            deliveries += 1;
            match decider.decide(current, &err, None) {
                Disposition::Retry(p) => current = p,
                Disposition::DeadLetter(p) => break p,
            }
        };

        assert_eq!(deliveries, 3);
        assert_eq!(last.attempts, 3);
        assert_eq!(last.error.as_deref(), Some("still broken"));
    }

    #[test]
    fn unretryable_failure_skips_the_hook_and_dead_letters() {
        let hook = failure_hook(|_, _| panic!("hook must not run"));
        let decider = RetryDecider::new(5);
        let out = decider.decide(
            package(0),
            &HandlerError::unretryable("invalid"),
            Some(&hook),
        );

        assert!(out.is_dead_letter());
        assert_eq!(out.package().attempts, 1);
    }

    #[test]
    fn hook_overrides_only_the_narrow_field_set() {
        let hook = failure_hook(|_, original| {
            let mut modified = original.clone();
            modified.data = json!({"n": 2});
            modified.attempts = 0;
            modified.max_attempts = Some(9);
            modified.error = Some("rewritten".into());
            modified.queue = "elsewhere".into();
            Ok(Some(modified))
        });
        let decider = RetryDecider::new(1);
        let out = decider.decide(package(3), &HandlerError::retryable("boom"), Some(&hook));

        let Disposition::Retry(p) = out else {
            panic!("expected retry, got {out:?}");
        };
        assert_eq!(p.data, json!({"n": 2}));
        assert_eq!(p.attempts, 1);
        assert_eq!(p.max_attempts, Some(9));
        assert_eq!(p.error.as_deref(), Some("rewritten"));
        assert_eq!(p.queue, "jobs");
    }

    #[test]
    fn null_data_and_missing_fields_keep_originals() {
        let hook = failure_hook(|_, original| {
            let mut modified = original.clone();
            modified.data = serde_json::Value::Null;
            modified.max_attempts = None;
            modified.error = None;
            Ok(Some(modified))
        });
        let decider = RetryDecider::new(4);
        let out = decider.decide(package(0), &HandlerError::retryable("boom"), Some(&hook));

        let p = out.into_package();
        assert_eq!(p.data, json!({"n": 1}));
        assert_eq!(p.max_attempts, Some(4));
        assert_eq!(p.error.as_deref(), Some("boom"));
    }

    #[test]
    fn failing_hook_is_ignored() {
        let hook = failure_hook(|_, _| Err(anyhow::anyhow!("hook exploded")));
        let decider = RetryDecider::new(3);
        let out = decider.decide(package(1), &HandlerError::retryable("boom"), Some(&hook));

        let Disposition::Retry(p) = out else {
            panic!("expected retry, got {out:?}");
        };
        assert_eq!(p.attempts, 2);
        assert_eq!(p.data, json!({"n": 1}));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// A retried package is never past its ceiling; a dead-lettered one
        /// (on a retryable failure) always is.
        #[test]
        fn retried_packages_are_never_exhausted(attempts in 0u32..50, max in 0u32..20) {
            let decider = RetryDecider::new(max);
            let out = decider.decide(package(attempts), &HandlerError::retryable("e"), None);

            prop_assert_eq!(out.package().attempts, attempts + 1);
            match out {
                Disposition::Retry(p) => prop_assert!(!p.is_exhausted()),
                Disposition::DeadLetter(p) => prop_assert!(p.attempts > max),
            }
        }

        /// Failing `k <= max` times never reaches the dead-letter list.
        #[test]
        fn bounded_failures_are_always_retried(max in 1u32..20, k in 1u32..20) {
            prop_assume!(k <= max);
            let decider = RetryDecider::new(max);
            let mut current = package(0);
            for _ in 0..k {
                match decider.decide(current, &HandlerError::retryable("e"), None) {
                    Disposition::Retry(p) => current = p,
                    Disposition::DeadLetter(p) => {
                        return Err(TestCaseError::fail(format!(
                            "dead-lettered at attempts {}",
                            p.attempts
                        )));
                    }
                }
            }
            prop_assert_eq!(current.attempts, k);
        }
    }
}
