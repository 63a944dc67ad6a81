//! Escalation from repeated link failures to a full radio stack reset.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::ResetStep;
use crate::error::LinkError;

/// Brings the local Bluetooth adapter back from a stuck state.
#[async_trait]
pub trait RadioReset: Send + Sync {
    /// Run every step of the reset, even after one fails.
    ///
    /// Returns whether all steps succeeded.
    async fn reset_adapter(&self) -> bool;
}

/// Resets the radio stack by running OS commands, one after the other.
pub struct SystemRadioReset {
    steps: Vec<ResetStep>,
}

impl SystemRadioReset {
    pub fn new(steps: Vec<ResetStep>) -> Self {
        Self { steps }
    }

    async fn run_step(step: &ResetStep) -> anyhow::Result<()> {
        let output = Command::new(&step.program).args(&step.args).output().await?;
        if !output.status.success() {
            anyhow::bail!("{}: {}", output.status, String::from_utf8_lossy(&output.stderr).trim());
        }
        Ok(())
    }
}

#[async_trait]
impl RadioReset for SystemRadioReset {
    async fn reset_adapter(&self) -> bool {
        let mut all_ok = true;
        for step in &self.steps {
            let command = format!("{} {}", step.program, step.args.join(" "));
            match Self::run_step(step).await {
                Ok(()) => info!(command = %command, "Reset step done"),
                Err(err) => {
                    all_ok = false;
                    warn!(command = %command, "Reset step failed: {err:#}");
                }
            }
        }
        all_ok
    }
}

/// Counts consecutive failed cycles and resets the radio when there are too many.
pub struct RecoveryPolicy<R> {
    threshold: u32,
    consecutive_failures: u32,
    malformed_chunks: u64,
    resets: u64,
    radio: R,
}

impl<R: RadioReset> RecoveryPolicy<R> {
    pub fn new(threshold: u32, radio: R) -> Self {
        Self { threshold: threshold.max(1), consecutive_failures: 0, malformed_chunks: 0, resets: 0, radio }
    }

    /// Count a failed cycle. Once the threshold is reached the radio is reset before this
    /// returns and the count starts over, whatever the reset's outcome.
    ///
    /// Returns whether a reset was performed.
    pub async fn record_failure(&mut self, err: &LinkError) -> bool {
        self.consecutive_failures += 1;
        warn!(
            kind = err.kind(),
            consecutive_failures = self.consecutive_failures,
            threshold = self.threshold,
            malformed_chunks = self.malformed_chunks,
            "Link failure: {err}"
        );

        if self.consecutive_failures < self.threshold {
            return false;
        }

        self.resets += 1;
        warn!(resets = self.resets, "Too many consecutive failures, resetting the radio stack");
        if self.radio.reset_adapter().await {
            info!("Radio stack reset complete");
        } else {
            error!("Radio stack reset finished with failed steps");
        }
        self.consecutive_failures = 0;
        true
    }

    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            info!(after = self.consecutive_failures, "Link recovered");
        }
        self.consecutive_failures = 0;
    }

    /// Track the total of chunks dropped as malformed. An increase is logged but does not
    /// count as a failure.
    pub fn observe_malformed_chunks(&mut self, total: u64) {
        if total > self.malformed_chunks {
            warn!(new = total - self.malformed_chunks, total, "Malformed chunks dropped");
        }
        self.malformed_chunks = total;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn malformed_chunks(&self) -> u64 {
        self.malformed_chunks
    }

    /// How many radio resets have been performed.
    pub fn resets(&self) -> u64 {
        self.resets
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    struct CountingReset {
        calls: Arc<AtomicUsize>,
        succeeds: bool,
    }

    #[async_trait]
    impl RadioReset for CountingReset {
        async fn reset_adapter(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.succeeds
        }
    }

    fn new_policy(succeeds: bool) -> (RecoveryPolicy<CountingReset>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (RecoveryPolicy::new(10, CountingReset { calls: calls.clone(), succeeds }), calls)
    }

    fn timeout_err() -> LinkError {
        LinkError::ResponseTimeout(Duration::from_secs(20))
    }

    #[tokio::test]
    async fn test_reset_on_tenth_failure() {
        for succeeds in [true, false] {
            let (mut policy, calls) = new_policy(succeeds);
            for i in 1..=9 {
                assert!(!policy.record_failure(&timeout_err()).await);
                assert_eq!(policy.consecutive_failures(), i);
            }
            assert_eq!(calls.load(Ordering::SeqCst), 0);

            assert!(policy.record_failure(&timeout_err()).await);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(policy.consecutive_failures(), 0);
            assert_eq!(policy.resets(), 1);
        }
    }

    #[tokio::test]
    async fn test_success_clears_count() {
        let (mut policy, calls) = new_policy(true);
        for _ in 0..9 {
            policy.record_failure(&timeout_err()).await;
        }
        policy.record_success();
        assert_eq!(policy.consecutive_failures(), 0);
        for _ in 0..9 {
            policy.record_failure(&timeout_err()).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_chunks_are_not_failures() {
        let (mut policy, _) = new_policy(true);
        policy.observe_malformed_chunks(3);
        policy.observe_malformed_chunks(3);
        assert_eq!(policy.malformed_chunks(), 3);
        assert_eq!(policy.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_system_reset_runs_every_step() {
        let reset = SystemRadioReset::new(vec![
            ResetStep { program: "definitely-not-a-real-program-xyz".to_string(), args: vec![] },
            ResetStep { program: "false".to_string(), args: vec![] },
            ResetStep { program: "true".to_string(), args: vec![] },
        ]);
        assert!(!reset.reset_adapter().await);

        let reset = SystemRadioReset::new(vec![ResetStep { program: "true".to_string(), args: vec![] }]);
        assert!(reset.reset_adapter().await);
    }
}
