//! Circuit build-time verification against `BUILDTIMEOUT_SET`.
//!
//! Tor computes a circuit build timeout from its own timing observations.
//! An adversary delaying circuit extension can skew that estimate; keeping
//! an independent count of launched versus timed-out circuits and
//! comparing our observed timeout rate with the one Tor announces makes
//! such tampering visible in the logs.
//!
//! Bookkeeping rules, in arrival order per circuit:
//!
//! - `LAUNCHED` counts toward the launched totals.
//! - `BUILT` settles the circuit as a success.
//! - `FAILED`/`CLOSED` with `REASON=TIMEOUT` settles it as a timeout.
//! - Any other teardown un-counts the launch: a circuit closed before
//!   building or timing out says nothing about the timeout estimate.
//!   Tor's own `MEASURE_TIMEOUT` probes are left alone entirely.
//!
//! After a `BUILDTIMEOUT_SET RESET` Tor has no timeout estimate, so
//! nothing can time out meaningfully; recording pauses and the counters
//! are discarded until the next `COMPUTED` set arrives.

use std::collections::HashMap;

use crate::config::LogLevel;
use crate::logger::plog;

/// Independent build/timeout counters over the circuit event stream.
#[derive(Debug)]
pub struct TimeoutStats {
    /// Pending circuits, mapped to whether they are hidden-service.
    pending: HashMap<String, bool>,
    all_launched: u64,
    all_built: u64,
    all_timeout: u64,
    hs_launched: u64,
    hs_built: u64,
    hs_timeout: u64,
    /// False between a RESET and the next COMPUTED set.
    record_timeouts: bool,
}

impl Default for TimeoutStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutStats {
    /// Creates empty counters with recording active.
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            all_launched: 0,
            all_built: 0,
            all_timeout: 0,
            hs_launched: 0,
            hs_built: 0,
            hs_timeout: 0,
            record_timeouts: true,
        }
    }

    /// Tracks one `CIRC` event.
    pub fn circ_event(
        &mut self,
        circ_id: &str,
        status: &str,
        purpose: &str,
        hs_state: Option<&str>,
        reason: Option<&str>,
    ) {
        let is_hs = hs_state.is_some() || purpose.starts_with("HS");

        if is_hs {
            if let Some(false) = self.pending.get(circ_id) {
                plog(
                    LogLevel::Error,
                    &format!(
                        "Circuit {} changed from non-HS to HS (purpose {})",
                        circ_id, purpose
                    ),
                );
            }
        }

        // Between RESET and COMPUTED there is no timeout in force, so a
        // circuit outcome in that window carries no signal.
        if !self.record_timeouts {
            return;
        }

        match status {
            "LAUNCHED" => {
                if self.pending.insert(circ_id.to_string(), is_hs).is_some() {
                    plog(
                        LogLevel::Error,
                        &format!("Circuit {} launched twice", circ_id),
                    );
                }
                self.all_launched += 1;
                if is_hs {
                    self.hs_launched += 1;
                }
            }
            "BUILT" => {
                if let Some(is_hs) = self.pending.remove(circ_id) {
                    self.all_built += 1;
                    if is_hs {
                        self.hs_built += 1;
                    }
                }
            }
            "FAILED" | "CLOSED" => {
                if reason == Some("TIMEOUT") {
                    if let Some(is_hs) = self.pending.remove(circ_id) {
                        self.all_timeout += 1;
                        if is_hs {
                            self.hs_timeout += 1;
                        }
                    }
                } else if purpose != "MEASURE_TIMEOUT" {
                    // Torn down before building or timing out; the launch
                    // never became an observation.
                    if let Some(is_hs) = self.pending.remove(circ_id) {
                        self.all_launched = self.all_launched.saturating_sub(1);
                        if is_hs {
                            self.hs_launched = self.hs_launched.saturating_sub(1);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Handles one `BUILDTIMEOUT_SET` event.
    ///
    /// `COMPUTED` resumes recording and logs Tor's timeout rate next to
    /// ours; `RESET` discards the counters and pauses recording.
    pub fn cbt_event(&mut self, set_type: &str, timeout_rate: Option<f64>) {
        if let Some(rate) = timeout_rate {
            plog(
                LogLevel::Info,
                &format!(
                    "Tor timeout rate {:.4}; ours {:.4} overall, {:.4} for HS circuits",
                    rate,
                    self.timeout_rate_all(),
                    self.timeout_rate_hs()
                ),
            );
        }

        match set_type {
            "COMPUTED" => {
                self.record_timeouts = true;
            }
            "RESET" => {
                self.record_timeouts = false;
                self.all_launched = 0;
                self.all_built = 0;
                self.all_timeout = 0;
                self.hs_launched = 0;
                self.hs_built = 0;
                self.hs_timeout = 0;
            }
            _ => {}
        }
    }

    /// Observed timeout rate over all launched circuits.
    pub fn timeout_rate_all(&self) -> f64 {
        if self.all_launched == 0 {
            return 0.0;
        }
        self.all_timeout as f64 / self.all_launched as f64
    }

    /// Observed timeout rate over launched hidden-service circuits.
    pub fn timeout_rate_hs(&self) -> f64 {
        if self.hs_launched == 0 {
            return 0.0;
        }
        self.hs_timeout as f64 / self.hs_launched as f64
    }

    /// Number of circuits still awaiting an outcome.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch_and_build(stats: &mut TimeoutStats, id: &str, purpose: &str) {
        stats.circ_event(id, "LAUNCHED", purpose, None, None);
        stats.circ_event(id, "BUILT", purpose, None, None);
    }

    fn launch_and_timeout(stats: &mut TimeoutStats, id: &str, purpose: &str) {
        stats.circ_event(id, "LAUNCHED", purpose, None, None);
        stats.circ_event(id, "FAILED", purpose, None, Some("TIMEOUT"));
    }

    #[test]
    fn rates_start_at_zero() {
        let stats = TimeoutStats::new();
        assert_eq!(stats.timeout_rate_all(), 0.0);
        assert_eq!(stats.timeout_rate_hs(), 0.0);
    }

    #[test]
    fn rates_are_timeouts_over_launches() {
        // 8 HS builds + 2 HS timeouts, then 9 general builds + 1 general
        // timeout: 20% HS rate, 15% overall.
        let mut stats = TimeoutStats::new();
        for i in 0..8 {
            launch_and_build(&mut stats, &format!("hs{}", i), "HS_VANGUARDS");
        }
        launch_and_timeout(&mut stats, "hs8", "HS_VANGUARDS");
        launch_and_timeout(&mut stats, "hs9", "HS_VANGUARDS");
        assert!((stats.timeout_rate_hs() - 0.2).abs() < 1e-9);
        assert!((stats.timeout_rate_all() - 0.2).abs() < 1e-9);

        for i in 0..9 {
            launch_and_build(&mut stats, &format!("g{}", i), "GENERAL");
        }
        launch_and_timeout(&mut stats, "g9", "GENERAL");
        assert!((stats.timeout_rate_hs() - 0.2).abs() < 1e-9);
        assert!((stats.timeout_rate_all() - 0.15).abs() < 1e-9);
    }

    #[test]
    fn early_teardown_uncounts_the_launch() {
        let mut stats = TimeoutStats::new();
        for i in 0..8 {
            launch_and_build(&mut stats, &format!("hs{}", i), "HS_VANGUARDS");
        }
        launch_and_timeout(&mut stats, "hs8", "HS_VANGUARDS");
        launch_and_timeout(&mut stats, "hs9", "HS_VANGUARDS");

        // A failure and a close, neither a timeout: rates unchanged.
        stats.circ_event("x1", "LAUNCHED", "HS_SERVICE_INTRO", None, None);
        stats.circ_event("x1", "FAILED", "HS_SERVICE_INTRO", None, Some("FINISHED"));
        stats.circ_event("x2", "LAUNCHED", "GENERAL", None, None);
        stats.circ_event("x2", "CLOSED", "GENERAL", None, Some("FINISHED"));
        assert!((stats.timeout_rate_hs() - 0.2).abs() < 1e-9);
        assert!((stats.timeout_rate_all() - 0.2).abs() < 1e-9);
        assert_eq!(stats.pending_count(), 0);
    }

    #[test]
    fn measure_timeout_probes_are_left_alone() {
        let mut stats = TimeoutStats::new();
        launch_and_timeout(&mut stats, "1", "HS_VANGUARDS");
        // The follow-up expiry of the measurement probe must not
        // disturb the settled counts.
        stats.circ_event(
            "1",
            "FAILED",
            "MEASURE_TIMEOUT",
            None,
            Some("MEASUREMENT_EXPIRED"),
        );
        assert!((stats.timeout_rate_all() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn timeout_for_unknown_circuit_is_ignored() {
        let mut stats = TimeoutStats::new();
        stats.circ_event("9", "FAILED", "HS_VANGUARDS", None, Some("TIMEOUT"));
        assert_eq!(stats.timeout_rate_all(), 0.0);
    }

    #[test]
    fn reset_pauses_recording_until_computed() {
        let mut stats = TimeoutStats::new();
        launch_and_timeout(&mut stats, "1", "HS_VANGUARDS");
        assert!(stats.timeout_rate_all() > 0.0);

        stats.cbt_event("RESET", None);
        assert_eq!(stats.timeout_rate_all(), 0.0);

        // No timeout is in force, so nothing in this window counts.
        launch_and_timeout(&mut stats, "2", "HS_VANGUARDS");
        launch_and_build(&mut stats, "3", "HS_VANGUARDS");
        assert_eq!(stats.timeout_rate_all(), 0.0);
        assert_eq!(stats.pending_count(), 0);

        stats.cbt_event("COMPUTED", Some(0.06));
        launch_and_timeout(&mut stats, "4", "HS_VANGUARDS");
        assert!((stats.timeout_rate_all() - 1.0).abs() < 1e-9);
    }
}
