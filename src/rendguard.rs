//! Rendezvous-point use counting and overuse detection.
//!
//! A service-side rendezvous circuit terminates at a relay the *client*
//! chose. An adversary who can get a service to build many rendezvous
//! circuits through a relay it controls gains repeated observation points,
//! so this module keeps a bandwidth-weight-aware histogram of terminal
//! rendezvous hops and asks for circuits to be closed when one relay's
//! share of uses exceeds twice (configurable) its fair share.
//!
//! The test is deliberately coarse:
//!
//! ```text
//! overused(r) ⇔ total_uses ≥ GLOBAL_START
//!             ∧ used(r)   ≥ RELAY_START
//!             ∧ used(r)/total_uses > weight(r) × MAX_RATIO
//! ```
//!
//! A relay exceeding twice its consensus weight over a hundred or more
//! observations is statistically far outside what honest client choice
//! produces on a network of this size, while the start counts suppress
//! false positives during warm-up. Counts are halved whenever the total
//! crosses the scale threshold so long-lived relays are not punished for
//! uptime.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::RendguardConfig;
use crate::sampler::BwWeightedGenerator;

/// Sentinel fingerprint for rendezvous points absent from the consensus.
pub const NOT_IN_CONSENSUS_ID: &str = "NOT_IN_CONSENSUS";

/// Use count and expected weight for one relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RendUseCount {
    /// Relay fingerprint, or [`NOT_IN_CONSENSUS_ID`].
    pub fingerprint: String,
    /// Observed uses. Fractional after scaling.
    pub used: f64,
    /// Expected share of uses, in `[0, 1]`.
    pub weight: f64,
}

impl RendUseCount {
    /// Creates an unused entry with the given weight.
    pub fn new(fingerprint: String, weight: f64) -> Self {
        Self {
            fingerprint,
            used: 0.0,
            weight,
        }
    }
}

/// Verdict for one recorded rendezvous use.
#[derive(Debug, Clone, PartialEq)]
pub enum RendVerdict {
    /// Within expected bounds.
    Ok,
    /// The relay exceeds its weighted share; the circuit should go.
    Overused {
        /// Offending relay fingerprint.
        fingerprint: String,
        /// Observed share of uses, percent.
        usage_pct: f64,
        /// Expected share from consensus weight, percent.
        expected_pct: f64,
    },
}

/// Weight-aware histogram over terminal service-rendezvous hops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RendGuard {
    /// Per-relay counts, keyed by fingerprint.
    pub use_counts: HashMap<String, RendUseCount>,
    /// Sum of `used` over all entries.
    pub total_use_counts: f64,
    /// Set once per consensus when an unlisted relay is seen.
    #[serde(skip)]
    warned_not_in_consensus: bool,
}

impl Default for RendGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl RendGuard {
    /// Creates an empty counter.
    pub fn new() -> Self {
        Self {
            use_counts: HashMap::new(),
            total_use_counts: 0.0,
            warned_not_in_consensus: false,
        }
    }

    /// Extracts the rendezvous hop from a service-side rend circuit path.
    ///
    /// With layer-3 guards in use the path is guard, layer2, layer3,
    /// middle, rend; without them the rend point sits one hop earlier.
    pub fn rend_hop(path: &[String], layer3_in_use: bool) -> Option<&str> {
        let idx = if layer3_in_use { 4 } else { 3 };
        path.get(idx).map(|s| s.as_str())
    }

    /// Records one use of `fingerprint` as a rendezvous point and checks
    /// the overuse policy.
    ///
    /// An unlisted relay is attributed to [`NOT_IN_CONSENSUS_ID`]; the
    /// first such sighting after each consensus is reported through the
    /// second tuple element so the caller can warn.
    pub fn record_use(
        &mut self,
        fingerprint: &str,
        config: &RendguardConfig,
    ) -> (RendVerdict, bool) {
        let mut first_unlisted = false;
        let key = if self.use_counts.contains_key(fingerprint) {
            fingerprint.to_string()
        } else {
            if !self.warned_not_in_consensus {
                self.warned_not_in_consensus = true;
                first_unlisted = true;
            }
            self.use_counts
                .entry(NOT_IN_CONSENSUS_ID.to_string())
                .or_insert_with(|| RendUseCount::new(NOT_IN_CONSENSUS_ID.to_string(), 0.0));
            NOT_IN_CONSENSUS_ID.to_string()
        };

        if let Some(count) = self.use_counts.get_mut(&key) {
            count.used += 1.0;
        }
        self.total_use_counts += 1.0;

        let verdict = if self.is_overused(&key, config) {
            RendVerdict::Overused {
                fingerprint: key.clone(),
                usage_pct: self.usage_pct(&key),
                expected_pct: self.expected_pct(&key),
            }
        } else {
            RendVerdict::Ok
        };
        (verdict, first_unlisted)
    }

    /// Applies the overuse test to a relay's current counts.
    pub fn is_overused(&self, fingerprint: &str, config: &RendguardConfig) -> bool {
        if self.total_use_counts < config.rend_use_global_start_count as f64 {
            return false;
        }
        match self.use_counts.get(fingerprint) {
            Some(count) => {
                count.used >= config.rend_use_relay_start_count as f64
                    && count.used / self.total_use_counts
                        > count.weight * config.rend_use_max_use_to_bw_ratio
            }
            None => false,
        }
    }

    /// Observed share of uses for a relay, in percent.
    pub fn usage_pct(&self, fingerprint: &str) -> f64 {
        if self.total_use_counts <= 0.0 {
            return 0.0;
        }
        self.use_counts
            .get(fingerprint)
            .map(|c| 100.0 * c.used / self.total_use_counts)
            .unwrap_or(0.0)
    }

    /// Expected share for a relay from its consensus weight, in percent.
    pub fn expected_pct(&self, fingerprint: &str) -> f64 {
        self.use_counts
            .get(fingerprint)
            .map(|c| 100.0 * c.weight)
            .unwrap_or(0.0)
    }

    /// Rebuilds the weight table from a fresh consensus sampler.
    ///
    /// Every relay the sampler admits gets its expected share as the new
    /// weight (the sampler normalizes exits against the repaired exit
    /// pool so their share is not zeroed by middle weighting). Previous
    /// `used` counts carry over by fingerprint and are halved when the
    /// total crossed the scale threshold. The sentinel entry survives
    /// consensus churn with the configured churn weight.
    pub fn xfer_use_counts(&mut self, generator: &BwWeightedGenerator, config: &RendguardConfig) {
        let old_counts = std::mem::take(&mut self.use_counts);
        let scale = self.total_use_counts >= config.rend_use_scale_at_count as f64;

        for (relay, share) in generator.expected_shares() {
            self.use_counts.insert(
                relay.fingerprint.clone(),
                RendUseCount::new(relay.fingerprint.clone(), share),
            );
        }

        self.use_counts.insert(
            NOT_IN_CONSENSUS_ID.to_string(),
            RendUseCount::new(
                NOT_IN_CONSENSUS_ID.to_string(),
                config.rend_use_max_consensus_weight_churn / 100.0,
            ),
        );

        for (fp, old) in old_counts {
            if let Some(new) = self.use_counts.get_mut(&fp) {
                new.used = if scale { old.used / 2.0 } else { old.used };
            }
        }

        self.total_use_counts = self.use_counts.values().map(|c| c.used).sum();
        self.warned_not_in_consensus = false;
    }
}
