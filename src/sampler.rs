//! Bandwidth-weighted relay sampling over the consensus directory.
//!
//! Everything this crate pins or counts sits in the *middle* of a
//! circuit: layer-2 and layer-3 vanguards are middle hops by definition,
//! and a rendezvous point is spliced in as the last middle hop of the
//! service-side circuit. The sampler is therefore specialized to Tor's
//! middle-position weighting and knows nothing about entry or exit
//! selection.
//!
//! Each eligible relay gets the sampling weight
//!
//! ```text
//! weight = measured_bw × Wm?/scale        scale = 10000
//! ```
//!
//! where `Wm?` is picked by the relay's flags: `Wmd` for Guard+Exit,
//! `Wme` for Exit, `Wmg` for Guard, `Wmm` otherwise. A missing
//! `Measured` value is imputed from `Bandwidth` before relays reach this
//! module.
//!
//! Draws walk the prefix sums of those weights: `x ∈ [0, total)` is drawn
//! with a strict upper bound and the first prefix sum strictly above `x`
//! selects the relay, so the walk terminates on the last relay even when
//! float rounding leaves `x` past the end. The generator never removes a
//! drawn relay; callers reject duplicates themselves.
//!
//! One wrinkle is owed to the rendezvous counter. Most consensuses set
//! `Wme`/`Wmd` to zero, which is correct for sampling (clients avoid
//! burning exit capacity on middle hops) but wrong as an *expected share*
//! of rendezvous choices, because cannibalized circuits still land on
//! exits. [`BwWeightedGenerator::repair_exits`] computes a separate
//! exit-position weight (`Wed`/`Wee`) for Exit relays, and
//! [`expected_shares`](BwWeightedGenerator::expected_shares) normalizes
//! exits against that pool instead. Sampling weights are never touched
//! by the repair.

use std::collections::HashMap;
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use rand::Rng;
use stem_rs::descriptor::router_status::RouterStatusEntry;

use crate::error::{Error, Result};

/// Returns true for a 40-character hex relay fingerprint.
pub fn is_valid_fingerprint(s: &str) -> bool {
    s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Returns true for an IPv4/IPv6 address or CIDR network literal.
pub fn is_valid_ip_or_network(s: &str) -> bool {
    s.parse::<IpAddr>().is_ok() || s.parse::<IpNetwork>().is_ok()
}

/// Returns true for a two-letter country code.
pub fn is_valid_country_code(s: &str) -> bool {
    s.len() == 2 && s.chars().all(|c| c.is_ascii_alphabetic())
}

/// A predicate narrowing the set of relays eligible for sampling.
pub trait RelayRestriction: Send + Sync {
    /// Returns true if the relay is acceptable.
    fn permits(&self, relay: &RouterStatusEntry) -> bool;
}

/// Restriction on mandatory and forbidden consensus flags.
#[derive(Debug, Clone)]
pub struct FlagsRestriction {
    mandatory: Vec<String>,
    forbidden: Vec<String>,
}

impl FlagsRestriction {
    /// Creates a restriction requiring all `mandatory` flags and none of
    /// the `forbidden` ones.
    pub fn new(mandatory: &[&str], forbidden: &[&str]) -> Self {
        Self {
            mandatory: mandatory.iter().map(|s| s.to_string()).collect(),
            forbidden: forbidden.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl RelayRestriction for FlagsRestriction {
    fn permits(&self, relay: &RouterStatusEntry) -> bool {
        self.mandatory
            .iter()
            .all(|m| relay.flags.iter().any(|f| f == m))
            && !self
                .forbidden
                .iter()
                .any(|b| relay.flags.iter().any(|f| f == b))
    }
}

/// A conjunction of restrictions. All must pass.
pub struct RestrictionSet {
    restrictions: Vec<Box<dyn RelayRestriction>>,
}

impl RestrictionSet {
    /// Creates a restriction set from its members.
    pub fn new(restrictions: Vec<Box<dyn RelayRestriction>>) -> Self {
        Self { restrictions }
    }

    /// Returns true if the relay passes every restriction.
    pub fn permits(&self, relay: &RouterStatusEntry) -> bool {
        self.restrictions.iter().all(|r| r.permits(relay))
    }
}

/// Consensus weight-scale constant. Tor publishes weights in parts per
/// ten thousand.
const WEIGHT_SCALE: f64 = 10000.0;

fn has_flag(relay: &RouterStatusEntry, flag: &str) -> bool {
    relay.flags.iter().any(|f| f == flag)
}

fn imputed_bw(relay: &RouterStatusEntry) -> f64 {
    relay.measured.or(relay.bandwidth).unwrap_or(0) as f64
}

/// Middle-position weight key for a relay's flag combination.
fn middle_weight_key(relay: &RouterStatusEntry) -> &'static str {
    match (has_flag(relay, "Guard"), has_flag(relay, "Exit")) {
        (true, true) => "Wmd",
        (false, true) => "Wme",
        (true, false) => "Wmg",
        (false, false) => "Wmm",
    }
}

/// Exit-position weight key. Only meaningful for Exit-flagged relays.
fn exit_weight_key(relay: &RouterStatusEntry) -> &'static str {
    if has_flag(relay, "Guard") {
        "Wed"
    } else {
        "Wee"
    }
}

/// One eligible relay with its precomputed weights.
struct WeightedRelay {
    relay: RouterStatusEntry,
    /// Middle-position sampling weight. Never changes after construction.
    sample_weight: f64,
    /// Weight used for expected-share computation; re-keyed to the exit
    /// position for Exit relays by `repair_exits`.
    share_weight: f64,
}

/// Bandwidth-weighted middle-relay generator over a restricted directory.
///
/// Construct once per consensus; [`sample`](Self::sample) may then be
/// called any number of times, and
/// [`expected_shares`](Self::expected_shares) hands the rendezvous
/// counter the per-relay probability mass the same draw distribution
/// implies.
pub struct BwWeightedGenerator {
    entries: Vec<WeightedRelay>,
    /// Running prefix sums of the sampling weights, one per entry.
    prefix_sums: Vec<f64>,
    total_weight: f64,
    /// Sum of repaired exit weights; 0 until `repair_exits` runs.
    exit_total: f64,
    bw_weights: HashMap<String, i64>,
}

impl BwWeightedGenerator {
    /// Builds the generator, filtering `sorted_relays` through
    /// `restrictions` and precomputing the prefix-sum table.
    ///
    /// Fails with [`Error::NoRelaysRemain`] if the restriction eliminates
    /// every relay.
    pub fn new(
        sorted_relays: Vec<RouterStatusEntry>,
        restrictions: RestrictionSet,
        bw_weights: HashMap<String, i64>,
    ) -> Result<Self> {
        let mut entries = Vec::new();
        let mut prefix_sums = Vec::new();
        let mut total_weight = 0.0;

        for relay in sorted_relays {
            if !restrictions.permits(&relay) {
                continue;
            }
            let weight = imputed_bw(&relay) * weight_param(&bw_weights, middle_weight_key(&relay));
            total_weight += weight;
            prefix_sums.push(total_weight);
            entries.push(WeightedRelay {
                relay,
                sample_weight: weight,
                share_weight: weight,
            });
        }

        if entries.is_empty() {
            return Err(Error::NoRelaysRemain);
        }

        Ok(Self {
            entries,
            prefix_sums,
            total_weight,
            exit_total: 0.0,
            bw_weights,
        })
    }

    /// Draws one relay, weighted by bandwidth.
    pub fn sample(&self) -> Result<&RouterStatusEntry> {
        if self.total_weight <= 0.0 {
            return Err(Error::NoRelaysRemain);
        }

        let x = rand::thread_rng().gen_range(0.0..self.total_weight);
        // First prefix sum strictly above x claims the draw. Rounding in
        // the sums can leave x past the final one; the last relay takes
        // those.
        let idx = self
            .prefix_sums
            .partition_point(|&sum| sum <= x)
            .min(self.entries.len() - 1);
        Ok(&self.entries[idx].relay)
    }

    /// Re-keys Exit relays' share weights to the exit position.
    ///
    /// The sampling distribution is left alone: a rendezvous share is a
    /// statement about what *clients* choose, not about what this tool
    /// should pin, and the pinned layers must keep avoiding exit
    /// capacity.
    pub fn repair_exits(&mut self) {
        self.exit_total = 0.0;
        for entry in &mut self.entries {
            if has_flag(&entry.relay, "Exit") {
                entry.share_weight =
                    imputed_bw(&entry.relay) * weight_param(&self.bw_weights, exit_weight_key(&entry.relay));
                self.exit_total += entry.share_weight;
            }
        }
    }

    /// Iterates every eligible relay with its expected share in `[0, 1]`.
    ///
    /// Exit relays are normalized against the repaired exit pool, all
    /// others against the middle pool, so the two families each sum to
    /// roughly one. Without a prior `repair_exits` call, exits fall back
    /// to their (usually zero) middle share.
    pub fn expected_shares(&self) -> impl Iterator<Item = (&RouterStatusEntry, f64)> {
        self.entries.iter().map(move |entry| {
            let share = if self.exit_total > 0.0 && has_flag(&entry.relay, "Exit") {
                entry.share_weight / self.exit_total
            } else if self.total_weight > 0.0 {
                entry.sample_weight / self.total_weight
            } else {
                0.0
            };
            (&entry.relay, share)
        })
    }

    /// Number of relays that survived the restrictions.
    pub fn relay_count(&self) -> usize {
        self.entries.len()
    }

    /// Sum of all middle-position sampling weights.
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// Sum of the exit-position weights set by
    /// [`repair_exits`](Self::repair_exits).
    pub fn exit_total(&self) -> f64 {
        self.exit_total
    }
}

fn weight_param(bw_weights: &HashMap<String, i64>, key: &str) -> f64 {
    // A consensus that omits a weight parameter gets the neutral
    // multiplier, same as publishing the full scale value.
    match bw_weights.get(key) {
        Some(&w) => w as f64 / WEIGHT_SCALE,
        None => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stem_rs::descriptor::router_status::RouterStatusEntryType;

    fn test_relay(
        fingerprint: &str,
        nickname: &str,
        bw: u64,
        flags: &[&str],
    ) -> RouterStatusEntry {
        let mut relay = RouterStatusEntry::new(
            RouterStatusEntryType::V3,
            nickname.to_string(),
            fingerprint.to_string(),
            Utc::now(),
            "192.0.2.1".parse().unwrap(),
            9001,
        );
        relay.flags = flags.iter().map(|s| s.to_string()).collect();
        relay.measured = Some(bw);
        relay
    }

    fn consensus_weights() -> HashMap<String, i64> {
        let mut w = HashMap::new();
        w.insert("Wmm".to_string(), 10000);
        w.insert("Wmg".to_string(), 4000);
        w.insert("Wme".to_string(), 0);
        w.insert("Wmd".to_string(), 0);
        w.insert("Wee".to_string(), 10000);
        w.insert("Wed".to_string(), 5000);
        w
    }

    fn fast_valid() -> RestrictionSet {
        RestrictionSet::new(vec![Box::new(FlagsRestriction::new(&["Fast"], &[]))])
    }

    #[test]
    fn fingerprint_validation() {
        assert!(is_valid_fingerprint(&"A".repeat(40)));
        assert!(is_valid_fingerprint(&"a1b2c3d4e5".repeat(4)));
        assert!(!is_valid_fingerprint(""));
        assert!(!is_valid_fingerprint(&"A".repeat(39)));
        assert!(!is_valid_fingerprint(&"A".repeat(41)));
        assert!(!is_valid_fingerprint(&"G".repeat(40)));
    }

    #[test]
    fn ip_and_network_validation() {
        assert!(is_valid_ip_or_network("192.0.2.7"));
        assert!(is_valid_ip_or_network("192.0.2.0/24"));
        assert!(is_valid_ip_or_network("2001:db8::1"));
        assert!(is_valid_ip_or_network("2001:db8::/32"));
        assert!(!is_valid_ip_or_network("192.0.2.0/33"));
        assert!(!is_valid_ip_or_network("relay.example.com"));
    }

    #[test]
    fn country_code_validation() {
        assert!(is_valid_country_code("us"));
        assert!(is_valid_country_code("DE"));
        assert!(!is_valid_country_code("usa"));
        assert!(!is_valid_country_code("u1"));
        assert!(!is_valid_country_code(""));
    }

    #[test]
    fn flags_restriction_filters() {
        let relay = test_relay(&"A".repeat(40), "r1", 100, &["Fast", "Stable", "Valid"]);
        let rstr = FlagsRestriction::new(&["Fast", "Stable", "Valid"], &["Authority"]);
        assert!(rstr.permits(&relay));

        let authority = test_relay(
            &"B".repeat(40),
            "r2",
            100,
            &["Fast", "Stable", "Valid", "Authority"],
        );
        assert!(!rstr.permits(&authority));

        let slow = test_relay(&"C".repeat(40), "r3", 100, &["Valid"]);
        assert!(!rstr.permits(&slow));
    }

    #[test]
    fn middle_weight_keys_by_flags() {
        let plain = test_relay(&"A".repeat(40), "a", 1, &["Fast"]);
        let guard = test_relay(&"B".repeat(40), "b", 1, &["Fast", "Guard"]);
        let exit = test_relay(&"C".repeat(40), "c", 1, &["Fast", "Exit"]);
        let both = test_relay(&"D".repeat(40), "d", 1, &["Fast", "Guard", "Exit"]);

        assert_eq!(middle_weight_key(&plain), "Wmm");
        assert_eq!(middle_weight_key(&guard), "Wmg");
        assert_eq!(middle_weight_key(&exit), "Wme");
        assert_eq!(middle_weight_key(&both), "Wmd");
        assert_eq!(exit_weight_key(&exit), "Wee");
        assert_eq!(exit_weight_key(&both), "Wed");
    }

    #[test]
    fn empty_directory_is_an_error() {
        let result = BwWeightedGenerator::new(vec![], fast_valid(), consensus_weights());
        assert!(matches!(result, Err(Error::NoRelaysRemain)));
    }

    #[test]
    fn restriction_eliminating_everything_is_an_error() {
        let relays = vec![test_relay(&"A".repeat(40), "r1", 100, &["Valid"])];
        let result = BwWeightedGenerator::new(relays, fast_valid(), consensus_weights());
        assert!(matches!(result, Err(Error::NoRelaysRemain)));
    }

    #[test]
    fn prefix_sums_accumulate_scaled_weights() {
        let relays = vec![
            test_relay(&"A".repeat(40), "mid", 1000, &["Fast"]),
            test_relay(&"B".repeat(40), "guard", 1000, &["Fast", "Guard"]),
            test_relay(&"C".repeat(40), "exit", 1000, &["Fast", "Exit"]),
        ];
        let gen = BwWeightedGenerator::new(relays, fast_valid(), consensus_weights()).unwrap();

        // 1000·1.0 + 1000·0.4 + 1000·0.0
        assert_eq!(gen.relay_count(), 3);
        assert!((gen.total_weight() - 1400.0).abs() < 1e-9);
        assert!((gen.prefix_sums[0] - 1000.0).abs() < 1e-9);
        assert!((gen.prefix_sums[1] - 1400.0).abs() < 1e-9);
        assert!((gen.prefix_sums[2] - 1400.0).abs() < 1e-9);
    }

    #[test]
    fn sample_never_yields_zero_weight_relays() {
        // The exit has Wme=0 and must never be drawn.
        let relays = vec![
            test_relay(&"A".repeat(40), "mid", 1000, &["Fast"]),
            test_relay(&"B".repeat(40), "exit", 1000, &["Fast", "Exit"]),
        ];
        let gen = BwWeightedGenerator::new(relays, fast_valid(), consensus_weights()).unwrap();

        for _ in 0..50 {
            assert_eq!(gen.sample().unwrap().fingerprint, "A".repeat(40));
        }
    }

    #[test]
    fn all_zero_weights_is_an_error() {
        let relays = vec![test_relay(&"A".repeat(40), "exit", 1000, &["Fast", "Exit"])];
        let gen = BwWeightedGenerator::new(relays, fast_valid(), consensus_weights()).unwrap();
        assert!(matches!(gen.sample(), Err(Error::NoRelaysRemain)));
    }

    #[test]
    fn repair_exits_leaves_sampling_alone() {
        let relays = vec![
            test_relay(&"A".repeat(40), "mid", 1000, &["Fast"]),
            test_relay(&"B".repeat(40), "exit", 500, &["Fast", "Exit"]),
        ];
        let mut gen = BwWeightedGenerator::new(relays, fast_valid(), consensus_weights()).unwrap();

        gen.repair_exits();
        assert!((gen.exit_total() - 500.0).abs() < 1e-9);
        assert!((gen.total_weight() - 1000.0).abs() < 1e-9);
        // Draws still avoid the exit even after the repair.
        for _ in 0..50 {
            assert_eq!(gen.sample().unwrap().fingerprint, "A".repeat(40));
        }
    }

    #[test]
    fn expected_shares_normalize_per_family() {
        let relays = vec![
            test_relay(&"A".repeat(40), "mid1", 300, &["Fast"]),
            test_relay(&"B".repeat(40), "mid2", 100, &["Fast"]),
            test_relay(&"C".repeat(40), "exit1", 600, &["Fast", "Exit"]),
            test_relay(&"D".repeat(40), "exit2", 200, &["Fast", "Exit"]),
        ];
        let mut gen = BwWeightedGenerator::new(relays, fast_valid(), consensus_weights()).unwrap();
        gen.repair_exits();

        let shares: HashMap<String, f64> = gen
            .expected_shares()
            .map(|(relay, share)| (relay.fingerprint.clone(), share))
            .collect();

        // Middles split their 400 pool, exits their 800 pool.
        assert!((shares[&"A".repeat(40)] - 0.75).abs() < 1e-9);
        assert!((shares[&"B".repeat(40)] - 0.25).abs() < 1e-9);
        assert!((shares[&"C".repeat(40)] - 0.75).abs() < 1e-9);
        assert!((shares[&"D".repeat(40)] - 0.25).abs() < 1e-9);
    }

    #[test]
    fn shares_without_repair_fall_back_to_middle_weighting() {
        let relays = vec![
            test_relay(&"A".repeat(40), "mid", 1000, &["Fast"]),
            test_relay(&"B".repeat(40), "exit", 500, &["Fast", "Exit"]),
        ];
        let gen = BwWeightedGenerator::new(relays, fast_valid(), consensus_weights()).unwrap();

        let shares: Vec<f64> = gen.expected_shares().map(|(_, share)| share).collect();
        assert!((shares[0] - 1.0).abs() < 1e-9);
        assert_eq!(shares[1], 0.0);
    }

    #[test]
    fn unmeasured_relay_falls_back_to_bandwidth() {
        let mut relay = test_relay(&"A".repeat(40), "r1", 0, &["Fast"]);
        relay.measured = None;
        relay.bandwidth = Some(750);
        let gen =
            BwWeightedGenerator::new(vec![relay], fast_valid(), consensus_weights()).unwrap();
        assert!((gen.total_weight() - 750.0).abs() < 1e-9);
    }

    #[test]
    fn missing_weight_param_counts_as_neutral() {
        let relays = vec![test_relay(&"A".repeat(40), "mid", 200, &["Fast"])];
        let gen = BwWeightedGenerator::new(relays, fast_valid(), HashMap::new()).unwrap();
        assert!((gen.total_weight() - 200.0).abs() < 1e-9);
    }
}
