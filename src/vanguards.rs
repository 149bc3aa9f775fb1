//! The vanguard set manager: pinned layer-2 and layer-3 relay sets.
//!
//! Hidden-service circuits normally pick their middle hops fresh for every
//! circuit, which lets an adversary who can repeatedly appear next to a
//! service walk the path one hop at a time. Pinning two layered sets of
//! middle relays for longer than a single circuit closes that avenue:
//!
//! ```text
//!  service ── layer1 (Tor's guard) ── layer2 (pinned) ── layer3 (pinned) ── …
//!                days/weeks            1–45 days          1–48 hours
//! ```
//!
//! On every consensus the manager drops members that fell out of the
//! directory, became excluded, or expired, then replenishes each layer
//! from a bandwidth-weighted sampler. Member lifetimes are drawn as the
//! maximum of two uniform samples, which biases rotation toward the long
//! end of the window and staggers replacements.
//!
//! The refreshed sampler is handed to the rendezvous counter so its
//! expected-use weights always describe the same consensus the layers
//! were drawn from.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use stem_rs::descriptor::router_status::RouterStatusEntry;

use crate::config::{Config, VanguardsConfig};
use crate::error::{Error, Result};
use crate::exclusion::ExclusionResolver;
use crate::rendguard::RendGuard;
use crate::sampler::{BwWeightedGenerator, FlagsRestriction, RestrictionSet};

const SECS_PER_HOUR: u64 = 3600;

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One pinned relay with its rotation window.
///
/// Invariant: `min_lifetime ≤ expires_at − chosen_at < max_lifetime` for
/// the layer the node belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardNode {
    /// Relay fingerprint, 40 hex characters.
    pub fingerprint: String,
    /// Unix second this node was pinned.
    pub chosen_at: u64,
    /// Unix second this node rotates out.
    pub expires_at: u64,
}

impl GuardNode {
    /// Creates a pinned node.
    pub fn new(fingerprint: String, chosen_at: u64, expires_at: u64) -> Self {
        Self {
            fingerprint,
            chosen_at,
            expires_at,
        }
    }

    /// Whether this node's rotation time has passed.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at < now
    }
}

/// Draws a rotation lifetime in seconds from `[min_hours, max_hours)`.
///
/// The result is the larger of two independent uniform draws, so the
/// distribution leans toward the top of the window.
pub fn guard_lifetime_secs(min_hours: u32, max_hours: u32) -> u64 {
    let min = (min_hours as u64 * SECS_PER_HOUR) as f64;
    let max = (max_hours as u64 * SECS_PER_HOUR) as f64;
    let mut rng = rand::thread_rng();
    let a: f64 = rng.gen_range(min..max);
    let b: f64 = rng.gen_range(min..max);
    a.max(b) as u64
}

/// The two pinned layers plus the rendezvous counter they feed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VanguardState {
    /// Pinned layer-2 relays.
    pub layer2: Vec<GuardNode>,
    /// Pinned layer-3 relays.
    pub layer3: Vec<GuardNode>,
    /// Rendezvous-point use counter, persisted alongside the layers.
    pub rendguard: RendGuard,
    /// Whether layer management is active. When false, consensus updates
    /// still re-weight the rendezvous counter but leave the layers alone.
    pub enabled: bool,
}

impl VanguardState {
    /// Creates an empty state with layer management enabled.
    pub fn new() -> Self {
        Self {
            layer2: Vec::new(),
            layer3: Vec::new(),
            rendguard: RendGuard::new(),
            enabled: true,
        }
    }

    /// Layer-2 fingerprints as the comma-separated `HSLayer2Nodes` value.
    pub fn layer2_nodes_conf(&self) -> String {
        join_fingerprints(&self.layer2)
    }

    /// Layer-3 fingerprints as the comma-separated `HSLayer3Nodes` value.
    pub fn layer3_nodes_conf(&self) -> String {
        join_fingerprints(&self.layer3)
    }

    /// Processes one consensus: prune, replenish, and re-weight.
    ///
    /// `relays` is the full directory view; ordering does not matter, a
    /// missing `Measured` value is imputed from `Bandwidth`. Exclusion is
    /// consulted for current members and for every sampler draw.
    pub async fn update_from_consensus(
        &mut self,
        relays: &[RouterStatusEntry],
        weights: &HashMap<String, i64>,
        exclusion: &mut ExclusionResolver<'_>,
        config: &Config,
    ) -> Result<()> {
        let mut sorted: Vec<RouterStatusEntry> = relays.to_vec();
        for r in &mut sorted {
            r.measured = r.measured.or(r.bandwidth);
        }
        sorted.sort_by(|a, b| b.measured.unwrap_or(0).cmp(&a.measured.unwrap_or(0)));

        let directory_size = sorted.len();

        if self.enabled {
            let by_fp: HashMap<&str, &RouterStatusEntry> = sorted
                .iter()
                .map(|r| (r.fingerprint.as_str(), r))
                .collect();
            let now = unix_now();
            remove_down_or_excluded(&mut self.layer2, &by_fp, exclusion).await;
            remove_down_or_excluded(&mut self.layer3, &by_fp, exclusion).await;
            self.layer2.retain(|g| !g.is_expired(now));
            self.layer3.retain(|g| !g.is_expired(now));
            self.layer2.truncate(config.vanguards.num_layer2_guards as usize);
            self.layer3.truncate(config.vanguards.num_layer3_guards as usize);

            let generator = BwWeightedGenerator::new(
                sorted.clone(),
                RestrictionSet::new(vec![Box::new(FlagsRestriction::new(
                    &["Fast", "Stable", "Valid"],
                    &["Authority"],
                ))]),
                weights.clone(),
            )?;

            self.replenish_layers(&generator, exclusion, directory_size, &config.vanguards)
                .await?;
        }

        // Rendezvous weights come from a wider eligibility set: stability
        // does not matter for a single rendezvous splice, and exits can
        // still appear there on cannibalized circuits.
        let mut rend_generator = BwWeightedGenerator::new(
            sorted,
            RestrictionSet::new(vec![Box::new(FlagsRestriction::new(
                &["Fast", "Valid"],
                &["Authority"],
            ))]),
            weights.clone(),
        )?;
        rend_generator.repair_exits();
        self.rendguard
            .xfer_use_counts(&rend_generator, &config.rendguard);

        Ok(())
    }

    async fn replenish_layers(
        &mut self,
        generator: &BwWeightedGenerator,
        exclusion: &mut ExclusionResolver<'_>,
        directory_size: usize,
        config: &VanguardsConfig,
    ) -> Result<()> {
        while self.layer2.len() < config.num_layer2_guards as usize {
            let node = self
                .draw_new_guard(
                    generator,
                    exclusion,
                    directory_size,
                    config.min_layer2_lifetime_hours,
                    config.max_layer2_lifetime_hours,
                )
                .await?;
            self.layer2.push(node);
        }
        while self.layer3.len() < config.num_layer3_guards as usize {
            let node = self
                .draw_new_guard(
                    generator,
                    exclusion,
                    directory_size,
                    config.min_layer3_lifetime_hours,
                    config.max_layer3_lifetime_hours,
                )
                .await?;
            self.layer3.push(node);
        }
        Ok(())
    }

    /// Draws a replacement that is in neither layer and not excluded.
    ///
    /// The retry bound is twice the directory size; the sampler never
    /// removes relays between draws, so duplicates have to be rejected
    /// here.
    async fn draw_new_guard(
        &self,
        generator: &BwWeightedGenerator,
        exclusion: &mut ExclusionResolver<'_>,
        directory_size: usize,
        min_lifetime_hours: u32,
        max_lifetime_hours: u32,
    ) -> Result<GuardNode> {
        let taken: HashSet<&str> = self
            .layer2
            .iter()
            .chain(self.layer3.iter())
            .map(|g| g.fingerprint.as_str())
            .collect();

        let max_attempts = 2 * directory_size;
        for _ in 0..max_attempts {
            let candidate = generator.sample()?;
            if taken.contains(candidate.fingerprint.as_str()) {
                continue;
            }
            if exclusion.is_excluded(candidate).await {
                continue;
            }
            let now = unix_now();
            let lifetime = guard_lifetime_secs(min_lifetime_hours, max_lifetime_hours);
            return Ok(GuardNode::new(
                candidate.fingerprint.clone(),
                now,
                now + lifetime,
            ));
        }
        Err(Error::InsufficientRelays {
            attempts: max_attempts,
        })
    }
}

fn join_fingerprints(layer: &[GuardNode]) -> String {
    layer
        .iter()
        .map(|g| g.fingerprint.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

async fn remove_down_or_excluded(
    layer: &mut Vec<GuardNode>,
    by_fp: &HashMap<&str, &RouterStatusEntry>,
    exclusion: &mut ExclusionResolver<'_>,
) {
    let mut kept = Vec::with_capacity(layer.len());
    for node in layer.drain(..) {
        let keep = match by_fp.get(node.fingerprint.as_str()) {
            Some(relay) => !exclusion.is_excluded(relay).await,
            None => false,
        };
        if keep {
            kept.push(node);
        }
    }
    *layer = kept;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exclusion::ExcludeNodes;
    use chrono::Utc;
    use stem_rs::descriptor::router_status::RouterStatusEntryType;

    fn relay(i: usize, bw: u64) -> RouterStatusEntry {
        let mut r = RouterStatusEntry::new(
            RouterStatusEntryType::V3,
            format!("relay{}", i),
            format!("{:0>40X}", i),
            Utc::now(),
            format!("10.{}.{}.1", i / 256, i % 256).parse().unwrap(),
            9001,
        );
        r.flags = vec!["Fast".into(), "Stable".into(), "Valid".into()];
        r.measured = Some(bw);
        r
    }

    fn directory(n: usize) -> Vec<RouterStatusEntry> {
        (0..n).map(|i| relay(i, 100 + i as u64)).collect()
    }

    fn flat_weights() -> HashMap<String, i64> {
        let mut w = HashMap::new();
        for key in ["Wmm", "Wmg", "Wme", "Wmd", "Wee", "Wed"] {
            w.insert(key.to_string(), 10000);
        }
        w
    }

    fn no_exclusions() -> ExclusionResolver<'static> {
        ExclusionResolver::offline(ExcludeNodes::parse("", None))
    }

    fn check_invariants(state: &VanguardState, config: &Config) {
        assert_eq!(
            state.layer2.len(),
            config.vanguards.num_layer2_guards as usize
        );
        assert_eq!(
            state.layer3.len(),
            config.vanguards.num_layer3_guards as usize
        );

        let mut seen = HashSet::new();
        for g in state.layer2.iter().chain(state.layer3.iter()) {
            assert!(seen.insert(g.fingerprint.clone()), "duplicate {}", g.fingerprint);
        }

        let vg = &config.vanguards;
        for g in &state.layer2 {
            let life = g.expires_at - g.chosen_at;
            assert!(life >= vg.min_layer2_lifetime_hours as u64 * 3600);
            assert!(life < vg.max_layer2_lifetime_hours as u64 * 3600);
        }
        for g in &state.layer3 {
            let life = g.expires_at - g.chosen_at;
            assert!(life >= vg.min_layer3_lifetime_hours as u64 * 3600);
            assert!(life < vg.max_layer3_lifetime_hours as u64 * 3600);
        }
    }

    #[test]
    fn lifetime_draws_stay_in_bounds_and_lean_high() {
        let min = 24u32;
        let max = 1080u32;
        let mut sum = 0u64;
        const DRAWS: u64 = 300;
        for _ in 0..DRAWS {
            let life = guard_lifetime_secs(min, max);
            assert!(life >= min as u64 * 3600);
            assert!(life < max as u64 * 3600);
            sum += life;
        }
        // max-of-two-uniforms has mean min + 2/3 of the range.
        let midpoint = (min as u64 + max as u64) * 3600 / 2;
        assert!(sum / DRAWS > midpoint);
    }

    #[tokio::test]
    async fn consensus_fills_both_layers() {
        let mut state = VanguardState::new();
        let config = Config::default();
        state
            .update_from_consensus(
                &directory(500),
                &flat_weights(),
                &mut no_exclusions(),
                &config,
            )
            .await
            .unwrap();
        check_invariants(&state, &config);
    }

    #[tokio::test]
    async fn expired_member_is_replaced_others_retained() {
        let mut state = VanguardState::new();
        let config = Config::default();
        let dir = directory(500);
        state
            .update_from_consensus(&dir, &flat_weights(), &mut no_exclusions(), &config)
            .await
            .unwrap();

        let originals: Vec<String> =
            state.layer2.iter().map(|g| g.fingerprint.clone()).collect();
        let expired = originals[1].clone();
        state.layer2[1].expires_at = unix_now() - 1;

        state
            .update_from_consensus(&dir, &flat_weights(), &mut no_exclusions(), &config)
            .await
            .unwrap();
        check_invariants(&state, &config);

        let current: HashSet<String> =
            state.layer2.iter().map(|g| g.fingerprint.clone()).collect();
        assert!(!current.contains(&expired));
        for keep in originals.iter().filter(|fp| **fp != expired) {
            assert!(current.contains(keep), "retained member {} lost", keep);
        }
        // The replacement is none of the original four.
        let fresh: Vec<_> = current.iter().filter(|fp| !originals.contains(fp)).collect();
        assert_eq!(fresh.len(), 1);
    }

    #[tokio::test]
    async fn member_leaving_the_directory_is_replaced() {
        let mut state = VanguardState::new();
        let config = Config::default();
        let dir = directory(500);
        state
            .update_from_consensus(&dir, &flat_weights(), &mut no_exclusions(), &config)
            .await
            .unwrap();

        let gone = state.layer2[0].fingerprint.clone();
        let keep: Vec<String> = state.layer2[1..]
            .iter()
            .map(|g| g.fingerprint.clone())
            .collect();
        let shrunk: Vec<RouterStatusEntry> = dir
            .iter()
            .filter(|r| r.fingerprint != gone)
            .cloned()
            .collect();

        state
            .update_from_consensus(&shrunk, &flat_weights(), &mut no_exclusions(), &config)
            .await
            .unwrap();
        check_invariants(&state, &config);

        let current: HashSet<String> =
            state.layer2.iter().map(|g| g.fingerprint.clone()).collect();
        assert!(!current.contains(&gone));
        for fp in keep {
            assert!(current.contains(&fp));
        }
    }

    #[tokio::test]
    async fn excluded_members_are_removed_per_rule_kind() {
        let config = Config::default();
        let dir = directory(500);

        // Exercise fingerprint, nickname, and CIDR exclusion separately.
        let rule_kinds: [fn(&RouterStatusEntry) -> String; 3] = [
            |r| format!("${}", r.fingerprint),
            |r| r.nickname.clone(),
            |r| format!("{}/32", r.address),
        ];
        for rule_of in rule_kinds {
            let mut state = VanguardState::new();
            state
                .update_from_consensus(&dir, &flat_weights(), &mut no_exclusions(), &config)
                .await
                .unwrap();

            let target_fp = state.layer2[0].fingerprint.clone();
            let target = dir.iter().find(|r| r.fingerprint == target_fp).unwrap();
            let keep: Vec<String> = state.layer2[1..]
                .iter()
                .map(|g| g.fingerprint.clone())
                .collect();

            let rules = ExcludeNodes::parse(&rule_of(target), None);
            let mut resolver = ExclusionResolver::offline(rules);
            state
                .update_from_consensus(&dir, &flat_weights(), &mut resolver, &config)
                .await
                .unwrap();
            check_invariants(&state, &config);

            let current: HashSet<String> =
                state.layer2.iter().map(|g| g.fingerprint.clone()).collect();
            assert!(!current.contains(&target_fp));
            for fp in keep {
                assert!(current.contains(&fp));
            }
        }
    }

    #[tokio::test]
    async fn shrunken_layer_config_truncates() {
        let mut state = VanguardState::new();
        let mut config = Config::default();
        let dir = directory(200);
        state
            .update_from_consensus(&dir, &flat_weights(), &mut no_exclusions(), &config)
            .await
            .unwrap();

        config.vanguards.num_layer2_guards = 2;
        config.vanguards.num_layer3_guards = 3;
        state
            .update_from_consensus(&dir, &flat_weights(), &mut no_exclusions(), &config)
            .await
            .unwrap();
        check_invariants(&state, &config);
    }

    #[tokio::test]
    async fn tiny_directory_yields_insufficient_relays() {
        let mut state = VanguardState::new();
        let config = Config::default();
        // 4 + 8 slots cannot be filled from 5 distinct relays.
        let result = state
            .update_from_consensus(
                &directory(5),
                &flat_weights(),
                &mut no_exclusions(),
                &config,
            )
            .await;
        assert!(matches!(result, Err(Error::InsufficientRelays { .. })));
    }

    #[tokio::test]
    async fn empty_directory_yields_no_relays_remain() {
        let mut state = VanguardState::new();
        let config = Config::default();
        let result = state
            .update_from_consensus(&[], &flat_weights(), &mut no_exclusions(), &config)
            .await;
        assert!(matches!(result, Err(Error::NoRelaysRemain)));
    }

    #[tokio::test]
    async fn disabled_state_leaves_layers_alone_but_reweights() {
        let mut state = VanguardState::new();
        state.enabled = false;
        let config = Config::default();
        state
            .update_from_consensus(
                &directory(100),
                &flat_weights(),
                &mut no_exclusions(),
                &config,
            )
            .await
            .unwrap();
        assert!(state.layer2.is_empty());
        assert!(state.layer3.is_empty());
        assert!(!state.rendguard.use_counts.is_empty());
    }

    #[test]
    fn nodes_conf_formatting() {
        let mut state = VanguardState::new();
        state.layer2.push(GuardNode::new("A".repeat(40), 0, 10));
        state.layer2.push(GuardNode::new("B".repeat(40), 0, 10));
        assert_eq!(
            state.layer2_nodes_conf(),
            format!("{},{}", "A".repeat(40), "B".repeat(40))
        );
        assert_eq!(state.layer3_nodes_conf(), "");
    }
}
