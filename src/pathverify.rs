//! Verification that built circuits honor the pinned layer configuration.
//!
//! The overlay is trusted to apply `HSLayer2Nodes`/`HSLayer3Nodes`, but a
//! bug (or a tampered binary) that ignores them would silently void every
//! vanguard protection. This sibling policy re-checks each built
//! hidden-service circuit against the sets we pushed: the route length
//! must match the purpose, the first hop must ride an existing guard
//! connection, and hops two and three must come from the pinned layers.
//! Mismatches are warnings, never closes.

use std::collections::{HashMap, HashSet};

use crate::config::LogLevel;
use crate::logger::plog;

/// Expected route length per purpose with layer-3 guards in use.
///
/// Service-side rendezvous and client-side intro/HSDIR circuits carry one
/// extra hop because the far end chose the terminal relay.
const ROUTELEN_FOR_PURPOSE: [(&str, usize); 7] = [
    ("HS_VANGUARDS", 4),
    ("HS_CLIENT_HSDIR", 5),
    ("HS_CLIENT_INTRO", 5),
    ("HS_CLIENT_REND", 4),
    ("HS_SERVICE_HSDIR", 4),
    ("HS_SERVICE_INTRO", 4),
    ("HS_SERVICE_REND", 5),
];

/// Circuit-path verifier over the current layer sets.
pub struct PathVerify {
    layer1_conns: HashSet<String>,
    layer2: HashSet<String>,
    layer3: HashSet<String>,
    layer3_in_use: bool,
    num_layer2: u8,
    num_layer3: u8,
}

impl PathVerify {
    /// Creates a verifier for the configured layer sizes.
    pub fn new(num_layer2: u8, num_layer3: u8) -> Self {
        Self {
            layer1_conns: HashSet::new(),
            layer2: HashSet::new(),
            layer3: HashSet::new(),
            layer3_in_use: num_layer3 > 0,
            num_layer2,
            num_layer3,
        }
    }

    /// Seeds the layer sets from `GETCONF HSLayer2Nodes`/`HSLayer3Nodes`.
    pub fn init_layers(&mut self, layer2: Option<&str>, layer3: Option<&str>) {
        if let Some(nodes) = layer2 {
            self.layer2 = split_fingerprints(nodes);
        }
        if let Some(nodes) = layer3 {
            self.layer3 = split_fingerprints(nodes);
        }
        self.check_layer_sizes();
    }

    /// Seeds the first-hop set from a `GETINFO orconn-status` snapshot.
    pub fn init_conns(&mut self, snapshot: &str) {
        for line in snapshot.lines().filter(|l| !l.is_empty()) {
            let target = line.split_whitespace().next().unwrap_or("");
            let fp = target.strip_prefix('$').unwrap_or(target);
            let fp = fp.split(['~', '=']).next().unwrap_or("");
            if !fp.is_empty() {
                self.layer1_conns.insert(fp.to_string());
            }
        }
    }

    /// Tracks layer set changes pushed through `SETCONF`.
    pub fn conf_changed_event(&mut self, changed: &HashMap<String, Vec<String>>) {
        if let Some(values) = changed.get("HSLayer2Nodes") {
            if let Some(nodes) = values.first() {
                self.layer2 = split_fingerprints(nodes);
            }
        }
        if let Some(values) = changed.get("HSLayer3Nodes") {
            if let Some(nodes) = values.first() {
                self.layer3 = split_fingerprints(nodes);
            }
        }
        // On SIGHUP the sets can flash empty; only a populated wrong-sized
        // set is worth a warning.
        self.check_layer_sizes();
    }

    /// Tracks guard connection lifecycle.
    pub fn orconn_event(&mut self, guard_fp: &str, status: &str) {
        match status {
            "CONNECTED" => {
                self.layer1_conns.insert(guard_fp.to_string());
            }
            "CLOSED" | "FAILED" => {
                self.layer1_conns.remove(guard_fp);
            }
            _ => {}
        }
    }

    /// Expected route length for a purpose, or `None` for non-HS tags.
    pub fn routelen_for_purpose(&self, purpose: &str) -> Option<usize> {
        ROUTELEN_FOR_PURPOSE
            .iter()
            .find(|(p, _)| *p == purpose)
            .map(|(_, len)| if self.layer3_in_use { *len } else { *len - 1 })
    }

    /// Verifies one built (or guard-wait) circuit.
    pub fn circ_event(&mut self, status: &str, purpose: &str, hs_state: Option<&str>, path: &[String]) {
        if !purpose.starts_with("HS_") || (status != "BUILT" && status != "GUARD_WAIT") {
            return;
        }

        if let Some(expected) = self.routelen_for_purpose(purpose) {
            if path.len() != expected {
                // Cannibalized HS_VANGUARDS circuits legitimately show up
                // one hop short while still connecting.
                let level = if purpose == "HS_SERVICE_HSDIR" && hs_state == Some("HSSI_CONNECTING")
                {
                    LogLevel::Info
                } else {
                    LogLevel::Warn
                };
                plog(
                    level,
                    &format!(
                        "Route length {} is not {} for purpose {} circuit",
                        path.len(),
                        expected,
                        purpose
                    ),
                );
            }
        }

        if let Some(hop) = path.first() {
            if !self.layer1_conns.contains(hop) {
                plog(
                    LogLevel::Warn,
                    &format!("Guard {} has no tracked connection", hop),
                );
            }
        }
        if let Some(hop) = path.get(1) {
            if !self.layer2.contains(hop) {
                plog(
                    LogLevel::Warn,
                    &format!("Hop {} is not in the layer2 set", hop),
                );
            }
        }
        if self.layer3_in_use {
            if let Some(hop) = path.get(2) {
                if !self.layer3.contains(hop) {
                    plog(
                        LogLevel::Warn,
                        &format!("Hop {} is not in the layer3 set", hop),
                    );
                }
            }
        }
    }

    fn check_layer_sizes(&self) {
        if self.layer2.len() > 1 && self.layer2.len() != self.num_layer2 as usize {
            plog(
                LogLevel::Notice,
                &format!(
                    "Wrong number of layer2 guards: {} configured, {} in use",
                    self.num_layer2,
                    self.layer2.len()
                ),
            );
        }
        if self.layer3_in_use && self.layer3.len() > 1 && self.layer3.len() != self.num_layer3 as usize
        {
            plog(
                LogLevel::Notice,
                &format!(
                    "Wrong number of layer3 guards: {} configured, {} in use",
                    self.num_layer3,
                    self.layer3.len()
                ),
            );
        }
    }

    /// Fingerprints currently in the layer-2 set.
    pub fn layer2(&self) -> &HashSet<String> {
        &self.layer2
    }

    /// Fingerprints currently in the layer-3 set.
    pub fn layer3(&self) -> &HashSet<String> {
        &self.layer3
    }
}

fn split_fingerprints(nodes: &str) -> HashSet<String> {
    nodes
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routelen_accounts_for_layer3() {
        let with_l3 = PathVerify::new(4, 8);
        assert_eq!(with_l3.routelen_for_purpose("HS_VANGUARDS"), Some(4));
        assert_eq!(with_l3.routelen_for_purpose("HS_SERVICE_REND"), Some(5));
        assert_eq!(with_l3.routelen_for_purpose("HS_CLIENT_REND"), Some(4));
        assert_eq!(with_l3.routelen_for_purpose("GENERAL"), None);

        let without_l3 = PathVerify::new(4, 0);
        assert_eq!(without_l3.routelen_for_purpose("HS_VANGUARDS"), Some(3));
        assert_eq!(without_l3.routelen_for_purpose("HS_SERVICE_REND"), Some(4));
    }

    #[test]
    fn layers_seed_and_follow_conf_changes() {
        let mut pv = PathVerify::new(2, 2);
        pv.init_layers(Some("AAAA,BBBB"), Some("CCCC,DDDD"));
        assert!(pv.layer2().contains("AAAA"));
        assert!(pv.layer3().contains("DDDD"));

        let mut changed = HashMap::new();
        changed.insert("HSLayer2Nodes".to_string(), vec!["EEEE,FFFF".to_string()]);
        pv.conf_changed_event(&changed);
        assert!(pv.layer2().contains("EEEE"));
        assert!(!pv.layer2().contains("AAAA"));
        assert!(pv.layer3().contains("CCCC"));
    }

    #[test]
    fn orconn_events_track_first_hops() {
        let mut pv = PathVerify::new(2, 2);
        pv.init_conns("$AAAA~guard CONNECTED\n$BBBB~other CONNECTED");
        assert!(pv.layer1_conns.contains("AAAA"));

        pv.orconn_event("AAAA", "CLOSED");
        assert!(!pv.layer1_conns.contains("AAAA"));
        pv.orconn_event("CCCC", "CONNECTED");
        assert!(pv.layer1_conns.contains("CCCC"));
    }
}
