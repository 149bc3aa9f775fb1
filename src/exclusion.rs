//! Resolution of Tor's `ExcludeNodes` configuration into a relay predicate.
//!
//! Two configuration strings are read from Tor: `ExcludeNodes` itself and
//! `GeoIPExcludeUnknown` (`0`, `1`, or `auto`). The exclusion list is a
//! comma-separated sequence of tokens, each one of:
//!
//! | Token | Example |
//! |-------|---------|
//! | fingerprint, `$`-optional, `~nick`/`=nick` suffix ignored | `$AABB…EEFF~relay` |
//! | bare nickname | `BadRelay` |
//! | IPv4/IPv6 literal | `192.0.2.7` |
//! | CIDR or dotted netmask | `192.0.2.0/24`, `192.0.2.0/255.255.255.0` |
//! | country code | `{us}` |
//!
//! Fingerprint, nickname, and network rules are static. Country rules need
//! the overlay's GeoIP database, queried per address with
//! `GETINFO ip-to-country/<addr>`; when Tor reports that no IPv4 GeoIP data
//! is available, countries are unresolvable and every relay resolves to
//! the unknown country `??`, which the `GeoIPExcludeUnknown` setting then
//! admits or excludes.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use ipnetwork::{IpNetwork, Ipv4Network};
use stem_rs::controller::Controller;
use stem_rs::descriptor::router_status::RouterStatusEntry;

use crate::config::LogLevel;
use crate::logger::plog;
use crate::sampler::{is_valid_country_code, is_valid_fingerprint};

/// Country code Tor reports for addresses it cannot resolve.
pub const UNKNOWN_COUNTRY: &str = "??";

/// Parsed `ExcludeNodes` rules.
#[derive(Debug, Clone, Default)]
pub struct ExcludeNodes {
    /// Excluded networks, in CIDR form.
    pub networks: Vec<IpNetwork>,
    /// Excluded fingerprints, uppercase.
    pub fingerprints: HashSet<String>,
    /// Excluded nicknames, verbatim.
    pub nicknames: HashSet<String>,
    /// Excluded countries, lowercase.
    pub countries: HashSet<String>,
    /// The raw `GeoIPExcludeUnknown` setting.
    pub exclude_unknowns: Option<String>,
}

impl ExcludeNodes {
    /// Parses the two configuration strings.
    ///
    /// `GeoIPExcludeUnknown=1` always adds the unknown countries `??` and
    /// `a1`; `auto` adds them only when at least one real country is
    /// excluded.
    pub fn parse(conf_line: &str, exclude_unknowns: Option<&str>) -> Self {
        let mut rules = Self {
            exclude_unknowns: exclude_unknowns.map(|s| s.to_string()),
            ..Self::default()
        };

        if exclude_unknowns == Some("1") {
            rules.countries.insert("??".to_string());
            rules.countries.insert("a1".to_string());
        }

        for token in conf_line.split(',') {
            rules.parse_token(token.trim());
        }

        if rules.exclude_unknowns.as_deref() == Some("auto") && !rules.countries.is_empty() {
            rules.countries.insert("??".to_string());
            rules.countries.insert("a1".to_string());
        }

        rules
    }

    fn parse_token(&mut self, token: &str) {
        if token.is_empty() {
            return;
        }

        let mut t = token.strip_prefix('$').unwrap_or(token);
        if let Some(idx) = t.find(['~', '=']) {
            t = &t[..idx];
        }

        if is_valid_fingerprint(t) {
            self.fingerprints.insert(t.to_uppercase());
        } else if t.starts_with('{') && t.ends_with('}') && t.len() >= 3 {
            let cc = &t[1..t.len() - 1];
            if is_valid_country_code(cc) {
                self.countries.insert(cc.to_lowercase());
            }
        } else if t.contains(':') || t.contains('.') {
            if let Some(net) = parse_network(t) {
                self.networks.push(net);
            }
        } else {
            self.nicknames.insert(t.to_string());
        }
    }

    /// Returns true when any rule is configured.
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
            && self.fingerprints.is_empty()
            && self.nicknames.is_empty()
            && self.countries.is_empty()
    }

    /// Returns true when matching needs GeoIP lookups.
    pub fn wants_countries(&self) -> bool {
        !self.countries.is_empty()
    }

    /// Checks the rules that need no GeoIP data.
    pub fn matches_static(&self, relay: &RouterStatusEntry) -> bool {
        if self.fingerprints.contains(&relay.fingerprint.to_uppercase()) {
            return true;
        }
        if self.nicknames.contains(&relay.nickname) {
            return true;
        }
        let mut addrs = vec![relay.address];
        addrs.extend(relay.or_addresses.iter().map(|(a, _, _)| *a));
        addrs
            .iter()
            .any(|a| self.networks.iter().any(|n| n.contains(*a)))
    }

    /// Checks the country rules against a resolved country code.
    pub fn matches_country(&self, country: &str) -> bool {
        self.countries.contains(&country.to_lowercase())
    }
}

/// Parses a CIDR, dotted-netmask network, or bare address.
fn parse_network(s: &str) -> Option<IpNetwork> {
    if let Ok(net) = s.parse::<IpNetwork>() {
        return Some(net);
    }
    // Dotted netmask: addr/255.255.255.0
    if let Some((addr, mask)) = s.split_once('/') {
        if let (Ok(addr), Ok(mask)) = (addr.parse(), mask.parse()) {
            return Ipv4Network::with_netmask(addr, mask).ok().map(IpNetwork::V4);
        }
    }
    // Bare address becomes a host network.
    match s.parse::<IpAddr>() {
        Ok(IpAddr::V4(a)) => format!("{}/32", a).parse().ok(),
        Ok(IpAddr::V6(a)) => format!("{}/128", a).parse().ok(),
        Err(_) => None,
    }
}

/// A per-consensus exclusion predicate with a country cache.
///
/// Country lookups go through the controller lazily, one `GETINFO` per
/// distinct address, so only relays that actually get inspected (current
/// layer members and sampler candidates) cost a round trip.
pub struct ExclusionResolver<'c> {
    rules: ExcludeNodes,
    controller: Option<&'c mut Controller>,
    geoip_ready: bool,
    country_cache: HashMap<IpAddr, String>,
}

impl<'c> ExclusionResolver<'c> {
    /// Builds a resolver. When the rules name countries, probes the
    /// overlay once for `ip-to-country/ipv4-available`.
    pub async fn new(rules: ExcludeNodes, mut controller: Option<&'c mut Controller>) -> Self {
        let mut geoip_ready = false;
        if rules.wants_countries() {
            if let Some(ctrl) = controller.as_deref_mut() {
                geoip_ready = ctrl
                    .get_info("ip-to-country/ipv4-available")
                    .await
                    .map(|v| v.trim() == "1")
                    .unwrap_or(false);
            }
            if !geoip_ready {
                plog(
                    LogLevel::Notice,
                    "Tor has no GeoIP data; excluded countries resolve as unknown",
                );
            }
        }
        Self {
            rules,
            controller,
            geoip_ready,
            country_cache: HashMap::new(),
        }
    }

    /// Builds a resolver with no controller. Countries are unresolvable
    /// and report as unknown.
    pub fn offline(rules: ExcludeNodes) -> Self {
        Self {
            rules,
            controller: None,
            geoip_ready: false,
            country_cache: HashMap::new(),
        }
    }

    /// The parsed rules backing this resolver.
    pub fn rules(&self) -> &ExcludeNodes {
        &self.rules
    }

    /// Returns true when the relay matches any exclusion rule.
    pub async fn is_excluded(&mut self, relay: &RouterStatusEntry) -> bool {
        if self.rules.matches_static(relay) {
            return true;
        }
        if !self.rules.wants_countries() {
            return false;
        }
        let country = self.country_of(relay.address).await;
        self.rules.matches_country(&country)
    }

    async fn country_of(&mut self, addr: IpAddr) -> String {
        if let Some(cc) = self.country_cache.get(&addr) {
            return cc.clone();
        }
        let cc = match (self.geoip_ready, self.controller.as_deref_mut()) {
            (true, Some(ctrl)) => ctrl
                .get_info(&format!("ip-to-country/{}", addr))
                .await
                .map(|v| v.trim().to_lowercase())
                .unwrap_or_else(|_| UNKNOWN_COUNTRY.to_string()),
            _ => UNKNOWN_COUNTRY.to_string(),
        };
        self.country_cache.insert(addr, cc.clone());
        cc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stem_rs::descriptor::router_status::RouterStatusEntryType;

    fn relay(fingerprint: &str, nickname: &str, address: &str) -> RouterStatusEntry {
        RouterStatusEntry::new(
            RouterStatusEntryType::V3,
            nickname.to_string(),
            fingerprint.to_string(),
            Utc::now(),
            address.parse().unwrap(),
            9001,
        )
    }

    #[test]
    fn parses_fingerprints_in_all_spellings() {
        let fp = "AABBCCDD00112233445566778899AABBCCDDEEFF";
        for token in [
            format!("${}", fp),
            fp.to_string(),
            format!("${}~nick", fp),
            format!("{}=nick", fp),
            format!("  ${}  ", fp.to_lowercase()),
        ] {
            let rules = ExcludeNodes::parse(&token, None);
            assert!(rules.fingerprints.contains(fp), "token {:?}", token);
            assert!(rules.nicknames.is_empty());
        }
    }

    #[test]
    fn parses_countries_case_insensitively() {
        let rules = ExcludeNodes::parse("{Us},{de}", None);
        assert!(rules.countries.contains("us"));
        assert!(rules.countries.contains("de"));
    }

    #[test]
    fn parses_networks_and_addresses() {
        let rules = ExcludeNodes::parse("192.0.2.0/24,198.51.100.7,2001:db8::/32", None);
        assert_eq!(rules.networks.len(), 3);

        let netmask = ExcludeNodes::parse("192.0.2.0/255.255.255.0", None);
        assert_eq!(netmask.networks.len(), 1);
        assert!(netmask.networks[0].contains("192.0.2.77".parse().unwrap()));
        assert!(!netmask.networks[0].contains("192.0.3.1".parse().unwrap()));
    }

    #[test]
    fn parses_nicknames() {
        let rules = ExcludeNodes::parse("BadRelay,{us},OtherRelay", None);
        assert!(rules.nicknames.contains("BadRelay"));
        assert!(rules.nicknames.contains("OtherRelay"));
        assert_eq!(rules.nicknames.len(), 2);
    }

    #[test]
    fn geoip_exclude_unknown_one_always_adds_unknowns() {
        let rules = ExcludeNodes::parse("", Some("1"));
        assert!(rules.countries.contains("??"));
        assert!(rules.countries.contains("a1"));
    }

    #[test]
    fn geoip_exclude_unknown_auto_needs_a_country() {
        let with_country = ExcludeNodes::parse("{us}", Some("auto"));
        assert!(with_country.countries.contains("??"));

        let without = ExcludeNodes::parse("BadRelay", Some("auto"));
        assert!(!without.countries.contains("??"));
    }

    #[test]
    fn static_matching_by_each_rule_kind() {
        let fp = "AABBCCDD00112233445566778899AABBCCDDEEFF";
        let rules = ExcludeNodes::parse(&format!("${},BadRelay,192.0.2.0/24", fp), None);

        assert!(rules.matches_static(&relay(fp, "x", "198.51.100.1")));
        assert!(rules.matches_static(&relay(&"B".repeat(40), "BadRelay", "198.51.100.1")));
        assert!(rules.matches_static(&relay(&"C".repeat(40), "x", "192.0.2.200")));
        assert!(!rules.matches_static(&relay(&"D".repeat(40), "x", "198.51.100.1")));
    }

    #[test]
    fn fingerprint_matching_is_case_insensitive() {
        let fp = "aabbccdd00112233445566778899aabbccddeeff";
        let rules = ExcludeNodes::parse(fp, None);
        assert!(rules.matches_static(&relay(&fp.to_uppercase(), "x", "198.51.100.1")));
    }

    #[test]
    fn empty_rules_match_nothing() {
        let rules = ExcludeNodes::parse("", None);
        assert!(rules.is_empty());
        assert!(!rules.matches_static(&relay(&"A".repeat(40), "x", "198.51.100.1")));
    }

    #[tokio::test]
    async fn offline_resolver_treats_countries_as_unknown() {
        // With GeoIP unavailable and unknowns excluded, the country rules
        // swallow every relay; with unknowns admitted, none.
        let excluding = ExcludeNodes::parse("{us}", Some("1"));
        let mut resolver = ExclusionResolver::offline(excluding);
        assert!(resolver.is_excluded(&relay(&"A".repeat(40), "x", "198.51.100.1")).await);

        let admitting = ExcludeNodes::parse("{us}", Some("0"));
        let mut resolver = ExclusionResolver::offline(admitting);
        assert!(!resolver.is_excluded(&relay(&"A".repeat(40), "x", "198.51.100.1")).await);
    }

    #[tokio::test]
    async fn offline_resolver_still_applies_static_rules() {
        let rules = ExcludeNodes::parse("192.0.2.0/24", Some("auto"));
        let mut resolver = ExclusionResolver::offline(rules);
        assert!(resolver.is_excluded(&relay(&"A".repeat(40), "x", "192.0.2.9")).await);
        assert!(!resolver.is_excluded(&relay(&"B".repeat(40), "x", "198.51.100.1")).await);
    }
}
