//! Circuit and connection tracking with bandwidth side-channel policy.
//!
//! An adversary on a circuit can inject cells that Tor silently drops, or
//! inflate a circuit's traffic, to create a timing signal observable from
//! the guard or from netflow records. This module keeps per-circuit byte
//! and cell accounting from `CIRC_BW` events and decides when a circuit
//! has to go:
//!
//! | Check | Trigger | Severity |
//! |-------|---------|----------|
//! | Dropped cells | received bytes never delivered, beyond the sendme allowance | WARN (service) / NOTICE (client) |
//! | Total bytes | read+written over `circ_max_megabytes` | NOTICE |
//! | HSDIR fetch size | descriptor circuit over `circ_max_hsdesc_kilobytes` | WARN |
//! | Age | older than `circ_max_age_hours`, checked on the 1 Hz `BW` tick | NOTICE |
//!
//! Every limit disables its check when set to 0, without affecting the
//! others. Only hidden-service circuits are enforced.
//!
//! The same data feeds two liveness signals: a heartbeat that warns when
//! all guard connections (or all circuit building) stalls, and a
//! correlation between a guard TLS connection closing and circuits on
//! that guard being destroyed moments later, which is how an attacking
//! guard sheds circuits it has finished measuring.
//!
//! This module makes no control-port calls and emits no log lines; it
//! returns verdicts for the dispatcher to act on.
//!
//! # Cell accounting
//!
//! `CIRC_BW` reports raw cell bytes (`read`/`written`, multiples of 509)
//! and application bytes (`DELIVERED_*`, `OVERHEAD_*`, in relay-payload
//! units of 498). Raw counts are scaled by `498/509` so both sides are in
//! payload bytes:
//!
//! ```text
//! dropped = read·(498/509) − (delivered_read + overhead_read)
//! ```
//!
//! At stream teardown up to `WINDOW/INCREMENT = 10` flow-control cells
//! can legitimately be in flight and arrive after Tor stopped counting
//! them as overhead, so an allowance of
//! `(1 + min(cells_sent/50, 10)) × 509` bytes is subtracted before the
//! dropped rate is computed.

use std::collections::HashMap;

use crate::config::BandguardsConfig;

/// Bytes in a cell payload.
pub const CELL_PAYLOAD_SIZE: u64 = 509;
/// Bytes of relay header inside a cell payload.
pub const RELAY_HEADER_SIZE: u64 = 11;
/// Fraction of a cell that carries relay payload.
pub const CELL_DATA_RATE: f64 =
    (CELL_PAYLOAD_SIZE - RELAY_HEADER_SIZE) as f64 / CELL_PAYLOAD_SIZE as f64;

/// Cells acknowledged by one stream-level sendme.
const SENDME_INCREMENT_CELLS: f64 = 50.0;
/// Stream flow-control window, in cells.
const SENDME_WINDOW_CELLS: f64 = 500.0;

/// Maximum lag between a guard connection closing and the destroy of a
/// circuit it carried for the two to be treated as correlated.
pub const MAX_CIRC_DESTROY_LAG_SECS: f64 = 2.0;

const SECS_PER_HOUR: f64 = 3600.0;
const BYTES_PER_KB: f64 = 1024.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Per-circuit accounting record.
#[derive(Debug, Clone, PartialEq)]
pub struct CircStat {
    /// Circuit id from the control protocol.
    pub id: String,
    /// Hidden-service circuit. Only these are enforced.
    pub is_hs: bool,
    /// Service side (as opposed to client side).
    pub is_service: bool,
    /// Hidden-service-directory circuit.
    pub is_hsdir: bool,
    /// Carrying application traffic for a hidden service.
    pub in_use: bool,
    /// Has reached BUILT or GUARD_WAIT.
    pub built: bool,
    /// Last seen purpose tag.
    pub purpose: Option<String>,
    /// Last seen HS_STATE tag.
    pub hs_state: Option<String>,
    /// Event time the circuit was first seen.
    pub created_at: f64,
    /// Payload-scaled bytes received.
    pub read_bytes: f64,
    /// Payload-scaled bytes sent.
    pub sent_bytes: f64,
    /// Application bytes delivered inbound.
    pub delivered_read: u64,
    /// Application bytes delivered outbound.
    pub delivered_sent: u64,
    /// Protocol overhead bytes inbound.
    pub overhead_read: u64,
    /// Protocol overhead bytes outbound.
    pub overhead_sent: u64,
    /// First hop, once the circuit is in use.
    pub guard_fp: Option<String>,
    /// Set when this circuit's guard connection closed under it.
    pub possibly_destroyed_at: Option<f64>,
}

impl CircStat {
    fn new(id: &str, created_at: f64) -> Self {
        Self {
            id: id.to_string(),
            is_hs: true,
            is_service: true,
            is_hsdir: false,
            in_use: false,
            built: false,
            purpose: None,
            hs_state: None,
            created_at,
            read_bytes: 0.0,
            sent_bytes: 0.0,
            delivered_read: 0,
            delivered_sent: 0,
            overhead_read: 0,
            overhead_sent: 0,
            guard_fp: None,
            possibly_destroyed_at: None,
        }
    }

    /// Read plus written payload-scaled bytes.
    pub fn total_bytes(&self) -> f64 {
        self.read_bytes + self.sent_bytes
    }

    /// Received bytes not accounted for by delivery or overhead.
    pub fn dropped_read_bytes(&self) -> f64 {
        self.read_bytes - (self.delivered_read + self.overhead_read) as f64
    }

    /// Bytes of in-flight flow-control cells the circuit is entitled to
    /// at stream teardown.
    pub fn sendme_allowance_bytes(&self) -> f64 {
        let cells_sent = self.sent_bytes / CELL_PAYLOAD_SIZE as f64;
        let in_flight =
            (cells_sent / SENDME_INCREMENT_CELLS).min(SENDME_WINDOW_CELLS / SENDME_INCREMENT_CELLS);
        (1.0 + in_flight) * CELL_PAYLOAD_SIZE as f64
    }

    /// Dropped bytes beyond the sendme allowance.
    pub fn dropped_read_excess(&self) -> f64 {
        let allowance = self.sendme_allowance_bytes();
        self.dropped_read_bytes().max(allowance) - allowance
    }

    /// Excess dropped bytes as a fraction of everything received.
    pub fn dropped_read_rate(&self) -> f64 {
        if self.read_bytes <= 0.0 {
            return 0.0;
        }
        self.dropped_read_excess() / self.read_bytes
    }

    fn age_secs(&self, now: f64) -> f64 {
        now - self.created_at
    }

    fn apply_purpose(&mut self, purpose: &str) {
        if purpose.starts_with("HS_CLIENT") {
            self.is_service = false;
        } else if purpose.starts_with("HS_SERVICE") {
            self.is_service = true;
        }
        if purpose.ends_with("_HSDIR") {
            self.is_hsdir = true;
        }
    }
}

/// Per-first-hop relay statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuardStat {
    /// Relay fingerprint.
    pub fingerprint: String,
    /// Connections that closed and took live circuits with them.
    pub killed_conns: u32,
    /// Time of the most recent suspicious connection close.
    pub killed_conn_at: f64,
    /// Connections established to this guard.
    pub conns_made: u32,
    /// Connection close reasons and counts.
    pub close_reasons: HashMap<String, u32>,
}

impl GuardStat {
    fn new(fingerprint: &str) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            ..Self::default()
        }
    }
}

/// Outcome of one `CIRC_BW` event.
#[derive(Debug, Clone, PartialEq)]
pub enum CircBwOutcome {
    /// Circuit unknown, nothing tracked (also returned once disabled).
    Untracked,
    /// Counters updated. The breach flags report the per-event sanity
    /// check `delivered + overhead ≤ raw × 498/509` failing, which is a
    /// Tor accounting bug and not a close condition.
    Updated {
        /// Inbound accounting breached.
        read_breach: bool,
        /// Outbound accounting breached.
        write_breach: bool,
    },
    /// The event had no `DELIVERED_*`/`OVERHEAD_*` fields (Tor too old);
    /// the guard just disabled itself.
    DisabledNow,
}

/// A limit verdict for one circuit.
#[derive(Debug, Clone, PartialEq)]
pub enum LimitVerdict {
    /// Within limits.
    Ok,
    /// Dropped cells beyond the allowance.
    DroppedCells {
        /// Excess dropped fraction, of bytes received.
        rate: f64,
        /// Total dropped bytes.
        dropped_bytes: f64,
        /// Service-side circuit (drives severity).
        service: bool,
    },
    /// Total traffic over the configured cap.
    MaxBytes {
        /// Current total bytes.
        bytes: f64,
        /// Configured cap in bytes.
        limit: f64,
    },
    /// Descriptor circuit over the HSDIR cap.
    HsdescBytes {
        /// Current total bytes.
        bytes: f64,
        /// Configured cap in bytes.
        limit: f64,
    },
}

/// A confirmed guard-connection/circuit-destroy correlation.
#[derive(Debug, Clone, PartialEq)]
pub struct DestroyCorrelation {
    /// The guard whose connection died.
    pub guard_fp: String,
    /// The destroyed circuit.
    pub circ_id: String,
    /// Total correlated kills now attributed to this guard.
    pub killed_conns: u32,
}

/// Liveness warning raised by the heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub enum LivenessWarning {
    /// No guard connection for this many seconds.
    NoConnections {
        /// Seconds without any connection.
        secs: u64,
    },
    /// Circuits have been failing for this many seconds.
    CircuitsFailing {
        /// Seconds since building started failing.
        secs: u64,
        /// Seconds Tor has reported the network down, when known.
        network_down_secs: Option<u64>,
    },
}

/// Result of one `BW` tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Circuits past the age limit, with their age in seconds.
    pub aged: Vec<(String, f64)>,
    /// Liveness warning due this tick, if any.
    pub warning: Option<LivenessWarning>,
}

impl TickReport {
    fn default_with_warning(warning: Option<LivenessWarning>) -> Self {
        Self {
            aged: Vec::new(),
            warning,
        }
    }
}

/// Tracker for circuits, guard connections, and the policies over them.
#[derive(Debug, Clone)]
pub struct BandwidthGuard {
    /// Tracked circuits by id.
    pub circs: HashMap<String, CircStat>,
    /// Live guard connections: connection id to guard fingerprint.
    live_conns: HashMap<String, String>,
    /// Per-guard statistics by fingerprint.
    pub guards: HashMap<String, GuardStat>,
    /// Circuits confirmed destroyed by a guard connection close.
    pub circs_destroyed_total: u64,
    no_conns_since: Option<f64>,
    no_circs_since: Option<f64>,
    network_down_since: Option<f64>,
    /// Highest placeholder id synthesized from the startup snapshot.
    max_fake_id: i64,
    warned_no_conns: bool,
    warned_no_circs: bool,
    enabled: bool,
}

impl BandwidthGuard {
    /// Creates a tracker. Until a connection is seen, the process counts
    /// as disconnected since `started_at`.
    pub fn new(started_at: f64) -> Self {
        Self {
            circs: HashMap::new(),
            live_conns: HashMap::new(),
            guards: HashMap::new(),
            circs_destroyed_total: 0,
            no_conns_since: Some(started_at),
            no_circs_since: None,
            network_down_since: None,
            max_fake_id: -1,
            warned_no_conns: false,
            warned_no_circs: false,
            enabled: true,
        }
    }

    /// Whether `CIRC_BW` enforcement is still active.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Number of live guard connections.
    pub fn live_conn_count(&self) -> usize {
        self.live_conns.len()
    }

    /// Seeds connection state from a `GETINFO orconn-status` snapshot.
    ///
    /// The snapshot names endpoints but not connection ids, so each line
    /// gets a synthesized monotonic id. A later `CLOSED`/`FAILED` event
    /// that names an unknown id is reconciled against these placeholders
    /// by endpoint fingerprint.
    pub fn init_from_orconn_status(&mut self, snapshot: &str) {
        self.live_conns.clear();
        self.max_fake_id = -1;
        for (i, line) in snapshot.lines().filter(|l| !l.is_empty()).enumerate() {
            let mut parts = line.split_whitespace();
            let target = parts.next().unwrap_or("");
            let status = parts.next().unwrap_or("");
            let fp = guard_fp_from_target(target);
            if fp.is_empty() {
                continue;
            }
            self.guards
                .entry(fp.to_string())
                .or_insert_with(|| GuardStat::new(fp));
            if status == "CONNECTED" {
                self.live_conns.insert(i.to_string(), fp.to_string());
            }
            self.max_fake_id = i as i64;
        }
        if !self.live_conns.is_empty() {
            self.no_conns_since = None;
        }
    }

    /// Handles an `ORCONN` event.
    pub fn orconn_event(
        &mut self,
        conn_id: &str,
        target: &str,
        status: &str,
        reason: Option<&str>,
        arrived_at: f64,
    ) {
        let fp = guard_fp_from_target(target).to_string();
        if fp.is_empty() {
            return;
        }
        self.guards
            .entry(fp.clone())
            .or_insert_with(|| GuardStat::new(&fp));

        match status {
            "CONNECTED" => {
                self.warned_no_conns = false;
                self.live_conns.insert(conn_id.to_string(), fp.clone());
                if let Some(guard) = self.guards.get_mut(&fp) {
                    guard.conns_made += 1;
                }
                self.no_conns_since = None;
            }
            "CLOSED" | "FAILED" => {
                let conn_id = self.reconcile_conn_id(conn_id, &fp);
                if self.live_conns.remove(&conn_id).is_some() {
                    for circ in self.circs.values_mut() {
                        if circ.in_use && circ.guard_fp.as_deref() == Some(fp.as_str()) {
                            circ.possibly_destroyed_at = Some(arrived_at);
                            if let Some(guard) = self.guards.get_mut(&fp) {
                                guard.killed_conn_at = arrived_at;
                            }
                        }
                    }
                    if self.live_conns.is_empty() && self.no_conns_since.is_none() {
                        self.no_conns_since = Some(arrived_at);
                    }
                }
                if status == "CLOSED" {
                    if let (Some(reason), Some(guard)) = (reason, self.guards.get_mut(&fp)) {
                        *guard.close_reasons.entry(reason.to_string()).or_insert(0) += 1;
                    }
                }
            }
            _ => {}
        }
    }

    /// Maps an id the event stream never announced back onto a startup
    /// placeholder carrying the same endpoint.
    fn reconcile_conn_id(&self, conn_id: &str, fp: &str) -> String {
        if self.live_conns.contains_key(conn_id) {
            return conn_id.to_string();
        }
        for (candidate, guard) in &self.live_conns {
            if guard == fp
                && candidate
                    .parse::<i64>()
                    .map(|id| id <= self.max_fake_id)
                    .unwrap_or(false)
            {
                return candidate.clone();
            }
        }
        conn_id.to_string()
    }

    /// Handles a `CIRC` event. Returns a correlation record when a
    /// terminal event confirms a guard-connection kill.
    #[allow(clippy::too_many_arguments)]
    pub fn circ_event(
        &mut self,
        circ_id: &str,
        status: &str,
        purpose: &str,
        hs_state: Option<&str>,
        path: &[String],
        reason: Option<&str>,
        remote_reason: Option<&str>,
        arrived_at: f64,
    ) -> Option<DestroyCorrelation> {
        if status == "FAILED"
            && self.no_circs_since.is_none()
            && self.any_circuits_pending(Some(circ_id))
        {
            self.no_circs_since = Some(arrived_at);
        }

        if status == "FAILED" || status == "CLOSED" {
            // Duplicate terminal events find nothing to remove.
            let circ = self.circs.remove(circ_id)?;
            if circ.in_use
                && reason == Some("DESTROYED")
                && remote_reason == Some("CHANNEL_CLOSED")
            {
                if let (Some(destroyed_at), Some(fp)) =
                    (circ.possibly_destroyed_at, circ.guard_fp.as_ref())
                {
                    if arrived_at - destroyed_at <= MAX_CIRC_DESTROY_LAG_SECS {
                        let guard = self
                            .guards
                            .entry(fp.clone())
                            .or_insert_with(|| GuardStat::new(fp));
                        guard.killed_conn_at = 0.0;
                        guard.killed_conns += 1;
                        self.circs_destroyed_total += 1;
                        return Some(DestroyCorrelation {
                            guard_fp: fp.clone(),
                            circ_id: circ_id.to_string(),
                            killed_conns: guard.killed_conns,
                        });
                    }
                }
            }
            return None;
        }

        let is_hs = hs_state.is_some() || purpose.starts_with("HS");
        if is_hs && !self.circs.contains_key(circ_id) {
            self.circs
                .insert(circ_id.to_string(), CircStat::new(circ_id, arrived_at));
        }

        if let Some(circ) = self.circs.get_mut(circ_id) {
            circ.purpose = Some(purpose.to_string());
            circ.hs_state = hs_state.map(|s| s.to_string());
            circ.apply_purpose(purpose);

            match status {
                "BUILT" | "GUARD_WAIT" => {
                    circ.built = true;
                    if purpose.starts_with("HS_CLIENT") || purpose.starts_with("HS_SERVICE") {
                        circ.in_use = true;
                        if let Some(first) = path.first() {
                            circ.guard_fp = Some(first.clone());
                        }
                    }
                    self.circuit_progress();
                }
                "EXTENDED" => self.circuit_progress(),
                _ => {}
            }
        }
        None
    }

    /// Handles a `CIRC_MINOR` event (purpose changes and cannibalization).
    pub fn circ_minor_event(
        &mut self,
        circ_id: &str,
        kind: &str,
        purpose: &str,
        hs_state: Option<&str>,
        old_purpose: Option<&str>,
        path: &[String],
    ) {
        if let Some(circ) = self.circs.get_mut(circ_id) {
            circ.purpose = Some(purpose.to_string());
            circ.hs_state = hs_state.map(|s| s.to_string());
            circ.apply_purpose(purpose);

            if kind == "PURPOSE_CHANGED" && old_purpose == Some("HS_VANGUARDS") {
                circ.in_use = true;
                if let Some(first) = path.first() {
                    circ.guard_fp = Some(first.clone());
                }
            }
        }
    }

    /// Accumulates one `CIRC_BW` event.
    #[allow(clippy::too_many_arguments)]
    pub fn circbw_event(
        &mut self,
        circ_id: &str,
        read: u64,
        written: u64,
        delivered_read: Option<u64>,
        delivered_written: Option<u64>,
        overhead_read: Option<u64>,
        overhead_written: Option<u64>,
    ) -> CircBwOutcome {
        if !self.enabled {
            return CircBwOutcome::Untracked;
        }
        let (Some(dr), Some(dw), Some(or_), Some(ow)) = (
            delivered_read,
            delivered_written,
            overhead_read,
            overhead_written,
        ) else {
            self.enabled = false;
            return CircBwOutcome::DisabledNow;
        };

        self.circuit_progress();

        let Some(circ) = self.circs.get_mut(circ_id) else {
            return CircBwOutcome::Untracked;
        };

        let read_scaled = read as f64 * CELL_DATA_RATE;
        let written_scaled = written as f64 * CELL_DATA_RATE;
        let read_breach = (dr + or_) as f64 > read_scaled;
        let write_breach = (dw + ow) as f64 > written_scaled;

        circ.read_bytes += read_scaled;
        circ.sent_bytes += written_scaled;
        circ.delivered_read += dr;
        circ.delivered_sent += dw;
        circ.overhead_read += or_;
        circ.overhead_sent += ow;

        CircBwOutcome::Updated {
            read_breach,
            write_breach,
        }
    }

    /// Applies the byte-limit taxonomy to one circuit.
    pub fn check_limits(&self, circ_id: &str, config: &BandguardsConfig) -> LimitVerdict {
        let Some(circ) = self.circs.get(circ_id) else {
            return LimitVerdict::Ok;
        };
        if !circ.is_hs || !self.enabled {
            return LimitVerdict::Ok;
        }

        if circ.read_bytes > 0.0
            && circ.dropped_read_rate() > config.circ_max_dropped_cell_percent / 100.0
        {
            return LimitVerdict::DroppedCells {
                rate: circ.dropped_read_rate(),
                dropped_bytes: circ.dropped_read_bytes(),
                service: circ.is_service,
            };
        }

        if config.circ_max_megabytes > 0 {
            let limit = config.circ_max_megabytes as f64 * BYTES_PER_MB;
            if circ.total_bytes() > limit {
                return LimitVerdict::MaxBytes {
                    bytes: circ.total_bytes(),
                    limit,
                };
            }
        }

        if config.circ_max_hsdesc_kilobytes > 0 && circ.is_hsdir {
            let limit = config.circ_max_hsdesc_kilobytes as f64 * BYTES_PER_KB;
            if circ.total_bytes() > limit {
                return LimitVerdict::HsdescBytes {
                    bytes: circ.total_bytes(),
                    limit,
                };
            }
        }

        LimitVerdict::Ok
    }

    /// The 1 Hz housekeeping tick: age enforcement plus the
    /// connectivity heartbeat.
    ///
    /// Heartbeat warnings repeat while the condition persists, but only
    /// when the disconnected time is a whole multiple of the configured
    /// period, so a 15 s threshold warns at 15 s, 30 s, 45 s and stays
    /// quiet in between.
    pub fn bw_tick(&mut self, now: f64, config: &BandguardsConfig) -> TickReport {
        let mut report = TickReport::default_with_warning(self.check_connectivity(now, config));

        if config.circ_max_age_hours > 0 {
            let max_age = config.circ_max_age_hours as f64 * SECS_PER_HOUR;
            report.aged = self
                .circs
                .iter()
                .filter(|(_, c)| c.age_secs(now) > max_age)
                .map(|(id, c)| (id.clone(), c.age_secs(now)))
                .collect();
        }
        report
    }

    fn check_connectivity(
        &mut self,
        now: f64,
        config: &BandguardsConfig,
    ) -> Option<LivenessWarning> {
        if let Some(since) = self.no_conns_since {
            let secs = (now - since) as u64;
            let period = config.conn_max_disconnected_secs as u64;
            if period > 0 && secs >= period && (!self.warned_no_conns || secs % period == 0) {
                self.warned_no_conns = true;
                return Some(LivenessWarning::NoConnections { secs });
            }
        } else if let Some(since) = self.no_circs_since {
            let secs = (now - since) as u64;
            let period = config.circ_max_disconnected_secs as u64;
            if period > 0
                && secs >= period
                && self.any_circuits_pending(None)
                && (!self.warned_no_circs || secs % period == 0)
            {
                self.warned_no_circs = true;
                return Some(LivenessWarning::CircuitsFailing {
                    secs,
                    network_down_secs: self.network_down_since.map(|t| (now - t) as u64),
                });
            }
        }
        None
    }

    /// Handles a `NETWORK_LIVENESS` event.
    pub fn network_liveness_event(&mut self, status: &str, arrived_at: f64) {
        match status {
            "UP" => {
                self.network_down_since = None;
                self.circuit_progress();
            }
            "DOWN" => self.network_down_since = Some(arrived_at),
            _ => {}
        }
    }

    fn circuit_progress(&mut self) {
        self.warned_no_circs = false;
        self.no_circs_since = None;
    }

    fn any_circuits_pending(&self, except: Option<&str>) -> bool {
        self.circs
            .iter()
            .any(|(id, c)| !c.built && except != Some(id.as_str()))
    }
}

/// Extracts the fingerprint from an `ORCONN` target such as
/// `$FP~nickname` or `$FP=nickname`.
fn guard_fp_from_target(target: &str) -> &str {
    let target = target.strip_prefix('$').unwrap_or(target);
    target.split(['~', '=']).next().unwrap_or("")
}
