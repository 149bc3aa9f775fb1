//! The event dispatcher and consensus loop.
//!
//! One task owns every piece of mutable core state. The stem-rs
//! controller hands it parsed control-port events in strict arrival
//! order, and each event is fully processed, including any circuit
//! closes it provokes, before the next one is read. That single rule
//! gives the ordering guarantees the policies rely on: `CIRC` and
//! `CIRC_BW` for one circuit are serialized, and a consensus update
//! always completes before the next `NEWCONSENSUS` is looked at.
//!
//! ```text
//!  control port ──▶ recv_event ──▶ dispatch ──┬─▶ vanguard state ──▶ SETCONF + state file
//!                                             ├─▶ bandwidth guard ──▶ CLOSECIRCUIT
//!                                             ├─▶ rend counter    ──▶ CLOSECIRCUIT
//!                                             └─▶ path/cbt/log verifiers ──▶ log only
//! ```
//!
//! Connection loss ends the loop. Without a retry budget that is fatal;
//! with one, the loop reconnects, re-reads `orconn-status`, and resumes.

use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use stem_rs::controller::{CircuitId, Controller};
use stem_rs::descriptor::router_status::RouterStatusEntry;
use stem_rs::events::ParsedEvent;
use stem_rs::version::Version;
use stem_rs::EventType;

use crate::bandguard::{BandwidthGuard, CircBwOutcome, LimitVerdict, LivenessWarning};
use crate::cbtverify::TimeoutStats;
use crate::config::{Config, LogLevel};
use crate::error::{Error, Result};
use crate::exclusion::{ExcludeNodes, ExclusionResolver};
use crate::logger::plog;
use crate::logguard::LogGuard;
use crate::pathverify::PathVerify;
use crate::rendguard::{RendGuard, RendVerdict};
use crate::state;
use crate::vanguards::{unix_now, VanguardState};

/// Version string reported in the startup banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// When false, policy violations are logged but nothing is closed.
static CLOSE_CIRCUITS: AtomicBool = AtomicBool::new(true);

/// Sets the global close-circuits switch.
pub fn set_close_circuits(value: bool) {
    CLOSE_CIRCUITS.store(value, Ordering::SeqCst);
}

/// Reads the global close-circuits switch.
pub fn get_close_circuits() -> bool {
    CLOSE_CIRCUITS.load(Ordering::SeqCst)
}

/// Authenticates against the control port and prints the banner.
///
/// stem-rs negotiates the strongest available method (cookie before
/// password before open port). When Tor demands a password we do not
/// have, the operator is prompted once on the terminal.
pub async fn authenticate_any(controller: &mut Controller, password: Option<&str>) -> Result<()> {
    match controller.authenticate(password).await {
        Ok(()) => {}
        Err(stem_rs::Error::Authentication(stem_rs::AuthError::MissingPassword)) => {
            let passwd = prompt_password()?;
            controller.authenticate(Some(&passwd)).await?;
        }
        Err(e) => return Err(Error::Control(e)),
    }
    let version = controller.get_version().await?;
    plog(
        LogLevel::Notice,
        &format!("vigil {} connected to Tor {}", VERSION, version),
    );
    Ok(())
}

fn prompt_password() -> Result<String> {
    eprint!("Controller password: ");
    let mut password = String::new();
    std::io::stdin().read_line(&mut password)?;
    Ok(password.trim().to_string())
}

/// Parses the `bandwidth-weights` line of a cached consensus document.
pub fn get_consensus_weights(consensus_path: &Path) -> Result<HashMap<String, i64>> {
    let file = std::fs::File::open(consensus_path).map_err(|e| {
        Error::Consensus(format!("cannot read {}: {}", consensus_path.display(), e))
    })?;
    let reader = std::io::BufReader::new(file);

    let mut weights = HashMap::new();
    for line in reader.lines() {
        let line = line.map_err(|e| Error::Consensus(format!("read error: {}", e)))?;
        if let Some(rest) = line.strip_prefix("bandwidth-weights ") {
            for part in rest.split_whitespace() {
                if let Some((key, value)) = part.split_once('=') {
                    if let Ok(v) = value.parse::<i64>() {
                        weights.insert(key.to_string(), v);
                    }
                }
            }
            break;
        }
    }

    if weights.is_empty() {
        return Err(Error::Consensus(
            "no bandwidth-weights found in consensus".to_string(),
        ));
    }
    Ok(weights)
}

/// Fetches and parses the full relay directory via `GETINFO ns/all`.
async fn get_network_statuses(controller: &mut Controller) -> Result<Vec<RouterStatusEntry>> {
    let response = controller
        .get_info("ns/all")
        .await
        .map_err(|e| Error::DescriptorUnavailable(format!("cannot get network statuses: {}", e)))?;
    parse_network_statuses(&response)
}

/// Parses `r`/`s`/`w` lines from a `GETINFO ns/all` response.
fn parse_network_statuses(response: &str) -> Result<Vec<RouterStatusEntry>> {
    use chrono::Utc;
    use stem_rs::descriptor::router_status::RouterStatusEntryType;

    let mut relays = Vec::new();
    let mut current: Option<RouterStatusEntry> = None;

    for line in response.lines() {
        if line.starts_with("r ") {
            if let Some(relay) = current.take() {
                relays.push(relay);
            }
            // r nickname identity digest published-date published-time IP ORPort DirPort
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 8 {
                let nickname = parts[1].to_string();
                let fingerprint = decode_base64_fingerprint(parts[2]);
                let address = parts[5]
                    .parse()
                    .unwrap_or_else(|_| "0.0.0.0".parse().unwrap());
                let or_port = parts[6].parse().unwrap_or(9001);
                current = Some(RouterStatusEntry::new(
                    RouterStatusEntryType::V3,
                    nickname,
                    fingerprint,
                    Utc::now(),
                    address,
                    or_port,
                ));
            }
        } else if let Some(flags) = line.strip_prefix("s ") {
            if let Some(ref mut relay) = current {
                relay.flags = flags.split_whitespace().map(|s| s.to_string()).collect();
            }
        } else if let Some(bw) = line.strip_prefix("w ") {
            if let Some(ref mut relay) = current {
                for part in bw.split_whitespace() {
                    if let Some((key, value)) = part.split_once('=') {
                        if let Ok(v) = value.parse::<u64>() {
                            match key {
                                "Bandwidth" => relay.bandwidth = Some(v),
                                "Measured" => relay.measured = Some(v),
                                _ => {}
                            }
                        }
                    }
                }
            }
        }
    }
    if let Some(relay) = current {
        relays.push(relay);
    }
    Ok(relays)
}

/// Decodes the base64 relay identity of an `r` line into uppercase hex.
fn decode_base64_fingerprint(b64: &str) -> String {
    let padded = match b64.len() % 4 {
        2 => format!("{}==", b64),
        3 => format!("{}=", b64),
        _ => b64.to_string(),
    };
    base64_decode(&padded)
        .unwrap_or_default()
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect()
}

fn base64_decode(input: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    let input = input.trim_end_matches('=');
    let mut output = Vec::new();
    let mut buffer = 0u32;
    let mut bits = 0;
    for c in input.bytes() {
        let value = ALPHABET.iter().position(|&x| x == c)? as u32;
        buffer = (buffer << 6) | value;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            output.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }
    Some(output)
}

/// Sends `CLOSECIRCUIT`, dumping buffered overlay logs first.
///
/// Returns false when Tor rejected the close (typically the circuit is
/// already gone); the caller then drops the circuit from its tracker.
pub async fn try_close_circuit(
    controller: &mut Controller,
    circ_id: &str,
    logguard: Option<&mut LogGuard>,
) -> bool {
    if let Some(lg) = logguard {
        lg.dump_log_queue(circ_id, "Pre");
    }
    if !get_close_circuits() {
        return true;
    }
    match controller.close_circuit(&CircuitId::new(circ_id)).await {
        Ok(()) => {
            plog(
                LogLevel::Info,
                &format!("We force-closed circuit {}", circ_id),
            );
            true
        }
        Err(e) => {
            plog(
                LogLevel::Info,
                &format!("Failed to close circuit {}: {}", circ_id, e),
            );
            false
        }
    }
}

/// Pushes the current vanguard configuration into Tor.
///
/// `NumPrimaryGuards` rejection is tolerated (pre-0.3.4 Tor). Rejection
/// of the layer keys means a Tor too old for this design and is fatal.
pub async fn configure_tor(
    controller: &mut Controller,
    state: &VanguardState,
    config: &Config,
) -> Result<()> {
    let vg = &config.vanguards;

    if vg.num_layer1_guards > 0 {
        controller
            .set_conf("NumEntryGuards", &vg.num_layer1_guards.to_string())
            .await?;
        if let Err(e) = controller
            .set_conf("NumPrimaryGuards", &vg.num_layer1_guards.to_string())
            .await
        {
            plog(
                LogLevel::Notice,
                &format!("Tor rejected NumPrimaryGuards (pre-0.3.4 Tor?): {}", e),
            );
        }
    }

    if vg.layer1_lifetime_days > 0 {
        controller
            .set_conf("GuardLifetime", &format!("{} days", vg.layer1_lifetime_days))
            .await?;
    }

    let layer2 = state.layer2_nodes_conf();
    controller
        .set_conf("HSLayer2Nodes", &layer2)
        .await
        .inspect_err(|_| {
            plog(
                LogLevel::Error,
                "Vanguards requires Tor 0.3.3.x (and ideally 0.3.4.x or newer).",
            );
        })?;
    plog(LogLevel::Info, &format!("Layer2 guards: {}", layer2));

    if vg.num_layer3_guards > 0 {
        let layer3 = state.layer3_nodes_conf();
        controller
            .set_conf("HSLayer3Nodes", &layer3)
            .await
            .inspect_err(|_| {
                plog(
                    LogLevel::Error,
                    "Vanguards requires Tor 0.3.3.x (and ideally 0.3.4.x or newer).",
                );
            })?;
        plog(LogLevel::Info, &format!("Layer3 guards: {}", layer3));
    }

    Ok(())
}

/// Runs one full consensus update: directory fetch, exclusion resolve,
/// layer refresh, config push, state write.
///
/// A state-file write failure is fatal; everything the overlay already
/// has would silently diverge from disk otherwise.
pub async fn new_consensus_event(
    controller: &mut Controller,
    state: &mut VanguardState,
    config: &Config,
) -> Result<()> {
    let relays = get_network_statuses(controller).await?;
    if relays.is_empty() {
        return Err(Error::DescriptorUnavailable(
            "empty ns/all response".to_string(),
        ));
    }

    let exclude_conf = controller
        .get_conf("ExcludeNodes")
        .await
        .ok()
        .and_then(|v| v.first().cloned())
        .unwrap_or_default();
    let geoip_unknown = controller
        .get_conf("GeoIPExcludeUnknown")
        .await
        .ok()
        .and_then(|v| v.first().cloned());
    let rules = ExcludeNodes::parse(&exclude_conf, geoip_unknown.as_deref());

    let data_dir = controller
        .get_conf("DataDirectory")
        .await?
        .first()
        .cloned()
        .ok_or_else(|| {
            Error::Config("You must set a DataDirectory location option in your torrc.".to_string())
        })?;
    let consensus_path = Path::new(&data_dir).join("cached-microdesc-consensus");
    let weights = get_consensus_weights(&consensus_path)?;

    {
        let mut resolver = ExclusionResolver::new(rules, Some(controller)).await;
        state
            .update_from_consensus(&relays, &weights, &mut resolver, config)
            .await?;
    }

    if config.global.enable_vanguards {
        configure_tor(controller, state, config).await?;
    }

    state::write_state(&config.global.state_file, state).inspect_err(|e| {
        plog(
            LogLevel::Error,
            &format!(
                "Cannot write state to {}: {}",
                config.global.state_file.display(),
                e
            ),
        );
    })?;

    Ok(())
}

/// All mutable core state, owned by the dispatcher task.
pub struct AppState {
    /// Pinned layers and the rendezvous counter.
    pub vanguard_state: VanguardState,
    /// Circuit/connection tracking and bandwidth policy.
    pub bandguard: BandwidthGuard,
    /// Build-timeout counters.
    pub timeouts: TimeoutStats,
    /// Overlay log buffer, when enabled.
    pub logguard: Option<LogGuard>,
    /// Path verifier, when enabled.
    pub pathverify: Option<PathVerify>,
    /// Read-only policy parameters.
    pub config: Config,
}

impl AppState {
    /// Assembles the dispatcher state around a loaded vanguard state.
    pub fn new(vanguard_state: VanguardState, config: Config) -> Self {
        let logguard = config
            .global
            .enable_logguard
            .then(|| LogGuard::new(&config.logguard));
        let pathverify = config.global.enable_pathverify.then(|| {
            PathVerify::new(
                config.vanguards.num_layer2_guards,
                config.vanguards.num_layer3_guards,
            )
        });
        Self {
            vanguard_state,
            bandguard: BandwidthGuard::new(unix_now() as f64),
            timeouts: TimeoutStats::new(),
            logguard,
            pathverify,
            config,
        }
    }

    fn layer3_in_use(&self) -> bool {
        self.config.vanguards.num_layer3_guards > 0
    }
}

/// How one pass of the control loop ended.
#[derive(Debug)]
pub enum LoopExit {
    /// The control connection dropped or could not be established.
    Disconnected(String),
    /// An unrecoverable error; the process must exit non-zero.
    Fatal(Error),
    /// One-shot mode finished its single consensus update.
    OneShot,
}

async fn connect_to_tor(config: &Config) -> Result<Controller> {
    let g = &config.global;

    if let Some(ref socket_path) = g.control_socket {
        let controller = Controller::from_socket_file(socket_path.as_path()).await?;
        plog(
            LogLevel::Notice,
            &format!("Connected to Tor via socket {}", socket_path.display()),
        );
        return Ok(controller);
    }

    if let Some(port) = g.control_port {
        let addr = format!("{}:{}", g.control_ip, port);
        let controller = Controller::from_port(
            addr.parse()
                .map_err(|e| Error::Config(format!("invalid control address: {}", e)))?,
        )
        .await?;
        plog(
            LogLevel::Notice,
            &format!("Connected to Tor via control port {}", addr),
        );
        return Ok(controller);
    }

    if let Ok(controller) = Controller::from_socket_file(Path::new("/run/tor/control")).await {
        plog(LogLevel::Notice, "Connected to Tor via /run/tor/control");
        return Ok(controller);
    }

    let addr = format!("{}:9051", g.control_ip);
    let controller = Controller::from_port(
        addr.parse()
            .map_err(|e| Error::Config(format!("invalid control address: {}", e)))?,
    )
    .await?;
    plog(
        LogLevel::Notice,
        &format!("Connected to Tor via control port {}", addr),
    );
    Ok(controller)
}

/// Event subscriptions needed for the enabled subsystems.
fn event_subscriptions(config: &Config, tor_version: &Version) -> Vec<EventType> {
    let g = &config.global;
    let mut events = Vec::new();

    if g.enable_vanguards || g.enable_rendguard {
        events.push(EventType::NewConsensus);
        events.push(EventType::Signal);
    }
    if g.enable_rendguard {
        events.push(EventType::Circ);
    }
    if g.enable_bandguards {
        events.push(EventType::Circ);
        events.push(EventType::Bw);
        events.push(EventType::OrConn);
        events.push(EventType::NetworkLiveness);
        let min_version = Version::new(0, 3, 4).with_patch(10);
        if *tor_version >= min_version {
            events.push(EventType::CircBw);
            events.push(EventType::CircMinor);
        } else {
            plog(
                LogLevel::Notice,
                "In order for bandwidth-based protections to be enabled, you must use Tor 0.3.4.10 or newer.",
            );
        }
    }
    if g.enable_cbtverify {
        events.push(EventType::Circ);
        events.push(EventType::BuildTimeoutSet);
    }
    if g.enable_pathverify {
        events.push(EventType::Circ);
        events.push(EventType::CircMinor);
        events.push(EventType::OrConn);
        events.push(EventType::ConfChanged);
    }
    if g.enable_logguard {
        events.push(EventType::Circ);
        events.push(EventType::Warn);
        for name in LogGuard::event_types_for(config.logguard.log_dump_level) {
            match *name {
                "DEBUG" => events.push(EventType::Debug),
                "INFO" => events.push(EventType::Info),
                "NOTICE" => events.push(EventType::Notice),
                "WARN" => events.push(EventType::Warn),
                "ERR" => events.push(EventType::Err),
                _ => {}
            }
        }
    }

    events.sort_by_key(|e| format!("{:?}", e));
    events.dedup();
    events
}

/// Dispatches a `CIRC` event. Returns circuit ids that must be closed.
fn handle_circ_event(
    state: &mut AppState,
    event: &stem_rs::events::CircuitEvent,
    arrived_at: f64,
) -> Vec<String> {
    let circ_id = event.id.0.clone();
    let status = format!("{:?}", event.status);
    let purpose = event
        .purpose
        .as_ref()
        .map(|p| format!("{:?}", p))
        .unwrap_or_else(|| "GENERAL".to_string());
    let hs_state = event.hs_state.as_ref().map(|s| format!("{:?}", s));
    let reason = event.reason.as_ref().map(|r| format!("{:?}", r));
    let remote_reason = event.remote_reason.as_ref().map(|r| format!("{:?}", r));
    let path: Vec<String> = event.path.iter().map(|(fp, _)| fp.clone()).collect();

    let mut closes = Vec::new();

    // Rendezvous counting happens on the service-side rend circuit
    // becoming fully built; the client picked the terminal hop.
    if state.config.global.enable_rendguard && status == "BUILT" && purpose == "HS_SERVICE_REND" {
        match RendGuard::rend_hop(&path, state.layer3_in_use()) {
            Some(rend_fp) => {
                let rend_fp = rend_fp.to_string();
                let (verdict, first_unlisted) = state
                    .vanguard_state
                    .rendguard
                    .record_use(&rend_fp, &state.config.rendguard);
                if first_unlisted {
                    plog(
                        LogLevel::Notice,
                        &format!(
                            "Rendezvous point {} is not in our consensus, but someone is using it",
                            rend_fp
                        ),
                    );
                }
                if let RendVerdict::Overused {
                    fingerprint,
                    usage_pct,
                    expected_pct,
                } = verdict
                {
                    plog(
                        LogLevel::Warn,
                        &format!(
                            "Rendezvous point {} chosen for {:.2}% of circuits against an expected {:.2}%",
                            fingerprint, usage_pct, expected_pct
                        ),
                    );
                    if state.config.rendguard.rend_use_close_circuits_on_overuse {
                        closes.push(circ_id.clone());
                    }
                }
            }
            None => plog(
                LogLevel::Error,
                &format!(
                    "Rendezvous circuit {} built with a {}-hop path",
                    circ_id,
                    path.len()
                ),
            ),
        }
    }

    if state.config.global.enable_bandguards {
        if let Some(correlation) = state.bandguard.circ_event(
            &circ_id,
            &status,
            &purpose,
            hs_state.as_deref(),
            &path,
            reason.as_deref(),
            remote_reason.as_deref(),
            arrived_at,
        ) {
            plog(
                LogLevel::Notice,
                &format!(
                    "Guard {} closed a connection and destroyed circuit {} with it ({} total)",
                    correlation.guard_fp, correlation.circ_id, correlation.killed_conns
                ),
            );
        }
    }

    if state.config.global.enable_cbtverify {
        state.timeouts.circ_event(
            &circ_id,
            &status,
            &purpose,
            hs_state.as_deref(),
            reason.as_deref(),
        );
    }

    if let Some(ref mut lg) = state.logguard {
        lg.circ_event(&circ_id, &status, reason.as_deref());
    }

    if let Some(ref mut pv) = state.pathverify {
        pv.circ_event(&status, &purpose, hs_state.as_deref(), &path);
    }

    closes
}

/// Dispatches a `CIRC_BW` event. Returns circuit ids that must be closed.
fn handle_circbw_event(
    state: &mut AppState,
    event: &stem_rs::events::CircuitBandwidthEvent,
) -> Vec<String> {
    if !state.config.global.enable_bandguards {
        return Vec::new();
    }

    let circ_id = event.id.0.clone();
    let outcome = state.bandguard.circbw_event(
        &circ_id,
        event.read,
        event.written,
        event.delivered_read,
        event.delivered_written,
        event.overhead_read,
        event.overhead_written,
    );

    match outcome {
        CircBwOutcome::DisabledNow => {
            plog(
                LogLevel::Notice,
                "Tor is not reporting delivered/overhead counts; bandwidth protections disabled. Use Tor 0.3.4.10 or newer.",
            );
            return Vec::new();
        }
        CircBwOutcome::Untracked => return Vec::new(),
        CircBwOutcome::Updated {
            read_breach,
            write_breach,
        } => {
            if read_breach {
                plog(
                    LogLevel::Error,
                    &format!("Circuit {} read application data exceeds cell data", circ_id),
                );
            }
            if write_breach {
                plog(
                    LogLevel::Error,
                    &format!(
                        "Circuit {} written application data exceeds cell data",
                        circ_id
                    ),
                );
            }
        }
    }

    match state.bandguard.check_limits(&circ_id, &state.config.bandguards) {
        LimitVerdict::Ok => Vec::new(),
        LimitVerdict::DroppedCells {
            rate,
            dropped_bytes,
            service,
        } => {
            let level = if service {
                LogLevel::Warn
            } else {
                LogLevel::Notice
            };
            plog(
                level,
                &format!(
                    "Circuit {} dropped {:.0} bytes ({:.2}% of read traffic)",
                    circ_id,
                    dropped_bytes,
                    rate * 100.0
                ),
            );
            vec![circ_id]
        }
        LimitVerdict::MaxBytes { bytes, limit } => {
            plog(
                LogLevel::Notice,
                &format!(
                    "Circuit {} exceeded the byte cap: {:.0} > {:.0}",
                    circ_id, bytes, limit
                ),
            );
            vec![circ_id]
        }
        LimitVerdict::HsdescBytes { bytes, limit } => {
            plog(
                LogLevel::Warn,
                &format!(
                    "HSDIR circuit {} exceeded the descriptor cap: {:.0} > {:.0}",
                    circ_id, bytes, limit
                ),
            );
            vec![circ_id]
        }
    }
}

/// Parses and dispatches a raw `CIRC_MINOR` event.
///
/// stem-rs surfaces CIRC_MINOR as an unknown event, so the line is taken
/// apart here: `CircuitID Kind [Path] [PURPOSE=…] [HS_STATE=…]
/// [OLD_PURPOSE=…]`.
fn handle_circ_minor_raw(state: &mut AppState, content: &str) {
    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() < 2 {
        plog(
            LogLevel::Error,
            &format!("Malformed CIRC_MINOR event: {:?}", content),
        );
        return;
    }

    let circ_id = parts[0];
    let kind = parts[1];
    let mut path: Vec<String> = Vec::new();
    let mut purpose: Option<&str> = None;
    let mut hs_state: Option<&str> = None;
    let mut old_purpose: Option<&str> = None;

    for part in &parts[2..] {
        if let Some((key, value)) = part.split_once('=') {
            match key {
                "PURPOSE" => purpose = Some(value),
                "HS_STATE" => hs_state = Some(value),
                "OLD_PURPOSE" => old_purpose = Some(value),
                _ => {}
            }
        } else if part.starts_with('$') || part.contains(',') {
            for hop in part.split(',') {
                let hop = hop.trim_start_matches('$');
                let fp = hop.split(['~', '=']).next().unwrap_or("");
                if !fp.is_empty() {
                    path.push(fp.to_string());
                }
            }
        }
    }

    let purpose = purpose.unwrap_or("GENERAL");

    if state.config.global.enable_bandguards {
        state
            .bandguard
            .circ_minor_event(circ_id, kind, purpose, hs_state, old_purpose, &path);
    }
}

/// Dispatches an `ORCONN` event.
fn handle_orconn_event(
    state: &mut AppState,
    event: &stem_rs::events::OrConnEvent,
    arrived_at: f64,
) {
    let status = format!("{:?}", event.status);
    let reason = event.reason.as_ref().map(|r| format!("{:?}", r));
    let conn_id = event.id.as_deref().unwrap_or("");

    if state.config.global.enable_bandguards {
        state.bandguard.orconn_event(
            conn_id,
            &event.target,
            &status,
            reason.as_deref(),
            arrived_at,
        );
    }

    if let Some(ref mut pv) = state.pathverify {
        let target = event.target.strip_prefix('$').unwrap_or(&event.target);
        let guard_fp = target.split(['~', '=']).next().unwrap_or("");
        pv.orconn_event(guard_fp, &status);
    }
}

/// Runs the 1 Hz housekeeping attached to the `BW` heartbeat.
fn handle_bw_event(state: &mut AppState, arrived_at: f64) -> Vec<String> {
    if !state.config.global.enable_bandguards {
        return Vec::new();
    }
    let report = state.bandguard.bw_tick(arrived_at, &state.config.bandguards);

    match report.warning {
        Some(LivenessWarning::NoConnections { secs }) => plog(
            LogLevel::Warn,
            &format!("We've had no Tor guard connection for {} seconds!", secs),
        ),
        Some(LivenessWarning::CircuitsFailing {
            secs,
            network_down_secs,
        }) => {
            let extra = network_down_secs
                .map(|d| format!(" (Tor reports the network down for {} seconds)", d))
                .unwrap_or_default();
            plog(
                LogLevel::Warn,
                &format!("Circuits have been failing for {} seconds{}", secs, extra),
            );
        }
        None => {}
    }

    let mut closes = Vec::new();
    for (circ_id, age) in report.aged {
        plog(
            LogLevel::Notice,
            &format!(
                "Circuit {} is {:.0} seconds old, past the {} hour limit",
                circ_id, age, state.config.bandguards.circ_max_age_hours
            ),
        );
        closes.push(circ_id);
    }
    closes
}

async fn close_circuits(controller: &mut Controller, state: &mut AppState, ids: Vec<String>) {
    for circ_id in ids {
        if !try_close_circuit(controller, &circ_id, state.logguard.as_mut()).await {
            // Tor already lost the circuit; stop tracking it ourselves.
            state.bandguard.circs.remove(&circ_id);
        }
    }
}

/// One connect-authenticate-dispatch pass.
pub async fn control_loop(state: &mut AppState) -> LoopExit {
    let mut controller = match connect_to_tor(&state.config).await {
        Ok(c) => c,
        Err(e) => return LoopExit::Disconnected(format!("connect failed: {}", e)),
    };

    if let Err(e) =
        authenticate_any(&mut controller, state.config.global.control_pass.as_deref()).await
    {
        return LoopExit::Fatal(e);
    }

    let tor_version = match controller.get_version().await {
        Ok(v) => v,
        Err(e) => return LoopExit::Disconnected(format!("version query failed: {}", e)),
    };

    let g = &state.config.global;
    if g.enable_vanguards || g.enable_rendguard {
        match new_consensus_event(&mut controller, &mut state.vanguard_state, &state.config).await
        {
            Ok(()) => {}
            Err(Error::DescriptorUnavailable(msg)) => {
                plog(
                    LogLevel::Notice,
                    &format!("Tor needs descriptors: {}. Trying again...", msg),
                );
                return LoopExit::Disconnected(msg);
            }
            Err(e) => return LoopExit::Fatal(e),
        }
    }

    if state.config.global.one_shot_vanguards {
        plog(
            LogLevel::Notice,
            "Updated vanguards in Tor's configuration. Exiting (one-shot mode).",
        );
        return LoopExit::OneShot;
    }

    // Seed trackers from snapshots. Re-done on every reconnect, since
    // connection ids from before the gap are meaningless now.
    if state.config.global.enable_bandguards {
        match controller.get_info("orconn-status").await {
            Ok(snapshot) => state.bandguard.init_from_orconn_status(&snapshot),
            Err(e) => plog(
                LogLevel::Info,
                &format!("Cannot read orconn-status: {}", e),
            ),
        }
        if let Ok(liveness) = controller.get_info("network-liveness").await {
            if liveness.trim() == "down" {
                state
                    .bandguard
                    .network_liveness_event("DOWN", unix_now() as f64);
            }
        }
    }

    if state.pathverify.is_some() {
        let layer2 = controller
            .get_conf("HSLayer2Nodes")
            .await
            .ok()
            .and_then(|v| v.first().cloned());
        let layer3 = controller
            .get_conf("HSLayer3Nodes")
            .await
            .ok()
            .and_then(|v| v.first().cloned());
        let orconns = controller.get_info("orconn-status").await.unwrap_or_default();
        if let Some(ref mut pv) = state.pathverify {
            pv.init_layers(layer2.as_deref(), layer3.as_deref());
            pv.init_conns(&orconns);
        }
    }

    if state.logguard.is_some() && state.config.logguard.log_protocol_warns {
        if let Err(e) = controller.set_conf("ProtocolWarnings", "1").await {
            plog(
                LogLevel::Notice,
                &format!("Tor rejected ProtocolWarnings: {}", e),
            );
        }
    }

    let subscriptions = event_subscriptions(&state.config, &tor_version);
    if let Err(e) = controller.set_events(&subscriptions).await {
        return LoopExit::Disconnected(format!("event subscription failed: {}", e));
    }

    loop {
        let event = match controller.recv_event().await {
            Ok(event) => event,
            Err(e) => {
                plog(LogLevel::Debug, &format!("Event receive error: {}", e));
                return LoopExit::Disconnected("closed".to_string());
            }
        };
        let arrived_at = unix_now() as f64;

        match event {
            ParsedEvent::Circuit(ref e) => {
                let closes = handle_circ_event(state, e, arrived_at);
                close_circuits(&mut controller, state, closes).await;
            }
            ParsedEvent::CircuitBandwidth(ref e) => {
                let closes = handle_circbw_event(state, e);
                close_circuits(&mut controller, state, closes).await;
            }
            ParsedEvent::OrConn(ref e) => {
                handle_orconn_event(state, e, arrived_at);
            }
            ParsedEvent::Bandwidth(_) => {
                let closes = handle_bw_event(state, arrived_at);
                close_circuits(&mut controller, state, closes).await;
            }
            ParsedEvent::NetworkLiveness(ref e) => {
                if state.config.global.enable_bandguards {
                    let status = format!("{:?}", e.status);
                    state.bandguard.network_liveness_event(&status, arrived_at);
                }
            }
            ParsedEvent::BuildTimeoutSet(ref e) => {
                if state.config.global.enable_cbtverify {
                    let set_type = format!("{:?}", e.set_type);
                    state.timeouts.cbt_event(&set_type, e.timeout_rate);
                }
            }
            ParsedEvent::ConfChanged(ref e) => {
                if let Some(ref mut pv) = state.pathverify {
                    pv.conf_changed_event(&e.changed);
                }
            }
            ParsedEvent::Log(ref e) => {
                if let Some(ref mut lg) = state.logguard {
                    let runlevel = format!("{:?}", e.runlevel);
                    lg.log_event(&runlevel, &e.message, arrived_at);
                    if matches!(e.runlevel, stem_rs::Runlevel::Warn) {
                        lg.warn_event(&e.message);
                    }
                }
            }
            ParsedEvent::Signal(ref e) => {
                let signal = format!("{:?}", e.signal);
                if signal == "RELOAD" {
                    plog(LogLevel::Notice, "Tor got SIGHUP. Reapplying vanguards.");
                    if let Err(e) =
                        configure_tor(&mut controller, &state.vanguard_state, &state.config).await
                    {
                        return LoopExit::Fatal(e);
                    }
                }
            }
            ParsedEvent::Unknown {
                ref event_type,
                ref content,
            } => {
                if event_type == "NEWCONSENSUS" {
                    match new_consensus_event(
                        &mut controller,
                        &mut state.vanguard_state,
                        &state.config,
                    )
                    .await
                    {
                        Ok(()) => {}
                        Err(Error::DescriptorUnavailable(msg)) => plog(
                            LogLevel::Warn,
                            &format!("Consensus not usable yet: {}", msg),
                        ),
                        Err(e) => return LoopExit::Fatal(e),
                    }
                } else if event_type == "CIRC_MINOR" {
                    handle_circ_minor_raw(state, content);
                }
            }
            _ => {}
        }
    }
}

/// Process entry point: state load, dispatch, reconnect policy.
///
/// With no retry budget a lost control connection is fatal. With one,
/// the loop reconnects up to the budget and re-seeds its trackers.
pub async fn run_main(config: Config) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            plog(LogLevel::Notice, "Got CTRL+C. Exiting.");
            std::process::exit(0);
        }
    });

    set_close_circuits(config.global.close_circuits);

    let state_path = &config.global.state_file;
    let vanguard_state = match state::read_state(state_path) {
        Ok(mut loaded) => {
            plog(
                LogLevel::Info,
                &format!("Current layer2 guards: {}", loaded.layer2_nodes_conf()),
            );
            plog(
                LogLevel::Info,
                &format!("Current layer3 guards: {}", loaded.layer3_nodes_conf()),
            );
            loaded.enabled = config.global.enable_vanguards;
            loaded
        }
        Err(e) => {
            plog(
                LogLevel::Notice,
                &format!(
                    "Creating new vanguard state at {} ({})",
                    state_path.display(),
                    e
                ),
            );
            let mut fresh = VanguardState::new();
            fresh.enabled = config.global.enable_vanguards;
            fresh
        }
    };

    let retry_limit = config.global.retry_limit;
    let mut state = AppState::new(vanguard_state, config);
    let mut attempts = 0u32;

    loop {
        let reason = match control_loop(&mut state).await {
            LoopExit::OneShot => return Ok(()),
            LoopExit::Fatal(e) => return Err(e),
            LoopExit::Disconnected(reason) => reason,
        };

        match retry_limit {
            None => {
                return Err(Error::Config(format!(
                    "control connection lost: {}",
                    reason
                )));
            }
            Some(limit) if attempts >= limit => {
                return Err(Error::Config(format!(
                    "control connection lost after {} reconnect attempts: {}",
                    attempts, reason
                )));
            }
            Some(_) => {
                attempts += 1;
                plog(
                    LogLevel::Notice,
                    &format!(
                        "Tor control connection {}. Reconnecting ({} of {})...",
                        reason,
                        attempts,
                        retry_limit.unwrap_or(0)
                    ),
                );
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn consensus_weights_parse() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network-status-version 3 microdesc\n\
             bandwidth-weights Wbd=0 Wbe=0 Wbg=4194 Wbm=10000 Wgd=0 Wgg=5806 Wmd=0 Wme=0 Wmg=4194 Wmm=10000"
        )
        .unwrap();

        let weights = get_consensus_weights(file.path()).unwrap();
        assert_eq!(weights.get("Wmm"), Some(&10000));
        assert_eq!(weights.get("Wmg"), Some(&4194));
        assert_eq!(weights.get("Wgg"), Some(&5806));
    }

    #[test]
    fn consensus_without_weights_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "network-status-version 3 microdesc").unwrap();
        assert!(matches!(
            get_consensus_weights(file.path()),
            Err(Error::Consensus(_))
        ));
    }

    #[test]
    fn ns_all_parsing_extracts_relays() {
        let response = "\
r relay1 AAAAAAAAAAAAAAAAAAAAAAAAAAAA BBBBBBBBBBBBBBBBBBBBBBBBBBBB 2024-01-01 00:00:00 192.0.2.1 9001 0
s Fast Guard Running Stable Valid
w Bandwidth=1000 Measured=900
r relay2 CCCCCCCCCCCCCCCCCCCCCCCCCCCC DDDDDDDDDDDDDDDDDDDDDDDDDDDD 2024-01-01 00:00:00 192.0.2.2 9002 0
s Fast Running Stable Valid Exit
w Bandwidth=2000";

        let relays = parse_network_statuses(response).unwrap();
        assert_eq!(relays.len(), 2);
        assert_eq!(relays[0].nickname, "relay1");
        assert!(relays[0].flags.iter().any(|f| f == "Guard"));
        assert_eq!(relays[0].bandwidth, Some(1000));
        assert_eq!(relays[0].measured, Some(900));
        assert_eq!(relays[1].nickname, "relay2");
        assert_eq!(relays[1].measured, None);
    }

    #[test]
    fn base64_fingerprints_decode_to_hex() {
        assert_eq!(base64_decode("SGVsbG8=").unwrap(), b"Hello");
        assert_eq!(base64_decode("SGVsbG8").unwrap(), b"Hello");

        // A 20-byte identity is 27 unpadded base64 characters.
        let hex = decode_base64_fingerprint("AAAAAAAAAAAAAAAAAAAAAAAAAAA");
        assert_eq!(hex.len(), 40);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn close_circuits_flag_round_trips() {
        set_close_circuits(false);
        assert!(!get_close_circuits());
        set_close_circuits(true);
        assert!(get_close_circuits());
    }
}
