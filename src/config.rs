//! Configuration: policy parameters, the config file, and the CLI.
//!
//! All policy parameters live in a single [`Config`] value that is built
//! once at startup and then threaded by shared reference; nothing mutates
//! it afterwards. Sources are merged in increasing precedence:
//!
//! 1. Built-in defaults,
//! 2. the default config file (`vigil.conf`, if present),
//! 3. a config file named with `--config` (must be readable),
//! 4. command-line flags.
//!
//! The file format is TOML with one table per subsystem: `[Global]`,
//! `[Vanguards]`, `[Bandguards]`, `[Rendguard]`, and `[Logguard]`. Unknown
//! keys are skipped; each key coerces to the type of its declared default.
//! `--generate_config <path>` writes the effective defaults and exits.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Log severity levels, ordered from most to least verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Low-level debugging output.
    Debug,
    /// Informational messages.
    Info,
    /// Notable events. The default level.
    #[default]
    Notice,
    /// Warning conditions worth operator attention.
    Warn,
    /// Error conditions.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Notice => "NOTICE",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "NOTICE" => Ok(LogLevel::Notice),
            "WARN" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(Error::Config(format!("invalid loglevel: {}", other))),
        }
    }
}

/// `[Global]`: connection, persistence, logging, and subsystem toggles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GlobalConfig {
    /// IP address of the Tor control port.
    pub control_ip: String,
    /// Tor control port. `None` tries the default socket, then port 9051.
    pub control_port: Option<u16>,
    /// Unix control socket path, preferred over TCP when set.
    pub control_socket: Option<PathBuf>,
    /// Control port password. Cookie auth is used when absent.
    pub control_pass: Option<String>,
    /// Path of the guard-set state file.
    pub state_file: PathBuf,
    /// Minimum severity written to the log.
    pub loglevel: LogLevel,
    /// Log destination: a path, `:syslog:`, or unset for stdout.
    pub logfile: Option<String>,
    /// Reconnect budget after the control connection drops. With no budget
    /// a dropped connection is fatal.
    pub retry_limit: Option<u32>,
    /// Run one consensus update, write the config into Tor, and exit.
    pub one_shot_vanguards: bool,
    /// Close circuits on policy violations. When false, violations are
    /// logged but circuits stay open.
    pub close_circuits: bool,
    /// Enable the vanguard set manager.
    pub enable_vanguards: bool,
    /// Enable the circuit bandwidth guard.
    pub enable_bandguards: bool,
    /// Enable the rendezvous-point use counter.
    pub enable_rendguard: bool,
    /// Enable circuit build-timeout verification.
    pub enable_cbtverify: bool,
    /// Enable circuit path verification.
    pub enable_pathverify: bool,
    /// Enable the Tor log buffer.
    pub enable_logguard: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            control_ip: "127.0.0.1".to_string(),
            control_port: None,
            control_socket: None,
            control_pass: None,
            state_file: PathBuf::from("vigil.state"),
            loglevel: LogLevel::Notice,
            logfile: None,
            retry_limit: None,
            one_shot_vanguards: false,
            close_circuits: true,
            enable_vanguards: true,
            enable_bandguards: true,
            enable_rendguard: true,
            enable_cbtverify: false,
            enable_pathverify: false,
            enable_logguard: false,
        }
    }
}

/// `[Vanguards]`: layer sizes and rotation lifetimes.
///
/// Layer-1 parameters are pushed into Tor itself (`NumEntryGuards`,
/// `GuardLifetime`); layers 2 and 3 are managed here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VanguardsConfig {
    /// Number of entry guards for Tor to use. 0 keeps Tor's default.
    pub num_layer1_guards: u8,
    /// Number of pinned layer-2 relays.
    pub num_layer2_guards: u8,
    /// Number of pinned layer-3 relays. 0 disables layer 3.
    pub num_layer3_guards: u8,
    /// Entry guard lifetime in days, pushed into Tor. 0 keeps the default.
    pub layer1_lifetime_days: u16,
    /// Minimum layer-2 rotation lifetime in hours.
    pub min_layer2_lifetime_hours: u32,
    /// Maximum layer-2 rotation lifetime in hours (exclusive).
    pub max_layer2_lifetime_hours: u32,
    /// Minimum layer-3 rotation lifetime in hours.
    pub min_layer3_lifetime_hours: u32,
    /// Maximum layer-3 rotation lifetime in hours (exclusive).
    pub max_layer3_lifetime_hours: u32,
}

impl Default for VanguardsConfig {
    fn default() -> Self {
        Self {
            num_layer1_guards: 2,
            num_layer2_guards: 4,
            num_layer3_guards: 8,
            layer1_lifetime_days: 0,
            min_layer2_lifetime_hours: 24,
            max_layer2_lifetime_hours: 1080,
            min_layer3_lifetime_hours: 1,
            max_layer3_lifetime_hours: 48,
        }
    }
}

/// `[Bandguards]`: per-circuit limits and liveness thresholds.
///
/// Every byte/kilobyte/hour limit disables its check when set to 0,
/// without affecting the others.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BandguardsConfig {
    /// Close a circuit when more than this percentage of its received
    /// bytes were dropped (received but never delivered), after the
    /// in-flight flow-control allowance. 0 tolerates no excess at all.
    pub circ_max_dropped_cell_percent: f64,
    /// Close circuits that carried more than this many megabytes.
    /// 0 disables.
    pub circ_max_megabytes: u64,
    /// Close hidden-service-directory circuits over this many kilobytes.
    /// 0 disables.
    pub circ_max_hsdesc_kilobytes: u32,
    /// Close circuits older than this many hours. 0 disables.
    pub circ_max_age_hours: u32,
    /// Warn when circuits have been failing for this many seconds.
    pub circ_max_disconnected_secs: u32,
    /// Warn when no guard connection has existed for this many seconds.
    pub conn_max_disconnected_secs: u32,
}

impl Default for BandguardsConfig {
    fn default() -> Self {
        Self {
            circ_max_dropped_cell_percent: 0.0,
            circ_max_megabytes: 0,
            circ_max_hsdesc_kilobytes: 30,
            circ_max_age_hours: 24,
            circ_max_disconnected_secs: 20,
            conn_max_disconnected_secs: 15,
        }
    }
}

/// `[Rendguard]`: rendezvous-point overuse policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RendguardConfig {
    /// Minimum total observations before the overuse check activates.
    pub rend_use_global_start_count: u32,
    /// Minimum observations of one relay before it can be flagged.
    pub rend_use_relay_start_count: u32,
    /// A relay is overused when its share of uses exceeds its consensus
    /// weight times this ratio.
    pub rend_use_max_use_to_bw_ratio: f64,
    /// Halve all counts when the total reaches this value.
    pub rend_use_scale_at_count: u32,
    /// Weight granted to relays absent from the consensus, as a percent of
    /// the total. Covers legitimate consensus churn.
    pub rend_use_max_consensus_weight_churn: f64,
    /// Request circuit closure on overuse. Counting continues either way.
    pub rend_use_close_circuits_on_overuse: bool,
}

impl Default for RendguardConfig {
    fn default() -> Self {
        Self {
            rend_use_global_start_count: 100,
            rend_use_relay_start_count: 5,
            rend_use_max_use_to_bw_ratio: 2.0,
            rend_use_scale_at_count: 20000,
            rend_use_max_consensus_weight_churn: 1.0,
            rend_use_close_circuits_on_overuse: true,
        }
    }
}

/// `[Logguard]`: buffering of Tor's own log lines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogguardConfig {
    /// Ask Tor for `ProtocolWarnings` and count them.
    pub log_protocol_warns: bool,
    /// Number of Tor log lines held in the ring buffer.
    pub log_dump_limit: usize,
    /// Minimum Tor log level to buffer.
    pub log_dump_level: LogLevel,
}

impl Default for LogguardConfig {
    fn default() -> Self {
        Self {
            log_protocol_warns: true,
            log_dump_limit: 25,
            log_dump_level: LogLevel::Notice,
        }
    }
}

/// The complete, read-only configuration of a vigil process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Connection, persistence, and subsystem toggles.
    #[serde(rename = "Global")]
    pub global: GlobalConfig,
    /// Vanguard layer parameters.
    #[serde(rename = "Vanguards")]
    pub vanguards: VanguardsConfig,
    /// Bandwidth guard parameters.
    #[serde(rename = "Bandguards")]
    pub bandguards: BandguardsConfig,
    /// Rendezvous counter parameters.
    #[serde(rename = "Rendguard")]
    pub rendguard: RendguardConfig,
    /// Log buffer parameters.
    #[serde(rename = "Logguard")]
    pub logguard: LogguardConfig,
}

impl Config {
    /// Reads and merges a TOML config file over `self`.
    pub fn apply_file(&mut self, path: &std::path::Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let parsed: Config = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        *self = parsed;
        Ok(())
    }

    /// Serializes the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(format!("serialize: {}", e)))
    }

    /// Sanity checks on values no subsystem can work with.
    pub fn validate(&self) -> Result<()> {
        let vg = &self.vanguards;
        if vg.min_layer2_lifetime_hours >= vg.max_layer2_lifetime_hours {
            return Err(Error::Config(
                "layer2 lifetime range is empty (min >= max)".to_string(),
            ));
        }
        if vg.min_layer3_lifetime_hours >= vg.max_layer3_lifetime_hours {
            return Err(Error::Config(
                "layer3 lifetime range is empty (min >= max)".to_string(),
            ));
        }
        if vg.num_layer2_guards == 0 {
            return Err(Error::Config(
                "num_layer2_guards must be at least 1".to_string(),
            ));
        }
        if self.rendguard.rend_use_max_use_to_bw_ratio <= 0.0 {
            return Err(Error::Config(
                "rend_use_max_use_to_bw_ratio must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Command-line arguments. Every flag overrides its config-file value.
#[derive(Parser, Debug, Default)]
#[command(name = "vigil", about = "Control-port hardener for Tor onion services", version)]
pub struct CliArgs {
    /// File to persist guard-set state in
    #[arg(long = "state", env = "VIGIL_STATE")]
    pub state_file: Option<PathBuf>,

    /// Write the effective default config to a file and exit
    #[arg(long = "generate_config")]
    pub generate_config: Option<PathBuf>,

    /// Config file with advanced settings
    #[arg(long = "config", env = "VIGIL_CONFIG", default_value = "vigil.conf")]
    pub config_file: PathBuf,

    /// IP address of the Tor control port
    #[arg(long = "control_ip")]
    pub control_ip: Option<String>,

    /// Tor control port
    #[arg(long = "control_port")]
    pub control_port: Option<u16>,

    /// Tor control socket path
    #[arg(long = "control_socket")]
    pub control_socket: Option<PathBuf>,

    /// Tor control port password
    #[arg(long = "control_pass")]
    pub control_pass: Option<String>,

    /// Reconnection attempts before giving up (default: exit on disconnect)
    #[arg(long = "retry_limit")]
    pub retry_limit: Option<u32>,

    /// Log verbosity (DEBUG, INFO, NOTICE, WARN, ERROR)
    #[arg(long = "loglevel")]
    pub loglevel: Option<String>,

    /// Log to this file instead of stdout (`:syslog:` for syslog)
    #[arg(long = "logfile")]
    pub logfile: Option<String>,

    /// Set vanguards in Tor's config and exit
    #[arg(long = "one_shot_vanguards")]
    pub one_shot_vanguards: bool,

    /// Log policy violations without closing circuits
    #[arg(long = "no_close_circuits")]
    pub no_close_circuits: bool,

    /// Disable the vanguard set manager
    #[arg(long = "disable_vanguards")]
    pub disable_vanguards: bool,

    /// Disable bandwidth side-channel checks
    #[arg(long = "disable_bandguards")]
    pub disable_bandguards: bool,

    /// Disable rendezvous misuse checks
    #[arg(long = "disable_rendguard")]
    pub disable_rendguard: bool,

    /// Enable circuit build-time monitoring
    #[arg(long = "enable_cbtverify")]
    pub enable_cbtverify: bool,

    /// Enable circuit path verification
    #[arg(long = "enable_pathverify")]
    pub enable_pathverify: bool,

    /// Enable Tor log buffering
    #[arg(long = "enable_logguard")]
    pub enable_logguard: bool,
}

impl CliArgs {
    /// Applies the command-line overrides onto a loaded config.
    pub fn apply_to(&self, config: &mut Config) -> Result<()> {
        let g = &mut config.global;
        if let Some(ref p) = self.state_file {
            g.state_file = p.clone();
        }
        if let Some(ref ip) = self.control_ip {
            g.control_ip = ip.clone();
        }
        if let Some(port) = self.control_port {
            g.control_port = Some(port);
        }
        if let Some(ref sock) = self.control_socket {
            g.control_socket = Some(sock.clone());
        }
        if let Some(ref pass) = self.control_pass {
            g.control_pass = Some(pass.clone());
        }
        if let Some(limit) = self.retry_limit {
            g.retry_limit = Some(limit);
        }
        if let Some(ref level) = self.loglevel {
            g.loglevel = level.parse()?;
        }
        if let Some(ref file) = self.logfile {
            g.logfile = Some(file.clone());
        }
        if self.one_shot_vanguards {
            g.one_shot_vanguards = true;
        }
        if self.no_close_circuits {
            g.close_circuits = false;
        }
        if self.disable_vanguards {
            g.enable_vanguards = false;
        }
        if self.disable_bandguards {
            g.enable_bandguards = false;
        }
        if self.disable_rendguard {
            g.enable_rendguard = false;
        }
        if self.enable_cbtverify {
            g.enable_cbtverify = true;
        }
        if self.enable_pathverify {
            g.enable_pathverify = true;
        }
        if self.enable_logguard {
            g.enable_logguard = true;
        }
        Ok(())
    }
}

/// Default config file path, consulted when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "vigil.conf";

/// Builds the effective configuration from defaults, config files, and CLI.
///
/// The default config file may be absent; a file named explicitly with
/// `--config` must be readable.
pub fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = Config::default();

    let default_path = std::path::Path::new(DEFAULT_CONFIG_FILE);
    if args.config_file == default_path {
        if default_path.exists() {
            config.apply_file(default_path)?;
        }
    } else {
        // An explicitly named file overrides the default one entirely.
        config.apply_file(&args.config_file)?;
    }

    args.apply_to(&mut config)?;
    config.validate()?;
    Ok(config)
}
