//! # vigil
//!
//! An out-of-process security hardener for a Tor client hosting onion
//! services. vigil attaches to a running Tor over the control port,
//! subscribes to its event stream, drives the path-pinning configuration,
//! and closes circuits that show patterns known to enable deanonymization
//! side channels.
//!
//! The attacker model is a partially-observing adversary that may run
//! some relays and may drop, inject, or measure traffic on circuits it
//! participates in. Three subsystems address it:
//!
//! | Subsystem | Module | Defense |
//! |-----------|--------|---------|
//! | Vanguard set manager | [`vanguards`] | Pins layer-2/layer-3 relays with staggered rotation, starving guard-discovery walks |
//! | Bandwidth guard | [`bandguard`] | Closes circuits with dropped-cell, size, age, or liveness anomalies |
//! | Rendezvous counter | [`rendguard`] | Closes circuits whose rendezvous point is used far beyond its consensus weight |
//!
//! Supporting pieces: [`sampler`] (bandwidth-weighted relay selection),
//! [`exclusion`] (`ExcludeNodes` resolution), [`state`] (versioned,
//! atomic persistence), [`pathverify`], [`cbtverify`], and [`logguard`]
//! (optional verifiers), all driven by the dispatcher in [`control`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use vigil::{Config, Vigil};
//!
//! #[tokio::main]
//! async fn main() -> vigil::Result<()> {
//!     let config = Config::default();
//!     Vigil::from_config(config)?.run().await
//! }
//! ```
//!
//! Or from the command line:
//!
//! ```bash
//! vigil --control_port 9051 --state /var/lib/tor/vigil.state
//! ```
//!
//! # What this crate does NOT do
//!
//! - Choose the first-hop guard. That stays inside Tor; vigil only sets
//!   `NumEntryGuards` and `GuardLifetime`.
//! - Inspect stream payloads. Only byte and cell counts are read.
//! - Authenticate the Tor binary, or expose any network service of its
//!   own.
//!
//! # See also
//!
//! - [Tor proposal 292 (mesh vanguards)](https://github.com/torproject/torspec/blob/main/proposals/292-mesh-vanguards.txt)
//! - [Tor control protocol](https://spec.torproject.org/control-spec)

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod api;
pub mod bandguard;
pub mod cbtverify;
pub mod config;
pub mod control;
pub mod error;
pub mod exclusion;
pub mod logger;
pub mod logguard;
pub mod pathverify;
pub mod rendguard;
pub mod sampler;
pub mod state;
pub mod vanguards;

pub use api::{SecurePassword, Vigil};
pub use bandguard::{
    BandwidthGuard, CircStat, GuardStat, LimitVerdict, LivenessWarning, CELL_DATA_RATE,
    CELL_PAYLOAD_SIZE, MAX_CIRC_DESTROY_LAG_SECS, RELAY_HEADER_SIZE,
};
pub use config::{
    BandguardsConfig, CliArgs, Config, GlobalConfig, LogLevel, LogguardConfig, RendguardConfig,
    VanguardsConfig,
};
pub use error::{Error, Result};
pub use exclusion::{ExcludeNodes, ExclusionResolver};
pub use rendguard::{RendGuard, RendUseCount, RendVerdict, NOT_IN_CONSENSUS_ID};
pub use sampler::{
    is_valid_country_code, is_valid_fingerprint, is_valid_ip_or_network, BwWeightedGenerator,
    FlagsRestriction, RelayRestriction, RestrictionSet,
};
pub use state::{read_state, write_state};
pub use vanguards::{GuardNode, VanguardState};

pub use control::{
    authenticate_any, configure_tor, control_loop, get_close_circuits, new_consensus_event,
    run_main, set_close_circuits, try_close_circuit, AppState, VERSION,
};
