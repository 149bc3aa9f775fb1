//! Error types for vigil.
//!
//! All fallible operations in this crate return [`Result`]. The taxonomy
//! mirrors how failures are handled at the top level:
//!
//! | Variant | Handling |
//! |---------|----------|
//! | [`Control`](Error::Control) | Retried when a reconnect budget is configured, else fatal |
//! | [`Consensus`](Error::Consensus) | Fatal: we cannot operate without a parseable consensus |
//! | [`State`](Error::State) | Recoverable on read (start empty), fatal on write |
//! | [`NoRelaysRemain`](Error::NoRelaysRemain) | Fatal: restrictions eliminated the whole directory |
//! | [`InsufficientRelays`](Error::InsufficientRelays) | Fatal: could not fill a guard layer without duplicates |
//! | [`DescriptorUnavailable`](Error::DescriptorUnavailable) | Retried: Tor has not bootstrapped yet |
//! | [`Config`](Error::Config) | Fatal: requires operator intervention |
//!
//! Fatal conditions bubble up to `main`, which translates every error into
//! exit code 1.

use thiserror::Error;

/// Errors that can occur during vigil operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during file or network operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration file or command-line value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Tor control protocol error, wrapped from stem-rs.
    #[error("Tor control error: {0}")]
    Control(#[from] stem_rs::Error),

    /// State file could not be read, parsed, or written.
    #[error("state file error: {0}")]
    State(String),

    /// The network consensus could not be read or parsed.
    #[error("consensus parse error: {0}")]
    Consensus(String),

    /// Every relay in the directory was eliminated by the active
    /// restrictions (flags plus exclusion rules).
    #[error("no relays remain after restrictions")]
    NoRelaysRemain,

    /// The sampler kept producing fingerprints already pinned in a guard
    /// layer. The retry bound is twice the directory size; running into it
    /// means the eligible set is too small for the configured layer sizes.
    #[error("could not fill guard layer after {attempts} draws")]
    InsufficientRelays {
        /// Number of sampler draws performed before giving up.
        attempts: usize,
    },

    /// Tor does not have the required descriptors cached yet, typically
    /// during bootstrap.
    #[error("descriptor unavailable: {0}")]
    DescriptorUnavailable(String),
}

/// Result type alias used throughout vigil.
pub type Result<T> = std::result::Result<T, Error>;
