//! High-level embedding API.
//!
//! The CLI is a thin wrapper around this: build a [`Vigil`] from a
//! [`Config`] and run it. The control-port password, when present, lives
//! in a [`SecurePassword`] that zeroes its memory on drop.

use zeroize::Zeroize;

use crate::config::{Config, LogLevel};
use crate::control;
use crate::error::Result;
use crate::logger::plog;
use crate::state;
use crate::vanguards::VanguardState;

/// A password wrapper that clears its bytes on drop and never appears in
/// debug output.
#[derive(Clone)]
pub struct SecurePassword(String);

impl SecurePassword {
    /// Wraps a password.
    pub fn new(password: String) -> Self {
        Self(password)
    }

    /// Borrows the password for authentication.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Drop for SecurePassword {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SecurePassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecurePassword([REDACTED])")
    }
}

/// The supervisory engine as an embeddable value.
pub struct Vigil {
    state: VanguardState,
    config: Config,
    _password: Option<SecurePassword>,
}

impl Vigil {
    /// Loads persisted state (or starts empty) and prepares to run.
    pub fn from_config(config: Config) -> Result<Self> {
        let password = config.global.control_pass.clone().map(SecurePassword::new);

        let state_path = &config.global.state_file;
        let state = match state::read_state(state_path) {
            Ok(mut loaded) => {
                plog(
                    LogLevel::Info,
                    &format!(
                        "Loaded state with {} layer2 and {} layer3 guards",
                        loaded.layer2.len(),
                        loaded.layer3.len()
                    ),
                );
                loaded.enabled = config.global.enable_vanguards;
                loaded
            }
            Err(_) => {
                plog(
                    LogLevel::Notice,
                    &format!("Creating new vanguard state at {}", state_path.display()),
                );
                let mut fresh = VanguardState::new();
                fresh.enabled = config.global.enable_vanguards;
                fresh
            }
        };

        Ok(Self {
            state,
            config,
            _password: password,
        })
    }

    /// Runs the supervisory loop until shutdown or a fatal error.
    pub async fn run(self) -> Result<()> {
        control::run_main(self.config).await
    }

    /// The current guard-set state.
    pub fn state(&self) -> &VanguardState {
        &self.state
    }

    /// The effective configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_debug_is_redacted() {
        let password = SecurePassword::new("hunter2".to_string());
        let debug = format!("{:?}", password);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn password_is_readable_until_drop() {
        let password = SecurePassword::new("hunter2".to_string());
        assert_eq!(password.as_str(), "hunter2");
    }
}
