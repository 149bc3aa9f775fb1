//! Durable persistence of the guard-set state.
//!
//! The state file is a single JSON document tagged with an explicit schema
//! revision, so that an upgraded tool can recognize (and a future revision
//! can migrate) old files. An unknown revision is not fatal: the caller
//! starts from an empty state and logs.
//!
//! The file is exclusively owned by the running process and rewritten
//! atomically: serialize to a sibling temp file, fsync-free rename over
//! the target. On Unix the file mode is 0600, since pinned fingerprints
//! reveal which relays to attack.
//!
//! Failure semantics follow the attacker model. A state file that cannot
//! be *read* costs only rotation history, so it degrades to a fresh
//! start. A state file that cannot be *written* means restarting would
//! silently re-roll every vanguard, which is exactly the rotation pattern
//! the adversary wants to induce, so write failures are fatal.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rendguard::{RendGuard, NOT_IN_CONSENSUS_ID};
use crate::sampler::is_valid_fingerprint;
use crate::vanguards::{unix_now, GuardNode, VanguardState};

/// On-disk document. One variant per schema revision.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "schema")]
enum StateDocument {
    #[serde(rename = "vigil-state-1")]
    V1(StateV1),
}

#[derive(Debug, Serialize, Deserialize)]
struct StateV1 {
    layer2: Vec<GuardNode>,
    layer3: Vec<GuardNode>,
    rendguard: RendGuard,
}

/// Reads and validates the state file.
///
/// Errors cover a missing or unreadable file, an unknown schema revision,
/// and content that fails validation; all of them are recoverable by
/// starting empty.
pub fn read_state(path: &Path) -> Result<VanguardState> {
    let file =
        File::open(path).map_err(|e| Error::State(format!("cannot open state file: {}", e)))?;
    let document: StateDocument = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| Error::State(format!("cannot parse state file: {}", e)))?;

    let StateDocument::V1(v1) = document;
    let state = VanguardState {
        layer2: v1.layer2,
        layer3: v1.layer3,
        rendguard: v1.rendguard,
        enabled: true,
    };
    validate(&state)?;
    Ok(state)
}

/// Atomically writes the state file.
pub fn write_state(path: &Path, state: &VanguardState) -> Result<()> {
    let document = StateDocument::V1(StateV1 {
        layer2: state.layer2.clone(),
        layer3: state.layer3.clone(),
        rendguard: state.rendguard.clone(),
    });

    let temp_path = path.with_extension("tmp");

    #[cfg(unix)]
    let file = {
        use std::os::unix::fs::OpenOptionsExt;
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)
            .map_err(|e| Error::State(format!("cannot create temp state file: {}", e)))?
    };
    #[cfg(not(unix))]
    let file = File::create(&temp_path)
        .map_err(|e| Error::State(format!("cannot create temp state file: {}", e)))?;

    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, &document)
        .map_err(|e| Error::State(format!("cannot write state file: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::State(format!("cannot flush state file: {}", e)))?;
    drop(writer);

    std::fs::rename(&temp_path, path)
        .map_err(|e| Error::State(format!("cannot rename temp state file: {}", e)))?;
    Ok(())
}

/// Rejects state that could not have been produced by this tool.
fn validate(state: &VanguardState) -> Result<()> {
    // An hour of clock-skew tolerance for chosen_at, a year of headroom
    // for expiries.
    let max_chosen = unix_now() + 3600;
    let max_expires = max_chosen + 366 * 86400;

    for (layer_name, layer) in [("layer2", &state.layer2), ("layer3", &state.layer3)] {
        for guard in layer {
            if !is_valid_fingerprint(&guard.fingerprint) {
                return Err(Error::State(format!(
                    "invalid fingerprint in {}: {}",
                    layer_name, guard.fingerprint
                )));
            }
            if guard.chosen_at > max_chosen {
                return Err(Error::State(format!(
                    "future chosen_at in {} for {}",
                    layer_name, guard.fingerprint
                )));
            }
            if guard.expires_at > max_expires {
                return Err(Error::State(format!(
                    "unreasonable expires_at in {} for {}",
                    layer_name, guard.fingerprint
                )));
            }
        }
    }

    for fp in state.rendguard.use_counts.keys() {
        if fp != NOT_IN_CONSENSUS_ID && !is_valid_fingerprint(fp) {
            return Err(Error::State(format!(
                "invalid fingerprint in rend counter: {}",
                fp
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendguard::RendUseCount;

    fn sample_state() -> VanguardState {
        let now = unix_now();
        let mut state = VanguardState::new();
        state
            .layer2
            .push(GuardNode::new("A".repeat(40), now - 100, now + 86400));
        state
            .layer2
            .push(GuardNode::new("B".repeat(40), now - 50, now + 7200));
        state
            .layer3
            .push(GuardNode::new("C".repeat(40), now, now + 3600));
        state.rendguard.use_counts.insert(
            "D".repeat(40),
            RendUseCount {
                fingerprint: "D".repeat(40),
                used: 12.5,
                weight: 0.25,
            },
        );
        state.rendguard.total_use_counts = 12.5;
        state
    }

    #[test]
    fn round_trip_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.state");
        let state = sample_state();

        write_state(&path, &state).unwrap();
        let loaded = read_state(&path).unwrap();
        assert_eq!(state, loaded);
    }

    #[test]
    fn rewrites_are_atomic_replacements() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.state");

        write_state(&path, &sample_state()).unwrap();
        let mut second = sample_state();
        second.layer3.push(GuardNode::new("E".repeat(40), 1, 3601));
        write_state(&path, &second).unwrap();

        let loaded = read_state(&path).unwrap();
        assert_eq!(loaded, second);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn missing_file_is_a_state_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_state(&dir.path().join("nope.state"));
        assert!(matches!(result, Err(Error::State(_))));
    }

    #[test]
    fn unknown_schema_revision_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.state");
        std::fs::write(
            &path,
            r#"{"schema":"vigil-state-9","layer2":[],"layer3":[]}"#,
        )
        .unwrap();
        assert!(matches!(read_state(&path), Err(Error::State(_))));
    }

    #[test]
    fn garbage_content_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.state");
        std::fs::write(&path, b"\x80\x04not json").unwrap();
        assert!(matches!(read_state(&path), Err(Error::State(_))));
    }

    #[test]
    fn invalid_fingerprint_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.state");
        let mut state = sample_state();
        state.layer2[0].fingerprint = "not-a-fingerprint".to_string();
        write_state(&path, &state).unwrap();
        assert!(matches!(read_state(&path), Err(Error::State(_))));
    }

    #[test]
    fn future_chosen_at_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.state");
        let mut state = sample_state();
        state.layer2[0].chosen_at = unix_now() + 86400;
        write_state(&path, &state).unwrap();
        assert!(matches!(read_state(&path), Err(Error::State(_))));
    }

    #[cfg(unix)]
    #[test]
    fn state_file_mode_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.state");
        write_state(&path, &sample_state()).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
