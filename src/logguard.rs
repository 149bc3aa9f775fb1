//! Bounded buffering of Tor's own log lines for post-incident dumps.
//!
//! When a circuit gets force-closed for a policy violation, the overlay's
//! recent log lines are often the only clue to what the far end was
//! doing. This module keeps the last N lines at a configured minimum
//! level and replays them, tagged with the circuit id, right before the
//! close goes out.

use std::collections::VecDeque;

use crate::config::{LogLevel, LogguardConfig};
use crate::logger::plog;

/// One buffered overlay log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Overlay runlevel tag (DEBUG..ERR).
    pub runlevel: String,
    /// Raw message text.
    pub message: String,
    /// Arrival time, unix seconds.
    pub arrived_at: f64,
}

/// Ring buffer of overlay log lines plus protocol-warning counting.
pub struct LogGuard {
    buffer: VecDeque<LogEntry>,
    limit: usize,
    /// Protocol warnings seen since startup.
    pub protocol_warns: u64,
}

impl LogGuard {
    /// Creates a buffer sized from the configuration.
    pub fn new(config: &LogguardConfig) -> Self {
        Self {
            buffer: VecDeque::with_capacity(config.log_dump_limit),
            limit: config.log_dump_limit,
            protocol_warns: 0,
        }
    }

    /// Overlay runlevel names to subscribe to for a dump level.
    pub fn event_types_for(dump_level: LogLevel) -> &'static [&'static str] {
        match dump_level {
            LogLevel::Debug => &["DEBUG", "INFO", "NOTICE", "WARN", "ERR"],
            LogLevel::Info => &["INFO", "NOTICE", "WARN", "ERR"],
            LogLevel::Notice => &["NOTICE", "WARN", "ERR"],
            LogLevel::Warn => &["WARN", "ERR"],
            LogLevel::Error => &["ERR"],
        }
    }

    /// Buffers one overlay log line.
    pub fn log_event(&mut self, runlevel: &str, message: &str, arrived_at: f64) {
        if self.buffer.len() == self.limit {
            self.buffer.pop_front();
        }
        self.buffer.push_back(LogEntry {
            runlevel: runlevel.to_string(),
            message: message.to_string(),
            arrived_at,
        });
    }

    /// Counts warnings that look like protocol violations from the far
    /// end of a circuit.
    pub fn warn_event(&mut self, message: &str) {
        if message.contains("Protocol warning") || message.contains("protocol error") {
            self.protocol_warns += 1;
        }
    }

    /// Replays the buffer, tagged with a circuit id, and clears it.
    ///
    /// `when` distinguishes dumps taken right before a close ("Pre") from
    /// dumps after an unexpected teardown ("Post").
    pub fn dump_log_queue(&mut self, circ_id: &str, when: &str) {
        for entry in self.buffer.drain(..) {
            plog(
                LogLevel::Notice,
                &format!(
                    "{}-close circuit {} overlay log: [{}] {}",
                    when, circ_id, entry.runlevel, entry.message
                ),
            );
        }
    }

    /// Dumps the buffer when a circuit is torn down by the far side.
    pub fn circ_event(&mut self, circ_id: &str, status: &str, reason: Option<&str>) {
        if status == "CLOSED" && reason == Some("DESTROYED") {
            self.dump_log_queue(circ_id, "Post");
        }
    }

    /// Number of buffered lines.
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard_with_limit(limit: usize) -> LogGuard {
        LogGuard::new(&LogguardConfig {
            log_dump_limit: limit,
            ..Default::default()
        })
    }

    #[test]
    fn buffer_is_bounded() {
        let mut lg = guard_with_limit(3);
        for i in 0..10 {
            lg.log_event("NOTICE", &format!("line {}", i), i as f64);
        }
        assert_eq!(lg.buffer_len(), 3);
        assert_eq!(lg.buffer[0].message, "line 7");
    }

    #[test]
    fn dump_drains_the_buffer() {
        let mut lg = guard_with_limit(5);
        lg.log_event("WARN", "something odd", 1.0);
        lg.dump_log_queue("42", "Pre");
        assert_eq!(lg.buffer_len(), 0);
    }

    #[test]
    fn destroyed_circuits_trigger_a_dump() {
        let mut lg = guard_with_limit(5);
        lg.log_event("NOTICE", "before teardown", 1.0);
        lg.circ_event("42", "CLOSED", Some("DESTROYED"));
        assert_eq!(lg.buffer_len(), 0);

        lg.log_event("NOTICE", "unrelated", 2.0);
        lg.circ_event("43", "CLOSED", Some("FINISHED"));
        assert_eq!(lg.buffer_len(), 1);
    }

    #[test]
    fn protocol_warnings_are_counted() {
        let mut lg = guard_with_limit(5);
        lg.warn_event("Protocol warning: dropped cell");
        lg.warn_event("unrelated warning");
        assert_eq!(lg.protocol_warns, 1);
    }

    #[test]
    fn event_types_follow_dump_level() {
        assert_eq!(
            LogGuard::event_types_for(LogLevel::Warn),
            &["WARN", "ERR"]
        );
        assert_eq!(LogGuard::event_types_for(LogLevel::Debug).len(), 5);
    }
}
