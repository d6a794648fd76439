//! Handoff protocol messages and wire framing.
//!
//! Two handoffs cross the isolation boundary: an in-flight result (result
//! channel) and an abort confirmation (abort channel). Both use the same
//! well-known acknowledgment token, so every handoff attempt additionally
//! carries a correlation id generated by the initiating side; the ack must
//! echo both. A mismatch on either is a protocol violation, fatal to the one
//! offending slot.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::job::ResultEnvelope;

/// Granularity of bounded acknowledgment waits.
pub const ACK_POLL: Duration = Duration::from_millis(100);

/// Total bound a worker waits for a result acknowledgment before treating the
/// supervisor as gone.
pub const ACK_WAIT: Duration = Duration::from_secs(30);

/// The single well-known acknowledgment value. Any other value received on an
/// ack position is a protocol violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckToken(String);

impl AckToken {
    /// The expected token value.
    pub const WELL_KNOWN: &'static str = "ACK";

    /// Construct the well-known token.
    #[must_use]
    pub fn well_known() -> Self {
        Self(Self::WELL_KNOWN.to_string())
    }

    /// True if this token carries the expected value.
    #[must_use]
    pub fn is_well_known(&self) -> bool {
        self.0 == Self::WELL_KNOWN
    }
}

/// Messages exchanged on the abort and result channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProtocolMsg {
    /// Supervisor asks the worker to stop at its next safe point.
    AbortRequest {
        /// Correlation id the abort ack must echo.
        correlation: Uuid,
    },
    /// Worker hands a completed result to the supervisor.
    Result {
        /// Correlation id the result ack must echo.
        correlation: Uuid,
        /// The completed job output.
        envelope: ResultEnvelope,
    },
    /// Receipt confirmation for either handoff.
    Ack {
        /// Echo of the initiating message's correlation id.
        correlation: Uuid,
        /// Must be the well-known token.
        token: AckToken,
    },
}

/// One frame of the stdio transport: the three logical channels multiplexed
/// over a child process's stdin/stdout as tagged JSON lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMsg {
    /// Worker diagnostic text (output channel, worker to supervisor only).
    Output(String),
    /// A message on the abort channel.
    Abort(ProtocolMsg),
    /// A message on the result channel.
    Result(ProtocolMsg),
}

impl WireMsg {
    /// Encode this frame as one JSON line (no trailing newline).
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the frame cannot be encoded.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode one JSON line into a frame.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error for malformed frames.
    pub fn decode(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::SolverMethod;

    #[test]
    fn test_token_well_known() {
        assert!(AckToken::well_known().is_well_known());
        let forged: AckToken = serde_json::from_str("\"NACK\"").unwrap();
        assert!(!forged.is_well_known());
    }

    #[test]
    fn test_wire_roundtrip() {
        let correlation = Uuid::new_v4();
        let msg = WireMsg::Result(ProtocolMsg::Result {
            correlation,
            envelope: ResultEnvelope {
                job_id: 9,
                label: "scroll".into(),
                solver: SolverMethod::Euler { steps: 7000 },
                cycles_run: 3,
                elapsed_ms: 120,
                metrics: std::collections::BTreeMap::new(),
            },
        });
        let line = msg.encode().unwrap();
        assert!(!line.contains('\n'));
        match WireMsg::decode(&line).unwrap() {
            WireMsg::Result(ProtocolMsg::Result { correlation: c, envelope }) => {
                assert_eq!(c, correlation);
                assert_eq!(envelope.job_id, 9);
            }
            other => panic!("decoded wrong frame: {other:?}"),
        }
    }

    #[test]
    fn test_wire_rejects_garbage() {
        assert!(WireMsg::decode("not json").is_err());
    }
}
