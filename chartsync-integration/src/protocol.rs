use serde::{Deserialize, Serialize};

/// Sequenced message travelling in one direction of a channel.
///
/// `seq` is monotonically increasing per channel direction, starting at 1.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Envelope<Scope, Payload> {
    pub seq: u64,
    pub scope: Scope,
    pub payload: Payload,
}

impl<Scope, Payload> Envelope<Scope, Payload> {
    pub fn new(seq: u64, scope: Scope, payload: Payload) -> Self {
        Self {
            seq,
            scope,
            payload,
        }
    }
}

/// Every frame exchanged over a transport.
///
/// `Ack` is cumulative: it acknowledges every `Data` frame up to and including `seq`.
/// `Close` starts the two-phase shutdown; the peer answers with `CloseAck` once it has
/// delivered everything up to `last_seq`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireFrame<Scope, Payload> {
    Data(Envelope<Scope, Payload>),
    Ack { seq: u64 },
    Close { last_seq: u64 },
    CloseAck { last_seq: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_frame_json_shape() {
        let frame = WireFrame::Data(Envelope::new(7, "pane".to_string(), 42u32));
        let json = serde_json::to_value(&frame).unwrap();

        assert_eq!(
            json,
            serde_json::json!({ "type": "data", "seq": 7, "scope": "pane", "payload": 42 })
        );

        let close = serde_json::to_string(&WireFrame::<String, u32>::Close { last_seq: 9 }).unwrap();
        assert_eq!(close, r#"{"type":"close","last_seq":9}"#);
    }

    #[test]
    fn test_wire_frame_decodes_control_frames() {
        let ack: WireFrame<String, u32> = serde_json::from_str(r#"{"type":"ack","seq":3}"#).unwrap();
        assert_eq!(ack, WireFrame::Ack { seq: 3 });

        let close_ack: WireFrame<String, u32> =
            serde_json::from_str(r#"{"type":"close_ack","last_seq":3}"#).unwrap();
        assert_eq!(close_ack, WireFrame::CloseAck { last_seq: 3 });
    }
}
