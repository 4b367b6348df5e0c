//! The wire format carried in the body of every delivery.
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::HashMap;

/// The decoded view of a delivery body: a tracing carrier plus an opaque
/// application payload.
///
/// Every message consumed by the listener is expected to be a JSON object of
/// the shape `{"carrier": {..}, "msg": ..}`. The listener only reads
/// `carrier` to restore the distributed-tracing context; `msg` is forwarded
/// to the application handler byte-for-byte, without re-serialization.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Trace propagation headers injected by the publisher.
    #[serde(default)]
    pub carrier: HashMap<String, String>,
    /// The application payload, kept opaque. Publishers may omit it, in
    /// which case the handler receives an empty payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<Box<RawValue>>,
}

impl Envelope {
    /// Decode a delivery body.
    ///
    /// A body that does not decode is a poison message: it will not decode
    /// for any other consumer of the same queue either.
    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// The raw bytes of the application payload, exactly as published.
    /// Empty if the envelope carried no `msg`.
    pub fn payload(&self) -> &[u8] {
        self.msg.as_deref().map_or(&[], |raw| raw.get().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_carrier_and_payload() {
        let body = br#"{"carrier":{"traceparent":"00-abc-def-01"},"msg":{"order_id":42}}"#;
        let envelope = Envelope::decode(body).unwrap();
        assert_eq!(
            envelope.carrier.get("traceparent").map(String::as_str),
            Some("00-abc-def-01")
        );
        assert_eq!(envelope.payload(), br#"{"order_id":42}"#);
    }

    #[test]
    fn missing_carrier_defaults_to_empty() {
        let envelope = Envelope::decode(br#"{"msg":"plain"}"#).unwrap();
        assert!(envelope.carrier.is_empty());
        assert_eq!(envelope.payload(), br#""plain""#);
    }

    #[test]
    fn missing_msg_is_an_empty_payload() {
        let envelope = Envelope::decode(br#"{"carrier":{}}"#).unwrap();
        assert_eq!(envelope.payload(), b"");

        let envelope = Envelope::decode(br#"{"carrier":{},"msg":null}"#).unwrap();
        assert_eq!(envelope.payload(), b"");
    }

    #[test]
    fn malformed_body_is_an_error() {
        assert!(Envelope::decode(b"not json at all").is_err());
        assert!(Envelope::decode(br#"["carrier"]"#).is_err());
    }
}
