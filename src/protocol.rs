//! Wire message codec (spec §4.4, §6).
//!
//! `inv.rs` in the teacher shows the pattern this module generalizes: a
//! small typed enum with explicit (de)serialize impls and a dedicated
//! parse-error variant. There, the wire format is Bitcoin's length-prefixed
//! binary encoding over a `ZcashSerialize`/`ZcashDeserialize` pair; here,
//! spec §6 fixes the wire format to one JSON object per UDP datagram, so
//! `serde`/`serde_json` play the equivalent role `byteorder` played there.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::update::Update;

/// One slot of [`Message::updates`]: either a well-formed [`Update`], or the
/// raw JSON of an entry whose `status` wasn't `alive`/`suspect`/`down`.
///
/// Keeping the bad entry as untyped JSON rather than failing the whole
/// `Vec<Update>` deserialization lets the dispatcher emit
/// `unrecognized-status` for just that entry (spec §4.4) while still
/// applying every other update piggybacked on the same datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UpdateSlot {
    Valid(Update),
    Invalid(Value),
}

impl UpdateSlot {
    /// The raw `status` string of an invalid slot, for the
    /// `unrecognized-status` signal. `None` if the slot was valid, or if the
    /// entry didn't even have a `status` field to complain about.
    pub fn invalid_status(&self) -> Option<String> {
        match self {
            UpdateSlot::Valid(_) => None,
            UpdateSlot::Invalid(v) => v
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

/// A parsed inbound or outbound datagram (spec §4.4).
///
/// `command` is kept as a raw `String` rather than a strict enum so that an
/// unrecognized command produces [`Error::UnknownCommand`] (spec §4.4: "any
/// other command → emit `unrecognized-command(command)`; drop") instead of
/// failing the whole datagram as a [`Error::Parse`]. `sender_id` and
/// `updates` are present on every message, per spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub command: String,
    pub sender_id: u64,
    #[serde(default)]
    pub updates: Vec<UpdateSlot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    #[serde(rename = "eventName", default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
}

/// The set of commands this engine understands (spec §4.4). Parsed out of
/// [`Message::command`] by the dispatcher, not by serde directly, so that
/// an unknown command is a typed, signaled condition rather than a parse
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ping,
    Ack,
    PingReq,
    Event,
    EventReq,
}

impl Command {
    pub const fn as_str(self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::Ack => "ack",
            Command::PingReq => "ping-req",
            Command::Event => "event",
            Command::EventReq => "event-req",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "ping" => Ok(Command::Ping),
            "ack" => Ok(Command::Ack),
            "ping-req" => Ok(Command::PingReq),
            "event" => Ok(Command::Event),
            "event-req" => Ok(Command::EventReq),
            other => Err(Error::UnknownCommand(other.to_string())),
        }
    }
}

impl Message {
    pub fn ping(sender_id: u64, updates: Vec<Update>) -> Self {
        Message::new(Command::Ping, sender_id, updates)
    }

    pub fn ack(sender_id: u64, updates: Vec<Update>) -> Self {
        Message::new(Command::Ack, sender_id, updates)
    }

    pub fn ping_req(
        sender_id: u64,
        updates: Vec<Update>,
        target_id: u64,
        target_address: Option<String>,
        target_port: Option<u16>,
    ) -> Self {
        let mut m = Message::new(Command::PingReq, sender_id, updates);
        m.target_id = Some(target_id);
        m.target_address = target_address;
        m.target_port = target_port;
        m
    }

    pub fn event(sender_id: u64, updates: Vec<Update>, name: impl Into<String>) -> Self {
        let mut m = Message::new(Command::Event, sender_id, updates);
        m.event_name = Some(name.into());
        m
    }

    pub fn event_req(sender_id: u64, updates: Vec<Update>, name: impl Into<String>) -> Self {
        let mut m = Message::new(Command::EventReq, sender_id, updates);
        m.event_name = Some(name.into());
        m
    }

    fn new(command: Command, sender_id: u64, updates: Vec<Update>) -> Self {
        Message {
            command: command.as_str().to_string(),
            sender_id,
            updates: updates.into_iter().map(UpdateSlot::Valid).collect(),
            target_id: None,
            target_address: None,
            target_port: None,
            event_name: None,
        }
    }

    /// The parsed [`Command`], or [`Error::UnknownCommand`] if
    /// [`Message::command`] isn't one of the five this engine understands.
    pub fn command(&self) -> Result<Command, Error> {
        Command::parse(&self.command)
    }

    /// The well-formed updates carried by this message, in wire order.
    pub fn valid_updates(&self) -> impl Iterator<Item = &Update> {
        self.updates.iter().filter_map(|slot| match slot {
            UpdateSlot::Valid(u) => Some(u),
            UpdateSlot::Invalid(_) => None,
        })
    }

    /// Raw `status` strings of any updates that failed to parse, for the
    /// `unrecognized-status` signal (spec §4.4).
    pub fn invalid_update_statuses(&self) -> impl Iterator<Item = String> + '_ {
        self.updates.iter().filter_map(UpdateSlot::invalid_status)
    }

    /// Serialize to the UTF-8 JSON bytes that go on the wire (spec §6).
    pub fn to_bytes(&self) -> Vec<u8> {
        // `Message` only ever contains serializable field types we control,
        // so serialization cannot fail.
        serde_json::to_vec(self).expect("Message always serializes")
    }

    /// Parse an inbound datagram. Parse failures map to [`Error::Parse`],
    /// carrying the raw datagram text for the `error` signal (spec §6:
    /// `Invalid message: "<raw>"`).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes).map_err(|_| {
            let raw = String::from_utf8_lossy(bytes).into_owned();
            Error::Parse(raw)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::PeerStatus;

    #[test]
    fn ping_round_trips_through_json() {
        let msg = Message::ping(1, vec![Update::new(2, 3, PeerStatus::Alive)]);
        let bytes = msg.to_bytes();
        let parsed = Message::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.command().unwrap(), Command::Ping);
        assert_eq!(parsed.sender_id, 1);
        assert_eq!(parsed.valid_updates().count(), 1);
    }

    #[test]
    fn ping_req_carries_target_fields() {
        let msg = Message::ping_req(1, vec![], 9, Some("10.0.0.9".into()), Some(7000));
        let bytes = msg.to_bytes();
        let parsed = Message::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.target_id, Some(9));
        assert_eq!(parsed.target_address.as_deref(), Some("10.0.0.9"));
        assert_eq!(parsed.target_port, Some(7000));
    }

    #[test]
    fn malformed_json_is_a_parse_error_carrying_raw_text() {
        let err = Message::from_bytes(b"not json").unwrap_err();
        match err {
            Error::Parse(raw) => assert_eq!(raw, "not json"),
            other => panic!("expected Parse error, got {other:?}"),
        }
    }

    #[test]
    fn missing_updates_field_defaults_to_empty() {
        let json = br#"{"command":"ping","sender_id":1}"#;
        let parsed = Message::from_bytes(json).unwrap();
        assert_eq!(parsed.valid_updates().count(), 0);
    }

    #[test]
    fn update_with_unrecognized_status_is_isolated_from_the_rest() {
        let json = br#"{"command":"ping","sender_id":1,"updates":[
            {"id":2,"sequence":1,"status":"alive"},
            {"id":3,"sequence":1,"status":"zombie"}
        ]}"#;
        let parsed = Message::from_bytes(json).unwrap();
        assert_eq!(parsed.valid_updates().count(), 1);
        let bad: Vec<String> = parsed.invalid_update_statuses().collect();
        assert_eq!(bad, vec!["zombie".to_string()]);
    }

    #[test]
    fn wire_shape_uses_snake_case_sender_id() {
        let msg = Message::ping(42, vec![]);
        let json = String::from_utf8(msg.to_bytes()).unwrap();
        assert!(json.contains("\"sender_id\":42"));
    }

    #[test]
    fn unrecognized_command_parses_the_envelope_but_fails_command() {
        let json = br#"{"command":"frobnicate","sender_id":1,"updates":[]}"#;
        let parsed = Message::from_bytes(json).unwrap();
        match parsed.command() {
            Err(Error::UnknownCommand(cmd)) => assert_eq!(cmd, "frobnicate"),
            other => panic!("expected UnknownCommand, got {other:?}"),
        }
    }

    #[test]
    fn event_req_round_trips_event_name() {
        let msg = Message::event_req(1, vec![], "alive:5");
        let parsed = Message::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed.event_name.as_deref(), Some("alive:5"));
        assert_eq!(parsed.command().unwrap(), Command::EventReq);
    }
}
