// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for framing events in the migration control protocol.
//! Both planes the sender speaks on (the control socket from the
//! supervisor and the link to the remote receiver) carry the same
//! format: one JSON object per line, tagged with a `type` field.
//!
//! Requests and responses are correlated by `eventId`; `error` and
//! `sync-success` arrive asynchronously. Command-specific fields are
//! not enumerated anywhere by the peers, so each event carries its
//! remaining fields as an uninterpreted JSON map. The framing layer
//! makes no effort to validate which commands may appear on which
//! plane; higher level software is responsible for that.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Command-specific fields riding alongside an event's fixed fields.
pub type Extras = serde_json::Map<String, serde_json::Value>;

/// Protocol violations at the framing and schema layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Encountered an I/O error on the transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line arrived that does not parse as a tagged event
    #[error("malformed event line: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Failed to serialize an outbound event
    #[error("could not serialize event: {0}")]
    Serialize(#[source] serde_json::Error),

    /// A response field was absent or of the wrong type
    #[error("missing or invalid `{0}` field in {1} event")]
    MissingField(&'static str, &'static str),

    /// The receiver announced success outside a streaming phase
    #[error("received sync-success outside a streaming phase")]
    UntimelySyncSuccess,

    /// The storage tool's dry run produced no usable size line
    #[error("unable to get send estimate")]
    NoSendEstimate,
}

/// A request issued by us (to the receiver) or by the supervisor
/// (to us).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Request {
    pub command: String,
    #[serde(rename = "eventId")]
    pub event_id: u64,
    #[serde(flatten)]
    pub extras: Extras,
}

/// The positive reply to a request, correlated by event id.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(rename = "eventId")]
    pub event_id: u64,
    #[serde(flatten)]
    pub extras: Extras,
}

/// A failure notification. Carries the originating command and event
/// id when it answers a request, and neither when asynchronous.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ErrorEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(
        rename = "eventId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub event_id: Option<u64>,
    pub message: String,
    #[serde(flatten)]
    pub extras: Extras,
}

/// The receiver's asynchronous acknowledgment that its local receive
/// process consumed a whole stream and exited cleanly.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SyncSuccess {
    #[serde(flatten)]
    pub extras: Extras,
}

/// A progress broadcast to a subscribed control socket.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub phase: String,
    pub state: String,
    pub current_progress: u64,
    pub total_progress: u64,
    pub store: bool,
}

/// Event represents the different line types exchanged in the
/// migration control protocol. They must be kept in bijection with
/// the wire `type` tags.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    Request(Request),
    Response(Response),
    Error(ErrorEvent),
    SyncSuccess(SyncSuccess),
    Progress(ProgressEvent),
}

impl Event {
    /// Builds a response echoing `command` and `event_id` from the
    /// request it answers.
    pub fn response(command: &str, event_id: u64, extras: Extras) -> Event {
        Event::Response(Response {
            command: Some(command.to_string()),
            event_id,
            extras,
        })
    }

    /// Builds an error event, optionally tied to the request it
    /// answers.
    pub fn error(
        command: Option<&str>,
        event_id: Option<u64>,
        message: impl ToString,
    ) -> Event {
        Event::Error(ErrorEvent {
            command: command.map(str::to_string),
            event_id,
            message: message.to_string(),
            extras: Extras::new(),
        })
    }
}

impl Response {
    /// Reads a string field out of the response extras.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.extras.get(name).and_then(serde_json::Value::as_str)
    }

    /// Reads an array-of-strings field out of the response extras.
    /// Anything that is not an array (absent, null, scalar) reads as
    /// empty, as does any non-string element.
    pub fn field_names(&self, name: &str) -> Vec<String> {
        self.extras
            .get(name)
            .and_then(serde_json::Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The EventFramer encodes and decodes events as newline-delimited
/// JSON. Decoding consumes the offending line before reporting a
/// malformed event, so a tolerant caller may log the error and keep
/// reading from the same stream.
#[derive(Debug, Default)]
pub struct EventFramer {}

impl EventFramer {
    pub fn new() -> EventFramer {
        EventFramer::default()
    }
}

impl Decoder for EventFramer {
    type Item = Event;
    type Error = ProtocolError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Event>, ProtocolError> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == b'\n') else {
                return Ok(None);
            };
            let line = src.split_to(pos + 1);
            let mut line = &line[..line.len() - 1];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return serde_json::from_slice(line)
                .map(Some)
                .map_err(ProtocolError::Malformed);
        }
    }
}

impl Encoder<Event> for EventFramer {
    type Error = ProtocolError;

    fn encode(
        &mut self,
        event: Event,
        dst: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        let buf =
            serde_json::to_vec(&event).map_err(ProtocolError::Serialize)?;
        dst.reserve(buf.len() + 1);
        dst.put_slice(&buf);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod encoder_tests {
    use super::*;
    use serde_json::json;

    fn encode(event: Event) -> String {
        let mut framer = EventFramer::new();
        let mut dst = BytesMut::new();
        framer.encode(event, &mut dst).unwrap();
        String::from_utf8(dst.to_vec()).unwrap()
    }

    #[test]
    fn encode_is_one_line() {
        let line = encode(Event::response("ping", 1, Extras::new()));
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn encode_request_tags_and_renames() {
        let mut extras = Extras::new();
        extras.insert("zfsFilesystem".into(), json!("zones/x"));
        let line = encode(Event::Request(Request {
            command: "get-zfs-snapshot-names".into(),
            event_id: 7,
            extras,
        }));
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["type"], "request");
        assert_eq!(v["command"], "get-zfs-snapshot-names");
        assert_eq!(v["eventId"], 7);
        assert_eq!(v["zfsFilesystem"], "zones/x");
    }

    #[test]
    fn encode_async_error_omits_correlation() {
        let line = encode(Event::error(None, None, "boom"));
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["message"], "boom");
        assert!(v.get("command").is_none());
        assert!(v.get("eventId").is_none());
    }

    #[test]
    fn encode_progress() {
        let line = encode(Event::Progress(ProgressEvent {
            phase: "sync".into(),
            state: "running".into(),
            current_progress: 12,
            total_progress: 99,
            store: true,
        }));
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["type"], "progress");
        assert_eq!(v["current_progress"], 12);
        assert_eq!(v["total_progress"], 99);
        assert_eq!(v["store"], true);
    }
}

#[cfg(test)]
mod decoder_tests {
    use super::*;

    fn framer_with(input: &str) -> (EventFramer, BytesMut) {
        (EventFramer::new(), BytesMut::from(input.as_bytes()))
    }

    #[test]
    fn decode_response() {
        let (mut framer, mut src) = framer_with(
            "{\"type\":\"response\",\"command\":\"sync\",\"eventId\":3,\
             \"names\":[\"vm-migration-1\"]}\n",
        );
        let ev = framer.decode(&mut src).unwrap().unwrap();
        let Event::Response(resp) = ev else {
            panic!("expected response, got {ev:?}");
        };
        assert_eq!(resp.command.as_deref(), Some("sync"));
        assert_eq!(resp.event_id, 3);
        assert_eq!(resp.field_names("names"), vec!["vm-migration-1"]);
    }

    #[test]
    fn decode_sync_success_tag() {
        let (mut framer, mut src) =
            framer_with("{\"type\":\"sync-success\"}\n");
        let ev = framer.decode(&mut src).unwrap().unwrap();
        assert!(matches!(ev, Event::SyncSuccess(_)));
    }

    #[test]
    fn decode_waits_for_full_line() {
        let (mut framer, mut src) = framer_with("{\"type\":\"resp");
        assert!(framer.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(b"onse\",\"eventId\":1}\n");
        assert!(framer.decode(&mut src).unwrap().is_some());
    }

    #[test]
    fn decode_tolerates_crlf_and_blank_lines() {
        let (mut framer, mut src) = framer_with(
            "\r\n{\"type\":\"response\",\"eventId\":1}\r\n\n",
        );
        let ev = framer.decode(&mut src).unwrap().unwrap();
        assert!(matches!(ev, Event::Response(_)));
        assert!(framer.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn decode_malformed_line_is_consumed() {
        let (mut framer, mut src) = framer_with(
            "not json\n{\"type\":\"response\",\"eventId\":2}\n",
        );
        assert!(matches!(
            framer.decode(&mut src),
            Err(ProtocolError::Malformed(_))
        ));
        // The bad line is gone; the stream remains usable.
        let ev = framer.decode(&mut src).unwrap().unwrap();
        assert!(matches!(ev, Event::Response(r) if r.event_id == 2));
    }

    #[test]
    fn decode_unknown_tag_is_malformed() {
        let (mut framer, mut src) =
            framer_with("{\"type\":\"frobnicate\"}\n");
        assert!(matches!(
            framer.decode(&mut src),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn non_array_names_read_as_empty() {
        let resp = Response {
            command: None,
            event_id: 1,
            extras: serde_json::from_str(
                "{\"names\":\"not-an-array\"}",
            )
            .unwrap(),
        };
        assert!(resp.field_names("names").is_empty());
        assert!(resp.field_names("absent").is_empty());
    }
}
