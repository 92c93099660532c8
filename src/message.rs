//! # Summary
//!
//! Wire grammar. Every message is a single UTF-8 line whose fields are
//! separated by `~`; the first field names the kind. Lines are decoded
//! into `Message` once, at the socket boundary, and everything past that
//! point works on the typed form.

use std::fmt;
use std::str::FromStr;

use crate::clock::{self, Timestamp};
use crate::error::Error;

pub const DELIMITER: char = '~';

/// Text of the acknowledgement sent back for `NEW_NODE`.
pub const ADMITTED: &str = "New node added successfully.";

/// Text of the fallback reply to anything we could not make sense of.
pub const UNRECOGNIZED: &str = "Didn't get you";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Announce a new member.
    NewNode {
        id: usize,
        host: String,
        port: u16,
        timestamp: Timestamp,
    },

    /// Request the critical section. `timestamp` is the request timestamp,
    /// which doubles as the requester's priority.
    CsEntry { id: usize, timestamp: Timestamp },

    /// Grant.
    CsReply { id: usize, timestamp: Timestamp },

    /// Request postponed; a `CsReply` follows once the sender leaves.
    Deferred { id: usize, timestamp: Timestamp },

    /// Acknowledgement of a grant.
    GotIt { timestamp: Timestamp },

    Heartbeat { id: usize },

    HeartbeatReply { id: usize },

    /// Generic reply: free text followed by a timestamp.
    Ack { text: String, timestamp: Timestamp },
}

impl Message {
    pub fn admitted(timestamp: Timestamp) -> Self {
        Message::Ack { text: ADMITTED.to_string(), timestamp }
    }

    pub fn unrecognized(timestamp: Timestamp) -> Self {
        Message::Ack { text: UNRECOGNIZED.to_string(), timestamp }
    }

    pub fn kind(&self) -> &str {
        match self {
        | Message::NewNode { .. } => "NEW_NODE",
        | Message::CsEntry { .. } => "CSENTRY",
        | Message::CsReply { .. } => "CSREPLY",
        | Message::Deferred { .. } => "DEFERRED",
        | Message::GotIt { .. } => "GOTIT",
        | Message::Heartbeat { .. } => "HEARTBEAT",
        | Message::HeartbeatReply { .. } => "HEARTBEAT_REPLY",
        | Message::Ack { text, .. } => text,
        }
    }

    /// Logical timestamp carried by this message. Liveness probes carry none
    /// and never move the receiver's clock.
    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
        | Message::NewNode { timestamp, .. }
        | Message::CsEntry { timestamp, .. }
        | Message::CsReply { timestamp, .. }
        | Message::Deferred { timestamp, .. }
        | Message::GotIt { timestamp }
        | Message::Ack { timestamp, .. } => Some(*timestamp),
        | Message::Heartbeat { .. }
        | Message::HeartbeatReply { .. } => None,
        }
    }

    /// Overwrites the send timestamp with a freshly ticked clock value.
    ///
    /// `CsEntry` keeps its request timestamp: receivers compare it against
    /// their own request to decide priority, so it must not drift between
    /// the copies sent to different peers.
    pub fn stamp(&mut self, now: Timestamp) {
        match self {
        | Message::NewNode { timestamp, .. }
        | Message::CsReply { timestamp, .. }
        | Message::Deferred { timestamp, .. }
        | Message::GotIt { timestamp }
        | Message::Ack { timestamp, .. } => *timestamp = now,
        | Message::CsEntry { .. }
        | Message::Heartbeat { .. }
        | Message::HeartbeatReply { .. } => (),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let d = DELIMITER;
        match self {
        | Message::NewNode { id, host, port, timestamp } => {
            write!(f, "NEW_NODE{}{}{}{}{}{}{}{}", d, id, d, host, d, port, d, timestamp)
        }
        | Message::CsEntry { id, timestamp }
        | Message::CsReply { id, timestamp }
        | Message::Deferred { id, timestamp } => {
            write!(f, "{}{}{}{}{}", self.kind(), d, id, d, timestamp)
        }
        | Message::GotIt { timestamp } => write!(f, "GOTIT{}{}", d, timestamp),
        | Message::Heartbeat { id }
        | Message::HeartbeatReply { id } => write!(f, "{}{}{}", self.kind(), d, id),
        | Message::Ack { text, timestamp } => write!(f, "{}{}{}", text, d, timestamp),
        }
    }
}

fn number<T: FromStr>(field: &str, line: &str) -> Result<T, Error> {
    field.trim()
        .parse()
        .map_err(|_| Error::Parse(line.to_string()))
}

fn logical(field: &str, line: &str) -> Result<Timestamp, Error> {
    match number(field, line)? {
    | timestamp if timestamp <= clock::LIMIT => Ok(timestamp),
    | _ => Err(Error::Parse(line.to_string())),
    }
}

impl FromStr for Message {
    type Err = Error;
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
        let fields = line.split(DELIMITER).collect::<Vec<_>>();
        let malformed = || Error::Parse(line.to_string());
        match fields.as_slice() {
        | ["NEW_NODE", id, host, port, timestamp] => Ok(Message::NewNode {
            id: number(id, line)?,
            host: host.trim().to_string(),
            port: number(port, line)?,
            timestamp: logical(timestamp, line)?,
        }),
        | ["CSENTRY", id, timestamp] => Ok(Message::CsEntry {
            id: number(id, line)?,
            timestamp: logical(timestamp, line)?,
        }),
        | ["CSREPLY", id, timestamp] => Ok(Message::CsReply {
            id: number(id, line)?,
            timestamp: logical(timestamp, line)?,
        }),
        | ["DEFERRED", id, timestamp] => Ok(Message::Deferred {
            id: number(id, line)?,
            timestamp: logical(timestamp, line)?,
        }),
        | ["GOTIT", timestamp] => Ok(Message::GotIt { timestamp: logical(timestamp, line)? }),
        | ["HEARTBEAT", id] => Ok(Message::Heartbeat { id: number(id, line)? }),
        | ["HEARTBEAT_REPLY", id] => Ok(Message::HeartbeatReply { id: number(id, line)? }),
        | ["NEW_NODE", ..]
        | ["CSENTRY", ..]
        | ["CSREPLY", ..]
        | ["DEFERRED", ..]
        | ["GOTIT", ..]
        | ["HEARTBEAT", ..]
        | ["HEARTBEAT_REPLY", ..] => Err(malformed()),
        | [text @ .., timestamp] if !text.is_empty() => Ok(Message::Ack {
            text: text.join("~"),
            timestamp: logical(timestamp, line)?,
        }),
        | _ => Err(malformed()),
        }
    }
}
