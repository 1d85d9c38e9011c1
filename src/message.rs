//! Wire envelope exchanged between servers and clients.
//!
//! ```text
//! [u32 length][u32 id][u32 verb][u16 session length][session utf-8][body]
//! ```
//!
//! All integers are big-endian and `length` counts every byte after itself.
//! An empty session id means the message is not bound to a client session.
//! `REPLY_MUTATION` carries a bare `i32` status code, `APPLY_DIFF_RESULT` a
//! single byte and `REQUIRE_TREE` nothing; every other body is the bincode
//! encoding of its payload.

use std::io::Read;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::MalformedMessage;
use crate::ops::Mutation;
use crate::sync::{DiffResult, RequireDiff};
use crate::tree::{Difference, TreeImage};
use crate::types::ReplyStatus;

const HEADER_LEN: usize = 4 + 4 + 2;

/// Upper bound on a single frame, to refuse absurd length prefixes before
/// allocating for them.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Bincode settings for message bodies. The limit makes the decoder reject a
/// length prefix larger than a frame before it allocates for it.
fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_FRAME_LEN>()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Verb {
    Mutation = 1,
    ReplyMutation = 2,
    RequireDiff = 3,
    DiffResult = 4,
    RequireTree = 5,
    Tree = 6,
    ApplyDiff = 7,
    ApplyDiffResult = 8,
}

impl Verb {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for Verb {
    type Error = MalformedMessage;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => Verb::Mutation,
            2 => Verb::ReplyMutation,
            3 => Verb::RequireDiff,
            4 => Verb::DiffResult,
            5 => Verb::RequireTree,
            6 => Verb::Tree,
            7 => Verb::ApplyDiff,
            8 => Verb::ApplyDiffResult,
            other => return Err(MalformedMessage::UnknownVerb(other)),
        })
    }
}

/// Typed message body, one variant per verb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Mutation(Mutation),
    ReplyMutation(ReplyStatus),
    RequireDiff(RequireDiff),
    DiffResult(DiffResult),
    RequireTree,
    Tree(TreeImage),
    ApplyDiff(Difference),
    ApplyDiffResult(u8),
}

impl Payload {
    pub fn verb(&self) -> Verb {
        match self {
            Payload::Mutation(_) => Verb::Mutation,
            Payload::ReplyMutation(_) => Verb::ReplyMutation,
            Payload::RequireDiff(_) => Verb::RequireDiff,
            Payload::DiffResult(_) => Verb::DiffResult,
            Payload::RequireTree => Verb::RequireTree,
            Payload::Tree(_) => Verb::Tree,
            Payload::ApplyDiff(_) => Verb::ApplyDiff,
            Payload::ApplyDiffResult(_) => Verb::ApplyDiffResult,
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<(), MalformedMessage> {
        match self {
            Payload::Mutation(m) => encode_serde(m, out),
            Payload::ReplyMutation(status) => {
                out.extend_from_slice(&status.code().to_be_bytes());
                Ok(())
            }
            Payload::RequireDiff(r) => encode_serde(r, out),
            Payload::DiffResult(r) => encode_serde(r, out),
            Payload::RequireTree => Ok(()),
            Payload::Tree(image) => encode_serde(image, out),
            Payload::ApplyDiff(diff) => encode_serde(diff, out),
            Payload::ApplyDiffResult(code) => {
                out.push(*code);
                Ok(())
            }
        }
    }
}

type BodyDecoder = fn(&[u8]) -> Result<Payload, MalformedMessage>;

/// Single verb to decoder table.
fn decoder(verb: Verb) -> BodyDecoder {
    match verb {
        Verb::Mutation => |b| decode_serde(b).map(Payload::Mutation),
        Verb::ReplyMutation => |b| {
            let code = i32::from_be_bytes(exact::<4>(b)?);
            ReplyStatus::from_code(code)
                .map(Payload::ReplyMutation)
                .ok_or(MalformedMessage::UnknownStatus(code))
        },
        Verb::RequireDiff => |b| decode_serde(b).map(Payload::RequireDiff),
        Verb::DiffResult => |b| decode_serde(b).map(Payload::DiffResult),
        Verb::RequireTree => |b| {
            exact::<0>(b)?;
            Ok(Payload::RequireTree)
        },
        Verb::Tree => |b| decode_serde(b).map(Payload::Tree),
        Verb::ApplyDiff => |b| decode_serde(b).map(Payload::ApplyDiff),
        Verb::ApplyDiffResult => |b| {
            let [code] = exact::<1>(b)?;
            Ok(Payload::ApplyDiffResult(code))
        },
    }
}

fn encode_serde<T: Serialize>(value: &T, out: &mut Vec<u8>) -> Result<(), MalformedMessage> {
    let encoded = bincode::serde::encode_to_vec(value, wire_config())?;
    out.extend_from_slice(&encoded);
    Ok(())
}

fn decode_serde<T: DeserializeOwned>(body: &[u8]) -> Result<T, MalformedMessage> {
    let (value, read) = bincode::serde::decode_from_slice(body, wire_config())?;
    if read != body.len() {
        return Err(MalformedMessage::TrailingBytes(body.len() - read));
    }
    Ok(value)
}

fn exact<const N: usize>(body: &[u8]) -> Result<[u8; N], MalformedMessage> {
    if body.len() < N {
        return Err(MalformedMessage::Truncated {
            needed: N,
            available: body.len(),
        });
    }
    if body.len() > N {
        return Err(MalformedMessage::TrailingBytes(body.len() - N));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(body);
    Ok(out)
}

fn split(buf: &[u8], n: usize) -> Result<(&[u8], &[u8]), MalformedMessage> {
    if buf.len() < n {
        return Err(MalformedMessage::Truncated {
            needed: n,
            available: buf.len(),
        });
    }
    Ok(buf.split_at(n))
}

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

/// Process-wide request id generator.
pub fn next_id() -> u32 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u32,
    pub session_id: Option<String>,
    pub payload: Payload,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self {
            id: next_id(),
            session_id: None,
            payload,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn verb(&self) -> Verb {
        self.payload.verb()
    }

    /// Reply to this message: same id, same session.
    pub fn reply(&self, payload: Payload) -> Message {
        Message {
            id: self.id,
            session_id: self.session_id.clone(),
            payload,
        }
    }

    /// Encodes the full frame, length prefix included.
    pub fn encode(&self) -> Result<Vec<u8>, MalformedMessage> {
        let session = self.session_id.as_deref().unwrap_or("").as_bytes();
        let session_len =
            u16::try_from(session.len()).map_err(|_| MalformedMessage::SessionTooLong(session.len()))?;

        let mut out = Vec::with_capacity(4 + 4 + HEADER_LEN + session.len());
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.verb().code().to_be_bytes());
        out.extend_from_slice(&session_len.to_be_bytes());
        out.extend_from_slice(session);
        self.payload.encode_body(&mut out)?;

        let len = out.len() - 4;
        if len > MAX_FRAME_LEN {
            return Err(MalformedMessage::FrameTooLarge(len));
        }
        out[..4].copy_from_slice(&(len as u32).to_be_bytes());
        Ok(out)
    }

    /// Decodes one complete frame, length prefix included.
    pub fn decode(frame: &[u8]) -> Result<Message, MalformedMessage> {
        let (len, rest) = split(frame, 4)?;
        let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
        if rest.len() < len {
            return Err(MalformedMessage::Truncated {
                needed: len,
                available: rest.len(),
            });
        }
        if rest.len() > len {
            return Err(MalformedMessage::TrailingBytes(rest.len() - len));
        }
        Self::decode_content(rest)
    }

    /// Reads exactly one frame from a blocking stream.
    pub fn read_from(mut reader: impl Read) -> Result<Message, MalformedMessage> {
        let mut len = [0u8; 4];
        reader.read_exact(&mut len)?;
        let len = u32::from_be_bytes(len) as usize;
        if len > MAX_FRAME_LEN {
            return Err(MalformedMessage::FrameTooLarge(len));
        }
        let mut content = vec![0u8; len];
        reader.read_exact(&mut content)?;
        Self::decode_content(&content)
    }

    fn decode_content(content: &[u8]) -> Result<Message, MalformedMessage> {
        let (id, rest) = split(content, 4)?;
        let (verb, rest) = split(rest, 4)?;
        let (session_len, rest) = split(rest, 2)?;
        let session_len = u16::from_be_bytes([session_len[0], session_len[1]]) as usize;
        let (session, body) = split(rest, session_len)?;

        let id = u32::from_be_bytes([id[0], id[1], id[2], id[3]]);
        let verb = Verb::try_from(u32::from_be_bytes([verb[0], verb[1], verb[2], verb[3]]))?;
        let session_id = if session.is_empty() {
            None
        } else {
            Some(String::from_utf8(session.to_vec())?)
        };
        let payload = decoder(verb)(body)?;

        Ok(Message {
            id,
            session_id,
            payload,
        })
    }
}
