//! Outbound commands.
//!
//! Each [`Command`] has a byte-exact line encoding and a declared set of
//! success and error responses. The sets determine how long a caller waits
//! after writing it, see [`ResponseClass`].
//!
//! ```text
//! PUB <topic>\n  [ 4-byte size ][ body ]
//! MPUB <topic>\n [ 4-byte size ][ 4-byte count ]([ 4-byte size ][ body ])*
//! IDENTIFY\n     [ 4-byte size ][ JSON ]
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::frame::{Frame, MessageId};
use crate::error::{NsqError, Result};

/// How a caller waits after transmitting a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// Nothing comes back; fire-and-forget.
    None,
    /// Only failures are answered; silence means success.
    ErrorOnly,
    /// A response always follows.
    Required,
}

/// Outbound protocol command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Feature negotiation with a JSON body.
    Identify(Bytes),
    /// Authentication secret.
    Auth(Bytes),
    /// Subscribe to a topic/channel.
    Sub { topic: String, channel: String },
    /// Publish one message.
    Pub { topic: String, body: Bytes },
    /// Publish several messages at once.
    Mpub { topic: String, bodies: Vec<Bytes> },
    /// Update readiness.
    Rdy(u64),
    /// Finish (confirm) a message.
    Fin(MessageId),
    /// Requeue a message with a delay in milliseconds.
    Req { id: MessageId, timeout_ms: u64 },
    /// Reset a message's server-side timeout.
    Touch(MessageId),
    /// Start a graceful close.
    Cls,
    /// No-op, answers heartbeats.
    Nop,
}

const OK: &[&str] = &["OK"];
const NONE: &[&str] = &[];

impl Command {
    /// Protocol name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Identify(_) => "IDENTIFY",
            Command::Auth(_) => "AUTH",
            Command::Sub { .. } => "SUB",
            Command::Pub { .. } => "PUB",
            Command::Mpub { .. } => "MPUB",
            Command::Rdy(_) => "RDY",
            Command::Fin(_) => "FIN",
            Command::Req { .. } => "REQ",
            Command::Touch(_) => "TOUCH",
            Command::Cls => "CLS",
            Command::Nop => "NOP",
        }
    }

    /// Responses that mean success.
    pub fn ok_responses(&self) -> &'static [&'static str] {
        match self {
            Command::Identify(_)
            | Command::Auth(_)
            | Command::Sub { .. }
            | Command::Pub { .. }
            | Command::Mpub { .. } => OK,
            Command::Cls => &["CLOSE_WAIT"],
            _ => NONE,
        }
    }

    /// Error codes the server may answer with.
    pub fn error_responses(&self) -> &'static [&'static str] {
        match self {
            Command::Identify(_) => &["E_INVALID", "E_BAD_BODY"],
            Command::Auth(_) => &["E_AUTH_FAILED", "E_UNAUTHORIZED"],
            Command::Sub { .. } => &["E_INVALID", "E_BAD_TOPIC", "E_BAD_CHANNEL"],
            Command::Pub { .. } => &["E_INVALID", "E_BAD_TOPIC", "E_BAD_MESSAGE", "E_PUB_FAILED"],
            Command::Mpub { .. } => &[
                "E_INVALID",
                "E_BAD_TOPIC",
                "E_BAD_BODY",
                "E_BAD_MESSAGE",
                "E_MPUB_FAILED",
            ],
            Command::Rdy(_) | Command::Cls => &["E_INVALID"],
            Command::Fin(_) => &["E_INVALID", "E_FIN_FAILED"],
            Command::Req { .. } => &["E_INVALID", "E_REQ_FAILED"],
            Command::Touch(_) | Command::Nop => NONE,
        }
    }

    /// Response class derived from the declared response sets.
    pub fn response_class(&self) -> ResponseClass {
        if !self.ok_responses().is_empty() {
            ResponseClass::Required
        } else if !self.error_responses().is_empty() {
            ResponseClass::ErrorOnly
        } else {
            ResponseClass::None
        }
    }

    /// Check a response frame against the declared sets.
    ///
    /// Error frames and responses listed as errors become
    /// [`NsqError::BadResponse`].
    pub fn check_response(&self, frame: &Frame) -> Result<()> {
        match frame {
            Frame::Error(data) => Err(NsqError::BadResponse {
                command: self.name(),
                error: String::from_utf8_lossy(data).into_owned(),
            }),
            Frame::Response(data) => {
                let text = String::from_utf8_lossy(data);
                let code = text.split_whitespace().next().unwrap_or_default();
                if self.error_responses().contains(&code) {
                    Err(NsqError::BadResponse {
                        command: self.name(),
                        error: text.into_owned(),
                    })
                } else {
                    Ok(())
                }
            }
            Frame::Message(message) => Err(NsqError::MalformedFrame(format!(
                "message {} arrived in response slot for {}",
                message.id,
                self.name()
            ))),
        }
    }

    /// Encode to wire bytes.
    ///
    /// # Example
    ///
    /// ```
    /// use nsq_client::protocol::Command;
    /// use bytes::Bytes;
    ///
    /// let cmd = Command::Pub { topic: "t".into(), body: Bytes::from_static(b"hi") };
    /// assert_eq!(&cmd.encode()[..], b"PUB t\n\x00\x00\x00\x02hi");
    /// ```
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Command::Identify(body) => {
                buf.put_slice(b"IDENTIFY\n");
                put_sized(&mut buf, body);
            }
            Command::Auth(secret) => {
                buf.put_slice(b"AUTH\n");
                put_sized(&mut buf, secret);
            }
            Command::Sub { topic, channel } => {
                buf.put_slice(format!("SUB {} {}\n", topic, channel).as_bytes());
            }
            Command::Pub { topic, body } => {
                buf.put_slice(format!("PUB {}\n", topic).as_bytes());
                put_sized(&mut buf, body);
            }
            Command::Mpub { topic, bodies } => {
                buf.put_slice(format!("MPUB {}\n", topic).as_bytes());
                let messages_len: usize = bodies.iter().map(|b| 4 + b.len()).sum();
                buf.reserve(8 + messages_len);
                buf.put_u32((4 + messages_len) as u32);
                buf.put_u32(bodies.len() as u32);
                for body in bodies {
                    put_sized(&mut buf, body);
                }
            }
            Command::Rdy(count) => buf.put_slice(format!("RDY {}\n", count).as_bytes()),
            Command::Fin(id) => put_id_line(&mut buf, "FIN", id, None),
            Command::Req { id, timeout_ms } => put_id_line(&mut buf, "REQ", id, Some(*timeout_ms)),
            Command::Touch(id) => put_id_line(&mut buf, "TOUCH", id, None),
            Command::Cls => buf.put_slice(b"CLS\n"),
            Command::Nop => buf.put_slice(b"NOP\n"),
        }
        buf.freeze()
    }
}

fn put_sized(buf: &mut BytesMut, data: &[u8]) {
    buf.reserve(4 + data.len());
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn put_id_line(buf: &mut BytesMut, name: &str, id: &MessageId, arg: Option<u64>) {
    buf.put_slice(name.as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(id.as_bytes());
    if let Some(arg) = arg {
        buf.put_slice(format!(" {}", arg).as_bytes());
    }
    buf.put_u8(b'\n');
}

/// Maximum topic/channel name length.
pub const MAX_NAME_LENGTH: usize = 64;

/// Validate a topic or channel name.
///
/// Names are 1 to 64 characters of `[.a-zA-Z0-9_-]`, optionally ending in
/// `#ephemeral`.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    let base = name.strip_suffix("#ephemeral").unwrap_or(name);
    let valid_chars = base
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if name.is_empty() || name.len() > MAX_NAME_LENGTH || base.is_empty() || !valid_chars {
        return Err(NsqError::Configuration(format!(
            "invalid {} name {:?}",
            kind, name
        )));
    }
    Ok(())
}
