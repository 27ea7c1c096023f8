//! The Rock RPC message model and wire codec.
//!
//! Messages come in three kinds: a request carries `{sn, cmd, body}`, a
//! response answers a specific `sn` with `{result, result_str, body}`, and
//! a notify is fire-and-forget. On the wire every message is framed as a
//! 4-byte network-order payload length followed by a one-byte type tag and
//! the fixed header fields, then the body bytes.
//!
//! The [`Codec`] trait is the seam between the session layer and a wire
//! protocol: sessions own the length-prefix framing and the frame-size
//! cap, codecs own the payload. [`RockCodec`] is the in-repo
//! implementation.

pub mod server;

pub use server::{RockHandler, RockServer};

use crate::error::{Error, ErrorKind, Result};
use crate::net::TcpStream;

/// Default cap on one frame's payload.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

const TYPE_REQUEST: u8 = 1;
const TYPE_RESPONSE: u8 = 2;
const TYPE_NOTIFY: u8 = 3;

/// An RPC request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Correlation sequence number.
    pub sn: u32,
    /// Command selector.
    pub cmd: u32,
    /// Opaque body bytes.
    pub body: Vec<u8>,
}

/// An RPC response, correlated to a request by `sn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Correlation sequence number of the request being answered.
    pub sn: u32,
    /// Command selector echoed from the request.
    pub cmd: u32,
    /// Application result code; zero is success.
    pub result: u32,
    /// Human-readable result annotation.
    pub result_str: String,
    /// Opaque body bytes.
    pub body: Vec<u8>,
}

/// A fire-and-forget notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    /// Notification selector.
    pub notify: u32,
    /// Opaque body bytes.
    pub body: Vec<u8>,
}

/// Any Rock message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A request expecting a correlated response.
    Request(Request),
    /// A response to an in-flight request.
    Response(Response),
    /// A fire-and-forget notification.
    Notify(Notify),
}

/// Payload codec: the session frames, the codec encodes/decodes payloads.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a message into a frame payload (no length prefix).
    fn encode(&self, message: &Message) -> Result<Vec<u8>>;

    /// Parses one complete frame payload.
    fn decode(&self, payload: &[u8]) -> Result<Message>;
}

/// The Rock wire codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct RockCodec;

impl Codec for RockCodec {
    fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(16);
        match message {
            Message::Request(req) => {
                out.push(TYPE_REQUEST);
                out.extend_from_slice(&req.sn.to_be_bytes());
                out.extend_from_slice(&req.cmd.to_be_bytes());
                out.extend_from_slice(&req.body);
            }
            Message::Response(rsp) => {
                let len = u16::try_from(rsp.result_str.len()).map_err(|_| {
                    Error::with_message(ErrorKind::Protocol, "result_str too long")
                })?;
                out.push(TYPE_RESPONSE);
                out.extend_from_slice(&rsp.sn.to_be_bytes());
                out.extend_from_slice(&rsp.cmd.to_be_bytes());
                out.extend_from_slice(&rsp.result.to_be_bytes());
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(rsp.result_str.as_bytes());
                out.extend_from_slice(&rsp.body);
            }
            Message::Notify(ntf) => {
                out.push(TYPE_NOTIFY);
                out.extend_from_slice(&ntf.notify.to_be_bytes());
                out.extend_from_slice(&ntf.body);
            }
        }
        Ok(out)
    }

    fn decode(&self, payload: &[u8]) -> Result<Message> {
        let mut cursor = Cursor::new(payload);
        let message = match cursor.u8()? {
            TYPE_REQUEST => Message::Request(Request {
                sn: cursor.u32()?,
                cmd: cursor.u32()?,
                body: cursor.rest(),
            }),
            TYPE_RESPONSE => {
                let sn = cursor.u32()?;
                let cmd = cursor.u32()?;
                let result = cursor.u32()?;
                let len = cursor.u16()? as usize;
                let raw = cursor.take(len)?;
                let result_str = String::from_utf8(raw)
                    .map_err(|_| Error::with_message(ErrorKind::Protocol, "result_str not utf-8"))?;
                Message::Response(Response {
                    sn,
                    cmd,
                    result,
                    result_str,
                    body: cursor.rest(),
                })
            }
            TYPE_NOTIFY => Message::Notify(Notify {
                notify: cursor.u32()?,
                body: cursor.rest(),
            }),
            other => {
                return Err(Error::with_message(
                    ErrorKind::Protocol,
                    format!("unknown message type {other}"),
                ))
            }
        };
        Ok(message)
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<Vec<u8>> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| Error::with_message(ErrorKind::Protocol, "truncated frame"))?;
        let slice = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn rest(&mut self) -> Vec<u8> {
        let out = self.data[self.pos..].to_vec();
        self.pos = self.data.len();
        out
    }
}

/// Reads one length-prefixed frame. `Ok(None)` is a clean close at a
/// frame boundary; a close mid-frame is an error.
pub async fn read_frame(stream: &TcpStream, max_frame: usize) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let first = stream
        .read(&mut len_buf[..1])
        .await
        .map_err(Error::from)?;
    if first == 0 {
        return Ok(None);
    }
    stream
        .read_exact(&mut len_buf[1..])
        .await
        .map_err(Error::from)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame {
        return Err(Error::with_message(
            ErrorKind::FrameTooLarge,
            format!("{len} bytes exceeds cap {max_frame}"),
        ));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.map_err(Error::from)?;
    Ok(Some(payload))
}

/// Writes one length-prefixed frame.
pub async fn write_frame(stream: &TcpStream, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::with_message(ErrorKind::FrameTooLarge, "payload exceeds u32"))?;
    stream
        .write_exact(&len.to_be_bytes())
        .await
        .map_err(Error::from)?;
    stream.write_exact(payload).await.map_err(Error::from)?;
    Ok(())
}

/// Frames and encodes a message in one step.
pub fn encode_frame<C: Codec>(codec: &C, message: &Message) -> Result<Vec<u8>> {
    let payload = codec.encode(message)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::with_message(ErrorKind::FrameTooLarge, "payload exceeds u32"))?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}
