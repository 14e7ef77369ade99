//! The framed request/response exchange spoken between client, coordinator
//! and storage nodes.
//!
//! A request is a one byte [`Kind`], a length-prefixed name and, for
//! [`Kind::Store`], a length-prefixed payload that follows the header on the
//! stream. Every reply starts with a one byte [`Status`]. A successful fetch
//! continues with the length-prefixed content, and a failure continues with a
//! length-prefixed reason. All integers are little-endian, lengths are `i64`.
//!
//! Connections carry exactly one exchange and are closed by the initiator.

use core::fmt;
use std::io;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

/// Upper bound for names, enforced before the name is read.
pub const MAX_NAME_LEN: u64 = 4096;
/// Upper bound for failure reasons.
pub const MAX_REASON_LEN: u64 = 64 * 1024;

// Buffers for declared payloads only grow past this as bytes actually arrive.
const MAX_PREALLOC: u64 = 16 * 1024 * 1024;
// How long a rejected peer may keep sending before it is cut off.
const REJECT_LINGER: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum Kind {
    Fetch = 0,
    Store = 1,
}

impl TryFrom<i8> for Kind {
    type Error = ProtocolError;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Fetch),
            1 => Ok(Self::Store),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fetch => "fetch",
            Self::Store => "store",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum Status {
    Ok = 0,
    NotFound = 1,
    Unreachable = 2,
    Protocol = 3,
    Incomplete = 4,
    Timeout = 5,
    Failed = 6,
}

impl TryFrom<i8> for Status {
    type Error = ProtocolError;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Ok,
            1 => Self::NotFound,
            2 => Self::Unreachable,
            3 => Self::Protocol,
            4 => Self::Incomplete,
            5 => Self::Timeout,
            6 => Self::Failed,
            other => return Err(ProtocolError::UnknownStatus(other)),
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "ok",
            Self::NotFound => "not found",
            Self::Unreachable => "unreachable",
            Self::Protocol => "protocol violation",
            Self::Incomplete => "incomplete fan-out",
            Self::Timeout => "timed out",
            Self::Failed => "failure",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message kind {0}")]
    UnknownKind(i8),
    #[error("unknown response status {0}")]
    UnknownStatus(i8),
    #[error("negative length {0}")]
    NegativeLength(i64),
    #[error("length {len} exceeds the {limit} byte limit")]
    TooLong { len: u64, limit: u64 },
    #[error("payload of {len} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { len: u64, limit: u64 },
    #[error("invalid name {0:?}")]
    InvalidName(String),
    #[error("name is not valid UTF-8")]
    InvalidUtf8,
    #[error("connection closed in the middle of a frame header")]
    UnexpectedEof,
    #[error("connection closed after {received} of {expected} payload bytes")]
    Truncated { expected: u64, received: u64 },
    #[error("shard {shard} holds {actual} bytes, expected {expected}")]
    ShardSizeMismatch {
        shard: u32,
        expected: u64,
        actual: u64,
    },
}

/// Names become file names on storage nodes, so they are restricted to a
/// single, non-special path component.
pub fn validate_name(name: &str) -> Result<(), ProtocolError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(ProtocolError::InvalidName(name.into()));
    }
    Ok(())
}

/// The header of one request. A store payload is not part of the frame, it is
/// streamed right after the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Fetch { name: String },
    Store { name: String, len: u64 },
}

impl Frame {
    pub fn kind(&self) -> Kind {
        match self {
            Self::Fetch { .. } => Kind::Fetch,
            Self::Store { .. } => Kind::Store,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Fetch { name } | Self::Store { name, .. } => name,
        }
    }

    /// Bytes that follow the header on the stream.
    pub fn payload_len(&self) -> u64 {
        match self {
            Self::Fetch { .. } => 0,
            Self::Store { len, .. } => *len,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let name = self.name().as_bytes();
        let name_len = wire_len(name.len() as u64)?;
        let payload_len = match self {
            Self::Fetch { .. } => None,
            Self::Store { len, .. } => Some(wire_len(*len)?),
        };

        dst.reserve(1 + 8 + name.len() + 8);
        dst.put_i8(self.kind() as i8);
        dst.put_i64_le(name_len);
        dst.put_slice(name);
        if let Some(len) = payload_len {
            dst.put_i64_le(len);
        }
        Ok(())
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), Error> {
        let mut header = BytesMut::new();
        self.encode(&mut header)?;
        writer.write_all(&header).await?;
        Ok(())
    }

    /// Reads one request header, rejecting store payloads above `max_payload`
    /// before any of their bytes are consumed.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R, max_payload: u64) -> Result<Self, Error> {
        let kind = Kind::try_from(reader.read_i8().await.map_err(eof)?)?;
        let name = read_string(reader, MAX_NAME_LEN).await?;
        match kind {
            Kind::Fetch => Ok(Self::Fetch { name }),
            Kind::Store => {
                let len = read_len(reader).await?;
                if len > max_payload {
                    return Err(ProtocolError::PayloadTooLarge {
                        len,
                        limit: max_payload,
                    }
                    .into());
                }
                Ok(Self::Store { name, len })
            }
        }
    }
}

/// Sends a complete store request with an in-memory payload.
pub async fn write_store<W: AsyncWrite + Unpin>(
    writer: &mut W,
    name: &str,
    payload: &[u8],
) -> Result<(), Error> {
    Frame::Store {
        name: name.into(),
        len: payload.len() as u64,
    }
    .write(writer)
    .await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_ok<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), Error> {
    writer.write_i8(Status::Ok as i8).await?;
    writer.flush().await?;
    Ok(())
}

/// Starts a successful fetch reply. The caller streams exactly `len` bytes
/// afterwards.
pub async fn write_payload_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    len: u64,
) -> Result<(), Error> {
    let mut header = BytesMut::with_capacity(9);
    header.put_i8(Status::Ok as i8);
    header.put_i64_le(wire_len(len)?);
    writer.write_all(&header).await?;
    Ok(())
}

pub async fn write_payload<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), Error> {
    write_payload_header(writer, payload.len() as u64).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_failure<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: Status,
    reason: &str,
) -> Result<(), Error> {
    let reason = truncate_reason(reason).as_bytes();
    let mut reply = BytesMut::with_capacity(1 + 8 + reason.len());
    reply.put_i8(status as i8);
    reply.put_i64_le(reason.len() as i64);
    reply.put_slice(reason);
    writer.write_all(&reply).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_error<W: AsyncWrite + Unpin>(writer: &mut W, err: &Error) -> Result<(), Error> {
    write_failure(writer, err.status(), &err.to_string()).await
}

/// Answers a request that is given up on before its payload was consumed.
///
/// With `pending` known, that many bytes are discarded before replying. With
/// `pending` unknown (a header too broken to trust), the reply goes out first,
/// the write half is closed, and whatever the peer still sends is discarded
/// until it hangs up or a few seconds pass. Closing with unread bytes
/// resets the connection, and the peer would never see the reply.
pub async fn reject<S>(stream: &mut S, err: &Error, pending: Option<u64>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(len) = pending {
        if let Err(drain_err) = copy_exact(stream, &mut tokio::io::sink(), len).await {
            tracing::debug!(%drain_err, "could not drain payload");
            return;
        }
    }
    if let Err(write_err) = write_error(stream, err).await {
        tracing::debug!(%write_err, "could not report failure to peer");
        return;
    }
    if pending.is_some() {
        return;
    }

    if let Err(shutdown_err) = stream.shutdown().await {
        tracing::debug!(%shutdown_err, "could not close write half");
        return;
    }
    let mut sink = tokio::io::sink();
    let drain = tokio::io::copy(stream, &mut sink);
    match tokio::time::timeout(REJECT_LINGER, drain).await {
        Ok(Ok(discarded)) => tracing::debug!(discarded, "rejected peer hung up"),
        Ok(Err(drain_err)) => tracing::debug!(%drain_err, "could not drain rejected peer"),
        Err(_) => tracing::debug!(linger = ?REJECT_LINGER, "rejected peer kept sending"),
    }
}

/// Reads the status of a reply to a request about `name`. Failure statuses
/// are turned into errors.
pub async fn read_ack<R: AsyncRead + Unpin>(reader: &mut R, name: &str) -> Result<(), Error> {
    let status = Status::try_from(reader.read_i8().await.map_err(eof)?)?;
    if status == Status::Ok {
        return Ok(());
    }
    let reason = read_string(reader, MAX_REASON_LEN).await?;
    Err(Error::from_status(status, reason, name))
}

/// Reads the status and length of a fetch reply. The content is left on the
/// stream.
pub async fn read_payload_len<R: AsyncRead + Unpin>(
    reader: &mut R,
    name: &str,
    max_payload: u64,
) -> Result<u64, Error> {
    read_ack(reader, name).await?;
    let len = read_len(reader).await?;
    if len > max_payload {
        return Err(ProtocolError::PayloadTooLarge {
            len,
            limit: max_payload,
        }
        .into());
    }
    Ok(len)
}

pub async fn read_payload<R: AsyncRead + Unpin>(
    reader: &mut R,
    name: &str,
    max_payload: u64,
) -> Result<Bytes, Error> {
    let len = read_payload_len(reader, name, max_payload).await?;
    read_exact_payload(reader, len).await
}

/// Reads exactly `len` payload bytes into memory.
pub async fn read_exact_payload<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    len: u64,
) -> Result<Bytes, Error> {
    let mut buf = Vec::with_capacity(len.min(MAX_PREALLOC) as usize);
    let received = reader.take(len).read_to_end(&mut buf).await? as u64;
    if received < len {
        return Err(ProtocolError::Truncated {
            expected: len,
            received,
        }
        .into());
    }
    Ok(buf.into())
}

/// Copies exactly `len` bytes from `reader` to `writer`. A reader that ends
/// early is a protocol violation.
pub async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, len: u64) -> Result<(), Error>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut limited = reader.take(len);
    let received = tokio::io::copy(&mut limited, writer).await?;
    if received < len {
        return Err(ProtocolError::Truncated {
            expected: len,
            received,
        }
        .into());
    }
    Ok(())
}

/// Lengths travel as `i64`, so anything past `i64::MAX` cannot be sent.
pub(crate) fn wire_len(len: u64) -> Result<i64, ProtocolError> {
    i64::try_from(len).map_err(|_| ProtocolError::TooLong {
        len,
        limit: i64::MAX as u64,
    })
}

async fn read_len<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64, Error> {
    let len = reader.read_i64_le().await.map_err(eof)?;
    u64::try_from(len).map_err(|_| ProtocolError::NegativeLength(len).into())
}

async fn read_string<R: AsyncRead + Unpin>(reader: &mut R, limit: u64) -> Result<String, Error> {
    let len = read_len(reader).await?;
    if len > limit {
        return Err(ProtocolError::TooLong { len, limit }.into());
    }
    let mut buf = vec![0; len as usize];
    reader.read_exact(&mut buf).await.map_err(eof)?;
    String::from_utf8(buf).map_err(|_| ProtocolError::InvalidUtf8.into())
}

fn eof(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::UnexpectedEof.into()
    } else {
        err.into()
    }
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() as u64 <= MAX_REASON_LEN {
        return reason;
    }
    let mut end = MAX_REASON_LEN as usize;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
