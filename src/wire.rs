//! Mesh gossip wire codec
//!
//! Tagged-union framing: a 1-byte message type, then length-prefixed fields.
//! Integers are little-endian unsigned; strings are UTF-8 with a u16 length;
//! fingerprint bytes carry a u8 length; optional fields carry a presence
//! byte. The surrounding secure transport provides frame boundaries, so a
//! decoded buffer must contain exactly one message.

use thiserror::Error;

/// Hard cap on any encoded mesh message.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

/// Gossip protocol version carried in HELLO.
pub const PROTOCOL_VERSION: u32 = 1;

const TAG_HELLO: u8 = 1;
const TAG_REQ_DELTA: u8 = 2;
const TAG_PUSH_DELTA: u8 = 3;
const TAG_REQ_KEY: u8 = 4;
const TAG_RESP_KEY: u8 = 5;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("message exceeds {MAX_MESSAGE_LEN} bytes")]
    TooLarge,

    #[error("truncated message")]
    Truncated,

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("field too long for its length prefix")]
    FieldTooLong,
}

/// One fingerprint row as it travels in a PUSH_DELTA batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaEntry {
    /// Sender-local sequence id; strictly ascending within a batch.
    pub seq: u64,
    /// Content-addressed key, lowercase hex.
    pub key: String,
    /// Raw fingerprint bytes (16 or 32).
    pub fingerprint: Vec<u8>,
    pub size: u64,
    pub meta_flags: u32,
}

impl DeltaEntry {
    fn encoded_len(&self) -> usize {
        8 + 2 + self.key.len() + 1 + self.fingerprint.len() + 8 + 4
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshMessage {
    Hello {
        client_id: String,
        protocol_version: u32,
        latest_seq: u64,
    },
    ReqDelta {
        since_seq: u64,
        max_entries: u32,
    },
    PushDelta {
        entries: Vec<DeltaEntry>,
    },
    ReqKey {
        key: String,
    },
    RespKey {
        key: String,
        fingerprint: Option<Vec<u8>>,
        size: Option<u64>,
    },
}

/// Encode a message. Fails with [`WireError::TooLarge`] if the result would
/// exceed [`MAX_MESSAGE_LEN`]; PUSH_DELTA senders should size batches with
/// [`delta_entries_fitting`] instead of hitting this.
pub fn encode(msg: &MeshMessage) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(64);
    match msg {
        MeshMessage::Hello {
            client_id,
            protocol_version,
            latest_seq,
        } => {
            out.push(TAG_HELLO);
            put_string(&mut out, client_id)?;
            out.extend_from_slice(&protocol_version.to_le_bytes());
            out.extend_from_slice(&latest_seq.to_le_bytes());
        }
        MeshMessage::ReqDelta {
            since_seq,
            max_entries,
        } => {
            out.push(TAG_REQ_DELTA);
            out.extend_from_slice(&since_seq.to_le_bytes());
            out.extend_from_slice(&max_entries.to_le_bytes());
        }
        MeshMessage::PushDelta { entries } => {
            out.push(TAG_PUSH_DELTA);
            let count = u16::try_from(entries.len()).map_err(|_| WireError::FieldTooLong)?;
            out.extend_from_slice(&count.to_le_bytes());
            for entry in entries {
                out.extend_from_slice(&entry.seq.to_le_bytes());
                put_string(&mut out, &entry.key)?;
                put_fingerprint(&mut out, &entry.fingerprint)?;
                out.extend_from_slice(&entry.size.to_le_bytes());
                out.extend_from_slice(&entry.meta_flags.to_le_bytes());
            }
        }
        MeshMessage::ReqKey { key } => {
            out.push(TAG_REQ_KEY);
            put_string(&mut out, key)?;
        }
        MeshMessage::RespKey {
            key,
            fingerprint,
            size,
        } => {
            out.push(TAG_RESP_KEY);
            put_string(&mut out, key)?;
            match fingerprint {
                Some(fp) => {
                    out.push(1);
                    put_fingerprint(&mut out, fp)?;
                }
                None => out.push(0),
            }
            match size {
                Some(size) => {
                    out.push(1);
                    out.extend_from_slice(&size.to_le_bytes());
                }
                None => out.push(0),
            }
        }
    }
    if out.len() > MAX_MESSAGE_LEN {
        return Err(WireError::TooLarge);
    }
    Ok(out)
}

/// Decode exactly one message from `buf`.
pub fn decode(buf: &[u8]) -> Result<MeshMessage, WireError> {
    if buf.len() > MAX_MESSAGE_LEN {
        return Err(WireError::TooLarge);
    }
    let mut r = Reader { buf, pos: 0 };
    let tag = r.u8()?;
    let msg = match tag {
        TAG_HELLO => MeshMessage::Hello {
            client_id: r.string()?,
            protocol_version: r.u32()?,
            latest_seq: r.u64()?,
        },
        TAG_REQ_DELTA => MeshMessage::ReqDelta {
            since_seq: r.u64()?,
            max_entries: r.u32()?,
        },
        TAG_PUSH_DELTA => {
            let count = r.u16()?;
            let mut entries = Vec::with_capacity(usize::from(count));
            for _ in 0..count {
                entries.push(DeltaEntry {
                    seq: r.u64()?,
                    key: r.string()?,
                    fingerprint: r.fingerprint()?,
                    size: r.u64()?,
                    meta_flags: r.u32()?,
                });
            }
            MeshMessage::PushDelta { entries }
        }
        TAG_REQ_KEY => MeshMessage::ReqKey { key: r.string()? },
        TAG_RESP_KEY => {
            let key = r.string()?;
            let fingerprint = if r.u8()? != 0 {
                Some(r.fingerprint()?)
            } else {
                None
            };
            let size = if r.u8()? != 0 { Some(r.u64()?) } else { None };
            MeshMessage::RespKey {
                key,
                fingerprint,
                size,
            }
        }
        other => return Err(WireError::UnknownType(other)),
    };
    if r.pos != buf.len() {
        return Err(WireError::TrailingBytes(buf.len() - r.pos));
    }
    Ok(msg)
}

/// How many leading `entries` fit in one PUSH_DELTA without exceeding the
/// message cap.
pub fn delta_entries_fitting(entries: &[DeltaEntry]) -> usize {
    let mut used = 1 + 2; // tag + count
    for (i, entry) in entries.iter().enumerate() {
        used += entry.encoded_len();
        if used > MAX_MESSAGE_LEN {
            return i;
        }
    }
    entries.len()
}

fn put_string(out: &mut Vec<u8>, s: &str) -> Result<(), WireError> {
    let len = u16::try_from(s.len()).map_err(|_| WireError::FieldTooLong)?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_fingerprint(out: &mut Vec<u8>, fp: &[u8]) -> Result<(), WireError> {
    let len = u8::try_from(fp.len()).map_err(|_| WireError::FieldTooLong)?;
    out.push(len);
    out.extend_from_slice(fp);
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(n).ok_or(WireError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(WireError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn string(&mut self) -> Result<String, WireError> {
        let len = self.u16()?;
        let bytes = self.take(usize::from(len))?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    fn fingerprint(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.u8()?;
        Ok(self.take(usize::from(len))?.to_vec())
    }
}
