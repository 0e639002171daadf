//! Beacon wire format: the four discovery messages.
//!
//! Every message starts with a 4-byte tag. Hello and Reply share one body;
//! the resource id is not part of the payload, it travels as the transport
//! stream id. ByeBye is the bare tag.
//!
//! Body layout (little-endian):
//!
//! ```text
//! category     u32 len + UTF-8
//! connection   u32 len + UTF-8
//! expiry_secs  i32            (negative = reject)
//! attr_count   i32            (0..=MAX_ATTRIBUTES)
//! attr_count × (key, value)   u32 len + UTF-8 each
//! ```
//!
//! Decoding never panics. Anything truncated, oversized or otherwise
//! implausible comes back as a [`WireError`] and the caller drops it.
//! Senders check the same limits up front with [`check_str`] and
//! [`check_attributes`]; `encode` does not re-check.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::resource::AttributeMap;

// ── Tags ──────────────────────────────────────────────────────────────────────

pub const TAG_CLIENT_QUERY: [u8; 4] = *b"BCQ1";
pub const TAG_SERVER_HELLO: [u8; 4] = *b"BCH1";
pub const TAG_SERVER_REPLY: [u8; 4] = *b"BCR1";
pub const TAG_SERVER_BYE_BYE: [u8; 4] = *b"BCB1";

// ── Limits ────────────────────────────────────────────────────────────────────

/// Upper bound on attributes per announcement.
pub const MAX_ATTRIBUTES: i32 = 1024;

/// Upper bound on any single encoded string, in bytes.
pub const MAX_STRING_LEN: u32 = 64 * 1024;

// ── Messages ──────────────────────────────────────────────────────────────────

/// Resource state as carried by Hello and Reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub category: String,
    pub connection: String,
    /// Lifetime relative to receipt. Receivers compute their own deadline.
    pub expiry_secs: i32,
    pub attributes: AttributeMap,
}

impl Announcement {
    /// Whether every receiver's decoder would accept this body.
    pub fn validate(&self) -> Result<(), WireError> {
        check_str(&self.category)?;
        check_str(&self.connection)?;
        if self.expiry_secs < 0 {
            return Err(WireError::NegativeExpiry(self.expiry_secs));
        }
        check_attributes(&self.attributes)
    }
}

/// A string the decoder will accept.
pub fn check_str(s: &str) -> Result<(), WireError> {
    match u32::try_from(s.len()) {
        Ok(len) if len <= MAX_STRING_LEN => Ok(()),
        Ok(len) => Err(WireError::StringTooLong(len)),
        Err(_) => Err(WireError::StringTooLong(u32::MAX)),
    }
}

/// An attribute map the decoder will accept.
pub fn check_attributes(attributes: &AttributeMap) -> Result<(), WireError> {
    let count = i32::try_from(attributes.len()).unwrap_or(i32::MAX);
    if count > MAX_ATTRIBUTES {
        return Err(WireError::BadAttributeCount(count));
    }
    for (key, value) in attributes {
        check_str(key)?;
        check_str(value)?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Subscriber asks owners of `category` to reply right away.
    ClientQuery { category: String },
    /// Periodic broadcast of a locally owned resource.
    ServerHello(Announcement),
    /// Unicast answer to a `ClientQuery`.
    ServerReply(Announcement),
    /// Resource withdrawn.
    ServerByeBye,
}

impl Message {
    pub fn tag(&self) -> [u8; 4] {
        match self {
            Message::ClientQuery { .. } => TAG_CLIENT_QUERY,
            Message::ServerHello(_) => TAG_SERVER_HELLO,
            Message::ServerReply(_) => TAG_SERVER_REPLY,
            Message::ServerByeBye => TAG_SERVER_BYE_BYE,
        }
    }

    /// Short name for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ClientQuery { .. } => "query",
            Message::ServerHello(_) => "hello",
            Message::ServerReply(_) => "reply",
            Message::ServerByeBye => "bye-bye",
        }
    }

    pub fn validate(&self) -> Result<(), WireError> {
        match self {
            Message::ClientQuery { category } => check_str(category),
            Message::ServerHello(ann) | Message::ServerReply(ann) => ann.validate(),
            Message::ServerByeBye => Ok(()),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(&self.tag());
        match self {
            Message::ClientQuery { category } => put_str(&mut buf, category),
            Message::ServerHello(ann) | Message::ServerReply(ann) => put_announcement(&mut buf, ann),
            Message::ServerByeBye => {}
        }
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, WireError> {
        if data.len() < 4 {
            return Err(WireError::Truncated);
        }
        let mut tag = [0u8; 4];
        data.copy_to_slice(&mut tag);
        match tag {
            TAG_CLIENT_QUERY => Ok(Message::ClientQuery {
                category: get_str(&mut data)?,
            }),
            TAG_SERVER_HELLO => Ok(Message::ServerHello(get_announcement(&mut data)?)),
            TAG_SERVER_REPLY => Ok(Message::ServerReply(get_announcement(&mut data)?)),
            TAG_SERVER_BYE_BYE => Ok(Message::ServerByeBye),
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

// ── Encoding helpers ──────────────────────────────────────────────────────────

// Lengths that do not fit saturate, so the decoder rejects them instead of
// misreading the body.
fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(u32::try_from(s.len()).unwrap_or(u32::MAX));
    buf.put_slice(s.as_bytes());
}

fn put_announcement(buf: &mut BytesMut, ann: &Announcement) {
    put_str(buf, &ann.category);
    put_str(buf, &ann.connection);
    buf.put_i32_le(ann.expiry_secs);
    buf.put_i32_le(i32::try_from(ann.attributes.len()).unwrap_or(i32::MAX));
    for (key, value) in &ann.attributes {
        put_str(buf, key);
        put_str(buf, value);
    }
}

fn get_str(data: &mut &[u8]) -> Result<String, WireError> {
    if data.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    let len = data.get_u32_le();
    if len > MAX_STRING_LEN {
        return Err(WireError::StringTooLong(len));
    }
    let len = len as usize;
    if data.remaining() < len {
        return Err(WireError::Truncated);
    }
    let text = std::str::from_utf8(&data[..len])
        .map_err(|_| WireError::InvalidUtf8)?
        .to_owned();
    data.advance(len);
    Ok(text)
}

fn get_announcement(data: &mut &[u8]) -> Result<Announcement, WireError> {
    let category = get_str(data)?;
    let connection = get_str(data)?;
    if data.remaining() < 8 {
        return Err(WireError::Truncated);
    }
    let expiry_secs = data.get_i32_le();
    if expiry_secs < 0 {
        return Err(WireError::NegativeExpiry(expiry_secs));
    }
    let count = data.get_i32_le();
    if !(0..=MAX_ATTRIBUTES).contains(&count) {
        return Err(WireError::BadAttributeCount(count));
    }
    let mut attributes = AttributeMap::new();
    for _ in 0..count {
        let key = get_str(data)?;
        let value = get_str(data)?;
        attributes.insert(key, value);
    }
    Ok(Announcement {
        category,
        connection,
        expiry_secs,
        attributes,
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Reasons a payload is rejected. None of these are fatal to the receiver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("message truncated")]
    Truncated,

    #[error("unknown message tag: {0:02x?}")]
    UnknownTag([u8; 4]),

    #[error("string length {0} exceeds maximum {}", MAX_STRING_LEN)]
    StringTooLong(u32),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("negative expiry: {0}")]
    NegativeExpiry(i32),

    #[error("attribute count {0} outside 0..={}", MAX_ATTRIBUTES)]
    BadAttributeCount(i32),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
