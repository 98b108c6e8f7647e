/*!
 * Reply Objects
 *
 * Replies queued for a client are byte payloads with an encoding tag.
 * A payload is either exclusively owned (and therefore appendable), shared
 * between clients through a refcounted buffer, or one of the preallocated
 * wire constants. Integer-encoded replies carry the logical value and are
 * decoded to their decimal byte form on demand.
 */

use bytes::{Bytes, BytesMut};

/// Byte payload of a reply, tagged by ownership.
///
/// Only `Owned` payloads may ever be mutated. `Shared` and `Static` payloads
/// can be queued on several clients at once; appending to one first goes
/// through [`Payload::make_unique`], which replaces it with a private copy.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Exclusively owned, append-friendly bytes.
    Owned(BytesMut),
    /// Refcount-shared immutable bytes.
    Shared(Bytes),
    /// Preallocated wire constant.
    Static(&'static [u8]),
}

impl Payload {
    /// Copy a slice into a new shared payload.
    pub fn from_slice(s: &[u8]) -> Payload {
        Payload::Shared(Bytes::copy_from_slice(s))
    }

    /// Copy a slice into a new owned payload.
    pub fn owned(s: &[u8]) -> Payload {
        Payload::Owned(BytesMut::from(s))
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Owned(b) => b,
            Payload::Shared(b) => b,
            Payload::Static(s) => s,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocation size of the payload, used for output memory accounting.
    /// Shared and static payloads are charged their length.
    #[inline]
    pub fn alloc_size(&self) -> usize {
        match self {
            Payload::Owned(b) => b.capacity(),
            Payload::Shared(b) => b.len(),
            Payload::Static(s) => s.len(),
        }
    }

    /// Make the payload privately owned, cloning shared or static bytes.
    /// Owned payloads are returned as-is.
    pub fn make_unique(&mut self) -> &mut BytesMut {
        if !matches!(self, Payload::Owned(_)) {
            let copy = BytesMut::from(self.as_slice());
            *self = Payload::Owned(copy);
        }
        match self {
            Payload::Owned(b) => b,
            _ => unreachable!(),
        }
    }

    /// Append bytes, cloning first if the payload is not exclusively owned.
    pub fn append(&mut self, s: &[u8]) {
        self.make_unique().extend_from_slice(s);
    }
}

/// A reply object: raw bytes directly emittable on the wire, or an integer
/// whose decimal form is produced on demand.
#[derive(Debug, Clone)]
pub enum Reply {
    Raw(Payload),
    Int(i64),
}

impl Reply {
    pub fn raw(p: Payload) -> Reply {
        Reply::Raw(p)
    }

    /// Copy a slice into a raw reply.
    pub fn from_slice(s: &[u8]) -> Reply {
        Reply::Raw(Payload::from_slice(s))
    }

    pub fn integer(n: i64) -> Reply {
        Reply::Int(n)
    }

    #[inline]
    pub fn is_raw(&self) -> bool {
        matches!(self, Reply::Raw(_))
    }

    /// Decode to a raw payload. Raw replies hand out a cheap clone of their
    /// payload; integers are formatted into a fresh owned buffer.
    pub fn decoded(&self) -> Payload {
        match self {
            Reply::Raw(p) => p.clone(),
            Reply::Int(n) => Payload::Owned(BytesMut::from(n.to_string().as_bytes())),
        }
    }

    /// Length of the decoded byte form.
    pub fn decoded_len(&self) -> usize {
        match self {
            Reply::Raw(p) => p.len(),
            Reply::Int(n) => n.to_string().len(),
        }
    }
}

/// Preallocated replies for the most common responses. These are static:
/// queueing one on any number of clients never allocates, and the coalescer
/// copies them before it would ever append.
pub mod shared {
    use super::{Payload, Reply};

    pub const OK: &[u8] = b"+OK\r\n";
    pub const PONG: &[u8] = b"+PONG\r\n";
    pub const CRLF: &[u8] = b"\r\n";
    pub const CZERO: &[u8] = b":0\r\n";
    pub const CONE: &[u8] = b":1\r\n";
    pub const NULL_BULK: &[u8] = b"$-1\r\n";

    pub fn ok() -> Reply {
        Reply::Raw(Payload::Static(OK))
    }

    pub fn pong() -> Reply {
        Reply::Raw(Payload::Static(PONG))
    }

    pub fn crlf() -> Reply {
        Reply::Raw(Payload::Static(CRLF))
    }

    pub fn czero() -> Reply {
        Reply::Raw(Payload::Static(CZERO))
    }

    pub fn cone() -> Reply {
        Reply::Raw(Payload::Static(CONE))
    }

    pub fn null_bulk() -> Reply {
        Reply::Raw(Payload::Static(NULL_BULK))
    }
}
