//! Primitive encoding: the [`Writer`] and [`Cursor`] byte buffers, the
//! [`Encode`]/[`Decode`] traits, and their built-in implementations.
//!
//! All multi-byte scalars are little-endian. Strings and byte blobs are
//! prefixed with a `u32` length. `Option<T>` is a `u8` presence flag
//! followed by the value.
//!
//! ```text
//! "hi"        → 02 00 00 00 68 69
//! Some(7u16)  → 01 07 00
//! [1.0f32; 2] → 00 00 80 3f 00 00 80 3f
//! ```

use crate::WireError;

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Growable output buffer that encoders write into.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a writer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Appends raw bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Appends one byte.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Appends a little-endian `u16`.
    pub fn put_u16(&mut self, v: u16) {
        self.put_bytes(&v.to_le_bytes());
    }

    /// Appends a little-endian `u32`.
    pub fn put_u32(&mut self, v: u32) {
        self.put_bytes(&v.to_le_bytes());
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// `true` if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consumes the writer, returning the encoded bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Read position over a borrowed byte slice.
///
/// A cursor may be bounded to a sub-range of its slice (see
/// [`Cursor::sub`]); reads never cross `end`.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    bytes: &'a [u8],
    position: usize,
    end: usize,
}

impl<'a> Cursor<'a> {
    /// Creates a cursor over the whole slice.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            position: 0,
            end: bytes.len(),
        }
    }

    /// Current absolute read position.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes left before `end`.
    pub fn remaining(&self) -> usize {
        self.end - self.position
    }

    /// `true` when nothing is left to read.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Moves the read position. Positions outside the cursor's window are
    /// rejected.
    pub fn seek(&mut self, position: usize) -> Result<(), WireError> {
        if position > self.end {
            return Err(WireError::InvalidValue(format!(
                "seek to {position} beyond end {}",
                self.end
            )));
        }
        self.position = position;
        Ok(())
    }

    /// Returns a new cursor restricted to `start..end` (absolute offsets
    /// within this cursor's window). Does not move `self`.
    pub fn sub(&self, start: usize, end: usize) -> Result<Cursor<'a>, WireError> {
        if start > end || end > self.end {
            return Err(WireError::InvalidValue(format!(
                "sub-range {start}..{end} outside window ..{}",
                self.end
            )));
        }
        Ok(Cursor {
            bytes: self.bytes,
            position: start,
            end,
        })
    }

    /// Takes the next `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if n > self.remaining() {
            return Err(WireError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.bytes[self.position..self.position + n];
        self.position += n;
        Ok(slice)
    }

    /// Reads the next `u16` without consuming it.
    pub fn peek_u16(&self) -> Result<u16, WireError> {
        let mut probe = self.clone();
        u16::decode(&mut probe)
    }

    /// Decodes the next value.
    pub fn read<T: Decode>(&mut self) -> Result<T, WireError> {
        T::decode(self)
    }

    /// Speculative read: a value that is cut short yields `Ok(None)` and
    /// leaves the position untouched, so trailing optional fields can be
    /// probed. Malformed bytes are still an error.
    pub fn read_optional<T: Decode>(&mut self) -> Result<Option<T>, WireError> {
        let start = self.position;
        match T::decode(self) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_truncated() => {
                self.position = start;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A value with a compact binary representation.
pub trait Encode {
    /// Exact number of bytes [`encode`](Self::encode) will write.
    fn encoded_len(&self) -> usize;

    /// Writes the value.
    fn encode(&self, w: &mut Writer);

    /// Encodes into a fresh buffer.
    fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(self.encoded_len());
        self.encode(&mut w);
        w.into_inner()
    }
}

/// A value that can be read back from its binary representation.
pub trait Decode: Sized {
    /// Reads one value, advancing the cursor.
    fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError>;
}

/// Gives a type the fixed `u16` tag that introduces it on the wire.
pub trait Tagged {
    /// The type tag.
    const TAG: u16;
}

// ---------------------------------------------------------------------------
// Bytable
// ---------------------------------------------------------------------------

/// A deferred encoding: the size is known up front, the bytes are produced
/// later by `fill`.
///
/// Lets composite encoders size their buffer once and lets codec modules
/// hand back an encoding without allocating.
pub struct Bytable<'a> {
    size: usize,
    fill: Box<dyn FnOnce(&mut Writer) + 'a>,
}

impl<'a> Bytable<'a> {
    /// Builds a bytable from an explicit size and fill function.
    pub fn new(size: usize, fill: impl FnOnce(&mut Writer) + 'a) -> Self {
        Self {
            size,
            fill: Box::new(fill),
        }
    }

    /// Defers the encoding of `value`.
    pub fn of<T: Encode + ?Sized>(value: &'a T) -> Self {
        Self::new(value.encoded_len(), move |w| value.encode(w))
    }

    /// Concatenates several bytables into one.
    pub fn chain(parts: Vec<Bytable<'a>>) -> Self {
        let size = parts.iter().map(Bytable::size).sum();
        Self::new(size, move |w| {
            for part in parts {
                part.fill(w);
            }
        })
    }

    /// Number of bytes `fill` will write.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Writes the bytes.
    pub fn fill(self, w: &mut Writer) {
        let start = w.len();
        (self.fill)(w);
        debug_assert_eq!(w.len() - start, self.size, "bytable size mismatch");
    }

    /// Produces the bytes in a buffer of exactly the right size.
    pub fn into_vec(self) -> Vec<u8> {
        let mut w = Writer::with_capacity(self.size);
        self.fill(&mut w);
        w.into_inner()
    }
}

impl std::fmt::Debug for Bytable<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bytable").field("size", &self.size).finish_non_exhaustive()
    }
}

/// Defers the encoding of `value`. Shorthand for [`Bytable::of`].
pub fn encode<T: Encode + ?Sized>(value: &T) -> Bytable<'_> {
    Bytable::of(value)
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encoded_len(&self) -> usize {
        (**self).encoded_len()
    }

    fn encode(&self, w: &mut Writer) {
        (**self).encode(w);
    }
}

// ---------------------------------------------------------------------------
// Scalars
// ---------------------------------------------------------------------------

macro_rules! impl_scalar {
    ($($ty:ty),* $(,)?) => {$(
        impl Encode for $ty {
            fn encoded_len(&self) -> usize {
                std::mem::size_of::<$ty>()
            }

            fn encode(&self, w: &mut Writer) {
                w.put_bytes(&self.to_le_bytes());
            }
        }

        impl Decode for $ty {
            fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
                let bytes = cur.take(std::mem::size_of::<$ty>())?;
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                Ok(<$ty>::from_le_bytes(raw))
            }
        }
    )*};
}

impl_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl Encode for bool {
    fn encoded_len(&self) -> usize {
        1
    }

    fn encode(&self, w: &mut Writer) {
        w.put_u8(u8::from(*self));
    }
}

impl Decode for bool {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        match u8::decode(cur)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::InvalidValue(format!("bool byte {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Fixed-size vectors
// ---------------------------------------------------------------------------

// Covers the 2/3/4-component float vectors used for positions, rotations
// and colors, and any other fixed-size array of codec values.
impl<T: Encode, const N: usize> Encode for [T; N] {
    fn encoded_len(&self) -> usize {
        self.iter().map(Encode::encoded_len).sum()
    }

    fn encode(&self, w: &mut Writer) {
        for item in self {
            item.encode(w);
        }
    }
}

impl<T: Decode + Default + Copy, const N: usize> Decode for [T; N] {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        let mut out = [T::default(); N];
        for slot in &mut out {
            *slot = T::decode(cur)?;
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Strings and blobs
// ---------------------------------------------------------------------------

fn length_prefix(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

impl Encode for str {
    fn encoded_len(&self) -> usize {
        4 + self.len()
    }

    fn encode(&self, w: &mut Writer) {
        w.put_u32(length_prefix(self.len()));
        w.put_bytes(self.as_bytes());
    }
}

impl Encode for String {
    fn encoded_len(&self) -> usize {
        self.as_str().encoded_len()
    }

    fn encode(&self, w: &mut Writer) {
        self.as_str().encode(w);
    }
}

impl Decode for String {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        let len = u32::decode(cur)? as usize;
        let bytes = cur.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }
}

impl Encode for [u8] {
    fn encoded_len(&self) -> usize {
        4 + self.len()
    }

    fn encode(&self, w: &mut Writer) {
        w.put_u32(length_prefix(self.len()));
        w.put_bytes(self);
    }
}

impl Encode for Vec<u8> {
    fn encoded_len(&self) -> usize {
        self.as_slice().encoded_len()
    }

    fn encode(&self, w: &mut Writer) {
        self.as_slice().encode(w);
    }
}

impl Decode for Vec<u8> {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        let len = u32::decode(cur)? as usize;
        Ok(cur.take(len)?.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Option
// ---------------------------------------------------------------------------

impl<T: Encode> Encode for Option<T> {
    fn encoded_len(&self) -> usize {
        1 + self.as_ref().map_or(0, Encode::encoded_len)
    }

    fn encode(&self, w: &mut Writer) {
        match self {
            Some(value) => {
                w.put_u8(1);
                value.encode(w);
            }
            None => w.put_u8(0),
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        match u8::decode(cur)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(cur)?)),
            other => Err(WireError::InvalidValue(format!("option flag {other}"))),
        }
    }
}
