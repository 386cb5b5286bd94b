//! Error types for the wire codec.
//!
//! Decoding distinguishes two kinds of failure. [`WireError::Truncated`]
//! means "not enough bytes yet": speculative readers treat it as end of
//! stream. Every other variant means the bytes are wrong and the element
//! being decoded is lost (though, under indexed framing, its neighbours
//! are not).

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Fewer bytes remain than the value needs.
    #[error("truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the read required.
        needed: usize,
        /// Bytes left in the cursor.
        remaining: usize,
    },

    /// The leading type tag is not one this decoder understands.
    #[error("unknown type tag {0:#06x}")]
    UnknownTag(u16),

    /// A length-prefixed string was not valid UTF-8.
    #[error("string is not valid utf-8")]
    InvalidUtf8,

    /// The bytes decoded to a value outside its domain
    /// (e.g. a bool byte of 7, or offsets that run backwards).
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// No registered codec module handles this type.
    #[error("no codec registered for {0}")]
    NoCodec(String),

    /// A whole-buffer decode finished with bytes left over.
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    /// Batches nested deeper than the decoder allows.
    #[error("batches nested deeper than {0} levels")]
    TooDeep(usize),
}

impl WireError {
    /// `true` when the failure is only a lack of bytes.
    pub fn is_truncated(&self) -> bool {
        matches!(self, Self::Truncated { .. })
    }
}
