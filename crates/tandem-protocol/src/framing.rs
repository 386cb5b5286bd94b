//! Collection framings.
//!
//! Two layouts, chosen by the encoder:
//!
//! ```text
//! Counted:  tag:u16 | count:u32 | element … element
//! Indexed:  tag:u16 | count:u32 | offsets:[u32; count + 1] | element … element
//! ```
//!
//! **Counted** ([`CountArray`]) is for homogeneous elements: the decoder
//! reads them back to back, so it must understand every one.
//!
//! **Indexed** ([`IndexesArray`]) is for heterogeneous or variable-length
//! elements. Offsets are relative to the start of the element region and the
//! last entry marks its end, so a reader can jump to any element's boundary
//! without parsing what comes before it. An element the reader cannot
//! decode costs only that element.

use crate::wire::{Cursor, Decode, Encode, Tagged, Writer};
use crate::WireError;

// ---------------------------------------------------------------------------
// Counted
// ---------------------------------------------------------------------------

/// A homogeneous collection with counted framing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CountArray<T>(pub Vec<T>);

impl<T> CountArray<T> {
    /// Consumes the array, returning its elements.
    pub fn into_inner(self) -> Vec<T> {
        self.0
    }
}

impl<T> From<Vec<T>> for CountArray<T> {
    fn from(items: Vec<T>) -> Self {
        Self(items)
    }
}

impl<T: Encode + Tagged> Encode for CountArray<T> {
    fn encoded_len(&self) -> usize {
        2 + 4 + self.0.iter().map(Encode::encoded_len).sum::<usize>()
    }

    fn encode(&self, w: &mut Writer) {
        w.put_u16(T::TAG);
        w.put_u32(count_of(self.0.len()));
        for item in &self.0 {
            item.encode(w);
        }
    }
}

impl<T: Decode + Tagged> Decode for CountArray<T> {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        let tag = u16::decode(cur)?;
        if tag != T::TAG {
            return Err(WireError::UnknownTag(tag));
        }
        let count = u32::decode(cur)? as usize;
        // Every element takes at least one byte; never trust `count` for
        // the allocation beyond what the buffer could hold.
        let mut items = Vec::with_capacity(count.min(cur.remaining()));
        for _ in 0..count {
            items.push(T::decode(cur)?);
        }
        Ok(Self(items))
    }
}

// ---------------------------------------------------------------------------
// Indexed
// ---------------------------------------------------------------------------

/// A collection with indexed framing.
///
/// `T` is typically a sum type whose variants carry their own leading tag,
/// making the collection heterogeneous on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexesArray<T> {
    /// Tag identifying the kind of collection.
    pub tag: u16,
    /// The elements.
    pub items: Vec<T>,
}

impl<T> IndexesArray<T> {
    /// Creates an indexed collection with the given tag.
    pub fn new(tag: u16, items: Vec<T>) -> Self {
        Self { tag, items }
    }
}

impl<T: Encode> Encode for IndexesArray<T> {
    fn encoded_len(&self) -> usize {
        let n = self.items.len();
        2 + 4 + 4 * (n + 1) + self.items.iter().map(Encode::encoded_len).sum::<usize>()
    }

    fn encode(&self, w: &mut Writer) {
        w.put_u16(self.tag);
        w.put_u32(count_of(self.items.len()));
        let mut offset = 0usize;
        w.put_u32(0);
        for item in &self.items {
            offset += item.encoded_len();
            w.put_u32(count_of(offset));
        }
        for item in &self.items {
            item.encode(w);
        }
    }
}

impl<T: Decode> IndexesArray<T> {
    /// Decodes every element independently.
    ///
    /// The outer `Result` fails only if the header or offset table is
    /// unusable. Each inner `Result` is one element: a failure there leaves
    /// the other elements intact.
    pub fn decode_partial(
        cur: &mut Cursor<'_>,
        expected_tag: u16,
    ) -> Result<Vec<Result<T, WireError>>, WireError> {
        let reader = IndexedReader::open(cur, expected_tag)?;
        Ok(reader
            .map(|element| element.and_then(|mut sub| T::decode(&mut sub)))
            .collect())
    }

    /// Decodes every element, failing on the first one that does not decode.
    pub fn decode_strict(cur: &mut Cursor<'_>, expected_tag: u16) -> Result<Self, WireError> {
        let items = Self::decode_partial(cur, expected_tag)?
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(expected_tag, items))
    }
}

/// Iterates over the element windows of an indexed collection.
///
/// Each item is a cursor bounded to exactly one element, so a caller can
/// decode it, inspect its tag, or skip it. Opening the reader moves the
/// parent cursor past the whole collection.
#[derive(Debug)]
pub struct IndexedReader<'a> {
    region: Cursor<'a>,
    region_start: usize,
    offsets: Vec<usize>,
    next: usize,
}

impl<'a> IndexedReader<'a> {
    /// Reads the header and offset table, validating that offsets never run
    /// backwards and stay within the buffer.
    pub fn open(cur: &mut Cursor<'a>, expected_tag: u16) -> Result<Self, WireError> {
        let tag = u16::decode(cur)?;
        if tag != expected_tag {
            return Err(WireError::UnknownTag(tag));
        }
        let count = u32::decode(cur)? as usize;
        // The offset table alone needs 4 * (count + 1) bytes.
        let table_len = count
            .checked_add(1)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| WireError::InvalidValue(format!("count {count} overflows")))?;
        if table_len > cur.remaining() {
            return Err(WireError::Truncated {
                needed: table_len,
                remaining: cur.remaining(),
            });
        }

        let mut offsets = Vec::with_capacity(count + 1);
        for _ in 0..=count {
            offsets.push(u32::decode(cur)? as usize);
        }
        if offsets.first() != Some(&0) {
            return Err(WireError::InvalidValue("first offset must be 0".into()));
        }
        if offsets.windows(2).any(|pair| pair[1] < pair[0]) {
            return Err(WireError::InvalidValue("offsets run backwards".into()));
        }

        let region_start = cur.position();
        let region_len = offsets[count];
        let region = cur.sub(region_start, region_start + region_len).map_err(|_| {
            WireError::Truncated {
                needed: region_len,
                remaining: cur.remaining(),
            }
        })?;
        cur.seek(region_start + region_len)?;

        Ok(Self {
            region,
            region_start,
            offsets,
            next: 0,
        })
    }

    /// Number of elements in the collection.
    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    /// `true` if the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'a> Iterator for IndexedReader<'a> {
    type Item = Result<Cursor<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.len() {
            return None;
        }
        let start = self.region_start + self.offsets[self.next];
        let end = self.region_start + self.offsets[self.next + 1];
        self.next += 1;
        Some(self.region.sub(start, end))
    }
}

fn count_of(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Sample(u32);

    impl Tagged for Sample {
        const TAG: u16 = 0x0042;
    }

    impl Encode for Sample {
        fn encoded_len(&self) -> usize {
            4
        }

        fn encode(&self, w: &mut Writer) {
            self.0.encode(w);
        }
    }

    impl Decode for Sample {
        fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
            Ok(Self(u32::decode(cur)?))
        }
    }

    /// A record that only decodes when its first byte is an even number,
    /// standing in for a kind this reader does not understand.
    #[derive(Debug, Clone, PartialEq)]
    struct Picky(Vec<u8>);

    impl Encode for Picky {
        fn encoded_len(&self) -> usize {
            self.0.len()
        }

        fn encode(&self, w: &mut Writer) {
            w.put_bytes(&self.0);
        }
    }

    impl Decode for Picky {
        fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
            let first = u8::decode(cur)?;
            if first % 2 == 1 {
                return Err(WireError::UnknownTag(u16::from(first)));
            }
            let rest = cur.take(cur.remaining())?;
            let mut bytes = vec![first];
            bytes.extend_from_slice(rest);
            Ok(Self(bytes))
        }
    }

    #[test]
    fn test_count_array_round_trip() {
        let array = CountArray(vec![Sample(1), Sample(2), Sample(3)]);
        let bytes = array.to_bytes();
        assert_eq!(bytes.len(), array.encoded_len());
        let decoded = CountArray::<Sample>::decode(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(decoded, array);
    }

    #[test]
    fn test_count_array_wrong_tag_rejected() {
        let mut bytes = CountArray(vec![Sample(1)]).to_bytes();
        bytes[0] = 0x99;
        let err = CountArray::<Sample>::decode(&mut Cursor::new(&bytes)).unwrap_err();
        assert!(matches!(err, WireError::UnknownTag(_)));
    }

    #[test]
    fn test_count_array_truncated_element() {
        let bytes = CountArray(vec![Sample(1), Sample(2)]).to_bytes();
        let cut = &bytes[..bytes.len() - 1];
        let err = CountArray::<Sample>::decode(&mut Cursor::new(cut)).unwrap_err();
        assert!(err.is_truncated());
    }

    #[test]
    fn test_indexes_array_layout() {
        let array = IndexesArray::new(7, vec![Sample(1), Sample(2)]);
        let bytes = array.to_bytes();
        // tag(2) + count(4) + offsets 3×4 + elements 2×4
        assert_eq!(bytes.len(), 2 + 4 + 12 + 8);
        assert_eq!(&bytes[6..18], &[0, 0, 0, 0, 4, 0, 0, 0, 8, 0, 0, 0]);
    }

    #[test]
    fn test_indexes_array_skips_undecodable_record() {
        // Record 2 starts with an odd byte and cannot be decoded.
        let records = vec![
            Picky(vec![0, 1, 2]),
            Picky(vec![2]),
            Picky(vec![3, 9, 9, 9, 9]),
            Picky(vec![4, 4]),
            Picky(vec![6, 1, 1, 1]),
        ];
        let bytes = IndexesArray::new(0x0300, records.clone()).to_bytes();

        let mut cur = Cursor::new(&bytes);
        let decoded = IndexesArray::<Picky>::decode_partial(&mut cur, 0x0300).unwrap();

        assert_eq!(decoded.len(), 5);
        for (k, result) in decoded.iter().enumerate() {
            if k == 2 {
                assert!(result.is_err(), "record 2 should fail");
            } else {
                assert_eq!(result.as_ref().unwrap(), &records[k]);
            }
        }
        assert!(cur.is_empty(), "cursor should sit past the collection");
    }

    #[test]
    fn test_indexes_array_strict_fails_on_bad_record() {
        let records = vec![Picky(vec![0]), Picky(vec![1])];
        let bytes = IndexesArray::new(1, records).to_bytes();
        assert!(IndexesArray::<Picky>::decode_strict(&mut Cursor::new(&bytes), 1).is_err());
    }

    #[test]
    fn test_indexes_array_followed_by_more_data() {
        let mut w = Writer::new();
        IndexesArray::new(5, vec![Sample(10)]).encode(&mut w);
        77u8.encode(&mut w);
        let bytes = w.into_inner();

        let mut cur = Cursor::new(&bytes);
        let items = IndexesArray::<Sample>::decode_strict(&mut cur, 5).unwrap();
        assert_eq!(items.items, vec![Sample(10)]);
        assert_eq!(cur.read::<u8>().unwrap(), 77);
    }

    #[test]
    fn test_indexed_reader_rejects_backwards_offsets() {
        let mut w = Writer::new();
        w.put_u16(1);
        w.put_u32(2);
        for offset in [0u32, 4, 2] {
            w.put_u32(offset);
        }
        w.put_bytes(&[0; 4]);
        let bytes = w.into_inner();
        let err = IndexedReader::open(&mut Cursor::new(&bytes), 1).unwrap_err();
        assert!(matches!(err, WireError::InvalidValue(_)));
    }

    #[test]
    fn test_indexed_reader_truncated_region() {
        let bytes = IndexesArray::new(1, vec![Sample(1), Sample(2)]).to_bytes();
        let cut = &bytes[..bytes.len() - 2];
        let err = IndexedReader::open(&mut Cursor::new(cut), 1).unwrap_err();
        assert!(err.is_truncated());
    }

    #[test]
    fn test_indexed_reader_huge_count_is_truncated_not_oom() {
        let mut w = Writer::new();
        w.put_u16(1);
        w.put_u32(u32::MAX);
        let bytes = w.into_inner();
        let err = IndexedReader::open(&mut Cursor::new(&bytes), 1).unwrap_err();
        assert!(err.is_truncated());
    }
}
