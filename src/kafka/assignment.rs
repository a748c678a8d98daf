//! Decoding of the consumer protocol `MemberAssignment` payload.
//!
//! ```text
//! MemberAssignment => version:i16 [topic:string [partition:i32]] user_data:bytes
//! ```

use crate::error::{LagError, Result};
use std::collections::BTreeMap;

/// Topic name to assigned partition indices.
pub type Assignment = BTreeMap<String, Vec<i32>>;

/// Decode a member's assignment payload.
///
/// Returns `Ok(None)` when the member has no payload yet (mid-rebalance).
/// A payload that ends early is an error, since a partial view would
/// under-count the group's lag.
pub fn decode_member_assignment(payload: Option<&[u8]>) -> Result<Option<Assignment>> {
    let Some(data) = payload.filter(|d| !d.is_empty()) else {
        return Ok(None);
    };

    let mut reader = Reader { data, pos: 0 };
    let _version = reader.read_i16("version")?;

    let mut assignment = Assignment::new();
    let topic_count = reader.read_array_len("topic count")?;
    for _ in 0..topic_count {
        let topic = reader.read_string("topic name")?;
        let partition_count = reader.read_array_len("partition count")?;
        let partitions = assignment.entry(topic).or_default();
        for _ in 0..partition_count {
            partitions.push(reader.read_i32("partition")?);
        }
    }

    reader.skip_bytes("user data")?;

    Ok(Some(assignment))
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, field: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                LagError::Decode(format!(
                    "payload truncated reading {field} at byte {} ({} bytes total)",
                    self.pos,
                    self.data.len()
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_i16(&mut self, field: &str) -> Result<i16> {
        let b = self.take(2, field)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn read_i32(&mut self, field: &str) -> Result<i32> {
        let b = self.take(4, field)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Array length; `-1` encodes a null array, read as empty.
    fn read_array_len(&mut self, field: &str) -> Result<usize> {
        match self.read_i32(field)? {
            -1 => Ok(0),
            n if n < 0 => Err(LagError::Decode(format!("negative {field}: {n}"))),
            #[allow(clippy::cast_sign_loss)]
            n => Ok(n as usize),
        }
    }

    fn read_string(&mut self, field: &str) -> Result<String> {
        let len = self.read_i16(field)?;
        if len < 0 {
            return Err(LagError::Decode(format!("null {field}")));
        }
        #[allow(clippy::cast_sign_loss)]
        let bytes = self.take(len as usize, field)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| LagError::Decode(format!("{field} is not valid UTF-8: {e}")))
    }

    fn skip_bytes(&mut self, field: &str) -> Result<()> {
        match self.read_i32(field)? {
            -1 => Ok(()),
            n if n < 0 => Err(LagError::Decode(format!("negative {field} length: {n}"))),
            #[allow(clippy::cast_sign_loss)]
            n => self.take(n as usize, field).map(|_| ()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Build a version-0 assignment payload.
    pub fn encode_assignment(topics: &[(&str, &[i32])], user_data: Option<&[u8]>) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0i16.to_be_bytes());
        buf.extend_from_slice(&(topics.len() as i32).to_be_bytes());
        for (topic, partitions) in topics {
            buf.extend_from_slice(&(topic.len() as i16).to_be_bytes());
            buf.extend_from_slice(topic.as_bytes());
            buf.extend_from_slice(&(partitions.len() as i32).to_be_bytes());
            for p in *partitions {
                buf.extend_from_slice(&p.to_be_bytes());
            }
        }
        match user_data {
            Some(data) => {
                buf.extend_from_slice(&(data.len() as i32).to_be_bytes());
                buf.extend_from_slice(data);
            }
            None => buf.extend_from_slice(&(-1i32).to_be_bytes()),
        }
        buf
    }

    #[test]
    fn test_absent_and_empty_payloads_are_none() {
        assert!(decode_member_assignment(None).unwrap().is_none());
        assert!(decode_member_assignment(Some(&[])).unwrap().is_none());
    }

    #[test]
    fn test_decodes_topics_and_partitions() {
        let payload = encode_assignment(&[("orders", &[0, 1][..]), ("payments", &[4][..])], None);
        let assignment = decode_member_assignment(Some(&payload)).unwrap().unwrap();

        assert_eq!(assignment.len(), 2);
        assert_eq!(assignment["orders"], vec![0, 1]);
        assert_eq!(assignment["payments"], vec![4]);
    }

    #[test]
    fn test_user_data_is_skipped() {
        let payload = encode_assignment(&[("orders", &[2][..])], Some(b"sticky-generation-7"));
        let assignment = decode_member_assignment(Some(&payload)).unwrap().unwrap();
        assert_eq!(assignment["orders"], vec![2]);
    }

    #[test]
    fn test_zero_topics_decodes_to_empty_assignment() {
        let payload = encode_assignment(&[], None);
        let assignment = decode_member_assignment(Some(&payload)).unwrap().unwrap();
        assert!(assignment.is_empty());
    }

    #[test]
    fn test_null_topic_array_reads_as_empty() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1i16.to_be_bytes());
        payload.extend_from_slice(&(-1i32).to_be_bytes());
        payload.extend_from_slice(&(-1i32).to_be_bytes());

        let assignment = decode_member_assignment(Some(&payload)).unwrap().unwrap();
        assert!(assignment.is_empty());
    }

    #[test]
    fn test_negative_partition_count_is_error() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0i16.to_be_bytes());
        payload.extend_from_slice(&1i32.to_be_bytes());
        payload.extend_from_slice(&1i16.to_be_bytes());
        payload.extend_from_slice(b"t");
        payload.extend_from_slice(&(-5i32).to_be_bytes());

        let err = decode_member_assignment(Some(&payload)).unwrap_err();
        assert!(matches!(err, LagError::Decode(_)));
    }

    #[test]
    fn test_truncated_payload_is_error() {
        let payload = encode_assignment(&[("orders", &[0, 1, 2][..])], None);
        let truncated = &payload[..payload.len() - 6];

        let err = decode_member_assignment(Some(truncated)).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    proptest! {
        /// Every strict, non-empty prefix of a valid payload is rejected.
        #[test]
        fn prop_any_truncation_is_rejected(
            partitions in proptest::collection::vec(0i32..1000, 0..8),
            user_data in proptest::option::of(proptest::collection::vec(any::<u8>(), 0..16)),
            cut in any::<prop::sample::Index>(),
        ) {
            let payload =
                encode_assignment(&[("topic-a", partitions.as_slice())], user_data.as_deref());
            let len = 1 + cut.index(payload.len() - 1);
            prop_assert!(decode_member_assignment(Some(&payload[..len])).is_err());
        }

        /// Arbitrary bytes never panic the decoder.
        #[test]
        fn prop_arbitrary_bytes_do_not_panic(
            bytes in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let _ = decode_member_assignment(Some(&bytes));
        }
    }
}
