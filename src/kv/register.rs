use std::io::Read;

use bytes::Bytes;

use crate::{
    hlc::HlcTimestamp,
    io::{read_exact_buf, Decodeable, Encodeable},
    types::ShoalResult,
};

/// A last-writer-wins register: the stored value plus the timestamp of the
/// write that produced it.
///
/// Merge rule: the entry with the greater `(ts, value bytes)` wins — the
/// byte-lexicographic comparison only kicks in to break exact timestamp
/// ties deterministically across replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LwwRegister {
    pub value: Bytes,
    pub ts: HlcTimestamp,
}

impl LwwRegister {
    pub fn new(value: Bytes, ts: HlcTimestamp) -> Self {
        Self { value, ts }
    }

    /// Merge-ordering rank.
    pub fn rank(&self) -> (HlcTimestamp, &[u8]) {
        (self.ts, &self.value)
    }
}

/// # Format
///
/// value_length (4B BE) | value bytes | ts (16B HLC)
impl Encodeable for LwwRegister {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.value.len() + 16);
        buf.extend_from_slice(&(self.value.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.value);
        buf.extend_from_slice(&self.ts.encode());
        buf
    }
}

impl Decodeable for LwwRegister {
    fn decode_from<R: Read>(reader: &mut R) -> ShoalResult<Self> {
        let len = u32::decode_from(reader)?;
        let value = read_exact_buf(reader, len as usize)?;
        let ts = HlcTimestamp::decode_from(reader)?;
        Ok(Self {
            value: Bytes::from(value),
            ts,
        })
    }
}

/// True when the candidate `(ts, value)` beats the incumbent under the LWW
/// ordering.
pub fn lww_wins(
    candidate_ts: HlcTimestamp,
    candidate_value: &[u8],
    incumbent_ts: HlcTimestamp,
    incumbent_value: &[u8],
) -> bool {
    (candidate_ts, candidate_value) > (incumbent_ts, incumbent_value)
}
