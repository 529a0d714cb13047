use std::io::{Cursor, Read};

use crate::{
    btree::key::IndexKey,
    error::ShoalError,
    io::{read_exact_buf, Decodeable, Encodeable},
    storage::page::{Page, PageId, PageKind, PAGE_HEADER_SIZE, SLOT_ENTRY_SIZE},
    types::ShoalResult,
};

/// Out-of-band value location: a value-chain page plus offset and total
/// length. Values larger than the inlining threshold live there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueRef {
    pub page: PageId,
    pub offset: u16,
    pub len: u32,
}

/// One stored value: inlined in the leaf slot, or a reference into the
/// value store. Reads and writes resolve both transparently, the key order
/// never depends on which form a value takes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSlot {
    Inline(Vec<u8>),
    Ref(ValueRef),
}

const VALUE_TAG_INLINE: u8 = 0;
const VALUE_TAG_REF: u8 = 1;

impl ValueSlot {
    fn encoded_size(&self) -> usize {
        match self {
            ValueSlot::Inline(bytes) => 1 + 4 + bytes.len(),
            ValueSlot::Ref(_) => 1 + 8 + 2 + 4,
        }
    }
}

impl Encodeable for ValueSlot {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            ValueSlot::Inline(bytes) => {
                buf.push(VALUE_TAG_INLINE);
                buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                buf.extend_from_slice(bytes);
            }
            ValueSlot::Ref(r) => {
                buf.push(VALUE_TAG_REF);
                buf.extend_from_slice(&r.page.to_be_bytes());
                buf.extend_from_slice(&r.offset.to_be_bytes());
                buf.extend_from_slice(&r.len.to_be_bytes());
            }
        }
        buf
    }
}

impl Decodeable for ValueSlot {
    fn decode_from<R: Read>(reader: &mut R) -> ShoalResult<Self> {
        match u8::decode_from(reader)? {
            VALUE_TAG_INLINE => {
                let len = u32::decode_from(reader)?;
                Ok(ValueSlot::Inline(read_exact_buf(reader, len as usize)?))
            }
            VALUE_TAG_REF => Ok(ValueSlot::Ref(ValueRef {
                page: PageId::decode_from(reader)?,
                offset: u16::decode_from(reader)?,
                len: u32::decode_from(reader)?,
            })),
            other => Err(ShoalError::InvalidKey(format!(
                "unknown value slot tag {}",
                other
            ))),
        }
    }
}

/// Logical view over a leaf page: sorted keys, one value list per key
/// (non-unique indexes append to the list), and the right-sibling link that
/// threads all leaves in key order.
#[derive(Debug, Clone)]
pub struct LeafNode {
    pub keys: Vec<IndexKey>,
    pub values: Vec<Vec<ValueSlot>>,
    pub next_leaf: Option<PageId>,
}

impl LeafNode {
    pub fn empty() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            next_leaf: None,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn value_blob(values: &[ValueSlot]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(values.len() as u16).to_be_bytes());
        for v in values {
            buf.extend_from_slice(&v.encode());
        }
        buf
    }

    fn decode_value_blob(bytes: &[u8]) -> ShoalResult<Vec<ValueSlot>> {
        let mut reader = Cursor::new(bytes);
        let count = u16::decode_from(&mut reader)?;
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            values.push(ValueSlot::decode_from(&mut reader)?);
        }
        Ok(values)
    }

    pub fn entry_size(key: &IndexKey, values: &[ValueSlot]) -> usize {
        SLOT_ENTRY_SIZE
            + key.encoded_size()
            + 2
            + values.iter().map(|v| v.encoded_size()).sum::<usize>()
    }

    pub fn encoded_size(&self) -> usize {
        PAGE_HEADER_SIZE
            + self
                .keys
                .iter()
                .zip(self.values.iter())
                .map(|(k, v)| Self::entry_size(k, v))
                .sum::<usize>()
    }

    pub fn fits(&self, page_size: usize) -> bool {
        self.encoded_size() <= page_size
    }

    pub fn decode(page: &Page) -> ShoalResult<Self> {
        if page.kind()? != PageKind::Leaf {
            return Err(ShoalError::Corruption {
                page_id: page.pid(),
                detail: format!("expected leaf page, found {}", page.kind()?),
            });
        }

        let mut keys = Vec::with_capacity(page.slot_count() as usize);
        let mut values = Vec::with_capacity(page.slot_count() as usize);
        for i in 0..page.slot_count() as usize {
            let (key_offset, key_len, value_len) = page.slot(i);
            let start = key_offset as usize;
            let key_end = start + key_len as usize;
            let value_end = key_end + value_len as usize;
            let mut key_reader = Cursor::new(&page.data()[start..key_end]);
            keys.push(IndexKey::decode_from(&mut key_reader)?);
            values.push(Self::decode_value_blob(&page.data()[key_end..value_end])?);
        }

        Ok(Self {
            keys,
            values,
            next_leaf: page.right_sibling(),
        })
    }

    pub fn encode(&self, page: &mut Page) -> ShoalResult<()> {
        let page_size = page.page_size();
        if !self.fits(page_size) {
            return Err(ShoalError::Corruption {
                page_id: page.pid(),
                detail: format!(
                    "leaf with {} entries needs {} bytes, page holds {}",
                    self.len(),
                    self.encoded_size(),
                    page_size
                ),
            });
        }

        page.format(PageKind::Leaf);
        page.set_right_sibling_opt(self.next_leaf);
        page.set_slot_count(self.len() as u16);

        let mut cursor = page_size;
        for (i, (key, values)) in self.keys.iter().zip(self.values.iter()).enumerate() {
            let key_bytes = key.encode();
            let value_bytes = Self::value_blob(values);
            cursor -= key_bytes.len() + value_bytes.len();
            page.data_mut()[cursor..cursor + key_bytes.len()].copy_from_slice(&key_bytes);
            page.data_mut()
                [cursor + key_bytes.len()..cursor + key_bytes.len() + value_bytes.len()]
                .copy_from_slice(&value_bytes);
            page.set_slot(
                i,
                cursor as u16,
                key_bytes.len() as u16,
                value_bytes.len() as u32,
            );
        }
        page.set_free_offset(cursor as u16);
        Ok(())
    }

    /// Byte-balanced split point: both halves stay within a page even when
    /// entry sizes are skewed.
    pub fn split_point(&self) -> usize {
        let total: usize = self
            .keys
            .iter()
            .zip(self.values.iter())
            .map(|(k, v)| Self::entry_size(k, v))
            .sum();
        let mut acc = 0;
        for (i, (k, v)) in self.keys.iter().zip(self.values.iter()).enumerate() {
            acc += Self::entry_size(k, v);
            if acc * 2 >= total {
                return (i + 1).max(1).min(self.len() - 1);
            }
        }
        self.len() / 2
    }
}

/// Logical view over an internal page: n separator keys and n+1 children.
/// All keys under `children[i]` satisfy `keys[i-1] <= k < keys[i]`.
///
/// The leftmost child rides in the page header's right-sibling field, which
/// internal pages have no other use for; slot `i` holds `(keys[i],
/// children[i+1])`.
#[derive(Debug, Clone)]
pub struct InternalNode {
    pub keys: Vec<IndexKey>,
    pub children: Vec<PageId>,
}

impl InternalNode {
    pub fn new(keys: Vec<IndexKey>, children: Vec<PageId>) -> Self {
        debug_assert_eq!(children.len(), keys.len() + 1);
        Self { keys, children }
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Index of the child to descend into for `key`: keys equal to a
    /// separator belong to the right subtree.
    pub fn child_for(&self, key: &IndexKey) -> usize {
        self.keys.partition_point(|sep| sep <= key)
    }

    pub fn child_at(&self, idx: usize) -> PageId {
        self.children[idx]
    }

    pub fn encoded_size(&self) -> usize {
        PAGE_HEADER_SIZE
            + self
                .keys
                .iter()
                .map(|k| SLOT_ENTRY_SIZE + k.encoded_size() + 8)
                .sum::<usize>()
    }

    pub fn fits(&self, page_size: usize) -> bool {
        self.encoded_size() <= page_size
    }

    pub fn decode(page: &Page) -> ShoalResult<Self> {
        if page.kind()? != PageKind::Internal {
            return Err(ShoalError::Corruption {
                page_id: page.pid(),
                detail: format!("expected internal page, found {}", page.kind()?),
            });
        }

        let first_child = page.right_sibling().ok_or_else(|| ShoalError::Corruption {
            page_id: page.pid(),
            detail: "internal page without a leftmost child".to_string(),
        })?;

        let mut keys = Vec::with_capacity(page.slot_count() as usize);
        let mut children = Vec::with_capacity(page.slot_count() as usize + 1);
        children.push(first_child);
        for i in 0..page.slot_count() as usize {
            let (key_offset, key_len, value_len) = page.slot(i);
            if value_len != 8 {
                return Err(ShoalError::Corruption {
                    page_id: page.pid(),
                    detail: format!("internal slot {} child width {} != 8", i, value_len),
                });
            }
            let start = key_offset as usize;
            let key_end = start + key_len as usize;
            let mut key_reader = Cursor::new(&page.data()[start..key_end]);
            keys.push(IndexKey::decode_from(&mut key_reader)?);
            let mut child_reader = Cursor::new(&page.data()[key_end..key_end + 8]);
            children.push(PageId::decode_from(&mut child_reader)?);
        }

        Ok(Self { keys, children })
    }

    pub fn encode(&self, page: &mut Page) -> ShoalResult<()> {
        debug_assert_eq!(self.children.len(), self.keys.len() + 1);
        let page_size = page.page_size();
        if !self.fits(page_size) {
            return Err(ShoalError::Corruption {
                page_id: page.pid(),
                detail: format!(
                    "internal node with {} children needs {} bytes, page holds {}",
                    self.child_count(),
                    self.encoded_size(),
                    page_size
                ),
            });
        }

        page.format(PageKind::Internal);
        page.set_right_sibling(self.children[0]);
        page.set_slot_count(self.keys.len() as u16);

        let mut cursor = page_size;
        for (i, key) in self.keys.iter().enumerate() {
            let key_bytes = key.encode();
            cursor -= key_bytes.len() + 8;
            page.data_mut()[cursor..cursor + key_bytes.len()].copy_from_slice(&key_bytes);
            page.data_mut()[cursor + key_bytes.len()..cursor + key_bytes.len() + 8]
                .copy_from_slice(&self.children[i + 1].to_be_bytes());
            page.set_slot(i, cursor as u16, key_bytes.len() as u16, 8);
        }
        page.set_free_offset(cursor as u16);
        Ok(())
    }

    pub fn split_point(&self) -> usize {
        (self.keys.len() / 2).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::NO_PAGE;

    #[test]
    fn test_leaf_round_trip() {
        let mut node = LeafNode::empty();
        for i in 0..10 {
            node.keys.push(IndexKey::int(i * 3));
            node.values
                .push(vec![ValueSlot::Inline(format!("v{}", i).into_bytes())]);
        }
        node.next_leaf = Some(17);

        let mut page = Page::new_empty(5, 4096, PageKind::Leaf);
        node.encode(&mut page).unwrap();
        page.check_integrity().unwrap();

        let decoded = LeafNode::decode(&page).unwrap();
        assert_eq!(decoded.keys, node.keys);
        assert_eq!(decoded.values, node.values);
        assert_eq!(decoded.next_leaf, Some(17));
    }

    #[test]
    fn test_leaf_with_value_refs_and_lists() {
        let mut node = LeafNode::empty();
        node.keys.push(IndexKey::str("big"));
        node.values.push(vec![
            ValueSlot::Ref(ValueRef {
                page: 40,
                offset: 26,
                len: 100_000,
            }),
            ValueSlot::Inline(vec![1, 2, 3]),
        ]);

        let mut page = Page::new_empty(6, 4096, PageKind::Leaf);
        node.encode(&mut page).unwrap();
        let decoded = LeafNode::decode(&page).unwrap();
        assert_eq!(decoded.values[0].len(), 2);
        assert_eq!(
            decoded.values[0][0],
            ValueSlot::Ref(ValueRef {
                page: 40,
                offset: 26,
                len: 100_000,
            })
        );
    }

    #[test]
    fn test_leaf_overflow_is_rejected() {
        let mut node = LeafNode::empty();
        for i in 0..100 {
            node.keys.push(IndexKey::int(i));
            node.values.push(vec![ValueSlot::Inline(vec![0u8; 100])]);
        }
        let mut page = Page::new_empty(6, 4096, PageKind::Leaf);
        assert!(matches!(
            node.encode(&mut page),
            Err(ShoalError::Corruption { .. })
        ));
    }

    #[test]
    fn test_internal_round_trip_and_routing() {
        let node = InternalNode::new(
            vec![IndexKey::int(10), IndexKey::int(20), IndexKey::int(30)],
            vec![2, 3, 4, 5],
        );

        let mut page = Page::new_empty(7, 4096, PageKind::Internal);
        node.encode(&mut page).unwrap();
        page.check_integrity().unwrap();
        let decoded = InternalNode::decode(&page).unwrap();
        assert_eq!(decoded.keys, node.keys);
        assert_eq!(decoded.children, node.children);

        assert_eq!(decoded.child_for(&IndexKey::int(5)), 0);
        // a key equal to the separator routes right
        assert_eq!(decoded.child_for(&IndexKey::int(10)), 1);
        assert_eq!(decoded.child_for(&IndexKey::int(25)), 2);
        assert_eq!(decoded.child_for(&IndexKey::int(99)), 3);
        assert_ne!(decoded.children[0], NO_PAGE);
    }
}
