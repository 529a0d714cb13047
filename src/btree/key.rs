use std::{fmt, io::Read};

use crate::{
    error::ShoalError,
    io::{read_exact_buf, Decodeable, Encodeable},
    types::ShoalResult,
};

/// Component types an index key may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Int = 0,
    Bytes = 1,
    Str = 2,
}

impl KeyType {
    pub fn from_u8(v: u8) -> Option<KeyType> {
        match v {
            0 => Some(KeyType::Int),
            1 => Some(KeyType::Bytes),
            2 => Some(KeyType::Str),
            _ => None,
        }
    }
}

/// One component of a (possibly compound) key.
///
/// The derived ordering compares same-type components naturally; the
/// variant rank only matters for maps that mix types, which the schema
/// check forbids inside one index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyComponent {
    Int(i64),
    Bytes(Vec<u8>),
    Str(String),
}

impl KeyComponent {
    pub fn key_type(&self) -> KeyType {
        match self {
            KeyComponent::Int(_) => KeyType::Int,
            KeyComponent::Bytes(_) => KeyType::Bytes,
            KeyComponent::Str(_) => KeyType::Str,
        }
    }
}

impl fmt::Display for KeyComponent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyComponent::Int(v) => write!(f, "{}", v),
            KeyComponent::Bytes(v) => write!(f, "0x{}", hex::encode(v)),
            KeyComponent::Str(v) => write!(f, "{:?}", v),
        }
    }
}

/// An index key: an ordered tuple of components compared lexicographically,
/// left to right. Scalar keys are one-component tuples. The component count
/// is fixed per index by its schema.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey {
    components: Vec<KeyComponent>,
}

impl IndexKey {
    pub fn new(components: Vec<KeyComponent>) -> Self {
        Self { components }
    }

    pub fn int(v: i64) -> Self {
        Self::new(vec![KeyComponent::Int(v)])
    }

    pub fn str(v: &str) -> Self {
        Self::new(vec![KeyComponent::Str(v.to_string())])
    }

    pub fn bytes(v: &[u8]) -> Self {
        Self::new(vec![KeyComponent::Bytes(v.to_vec())])
    }

    pub fn components(&self) -> &[KeyComponent] {
        &self.components
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// True when `prefix` matches the leading components of this key.
    pub fn starts_with(&self, prefix: &IndexKey) -> bool {
        self.components.len() >= prefix.components.len()
            && self.components[..prefix.components.len()] == prefix.components[..]
    }

    pub fn encoded_size(&self) -> usize {
        self.encode().len()
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.components.len() == 1 {
            return write!(f, "{}", self.components[0]);
        }
        write!(f, "(")?;
        for (i, c) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", c)?;
        }
        write!(f, ")")
    }
}

/// # Format
///
/// - 1 byte: component count
/// - per component: 1 byte type tag, then
///   - Int: 8 bytes big-endian two's complement
///   - Bytes/Str: 2 bytes big-endian length + payload
impl Encodeable for IndexKey {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.components.len() as u8);
        for c in &self.components {
            buf.push(c.key_type() as u8);
            match c {
                KeyComponent::Int(v) => buf.extend_from_slice(&v.to_be_bytes()),
                KeyComponent::Bytes(v) => {
                    buf.extend_from_slice(&(v.len() as u16).to_be_bytes());
                    buf.extend_from_slice(v);
                }
                KeyComponent::Str(v) => {
                    buf.extend_from_slice(&(v.len() as u16).to_be_bytes());
                    buf.extend_from_slice(v.as_bytes());
                }
            }
        }
        buf
    }
}

impl Decodeable for IndexKey {
    fn decode_from<R: Read>(reader: &mut R) -> ShoalResult<Self> {
        let count = u8::decode_from(reader)?;
        let mut components = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let tag = u8::decode_from(reader)?;
            let key_type = KeyType::from_u8(tag).ok_or_else(|| {
                ShoalError::InvalidKey(format!("unknown key component tag {}", tag))
            })?;
            let component = match key_type {
                KeyType::Int => KeyComponent::Int(i64::decode_from(reader)?),
                KeyType::Bytes => {
                    let len = u16::decode_from(reader)?;
                    KeyComponent::Bytes(read_exact_buf(reader, len as usize)?)
                }
                KeyType::Str => {
                    let len = u16::decode_from(reader)?;
                    let bytes = read_exact_buf(reader, len as usize)?;
                    KeyComponent::Str(String::from_utf8(bytes).map_err(|e| {
                        ShoalError::InvalidKey(format!("invalid utf-8 key: {}", e))
                    })?)
                }
            };
            components.push(component);
        }
        Ok(Self { components })
    }
}

impl From<i64> for IndexKey {
    fn from(v: i64) -> Self {
        IndexKey::int(v)
    }
}

impl From<&str> for IndexKey {
    fn from(v: &str) -> Self {
        IndexKey::str(v)
    }
}

impl From<&[u8]> for IndexKey {
    fn from(v: &[u8]) -> Self {
        IndexKey::bytes(v)
    }
}

/// Declared component types of one index. Every key entering the index is
/// checked against this before touching a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchema {
    types: Vec<KeyType>,
}

impl KeySchema {
    pub fn new(types: Vec<KeyType>) -> Self {
        assert!(!types.is_empty(), "a key needs at least one component");
        Self { types }
    }

    pub fn single(key_type: KeyType) -> Self {
        Self::new(vec![key_type])
    }

    pub fn component_count(&self) -> usize {
        self.types.len()
    }

    pub fn types(&self) -> &[KeyType] {
        &self.types
    }

    pub fn check(&self, key: &IndexKey) -> ShoalResult<()> {
        if key.len() != self.types.len() {
            return Err(ShoalError::InvalidKey(format!(
                "key has {} components, index wants {}",
                key.len(),
                self.types.len()
            )));
        }
        self.check_prefix(key)
    }

    /// Arity-relaxed check for prefix scans: the key may be shorter than
    /// the schema, but each present component must match its column type.
    pub fn check_prefix(&self, key: &IndexKey) -> ShoalResult<()> {
        if key.len() > self.types.len() {
            return Err(ShoalError::InvalidKey(format!(
                "key has {} components, index wants at most {}",
                key.len(),
                self.types.len()
            )));
        }
        for (i, (component, want)) in
            key.components().iter().zip(self.types.iter()).enumerate()
        {
            if component.key_type() != *want {
                return Err(ShoalError::InvalidKey(format!(
                    "component {} is {:?}, index wants {:?}",
                    i,
                    component.key_type(),
                    want
                )));
            }
        }
        Ok(())
    }
}

impl Encodeable for KeySchema {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.types.len() as u8];
        buf.extend(self.types.iter().map(|t| *t as u8));
        buf
    }
}

impl Decodeable for KeySchema {
    fn decode_from<R: Read>(reader: &mut R) -> ShoalResult<Self> {
        let count = u8::decode_from(reader)?;
        let mut types = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let tag = u8::decode_from(reader)?;
            types.push(KeyType::from_u8(tag).ok_or_else(|| {
                ShoalError::InvalidKey(format!("unknown key type tag {}", tag))
            })?);
        }
        Ok(Self { types })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compound_ordering_is_lexicographic() {
        let a = IndexKey::new(vec![KeyComponent::Int(1), KeyComponent::Int(75_000)]);
        let b = IndexKey::new(vec![KeyComponent::Int(1), KeyComponent::Int(80_000)]);
        let c = IndexKey::new(vec![KeyComponent::Int(2), KeyComponent::Int(60_000)]);
        assert!(a < b);
        assert!(b < c);

        // a bare prefix sorts before every key it prefixes
        let p = IndexKey::new(vec![KeyComponent::Int(1)]);
        assert!(p < a);
        assert!(a.starts_with(&p));
        assert!(b.starts_with(&p));
        assert!(!c.starts_with(&p));
    }

    #[test]
    fn test_codec_round_trip() {
        let keys = vec![
            IndexKey::int(-42),
            IndexKey::str("charlie"),
            IndexKey::bytes(&[0, 1, 255]),
            IndexKey::new(vec![
                KeyComponent::Int(7),
                KeyComponent::Str("dept".to_string()),
                KeyComponent::Bytes(vec![9, 9]),
            ]),
        ];
        for key in keys {
            let bytes = key.encode();
            let decoded =
                IndexKey::decode_from(&mut std::io::Cursor::new(bytes)).unwrap();
            assert_eq!(decoded, key);
        }
    }

    #[test]
    fn test_schema_check() {
        let schema = KeySchema::new(vec![KeyType::Int, KeyType::Int]);
        let good = IndexKey::new(vec![KeyComponent::Int(1), KeyComponent::Int(2)]);
        assert!(schema.check(&good).is_ok());

        let short = IndexKey::int(1);
        assert!(matches!(
            schema.check(&short),
            Err(ShoalError::InvalidKey(_))
        ));
        assert!(schema.check_prefix(&short).is_ok());

        let wrong = IndexKey::new(vec![
            KeyComponent::Str("x".to_string()),
            KeyComponent::Int(2),
        ]);
        assert!(matches!(
            schema.check(&wrong),
            Err(ShoalError::InvalidKey(_))
        ));
    }
}
