//! # Parameter Store
//!
//! Named, typed attributes of a node, serialized as an opaque blob inside
//! element snapshots.

use std::collections::BTreeMap;

use crate::error::{DirectLinkError, DirectLinkResult};
use crate::protocol::{WireReader, WireWriter};

/// A single typed attribute value.
#[derive(Clone, Debug, PartialEq)]
pub enum ParameterValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point scalar.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Three component vector.
    Vec3([f32; 3]),
}

impl ParameterValue {
    const TAG_BOOL: u8 = 0;
    const TAG_INT: u8 = 1;
    const TAG_FLOAT: u8 = 2;
    const TAG_TEXT: u8 = 3;
    const TAG_BYTES: u8 = 4;
    const TAG_VEC3: u8 = 5;

    fn write(&self, writer: &mut WireWriter) {
        match self {
            Self::Bool(v) => {
                writer.write_u8(Self::TAG_BOOL);
                writer.write_bool(*v);
            }
            Self::Int(v) => {
                writer.write_u8(Self::TAG_INT);
                writer.write_i64(*v);
            }
            Self::Float(v) => {
                writer.write_u8(Self::TAG_FLOAT);
                writer.write_f64(*v);
            }
            Self::Text(v) => {
                writer.write_u8(Self::TAG_TEXT);
                writer.write_str(v);
            }
            Self::Bytes(v) => {
                writer.write_u8(Self::TAG_BYTES);
                writer.write_bytes(v);
            }
            Self::Vec3(v) => {
                writer.write_u8(Self::TAG_VEC3);
                for c in v {
                    writer.write_f32(*c);
                }
            }
        }
    }

    fn read(reader: &mut WireReader<'_>) -> DirectLinkResult<Self> {
        match reader.read_u8()? {
            Self::TAG_BOOL => Ok(Self::Bool(reader.read_bool()?)),
            Self::TAG_INT => Ok(Self::Int(reader.read_i64()?)),
            Self::TAG_FLOAT => Ok(Self::Float(reader.read_f64()?)),
            Self::TAG_TEXT => Ok(Self::Text(reader.read_string()?)),
            Self::TAG_BYTES => Ok(Self::Bytes(reader.read_bytes()?.to_vec())),
            Self::TAG_VEC3 => Ok(Self::Vec3([
                reader.read_f32()?,
                reader.read_f32()?,
                reader.read_f32()?,
            ])),
            _ => Err(DirectLinkError::StreamError("unknown parameter type")),
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<[f32; 3]> for ParameterValue {
    fn from(v: [f32; 3]) -> Self {
        Self::Vec3(v)
    }
}

/// Ordered name → value set.
///
/// Iteration order is the key order, so two stores with the same content
/// always serialize to the same bytes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParameterStore {
    values: BTreeMap<String, ParameterValue>,
}

impl ParameterStore {
    /// Creates an empty store.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }

    /// Sets a value, returning the previous one.
    pub fn set(
        &mut self,
        name: impl Into<String>,
        value: impl Into<ParameterValue>,
    ) -> Option<ParameterValue> {
        self.values.insert(name.into(), value.into())
    }

    /// Gets a value by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    /// Removes a value by name.
    pub fn remove(&mut self, name: &str) -> Option<ParameterValue> {
        self.values.remove(name)
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the store holds no value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over values in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Serializes the store into its opaque blob form.
    #[must_use]
    pub fn to_blob(&self) -> Vec<u8> {
        let mut writer = WireWriter::with_capacity(16 + self.values.len() * 16);
        writer.write_len(self.values.len());
        for (name, value) in &self.values {
            writer.write_str(name);
            value.write(&mut writer);
        }
        writer.into_bytes()
    }

    /// Rebuilds a store from its blob form.
    pub fn from_blob(blob: &[u8]) -> DirectLinkResult<Self> {
        let mut reader = WireReader::new(blob);
        let count = reader.read_packed()?;
        let mut values = BTreeMap::new();
        for _ in 0..count {
            let name = reader.read_string()?;
            let value = ParameterValue::read(&mut reader)?;
            values.insert(name, value);
        }
        if reader.remaining() != 0 {
            return Err(DirectLinkError::StreamError("trailing bytes in parameter blob"));
        }
        Ok(Self { values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_is_insertion_order_independent() {
        let mut a = ParameterStore::new();
        a.set("visible", true);
        a.set("label", "lamp");

        let mut b = ParameterStore::new();
        b.set("label", "lamp");
        b.set("visible", true);

        assert_eq!(a.to_blob(), b.to_blob());
    }

    #[test]
    fn test_blob_decodes_every_type() {
        let mut store = ParameterStore::new();
        store.set("b", false);
        store.set("i", -42_i64);
        store.set("f", 0.5_f64);
        store.set("t", "text");
        store.set("v", [1.0_f32, 2.0, 3.0]);
        store.set("raw", ParameterValue::Bytes(vec![9, 8, 7]));

        let decoded = ParameterStore::from_blob(&store.to_blob()).unwrap();
        assert_eq!(decoded, store);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut writer = WireWriter::new();
        writer.write_packed(1);
        writer.write_str("x");
        writer.write_u8(200);
        assert!(ParameterStore::from_blob(writer.as_slice()).is_err());
    }
}
