//! Execution parameter values.
//!
//! An execution parameter configures a tool without being a dependency;
//! its value must be *fundamental*: representable by [`ParamValue`] and
//! marshallable into a deterministic byte form that participates in the
//! tool instance fingerprint.

use std::collections::BTreeMap;

/// A fundamental (marshallable) execution parameter value.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Seq(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    /// The deterministic byte form: a tag byte per node, fixed-width
    /// little-endian integers, length-prefixed strings and collections,
    /// map entries in key order.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.marshal_into(&mut out);
        out
    }

    fn marshal_into(&self, out: &mut Vec<u8>) {
        fn len(out: &mut Vec<u8>, n: usize) {
            out.extend((n as u64).to_le_bytes());
        }
        match self {
            ParamValue::Null => out.push(0),
            ParamValue::Bool(b) => {
                out.push(1);
                out.push(*b as u8);
            }
            ParamValue::Int(i) => {
                out.push(2);
                out.extend(i.to_le_bytes());
            }
            ParamValue::Float(f) => {
                out.push(3);
                out.extend(f.to_bits().to_le_bytes());
            }
            ParamValue::Str(s) => {
                out.push(4);
                len(out, s.len());
                out.extend(s.as_bytes());
            }
            ParamValue::Bytes(b) => {
                out.push(5);
                len(out, b.len());
                out.extend(b);
            }
            ParamValue::Seq(items) => {
                out.push(6);
                len(out, items.len());
                for item in items {
                    item.marshal_into(out);
                }
            }
            ParamValue::Map(entries) => {
                out.push(7);
                len(out, entries.len());
                for (key, value) in entries {
                    len(out, key.len());
                    out.extend(key.as_bytes());
                    value.marshal_into(out);
                }
            }
        }
    }

    /// A value is fundamental only when equal values marshal equally; a
    /// NaN breaks that (it is not even equal to itself).
    pub(crate) fn find_non_fundamental(&self) -> Option<String> {
        match self {
            ParamValue::Float(f) if f.is_nan() => Some("float is NaN".into()),
            ParamValue::Seq(items) => items.iter().find_map(Self::find_non_fundamental),
            ParamValue::Map(entries) => entries.values().find_map(Self::find_non_fundamental),
            _ => None,
        }
    }

    /// The value kind, for override compatibility checks.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            ParamValue::Null => "null",
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "int",
            ParamValue::Float(_) => "float",
            ParamValue::Str(_) => "str",
            ParamValue::Bytes(_) => "bytes",
            ParamValue::Seq(_) => "seq",
            ParamValue::Map(_) => "map",
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v.into())
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(v.into())
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl From<&[u8]> for ParamValue {
    fn from(v: &[u8]) -> Self {
        ParamValue::Bytes(v.to_vec())
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(v: Vec<T>) -> Self {
        ParamValue::Seq(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(ParamValue::Null)
    }
}
