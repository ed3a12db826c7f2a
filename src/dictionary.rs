use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A serializable checkpoint value. The set of persistable kinds is closed,
/// so this is a tagged variant rather than an open dynamic type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DictValue {
    Bool(bool),
    String(String),
    Double(f64),
    Int(i64),
    List(Vec<DictValue>),
    Dict(Dictionary),
}

impl From<bool> for DictValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for DictValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<f64> for DictValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<i64> for DictValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<usize> for DictValue {
    fn from(value: usize) -> Self {
        Self::Int(value as i64)
    }
}

impl From<Vec<DictValue>> for DictValue {
    fn from(value: Vec<DictValue>) -> Self {
        Self::List(value)
    }
}

impl From<Dictionary> for DictValue {
    fn from(value: Dictionary) -> Self {
        Self::Dict(value)
    }
}

/// String-keyed dictionary of serializable values, the only persisted state
/// format besides raw weight streams. Keys are ordered so serialization is
/// deterministic.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Dictionary {
    entries: BTreeMap<String, DictValue>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<DictValue>) {
        self.entries.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&DictValue> {
        self.entries.get(key)
    }

    pub fn get_double(&self, key: &str) -> Option<f64> {
        match self.get(key) {
            Some(DictValue::Double(x)) => Some(*x),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(DictValue::Int(x)) => Some(*x),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(DictValue::Bool(x)) => Some(*x),
            _ => None,
        }
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(DictValue::String(x)) => Some(x),
            _ => None,
        }
    }

    pub fn get_list(&self, key: &str) -> Option<&[DictValue]> {
        match self.get(key) {
            Some(DictValue::List(x)) => Some(x),
            _ => None,
        }
    }

    pub fn get_dict(&self, key: &str) -> Option<&Dictionary> {
        match self.get(key) {
            Some(DictValue::Dict(x)) => Some(x),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DictValue)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_round_trip() {
        let mut inner = Dictionary::new();
        inner.insert("momentum", 0.9);

        let mut dict = Dictionary::new();
        dict.insert("samples", 1024usize);
        dict.insert("name", "sgd");
        dict.insert("frozen", false);
        dict.insert("state", inner);
        dict.insert("history", vec![DictValue::Double(0.5), DictValue::Double(0.25)]);

        let json = serde_json::to_string(&dict).unwrap();
        let back: Dictionary = serde_json::from_str(&json).unwrap();

        assert_eq!(dict, back);
        assert_eq!(back.get_int("samples"), Some(1024));
        assert_eq!(back.get_dict("state").unwrap().get_double("momentum"), Some(0.9));
    }
}
