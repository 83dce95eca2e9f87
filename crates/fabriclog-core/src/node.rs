//! `RawNode` — the structured payload tree delivered by the ledger client.
//!
//! A `RawNode` is JSON-shaped, except that it may carry raw `Bytes` leaves.
//! The decoder replaces every `Bytes` leaf with a text or hex representation
//! before a record leaves it (see `fabriclog_decode::convert`).

use indexmap::IndexMap;

/// A nested map / sequence / scalar tree with binary leaves.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RawNode {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<RawNode>),
    Map(IndexMap<String, RawNode>),
}

impl RawNode {
    /// An empty map node.
    pub fn map() -> Self {
        Self::Map(IndexMap::new())
    }

    /// Builder-style insert; no-op on non-map nodes.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<RawNode>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert a key into a map node. Returns `false` if `self` is not a map.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<RawNode>) -> bool {
        match self {
            Self::Map(m) => {
                m.insert(key.into(), value.into());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&RawNode> {
        match self {
            Self::Map(m) => m.get(key),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut RawNode> {
        match self {
            Self::Map(m) => m.get_mut(key),
            _ => None,
        }
    }

    /// Follow a path of map keys, e.g. `["payload", "header"]`.
    pub fn pointer_mut(&mut self, path: &[&str]) -> Option<&mut RawNode> {
        path.iter().try_fold(self, |node, key| node.get_mut(key))
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[RawNode]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut Vec<RawNode>> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Returns `true` if any leaf anywhere in the tree is raw bytes.
    pub fn contains_bytes(&self) -> bool {
        match self {
            Self::Bytes(_) => true,
            Self::List(l) => l.iter().any(RawNode::contains_bytes),
            Self::Map(m) => m.values().any(RawNode::contains_bytes),
            _ => false,
        }
    }
}

impl From<bool> for RawNode {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for RawNode {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for RawNode {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for RawNode {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<&[u8]> for RawNode {
    fn from(v: &[u8]) -> Self {
        Self::Bytes(v.to_vec())
    }
}

impl From<Vec<RawNode>> for RawNode {
    fn from(v: Vec<RawNode>) -> Self {
        Self::List(v)
    }
}

impl From<IndexMap<String, RawNode>> for RawNode {
    fn from(v: IndexMap<String, RawNode>) -> Self {
        Self::Map(v)
    }
}

impl<T: Into<RawNode>> From<Option<T>> for RawNode {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

macro_rules! number_from {
    ($($t:ty),*) => {
        $(
            impl From<$t> for RawNode {
                fn from(v: $t) -> Self {
                    Self::Number(serde_json::Number::from(v))
                }
            }
        )*
    };
}

number_from!(i32, i64, u32, u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_and_pointer() {
        let mut node = RawNode::map().with(
            "payload",
            RawNode::map().with("header", RawNode::map().with("tx_id", "abc")),
        );
        let tx = node.pointer_mut(&["payload", "header", "tx_id"]).unwrap();
        assert_eq!(*tx, RawNode::Text("abc".into()));
        assert!(node.pointer_mut(&["payload", "missing"]).is_none());
    }

    #[test]
    fn contains_bytes_walks_nested_lists() {
        let clean = RawNode::map().with("a", vec![RawNode::from(1u64), RawNode::from("x")]);
        assert!(!clean.contains_bytes());

        let dirty = RawNode::map().with("a", vec![RawNode::from(vec![0u8, 1])]);
        assert!(dirty.contains_bytes());
    }

    #[test]
    fn insert_on_non_map_is_rejected() {
        let mut node = RawNode::from("scalar");
        assert!(!node.insert("k", 1u32));
    }
}
