//! Text heuristic and the binary-leaf tree converter.

use fabriclog_core::RawNode;
use serde_json::{Map, Value};

/// Only the first bytes are inspected by [`is_likely_text`].
pub const TEXT_PROBE_LEN: usize = 25;

/// Bytes below this value are treated as control characters.
pub const CONTROL_THRESHOLD: u8 = 31;

/// Returns `true` if none of the first 25 bytes is below 31.
///
/// A heuristic, not a UTF-8 validator: protobuf payloads almost always start
/// with a small tag byte, plain identifiers never do. The empty slice is text.
pub fn is_likely_text(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .take(TEXT_PROBE_LEN)
        .all(|b| *b >= CONTROL_THRESHOLD)
}

/// Lossy UTF-8 conversion.
pub fn to_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// A byte sequence rendered as text or as lower-case hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HexOrText {
    Text(String),
    Hex(String),
}

impl HexOrText {
    /// `{"text": ..}` or `{"hex": ..}`.
    pub fn into_wrapper(self) -> Value {
        let mut obj = Map::new();
        match self {
            Self::Text(t) => obj.insert("text".into(), Value::String(t)),
            Self::Hex(h) => obj.insert("hex".into(), Value::String(h)),
        };
        Value::Object(obj)
    }

    /// Sibling key for a map field: `{field}_string` or `{field}_hex`.
    pub fn field_key(&self, field: &str) -> String {
        match self {
            Self::Text(_) => format!("{field}_string"),
            Self::Hex(_) => format!("{field}_hex"),
        }
    }

    pub fn into_string(self) -> String {
        match self {
            Self::Text(s) | Self::Hex(s) => s,
        }
    }
}

pub fn to_hex_or_text(bytes: &[u8]) -> HexOrText {
    if is_likely_text(bytes) {
        HexOrText::Text(to_text(bytes))
    } else {
        HexOrText::Hex(hex::encode(bytes))
    }
}

/// Convert a payload tree into JSON, replacing every binary leaf.
///
/// A map field `k` holding bytes becomes `k_string` or `k_hex`; bytes inside
/// a list (or at the root) become an inline `{text}` / `{hex}` object.
pub fn convert_buffers(node: RawNode) -> Value {
    match node {
        RawNode::Null => Value::Null,
        RawNode::Bool(b) => Value::Bool(b),
        RawNode::Number(n) => Value::Number(n),
        RawNode::Text(s) => Value::String(s),
        RawNode::Bytes(b) => to_hex_or_text(&b).into_wrapper(),
        RawNode::List(items) => Value::Array(items.into_iter().map(convert_buffers).collect()),
        RawNode::Map(fields) => {
            let mut out = Map::with_capacity(fields.len());
            for (key, value) in fields {
                match value {
                    RawNode::Bytes(b) => {
                        let repr = to_hex_or_text(&b);
                        out.insert(repr.field_key(&key), Value::String(repr.into_string()));
                    }
                    other => {
                        out.insert(key, convert_buffers(other));
                    }
                }
            }
            Value::Object(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn buf(h: &str) -> Vec<u8> {
        hex::decode(h).unwrap()
    }

    #[test]
    fn text_heuristic_samples() {
        assert!(is_likely_text(b"foobar"));
        assert!(is_likely_text(b"hello world"));
        assert!(is_likely_text(b""));
        assert!(is_likely_text(&buf("6465706c6f79")));
        assert!(is_likely_text(&buf("636f6d6d6f6e")));
        assert!(is_likely_text(&buf("65736363")));
        assert!(is_likely_text(&buf("76736363")));
        assert!(!is_likely_text(&buf(
            "0a1e08011216120f686967682d7468726f7567687075741a03312e301a020a00"
        )));
        assert!(!is_likely_text(&buf(
            "1210120e08011202080012020801120208021a0c120a0a084b617267614d5350"
        )));
    }

    #[test]
    fn only_first_25_bytes_count() {
        let mut bytes = vec![b'a'; TEXT_PROBE_LEN];
        bytes.push(0x00);
        assert!(is_likely_text(&bytes));
        bytes[TEXT_PROBE_LEN - 1] = 0x1e;
        assert!(!is_likely_text(&bytes));
        // 31 itself is not a control byte here.
        assert!(is_likely_text(&[31, 32]));
    }

    #[test]
    fn plain_tree_is_unchanged() {
        let node = RawNode::map()
            .with("foo", "bar")
            .with("anumber", 3u32)
            .with("so", true);
        assert_eq!(
            convert_buffers(node),
            json!({"foo": "bar", "anumber": 3, "so": true})
        );
    }

    #[test]
    fn map_fields_get_suffixed_keys() {
        let node = RawNode::map()
            .with("some", b"foobar".to_vec())
            .with("sig", vec![0x30u8, 0x01, 0x02]);
        assert_eq!(
            convert_buffers(node),
            json!({"some_string": "foobar", "sig_hex": "300102"})
        );
    }

    #[test]
    fn list_elements_get_wrappers() {
        let node = RawNode::map().with(
            "args",
            vec![
                RawNode::from(b"hello".to_vec()),
                RawNode::from(vec![0x0au8, 0x00]),
                RawNode::from("already text"),
            ],
        );
        assert_eq!(
            convert_buffers(node),
            json!({"args": [{"text": "hello"}, {"hex": "0a00"}, "already text"]})
        );
    }
}
