//! Query-string and urlencoded-form decoding.
//!
//! Keys ending in `[]` accumulate into arrays; a key repeated without `[]`
//! upgrades from string to array on its second occurrence. The raw query
//! string is preserved verbatim on the request; this parse runs on demand.

use std::fmt::Write as _;

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    One(String),
    Many(Vec<String>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::One(s) => Some(s),
            Value::Many(v) => v.first().map(String::as_str),
        }
    }

    pub fn as_slice(&self) -> &[String] {
        match self {
            Value::One(s) => std::slice::from_ref(s),
            Value::Many(v) => v,
        }
    }

    fn push(&mut self, item: String) {
        match self {
            Value::One(first) => {
                let first = std::mem::take(first);
                *self = Value::Many(vec![first, item]);
            }
            Value::Many(v) => v.push(item),
        }
    }
}

/// Insertion-ordered decoded query map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMap {
    entries: Vec<(String, Value)>,
}

impl QueryMap {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert_one(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), Value::One(value.into())));
    }

    pub fn insert_many(&mut self, key: impl Into<String>, values: Vec<String>) {
        self.entries.push((key.into(), Value::Many(values)));
    }

    fn accumulate(&mut self, key: String, value: String, force_array: bool) {
        if let Some((_, existing)) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            existing.push(value);
            return;
        }
        let value = if force_array { Value::Many(vec![value]) } else { Value::One(value) };
        self.entries.push((key, value));
    }

    /// Canonical form: single-element arrays collapse only if they were not
    /// declared with `[]`; here arrays stay arrays, so normalization is the
    /// identity on anything this module produced.
    pub fn normalize(self) -> Self {
        self
    }
}

/// Decode a query string (without the leading `?`).
pub fn parse(raw: &str) -> QueryMap {
    let mut map = QueryMap::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key_raw, value_raw) = match pair.find('=') {
            Some(idx) => (&pair[..idx], &pair[idx + 1..]),
            None => (pair, ""),
        };
        let mut key = decode_component(key_raw);
        let value = decode_component(value_raw);
        let force_array = key.ends_with("[]");
        if force_array {
            key.truncate(key.len() - 2);
        }
        if key.is_empty() {
            continue;
        }
        map.accumulate(key, value, force_array);
    }
    map
}

/// Encode a map back into a query string. Arrays emit `key[]=` per element,
/// so `parse(stringify(m)) == m.normalize()`.
pub fn stringify(map: &QueryMap) -> String {
    let mut out = String::new();
    for (key, value) in map.iter() {
        match value {
            Value::One(v) => {
                push_pair(&mut out, key, v, false);
            }
            Value::Many(vs) => {
                for v in vs {
                    push_pair(&mut out, key, v, true);
                }
            }
        }
    }
    out
}

fn push_pair(out: &mut String, key: &str, value: &str, array: bool) {
    if !out.is_empty() {
        out.push('&');
    }
    encode_component(key, out);
    if array {
        out.push_str("%5B%5D");
    }
    out.push('=');
    encode_component(value, out);
}

/// Percent-decode with `+`-as-space. Invalid escapes pass through verbatim.
pub fn decode_component(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                if let (Some(hi), Some(lo)) = (
                    bytes.get(i + 1).copied().and_then(hex_val),
                    bytes.get(i + 2).copied().and_then(hex_val),
                ) {
                    out.push((hi << 4) | lo);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn encode_component(raw: &str, out: &mut String) {
    for &b in raw.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            b' ' => out.push('+'),
            _ => {
                let _ = write!(out, "%{b:02X}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_pairs() {
        let q = parse("a=1&b=two&c=");
        assert_eq!(q.get("a"), Some("1"));
        assert_eq!(q.get("b"), Some("two"));
        assert_eq!(q.get("c"), Some(""));
        assert!(!q.contains("d"));
    }

    #[test]
    fn bracket_keys_accumulate() {
        let q = parse("tag[]=a&tag[]=b");
        assert_eq!(q.get_all("tag"), ["a", "b"]);
        // A single []-key still yields an array.
        let q = parse("tag[]=only");
        assert!(matches!(
            q.iter().next().unwrap().1,
            Value::Many(v) if v == &["only"]
        ));
    }

    #[test]
    fn repeated_plain_key_upgrades() {
        let q = parse("k=1");
        assert!(matches!(q.iter().next().unwrap().1, Value::One(_)));
        let q = parse("k=1&k=2&k=3");
        assert_eq!(q.get_all("k"), ["1", "2", "3"]);
    }

    #[test]
    fn percent_decoding() {
        let q = parse("msg=hello%20world&plus=a+b&pct=100%25");
        assert_eq!(q.get("msg"), Some("hello world"));
        assert_eq!(q.get("plus"), Some("a b"));
        assert_eq!(q.get("pct"), Some("100%"));
        // Malformed escape passes through.
        assert_eq!(parse("x=%zz").get("x"), Some("%zz"));
    }

    #[test]
    fn encoded_brackets_count() {
        let q = parse("tag%5B%5D=x&tag%5B%5D=y");
        assert_eq!(q.get_all("tag"), ["x", "y"]);
    }

    #[test]
    fn stringify_round_trip() {
        let mut m = QueryMap::new();
        m.insert_one("a", "1 2");
        m.insert_many("tag", vec!["x&y".into(), "z".into()]);
        m.insert_one("emp", "");
        let encoded = stringify(&m);
        assert_eq!(parse(&encoded), m.clone().normalize());
    }
}
