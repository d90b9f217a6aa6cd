//! Key Wire Format
//!
//! ```text
//! <counter digits> '_' <name> [ '_' <rest> ]
//! ```
//!
//! `counter` is part of object identity but not of the placement-group hash.
//! `name` selects the placement group: it is hashed, and compared byte for
//! byte. Counters compare numerically, so `"007_pg_x"` and `"7_pg_x"` name the
//! same object.

use crate::error::{JournalError, JournalResult};

const SEPARATOR: u8 = b'_';

/// Borrowed view of a decoded key: offsets into the original string
#[derive(Debug, Clone, Copy)]
pub struct DecodedKey<'a> {
    raw: &'a str,
    counter: u64,
    name_start: usize,
    name_end: usize,
}

impl<'a> DecodedKey<'a> {
    /// Parse `raw`, rejecting keys over `max_len` bytes or without a separator
    pub fn parse(raw: &'a str, max_len: usize) -> JournalResult<Self> {
        if raw.len() > max_len {
            return Err(JournalError::KeyTooLong {
                len: raw.len(),
                max: max_len,
            });
        }
        let bytes = raw.as_bytes();
        let Some(sep) = memchr::memchr(SEPARATOR, bytes) else {
            return Err(JournalError::BadKey(raw.to_string()));
        };
        let digits = &raw[..sep];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(JournalError::BadKey(raw.to_string()));
        }
        let counter: u64 = digits
            .parse()
            .map_err(|_| JournalError::BadKey(raw.to_string()))?;

        let name_start = sep + 1;
        let name_end = memchr::memchr(SEPARATOR, &bytes[name_start..])
            .map(|p| name_start + p)
            .unwrap_or(bytes.len());
        if name_end == name_start {
            return Err(JournalError::BadKey(raw.to_string()));
        }

        Ok(DecodedKey {
            raw,
            counter,
            name_start,
            name_end,
        })
    }

    /// Decoded counter
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Placement-group name bytes
    pub fn name(&self) -> &'a [u8] {
        &self.raw.as_bytes()[self.name_start..self.name_end]
    }

    /// Free-form suffix after the name, if any
    pub fn rest(&self) -> Option<&'a str> {
        if self.name_end < self.raw.len() {
            Some(&self.raw[self.name_end + 1..])
        } else {
            None
        }
    }

    /// Hash of the placement-group name
    pub fn name_hash(&self) -> u64 {
        hash_name(self.name())
    }

    /// Owned identity of this key
    pub fn to_key(&self) -> Key {
        Key {
            counter: self.counter,
            name: String::from_utf8_lossy(self.name()).into_owned(),
            rest: self.rest().map(str::to_string),
        }
    }
}

impl PartialEq for DecodedKey<'_> {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (self.name(), other.name());
        self.counter == other.counter && a.len() == b.len() && a == b && self.rest() == other.rest()
    }
}

impl Eq for DecodedKey<'_> {}

/// Owned key identity; ordering is by counter, then name, then suffix
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub counter: u64,
    pub name: String,
    pub rest: Option<String>,
}

impl Key {
    /// Build a key from its parts
    pub fn new(counter: u64, name: impl Into<String>, rest: Option<&str>) -> Self {
        Key {
            counter,
            name: name.into(),
            rest: rest.map(str::to_string),
        }
    }

    /// Canonical wire form (counter without leading zeros)
    pub fn encode(&self) -> String {
        match &self.rest {
            Some(rest) => format!("{}_{}_{}", self.counter, self.name, rest),
            None => format!("{}_{}", self.counter, self.name),
        }
    }

    /// Parse a key with no length limit beyond the format itself
    pub fn decode(raw: &str) -> JournalResult<Self> {
        DecodedKey::parse(raw, usize::MAX).map(|k| k.to_key())
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Rolling multiply-xor over the name bytes
pub fn hash_name(name: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in name {
        h = h.wrapping_mul(0x0100_0000_01b3) ^ u64::from(b);
    }
    h
}

/// Whether two raw keys name the same object
pub fn key_equal(a: &str, b: &str) -> JournalResult<bool> {
    let a = DecodedKey::parse(a, usize::MAX)?;
    let b = DecodedKey::parse(b, usize::MAX)?;
    Ok(a == b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_key() {
        let k = DecodedKey::parse("42_orders_item-7", 64).unwrap();
        assert_eq!(k.counter(), 42);
        assert_eq!(k.name(), b"orders");
        assert_eq!(k.rest(), Some("item-7"));
    }

    #[test]
    fn test_parse_without_rest() {
        let k = DecodedKey::parse("2_pg1", 64).unwrap();
        assert_eq!(k.counter(), 2);
        assert_eq!(k.name(), b"pg1");
        assert_eq!(k.rest(), None);
    }

    #[test]
    fn test_rest_may_contain_separators() {
        let k = DecodedKey::parse("1_pg_a_b_c", 64).unwrap();
        assert_eq!(k.name(), b"pg");
        assert_eq!(k.rest(), Some("a_b_c"));
    }

    #[test]
    fn test_bad_keys() {
        for raw in ["nounderscore", "_pg", "x1_pg", "1__a", "1_", "99999999999999999999999_pg"] {
            assert!(
                matches!(DecodedKey::parse(raw, 64), Err(JournalError::BadKey(_))),
                "{} should be rejected",
                raw
            );
        }
    }

    #[test]
    fn test_key_too_long() {
        let raw = format!("1_{}", "n".repeat(100));
        assert!(matches!(
            DecodedKey::parse(&raw, 64),
            Err(JournalError::KeyTooLong { len: 102, max: 64 })
        ));
    }

    #[test]
    fn test_leading_zero_counters_are_equal() {
        assert!(key_equal("007_pg_x", "7_pg_x").unwrap());
        assert!(!key_equal("7_pg_x", "7_pg_y").unwrap());
        assert!(!key_equal("7_pg", "7_pg_x").unwrap());
        assert!(!key_equal("7_pg_x", "8_pg_x").unwrap());
        assert!(!key_equal("7_pga_x", "7_pgb_x").unwrap());
    }

    #[test]
    fn test_decode_encode() {
        for raw in ["1_pg1_a", "3_pg1", "18446744073709551615_n_rest_more", "0_z_"] {
            let key = Key::decode(raw).unwrap();
            assert_eq!(Key::decode(&key.encode()).unwrap(), key);
        }
        assert_eq!(Key::decode("007_pg_x").unwrap().encode(), "7_pg_x");
    }

    #[test]
    fn test_hash_ignores_counter_and_rest() {
        let a = DecodedKey::parse("1_pg1_a", 64).unwrap();
        let b = DecodedKey::parse("900_pg1_zzz", 64).unwrap();
        let c = DecodedKey::parse("1_pg2_a", 64).unwrap();
        assert_eq!(a.name_hash(), b.name_hash());
        assert_ne!(a.name_hash(), c.name_hash());
    }

    #[test]
    fn test_key_ordering_by_counter_first() {
        let mut keys = vec![
            Key::decode("3_pg_b").unwrap(),
            Key::decode("1_pg_z").unwrap(),
            Key::decode("3_pg_a").unwrap(),
        ];
        keys.sort();
        let encoded: Vec<String> = keys.iter().map(Key::encode).collect();
        assert_eq!(encoded, vec!["1_pg_z", "3_pg_a", "3_pg_b"]);
    }
}
