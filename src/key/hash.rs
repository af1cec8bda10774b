//! Row keys for tables laid out over a [`KeySpace`].
//!
//! Writers prefix each row with the hashed hex key built here. Rows then
//! spread evenly over the key space, so splitting every shard at its
//! midpoint halves its data.

use sha2::{Digest, Sha256};

use super::{KeySpace, KeyValue};

impl KeySpace {
    /// Hash a row identifier into this key space.
    ///
    /// The leading 16 bytes of the SHA-256 digest are reduced modulo the
    /// domain size, so hashed rows spread evenly over `[0, max]`.
    pub fn hash(&self, row: &str) -> KeyValue {
        let digest = Sha256::digest(row.as_bytes());
        let mut prefix = [0u8; 16];
        prefix.copy_from_slice(&digest[..16]);
        let raw = u128::from_be_bytes(prefix);
        match self.max().get().checked_add(1) {
            Some(domain) => KeyValue::new(raw % domain),
            None => KeyValue::new(raw),
        }
    }

    /// Build a full row key, `<hash-hex>:<row>`, for the given identifier.
    ///
    /// Rows written with these keys land in the shard owning their hash
    /// prefix, which is what makes midpoint splits balanced.
    pub fn row_key(&self, row: &str) -> Vec<u8> {
        let mut key = self.to_hex(self.hash(row)).into_bytes();
        key.push(b':');
        key.extend_from_slice(row.as_bytes());
        key
    }

    /// Row key for a numeric row id.
    pub fn row_key_for_id(&self, id: u64) -> Vec<u8> {
        self.row_key(&id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use crate::key::KeySpace;

    #[test]
    fn hash_stays_inside_domain() {
        let space = KeySpace::new(2, 200).unwrap();
        for id in 0..500u64 {
            assert!(space.hash(&id.to_string()).get() <= 200);
        }
    }

    #[test]
    fn row_key_is_prefixed_and_stable() {
        let space = KeySpace::md5_prefix();
        let key = space.row_key("alice@example.com");
        let text = String::from_utf8(key.clone()).unwrap();
        let (prefix, row) = text.split_once(':').unwrap();
        assert_eq!(prefix.len(), 8);
        assert_eq!(row, "alice@example.com");
        assert_eq!(space.encode(prefix.as_bytes()).unwrap(), space.hash(row));
        assert_eq!(space.row_key("alice@example.com"), key);
        assert_eq!(space.row_key_for_id(42), space.row_key("42"));
    }
}
