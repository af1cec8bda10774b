//! Fixed-width numeric view over the table's key space.
//!
//! Shard boundaries arrive as raw key bytes holding hex text (the hashed
//! prefix of a row key). A [`KeySpace`] turns them into [`KeyValue`]s so that
//! midpoints can be computed with integer arithmetic, and renders values back
//! into zero-padded hex of the configured width.

mod hash;

use std::fmt;

use thiserror::Error;

/// Widest key space supported, in hex digits.
pub const MAX_KEY_WIDTH: usize = 32;

/// Numeric representation of a table key.
///
/// Comparison is numeric, so `0x0a` sorts after `0x9` regardless of how the
/// external encoding padded the two.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyValue(u128);

impl KeyValue {
    /// Smallest key; also the "open end" sentinel of a shard range.
    pub const ZERO: KeyValue = KeyValue(0);

    /// Wrap a raw integer.
    pub const fn new(value: u128) -> Self {
        KeyValue(value)
    }

    /// Integer value of the key.
    pub const fn get(self) -> u128 {
        self.0
    }

    /// Whether this is the zero key.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl From<u128> for KeyValue {
    fn from(value: u128) -> Self {
        KeyValue(value)
    }
}

impl fmt::LowerHex for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Errors raised while converting keys.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    /// The key bytes are not hexadecimal text.
    #[error("key {key:?} is not a hex string")]
    NotHex {
        /// Lossy rendering of the offending key.
        key: String,
    },
    /// The hex text has more digits than a key can hold.
    #[error("key {key:?} has {digits} hex digits, at most {} are supported", MAX_KEY_WIDTH)]
    TooWide {
        /// Lossy rendering of the offending key.
        key: String,
        /// Number of digits found.
        digits: usize,
    },
    /// A key space was configured with an unusable width.
    #[error("key width {0} is outside 1..={}", MAX_KEY_WIDTH)]
    InvalidWidth(usize),
    /// The domain maximum does not fit the configured width.
    #[error("domain maximum {max:#x} does not fit in {width} hex digits")]
    MaxOutOfRange {
        /// Configured width.
        width: usize,
        /// Configured maximum.
        max: u128,
    },
}

/// Fixed-width key domain: how many hex digits a key has and its maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySpace {
    width: usize,
    max: KeyValue,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::md5_prefix()
    }
}

impl KeySpace {
    /// Build a key space of `width` hex digits whose largest key is `max`.
    pub fn new(width: usize, max: u128) -> Result<Self, KeyError> {
        if width == 0 || width > MAX_KEY_WIDTH {
            return Err(KeyError::InvalidWidth(width));
        }
        if width < MAX_KEY_WIDTH && max >> (width * 4) != 0 {
            return Err(KeyError::MaxOutOfRange { width, max });
        }
        Ok(Self {
            width,
            max: KeyValue(max),
        })
    }

    /// The 8 hex digit space used for MD5-prefixed row keys.
    pub const fn md5_prefix() -> Self {
        Self {
            width: 8,
            max: KeyValue(0x7fff_ffff),
        }
    }

    /// Number of hex digits in a rendered key.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Largest key in the domain.
    pub fn max(&self) -> KeyValue {
        self.max
    }

    /// Map an open end (`0`) to the domain maximum.
    pub fn resolve_end(&self, end: KeyValue) -> KeyValue {
        if end.is_zero() {
            self.max
        } else {
            end
        }
    }

    /// Convert raw key bytes (hex text) into a [`KeyValue`].
    ///
    /// An empty key is the first or last boundary of the table and maps to
    /// zero.
    pub fn encode(&self, raw: &[u8]) -> Result<KeyValue, KeyError> {
        if raw.is_empty() {
            return Ok(KeyValue::ZERO);
        }
        let text = std::str::from_utf8(raw).map_err(|_| KeyError::NotHex {
            key: String::from_utf8_lossy(raw).into_owned(),
        })?;
        parse_hex(text)
    }

    /// Render a key as raw key bytes, zero padded to the key width.
    pub fn decode(&self, key: KeyValue) -> Vec<u8> {
        self.to_hex(key).into_bytes()
    }

    /// Render a key as zero-padded lowercase hex.
    pub fn to_hex(&self, key: KeyValue) -> String {
        format!("{:0width$x}", key.0, width = self.width)
    }
}

/// Parse hex text of any length up to [`MAX_KEY_WIDTH`] digits.
pub fn parse_hex(text: &str) -> Result<KeyValue, KeyError> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(KeyError::NotHex {
            key: text.to_string(),
        });
    }
    let digits = text.trim_start_matches('0').len();
    if digits > MAX_KEY_WIDTH {
        return Err(KeyError::TooWide {
            key: text.to_string(),
            digits,
        });
    }
    u128::from_str_radix(text, 16)
        .map(KeyValue)
        .map_err(|_| KeyError::NotHex {
            key: text.to_string(),
        })
}
