//! The snowflake id type and its text/binary encodings.
//!
//! Every encoding is a bijection over the 64-bit pattern of the id, so an id
//! always parses back to itself:
//!
//! | Encoding | Alphabet / layout |
//! |----------|-------------------|
//! | decimal  | `Display` / `FromStr` |
//! | base2    | `01` |
//! | base32   | z-base-32 `ybndrfg8ejkmcpqxot1uwisza345h769`, most significant digit first |
//! | base36   | `0-9a-z` |
//! | base58   | `123456789abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ` |
//! | base64   | standard base64 of the decimal string |
//! | bytes    | decimal string as ASCII bytes |
//! | int bytes| 8-byte big-endian integer |

use crate::error::SnowflakeError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const BASE2_ALPHABET: &[u8] = b"01";
const BASE32_ALPHABET: &[u8] = b"ybndrfg8ejkmcpqxot1uwisza345h769";
const BASE36_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const BASE58_ALPHABET: &[u8] = b"123456789abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ";

/// Marks a byte that is not part of an alphabet.
const INVALID: u8 = 0xFF;

static BASE2_DECODE: [u8; 256] = decode_table(BASE2_ALPHABET, false);
static BASE32_DECODE: [u8; 256] = decode_table(BASE32_ALPHABET, false);
static BASE36_DECODE: [u8; 256] = decode_table(BASE36_ALPHABET, true);
static BASE58_DECODE: [u8; 256] = decode_table(BASE58_ALPHABET, false);

/// Builds the reverse lookup for an alphabet at compile time.
const fn decode_table(alphabet: &[u8], fold_upper: bool) -> [u8; 256] {
    let mut table = [INVALID; 256];
    let mut i = 0;
    while i < alphabet.len() {
        let c = alphabet[i];
        table[c as usize] = i as u8;
        if fold_upper && c.is_ascii_lowercase() {
            table[c.to_ascii_uppercase() as usize] = i as u8;
        }
        i += 1;
    }
    table
}

fn encode_radix(mut value: u64, alphabet: &[u8]) -> String {
    let radix = alphabet.len() as u64;
    if value < radix {
        return (alphabet[value as usize] as char).to_string();
    }

    let mut digits = Vec::with_capacity(64);
    while value > 0 {
        digits.push(alphabet[(value % radix) as usize]);
        value /= radix;
    }
    digits.reverse();
    digits.into_iter().map(char::from).collect()
}

fn decode_radix(input: &[u8], table: &[u8; 256], radix: u64) -> Option<u64> {
    if input.is_empty() {
        return None;
    }

    let mut value: u64 = 0;
    for &b in input {
        let digit = table[b as usize];
        if digit == INVALID {
            return None;
        }
        value = value.checked_mul(radix)?.checked_add(digit as u64)?;
    }
    Some(value)
}

/// A snowflake id.
///
/// Generated ids are non-negative; the type still carries any `i64` so that
/// ids received from peers round-trip unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnowId(i64);

impl SnowId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Parses the decimal form.
    pub fn parse_str(s: &str) -> Result<Self, SnowflakeError> {
        s.parse::<i64>()
            .map(Self)
            .map_err(|_| SnowflakeError::InvalidRadix {
                radix: 10,
                input: s.to_string(),
            })
    }

    pub fn base2(&self) -> String {
        encode_radix(self.0 as u64, BASE2_ALPHABET)
    }

    pub fn parse_base2(s: &str) -> Result<Self, SnowflakeError> {
        decode_radix(s.as_bytes(), &BASE2_DECODE, 2)
            .map(|v| Self(v as i64))
            .ok_or_else(|| SnowflakeError::InvalidRadix {
                radix: 2,
                input: s.to_string(),
            })
    }

    /// z-base-32 form, shorter than base36 for the same id.
    pub fn base32(&self) -> String {
        encode_radix(self.0 as u64, BASE32_ALPHABET)
    }

    pub fn parse_base32(s: &[u8]) -> Result<Self, SnowflakeError> {
        decode_radix(s, &BASE32_DECODE, 32)
            .map(|v| Self(v as i64))
            .ok_or(SnowflakeError::InvalidBase32)
    }

    pub fn base36(&self) -> String {
        encode_radix(self.0 as u64, BASE36_ALPHABET)
    }

    /// Parses the base36 form; upper-case digits are accepted.
    pub fn parse_base36(s: &str) -> Result<Self, SnowflakeError> {
        decode_radix(s.as_bytes(), &BASE36_DECODE, 36)
            .map(|v| Self(v as i64))
            .ok_or_else(|| SnowflakeError::InvalidRadix {
                radix: 36,
                input: s.to_string(),
            })
    }

    pub fn base58(&self) -> String {
        encode_radix(self.0 as u64, BASE58_ALPHABET)
    }

    pub fn parse_base58(s: &[u8]) -> Result<Self, SnowflakeError> {
        decode_radix(s, &BASE58_DECODE, 58)
            .map(|v| Self(v as i64))
            .ok_or(SnowflakeError::InvalidBase58)
    }

    /// Standard base64 of the decimal representation.
    pub fn base64(&self) -> String {
        STANDARD.encode(self.bytes())
    }

    pub fn parse_base64(s: &str) -> Result<Self, SnowflakeError> {
        let decoded = STANDARD
            .decode(s)
            .map_err(|_| SnowflakeError::InvalidBase64)?;
        Self::parse_bytes(&decoded)
    }

    /// Decimal representation as ASCII bytes.
    pub fn bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    pub fn parse_bytes(b: &[u8]) -> Result<Self, SnowflakeError> {
        let s = std::str::from_utf8(b).map_err(|_| SnowflakeError::InvalidRadix {
            radix: 10,
            input: String::from_utf8_lossy(b).into_owned(),
        })?;
        Self::parse_str(s)
    }

    /// 8-byte big-endian integer form.
    pub fn int_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_int_bytes(b: [u8; 8]) -> Self {
        Self(i64::from_be_bytes(b))
    }
}

impl fmt::Display for SnowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SnowId {
    type Err = SnowflakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_str(s)
    }
}

impl From<i64> for SnowId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<SnowId> for i64 {
    fn from(id: SnowId) -> Self {
        id.0
    }
}

// JSON consumers lose precision above 2^53, so ids travel as strings.
impl Serialize for SnowId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SnowId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SnowIdVisitor;

        impl Visitor<'_> for SnowIdVisitor {
            type Value = SnowId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a snowflake id as a decimal string or integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<SnowId, E> {
                SnowId::parse_str(v).map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<SnowId, E> {
                Ok(SnowId(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<SnowId, E> {
                i64::try_from(v)
                    .map(SnowId)
                    .map_err(|_| E::custom(SnowflakeError::Overflow))
            }
        }

        deserializer.deserialize_any(SnowIdVisitor)
    }
}
