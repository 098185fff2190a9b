//! minimal ethereum abi plumbing
//!
//! calls take static uint256/address arguments only. return data may hold
//! dynamic tuples, arrays and bytes, reached through [`Words::follow`].

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

pub const WORD: usize = 32;

/// keccak256 hash
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// 4-byte function or error selector, e.g. `selector("isTallied()")`
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// selector as `0x`-prefixed hex, the form it takes inside revert messages
pub fn selector_hex(signature: &str) -> String {
    format!("0x{}", hex::encode(selector(signature)))
}

/// 20-byte account or contract address
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let stripped = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(|| Error::InvalidAddress(s.to_string()))?;
        if stripped.len() != 40 {
            return Err(Error::InvalidAddress(s.to_string()));
        }
        let bytes = hex::decode(stripped).map_err(|_| Error::InvalidAddress(s.to_string()))?;
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(Address(out))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// a static abi argument
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    Uint(u128),
    Address(Address),
    Bool(bool),
}

impl Token {
    fn to_word(&self) -> [u8; WORD] {
        let mut word = [0u8; WORD];
        match self {
            Token::Uint(v) => word[16..].copy_from_slice(&v.to_be_bytes()),
            Token::Address(a) => word[12..].copy_from_slice(&a.0),
            Token::Bool(b) => word[31] = *b as u8,
        }
        word
    }
}

/// encode calldata for `signature` with static arguments
pub fn encode_call(signature: &str, args: &[Token]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + args.len() * WORD);
    data.extend_from_slice(&selector(signature));
    data.extend(encode_tokens(args));
    data
}

/// head-only encoding of static values, as a view function returns them
pub fn encode_tokens(values: &[Token]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_word()).collect()
}

/// read-only view over abi-encoded return data
pub struct Words<'a> {
    data: &'a [u8],
}

impl<'a> Words<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len() / WORD
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn word(&self, index: usize) -> Result<&'a [u8]> {
        let start = index * WORD;
        self.data.get(start..start + WORD).ok_or_else(|| {
            Error::AbiDecode(format!(
                "word {} out of range ({} bytes returned)",
                index,
                self.data.len()
            ))
        })
    }

    pub fn uint128(&self, index: usize) -> Result<u128> {
        let word = self.word(index)?;
        if word[..16].iter().any(|b| *b != 0) {
            return Err(Error::Overflow {
                target: "u128",
                value: hex::encode(word),
            });
        }
        let mut buf = [0u8; 16];
        buf.copy_from_slice(&word[16..]);
        Ok(u128::from_be_bytes(buf))
    }

    pub fn uint64(&self, index: usize) -> Result<u64> {
        let value = self.uint128(index)?;
        u64::try_from(value).map_err(|_| Error::Overflow {
            target: "u64",
            value: format!("{:x}", value),
        })
    }

    pub fn boolean(&self, index: usize) -> Result<bool> {
        match self.uint128(index)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::AbiDecode(format!("invalid bool word: {}", other))),
        }
    }

    pub fn address(&self, index: usize) -> Result<Address> {
        let word = self.word(index)?;
        if word[..12].iter().any(|b| *b != 0) {
            return Err(Error::AbiDecode(format!(
                "dirty address word: 0x{}",
                hex::encode(word)
            )));
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(&word[12..]);
        Ok(Address(out))
    }

    /// follow a head offset to a dynamic tuple and return a view starting there
    pub fn follow(&self, index: usize) -> Result<Words<'a>> {
        let offset = self.uint64(index)? as usize;
        let tail = self
            .data
            .get(offset..)
            .ok_or_else(|| Error::AbiDecode(format!("offset {} out of range", offset)))?;
        Ok(Words { data: tail })
    }

    /// view starting `count` words further on
    pub fn skip(&self, count: usize) -> Result<Words<'a>> {
        let tail = self
            .data
            .get(count * WORD..)
            .ok_or_else(|| Error::AbiDecode(format!("cannot skip {} words", count)))?;
        Ok(Words { data: tail })
    }

    /// dynamic `bytes` referenced by the head word at `index`
    pub fn bytes(&self, index: usize) -> Result<Vec<u8>> {
        let tail = self.follow(index)?;
        let len = tail.uint64(0)? as usize;
        tail.data
            .get(WORD..WORD + len)
            .map(|b| b.to_vec())
            .ok_or_else(|| Error::AbiDecode(format!("bytes of length {} truncated", len)))
    }
}

/// decode a `0x`-prefixed hex string into bytes
pub fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(stripped).map_err(|e| Error::AbiDecode(format!("invalid hex {}: {}", s, e)))
}

/// parse a `0x`-prefixed hex quantity
pub fn parse_quantity(s: &str) -> Result<u64> {
    let stripped = s
        .strip_prefix("0x")
        .ok_or_else(|| Error::AbiDecode(format!("quantity without 0x prefix: {}", s)))?;
    u64::from_str_radix(stripped, 16)
        .map_err(|e| Error::AbiDecode(format!("invalid quantity {}: {}", s, e)))
}
