// Copyright (c) 2024 Botho Foundation

//! Identifiers shared by every table: account names, token symbol codes and
//! the resource a limit applies to.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

const NAME_CHARMAP: &[u8; 32] = b".12345abcdefghijklmnopqrstuvwxyz";
const MAX_NAME_LEN: usize = 13;
const MAX_SYMBOL_LEN: usize = 7;

/// Errors parsing an [`AccountName`] or [`SymbolCode`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("name '{0}' is longer than {MAX_NAME_LEN} characters")]
    NameTooLong(String),

    #[error("name '{0}' contains a character outside [.1-5a-z]")]
    InvalidNameChar(String),

    #[error("thirteenth character of '{0}' must be in [.1-5a-j]")]
    InvalidLastChar(String),

    #[error("symbol code '{0}' must be 1 to {MAX_SYMBOL_LEN} uppercase letters")]
    InvalidSymbol(String),
}

/// An account name: up to 12 characters of `[.1-5a-z]` (plus a thirteenth
/// restricted to `[.1-5a-j]`), packed five bits per character into a u64.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountName(u64);

impl AccountName {
    /// Wrap a raw packed value.
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// The packed value.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Big-endian bytes, used as (part of) a store key.
    pub fn to_key_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// True for the empty name.
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

fn name_char_value(c: u8) -> Option<u64> {
    match c {
        b'a'..=b'z' => Some((c - b'a') as u64 + 6),
        b'1'..=b'5' => Some((c - b'1') as u64 + 1),
        b'.' => Some(0),
        _ => None,
    }
}

impl FromStr for AccountName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() > MAX_NAME_LEN {
            return Err(NameError::NameTooLong(s.to_string()));
        }

        let mut value = 0u64;
        for (i, &c) in bytes.iter().enumerate() {
            let sym = name_char_value(c).ok_or_else(|| NameError::InvalidNameChar(s.to_string()))?;
            if i < 12 {
                value |= (sym & 0x1f) << (64 - 5 * (i + 1));
            } else {
                if sym > 0x0f {
                    return Err(NameError::InvalidLastChar(s.to_string()));
                }
                value |= sym;
            }
        }
        Ok(Self(value))
    }
}

impl fmt::Display for AccountName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut chars = [b'.'; MAX_NAME_LEN];
        let mut tmp = self.0;
        for i in 0..MAX_NAME_LEN {
            let (mask, shift) = if i == 0 { (0x0f, 4) } else { (0x1f, 5) };
            chars[MAX_NAME_LEN - 1 - i] = NAME_CHARMAP[(tmp & mask) as usize];
            tmp >>= shift;
        }
        let len = chars.iter().rposition(|&c| c != b'.').map_or(0, |p| p + 1);
        // Every byte comes from NAME_CHARMAP, which is ASCII.
        f.write_str(std::str::from_utf8(&chars[..len]).map_err(|_| fmt::Error)?)
    }
}

impl fmt::Debug for AccountName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountName({self})")
    }
}

/// A token symbol code: 1 to 7 uppercase letters packed one byte per letter,
/// first letter in the lowest byte.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SymbolCode(u64);

impl SymbolCode {
    /// Wrap a raw packed value.
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// The packed value.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Big-endian bytes, used as the leading part of stake keys.
    pub fn to_key_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl FromStr for SymbolCode {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.is_empty()
            || bytes.len() > MAX_SYMBOL_LEN
            || !bytes.iter().all(|c| c.is_ascii_uppercase())
        {
            return Err(NameError::InvalidSymbol(s.to_string()));
        }
        let value = bytes
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, &c)| acc | ((c as u64) << (8 * i)));
        Ok(Self(value))
    }
}

impl fmt::Display for SymbolCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tmp = self.0;
        while tmp != 0 {
            write!(f, "{}", (tmp & 0xff) as u8 as char)?;
            tmp >>= 8;
        }
        Ok(())
    }
}

impl fmt::Debug for SymbolCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymbolCode({self})")
    }
}

/// The resource an account limit is computed for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourcePurpose {
    Cpu,
    Net,
    Ram,
}

impl fmt::Display for ResourcePurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourcePurpose::Cpu => write!(f, "cpu"),
            ResourcePurpose::Net => write!(f, "net"),
            ResourcePurpose::Ram => write!(f, "ram"),
        }
    }
}
