//! The analysis result: occurrence counts for the 26 letters A–Z.
//!
//! Counting convention (the single stated one): case-insensitive, ASCII
//! letters only. `b'a'` and `b'A'` both land in the `A` bucket; everything
//! else is ignored.

use core::fmt;
use std::collections::BTreeMap;

use serde::de::{Deserializer, Error as _};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

const ALPHABET_LEN: usize = 26;

/// Per-letter occurrence counts.
///
/// Stored as a fixed array so the core field stays strongly typed; the JSON
/// form is a map with all 26 uppercase letters always present
/// (`{"A": 6, "B": 6, ..., "Z": 0}`).
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct LetterCounts([u64; ALPHABET_LEN]);

impl LetterCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tally one input byte. Non-ASCII-alphabetic bytes are ignored.
    pub fn tally(&mut self, byte: u8) {
        if byte.is_ascii_alphabetic() {
            self.0[(byte.to_ascii_uppercase() - b'A') as usize] += 1;
        }
    }

    /// Tally every byte of a chunk.
    pub fn tally_chunk(&mut self, chunk: &[u8]) {
        for &b in chunk {
            self.tally(b);
        }
    }

    /// Count for a letter; `letter` may be either case.
    pub fn get(&self, letter: char) -> u64 {
        debug_assert!(letter.is_ascii_alphabetic());
        self.0[(letter.to_ascii_uppercase() as u8 - b'A') as usize]
    }

    /// Total letters seen.
    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    /// Merge another tally into this one.
    pub fn merge(&mut self, other: &LetterCounts) {
        for (slot, add) in self.0.iter_mut().zip(other.0.iter()) {
            *slot += add;
        }
    }

    fn letter(index: usize) -> char {
        (b'A' + index as u8) as char
    }
}

impl fmt::Debug for LetterCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (i, count) in self.0.iter().enumerate() {
            if *count > 0 {
                map.entry(&Self::letter(i), count);
            }
        }
        map.finish()
    }
}

impl Serialize for LetterCounts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(ALPHABET_LEN))?;
        for (i, count) in self.0.iter().enumerate() {
            map.serialize_entry(&Self::letter(i).to_string(), count)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for LetterCounts {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, u64>::deserialize(deserializer)?;
        let mut counts = [0u64; ALPHABET_LEN];
        for (key, value) in raw {
            let mut chars = key.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_alphabetic() => {
                    counts[(c.to_ascii_uppercase() as u8 - b'A') as usize] = value;
                }
                _ => return Err(D::Error::custom(format!("invalid letter key {key:?}"))),
            }
        }
        Ok(Self(counts))
    }
}
