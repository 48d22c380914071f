// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Encode and decode the fixed-layout bless records stored in volume metadata.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Bless record codec.
//!
//! Two layouts exist on disk. The legacy layout is the eight-word finder-info
//! array of a volume root, persisted big-endian. The modern layout is the pair
//! of 64-bit object identifiers kept by container filesystems, persisted
//! little-endian. Both are held host-endian in memory; byte order is applied
//! only by [`BlessRecord::encode`] and [`BlessRecord::decode`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of 32-bit words in the legacy finder-info record.
pub const FINDER_INFO_WORDS: usize = 8;
/// Serialised length of the legacy finder-info record.
pub const FINDER_INFO_LEN: usize = FINDER_INFO_WORDS * 4;
/// Serialised length of the modern two-word record.
pub const APFS_BLESS_LEN: usize = 16;

/// Word holding the blessed system folder.
pub const WORD_SYSTEM_FOLDER: usize = 0;
/// Word holding the startup application folder.
pub const WORD_STARTUP_APP: usize = 1;
/// Word holding the head of the open-folder list.
pub const WORD_OPEN_FOLDER: usize = 2;
/// Word holding the classic blessed folder.
pub const WORD_FOLDER_9: usize = 3;
/// Reserved word, carried through every rewrite.
pub const WORD_RESERVED: usize = 4;
/// Word holding the modern blessed folder.
pub const WORD_FOLDER_X: usize = 5;
/// High half of the 64-bit volume identifier.
pub const WORD_VSDB_HIGH: usize = 6;
/// Low half of the 64-bit volume identifier.
pub const WORD_VSDB_LOW: usize = 7;
/// On files, the 16-bit Finder flags sit in the high half of this word.
pub const WORD_FILE_FLAGS: usize = 2;

/// Finder flag hiding a file from the desktop.
pub const FLAG_INVISIBLE: u16 = 0x4000;
/// Finder flag marking a file with a custom icon.
pub const FLAG_HAS_CUSTOM_ICON: u16 = 0x0400;

/// Human-readable description of finder-info words 0 through 5 and the volume id.
///
/// Each entry is `(unset, set)`; the set message is followed by the resolved path.
pub const FINDER_INFO_MESSAGES: [(&str, &str); 7] = [
    ("No Blessed System Folder", "Blessed System Folder is "),
    ("No Startup App folder (ignored anyway)", "Startup App folder is "),
    ("Open-folder linked list empty", "1st dir in open-folder list is "),
    ("No OS 9 + X blessed 9 folder", "OS 9 blessed folder is "),
    ("Unused field unset", "Thought-to-be-unused field points to "),
    ("No OS 9 + X blessed X folder", "OS X blessed folder is "),
    ("64-bit VSDB volume id not present", "64-bit VSDB volume id: "),
];

/// Errors raised while decoding bless records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    /// The buffer is shorter than the record layout.
    #[error("record truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required by the layout.
        expected: usize,
        /// Bytes supplied by the caller.
        actual: usize,
    },
    /// The buffer carries bytes beyond the record layout.
    #[error("record has trailing data: expected {expected} bytes, got {actual}")]
    TrailingData {
        /// Bytes required by the layout.
        expected: usize,
        /// Bytes supplied by the caller.
        actual: usize,
    },
    /// A word index outside the record was requested.
    #[error("word index {0} out of range")]
    WordIndex(usize),
}

/// Record layouts understood by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordKind {
    /// Eight 32-bit directory ids, big-endian on disk.
    LegacyEightWord,
    /// Two 64-bit object ids, little-endian on disk.
    ModernTwoWord64,
}

impl RecordKind {
    /// Serialised length of this layout.
    #[must_use]
    pub fn byte_len(self) -> usize {
        match self {
            RecordKind::LegacyEightWord => FINDER_INFO_LEN,
            RecordKind::ModernTwoWord64 => APFS_BLESS_LEN,
        }
    }
}

/// Legacy finder-info words in host order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FinderInfo {
    words: [u32; FINDER_INFO_WORDS],
}

impl FinderInfo {
    /// Wrap raw words.
    #[must_use]
    pub fn new(words: [u32; FINDER_INFO_WORDS]) -> Self {
        Self { words }
    }

    /// Borrow every word.
    #[must_use]
    pub fn words(&self) -> &[u32; FINDER_INFO_WORDS] {
        &self.words
    }

    /// Read one word.
    pub fn word(&self, index: usize) -> Result<u32, RecordError> {
        self.words
            .get(index)
            .copied()
            .ok_or(RecordError::WordIndex(index))
    }

    /// Overwrite one word.
    pub fn set_word(&mut self, index: usize, value: u32) -> Result<(), RecordError> {
        let slot = self
            .words
            .get_mut(index)
            .ok_or(RecordError::WordIndex(index))?;
        *slot = value;
        Ok(())
    }

    /// Apply a bless-folder update to words 0, 3 and 5, leaving the others untouched.
    ///
    /// Word 3 takes `dir9` and word 5 takes `dir_x`. Word 0 takes `dir_x` when it
    /// is non-zero and `use_x` is set, otherwise `dir9`.
    #[must_use]
    pub fn with_blessed_dirs(mut self, dir9: u32, dir_x: u32, use_x: bool) -> Self {
        self.words[WORD_FOLDER_9] = dir9;
        self.words[WORD_FOLDER_X] = dir_x;
        self.words[WORD_SYSTEM_FOLDER] = if dir_x != 0 && use_x { dir_x } else { dir9 };
        self
    }

    /// Finder flags of a file record.
    #[must_use]
    pub fn file_flags(&self) -> u16 {
        (self.words[WORD_FILE_FLAGS] >> 16) as u16
    }

    /// Set or clear `flag` in a file record's Finder flags; every other bit is kept.
    #[must_use]
    pub fn with_file_flag(mut self, flag: u16, set: bool) -> Self {
        let mask = u32::from(flag) << 16;
        if set {
            self.words[WORD_FILE_FLAGS] |= mask;
        } else {
            self.words[WORD_FILE_FLAGS] &= !mask;
        }
        self
    }

    /// 64-bit volume identifier stored in words 6 and 7.
    #[must_use]
    pub fn vsdb_id(&self) -> u64 {
        (u64::from(self.words[WORD_VSDB_HIGH]) << 32) | u64::from(self.words[WORD_VSDB_LOW])
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut words = [0u32; FINDER_INFO_WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self { words }
    }

    fn encode(&self) -> Vec<u8> {
        self.words.iter().flat_map(|word| word.to_be_bytes()).collect()
    }
}

/// Modern bless data: the blessed system object and its loader object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApfsBlessData {
    /// Object id of the blessed system folder.
    pub system: u64,
    /// Object id of the loader file inside it, zero when absent.
    pub loader: u64,
}

impl ApfsBlessData {
    /// Construct bless data from the two object ids.
    #[must_use]
    pub fn new(system: u64, loader: u64) -> Self {
        Self { system, loader }
    }

    /// Both object ids in record order.
    #[must_use]
    pub fn words(&self) -> [u64; 2] {
        [self.system, self.loader]
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut system = [0u8; 8];
        let mut loader = [0u8; 8];
        system.copy_from_slice(&bytes[..8]);
        loader.copy_from_slice(&bytes[8..APFS_BLESS_LEN]);
        Self {
            system: u64::from_le_bytes(system),
            loader: u64::from_le_bytes(loader),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(APFS_BLESS_LEN);
        out.extend_from_slice(&self.system.to_le_bytes());
        out.extend_from_slice(&self.loader.to_le_bytes());
        out
    }
}

/// A bless record in either layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "words", rename_all = "kebab-case")]
pub enum BlessRecord {
    /// Legacy finder-info words.
    LegacyEightWord(FinderInfo),
    /// Modern two-word object ids.
    ModernTwoWord64(ApfsBlessData),
}

impl BlessRecord {
    /// Layout of this record.
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            BlessRecord::LegacyEightWord(_) => RecordKind::LegacyEightWord,
            BlessRecord::ModernTwoWord64(_) => RecordKind::ModernTwoWord64,
        }
    }

    /// Decode a persisted buffer of the given layout.
    pub fn decode(kind: RecordKind, bytes: &[u8]) -> Result<Self, RecordError> {
        let expected = kind.byte_len();
        if bytes.len() < expected {
            return Err(RecordError::Truncated {
                expected,
                actual: bytes.len(),
            });
        }
        if bytes.len() > expected {
            return Err(RecordError::TrailingData {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(match kind {
            RecordKind::LegacyEightWord => BlessRecord::LegacyEightWord(FinderInfo::decode(bytes)),
            RecordKind::ModernTwoWord64 => {
                BlessRecord::ModernTwoWord64(ApfsBlessData::decode(bytes))
            }
        })
    }

    /// Encode into the persisted byte order of the layout.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            BlessRecord::LegacyEightWord(info) => info.encode(),
            BlessRecord::ModernTwoWord64(data) => data.encode(),
        }
    }

    /// Borrow the legacy words, if this is a legacy record.
    #[must_use]
    pub fn as_finder_info(&self) -> Option<&FinderInfo> {
        match self {
            BlessRecord::LegacyEightWord(info) => Some(info),
            BlessRecord::ModernTwoWord64(_) => None,
        }
    }

    /// Borrow the modern words, if this is a modern record.
    #[must_use]
    pub fn as_apfs(&self) -> Option<&ApfsBlessData> {
        match self {
            BlessRecord::ModernTwoWord64(data) => Some(data),
            BlessRecord::LegacyEightWord(_) => None,
        }
    }
}

impl From<FinderInfo> for BlessRecord {
    fn from(info: FinderInfo) -> Self {
        BlessRecord::LegacyEightWord(info)
    }
}

impl From<ApfsBlessData> for BlessRecord {
    fn from(data: ApfsBlessData) -> Self {
        BlessRecord::ModernTwoWord64(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bless_dirs_prefer_x_when_requested() {
        let info = FinderInfo::new([9, 0, 0, 7, 42, 11, 0, 0]);
        assert_eq!(
            info.with_blessed_dirs(7, 11, true).words(),
            &[11, 0, 0, 7, 42, 11, 0, 0]
        );
        assert_eq!(
            info.with_blessed_dirs(7, 11, false).words(),
            &[7, 0, 0, 7, 42, 11, 0, 0]
        );
    }

    #[test]
    fn file_flags_live_in_bytes_eight_and_nine() {
        let info = FinderInfo::new([0x5445_5854, 0x7474_7874, 0x0100_0000, 0, 0, 0, 0, 0]);
        let hidden = info.with_file_flag(FLAG_INVISIBLE, true);
        assert_eq!(hidden.file_flags(), 0x4100);
        assert_eq!(&hidden.encode()[8..10], &[0x41, 0x00]);
        assert_eq!(hidden.words()[..2], info.words()[..2]);

        let shown = hidden.with_file_flag(FLAG_INVISIBLE, false);
        assert_eq!(shown, info);
        assert_eq!(shown.with_file_flag(FLAG_HAS_CUSTOM_ICON, false), info);
    }

    #[test]
    fn bless_dirs_fall_back_to_nine_without_x() {
        let info = FinderInfo::new([1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(
            info.with_blessed_dirs(20, 0, true).words(),
            &[20, 2, 3, 20, 5, 0, 7, 8]
        );
    }

    #[test]
    fn legacy_layout_is_big_endian() {
        let info = FinderInfo::new([0x0102_0304, 0, 0, 0, 0, 0, 0, 0x0a0b_0c0d]);
        let bytes = BlessRecord::from(info).encode();
        assert_eq!(bytes.len(), FINDER_INFO_LEN);
        assert_eq!(&bytes[..4], &[1, 2, 3, 4]);
        assert_eq!(&bytes[28..], &[0x0a, 0x0b, 0x0c, 0x0d]);
    }

    #[test]
    fn modern_layout_is_little_endian() {
        let bytes = BlessRecord::from(ApfsBlessData::new(0x10, 0x0201)).encode();
        assert_eq!(bytes.len(), APFS_BLESS_LEN);
        assert_eq!(bytes[0], 0x10);
        assert_eq!(&bytes[8..10], &[0x01, 0x02]);
        let decoded = BlessRecord::decode(RecordKind::ModernTwoWord64, &bytes).expect("decode");
        assert_eq!(decoded.as_apfs().map(ApfsBlessData::words), Some([0x10, 0x0201]));
    }

    #[test]
    fn decode_rejects_wrong_lengths() {
        assert_eq!(
            BlessRecord::decode(RecordKind::LegacyEightWord, &[0u8; 31]),
            Err(RecordError::Truncated {
                expected: 32,
                actual: 31
            })
        );
        assert_eq!(
            BlessRecord::decode(RecordKind::ModernTwoWord64, &[0u8; 17]),
            Err(RecordError::TrailingData {
                expected: 16,
                actual: 17
            })
        );
    }

    #[test]
    fn vsdb_id_joins_words_six_and_seven() {
        let info = FinderInfo::new([0, 0, 0, 0, 0, 0, 0xdead_beef, 0x0000_0001]);
        assert_eq!(info.vsdb_id(), 0xdead_beef_0000_0001);
        assert!(info.word(8).is_err());
    }

    #[test]
    fn records_serialise_with_kind_tag() {
        let record = BlessRecord::from(ApfsBlessData::new(5, 6));
        let json = serde_json::to_string(&record).expect("json");
        assert_eq!(json, r#"{"kind":"modern-two-word64","words":{"system":5,"loader":6}}"#);
        let legacy: BlessRecord =
            serde_json::from_str(r#"{"kind":"legacy-eight-word","words":[1,2,3,4,5,6,7,8]}"#)
                .expect("parse");
        assert_eq!(legacy.as_finder_info().map(|i| i.words()[4]), Some(5));
    }
}
