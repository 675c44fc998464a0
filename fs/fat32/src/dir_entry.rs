// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Coding of the two 32-byte directory entry shapes (short-name and LFN),
//! and [`FatLfnDirectoryEntry`], the in-memory logical record that glues a
//! run of LFN entries to the one short entry they describe.

use log::warn;
use zerocopy::{little_endian::U16, little_endian::U32, FromBytes, Immutable, IntoBytes, KnownLayout};

use umas_fs::{attr, DosTimestamp};

use crate::short_name::ShortName;

pub const ENTRY_SIZE: usize = 32;
pub const DELETED_MARKER: u8 = 0xE5;
pub const FREE_MARKER: u8 = 0x00;
const LAST_LONG_ENTRY: u8 = 0x40;
const LFN_CHARS_PER_ENTRY: usize = 13;

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawShortEntry {
    pub name: [u8; 11],
    pub attr: u8,
    pub nt_reserved: u8,
    pub creation_time_tenths: u8,
    pub creation_time: U16,
    pub creation_date: U16,
    pub last_access_date: U16,
    pub first_cluster_high: U16,
    pub last_write_time: U16,
    pub last_write_date: U16,
    pub first_cluster_low: U16,
    pub file_size: U32,
}

const _: () = assert!(std::mem::size_of::<RawShortEntry>() == ENTRY_SIZE);

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawLfnEntry {
    pub sequence: u8,
    pub name1: [U16; 5],
    pub attr: u8,
    pub entry_type: u8,
    pub checksum: u8,
    pub name2: [U16; 6],
    pub first_cluster_low: U16,
    pub name3: [U16; 2],
}

const _: () = assert!(std::mem::size_of::<RawLfnEntry>() == ENTRY_SIZE);

/// A decoded short-name (primary) directory entry.
#[derive(Debug, Clone, Copy)]
pub struct ShortEntry {
    pub short_name: ShortName,
    pub attributes: u8,
    pub created_at: DosTimestamp,
    pub last_write: DosTimestamp,
    pub last_access_date: u16,
    pub first_cluster: u32,
    pub file_size: u32,
}

impl ShortEntry {
    pub fn is_directory(&self) -> bool {
        self.attributes & attr::DIRECTORY != 0
    }

    pub fn decode(raw: &RawShortEntry) -> Self {
        Self {
            short_name: ShortName::from_bytes(&raw.name),
            attributes: raw.attr,
            created_at: DosTimestamp {
                date: raw.creation_date.get(),
                time: raw.creation_time.get(),
                time_tenths: raw.creation_time_tenths,
            },
            last_write: DosTimestamp {
                date: raw.last_write_date.get(),
                time: raw.last_write_time.get(),
                time_tenths: 0,
            },
            last_access_date: raw.last_access_date.get(),
            first_cluster: (raw.first_cluster_high.get() as u32) << 16 | raw.first_cluster_low.get() as u32,
            file_size: raw.file_size.get(),
        }
    }

    pub fn encode(&self) -> RawShortEntry {
        RawShortEntry {
            name: self.short_name.to_bytes(),
            attr: self.attributes,
            nt_reserved: 0,
            creation_time_tenths: self.created_at.time_tenths,
            creation_time: self.created_at.time.into(),
            creation_date: self.created_at.date.into(),
            last_access_date: self.last_access_date.into(),
            first_cluster_high: ((self.first_cluster >> 16) as u16).into(),
            last_write_time: self.last_write.time.into(),
            last_write_date: self.last_write.date.into(),
            first_cluster_low: (self.first_cluster as u16).into(),
            file_size: self.file_size.into(),
        }
    }
}

/// One 32-byte LFN entry's 13 UCS-2 code units, already split in decode
/// order (name1, name2, name3 concatenated).
fn lfn_units(raw: &RawLfnEntry) -> [u16; LFN_CHARS_PER_ENTRY] {
    let mut units = [0u16; LFN_CHARS_PER_ENTRY];
    for (i, u) in raw.name1.iter().enumerate() {
        units[i] = u.get();
    }
    for (i, u) in raw.name2.iter().enumerate() {
        units[5 + i] = u.get();
    }
    for (i, u) in raw.name3.iter().enumerate() {
        units[11 + i] = u.get();
    }
    units
}

fn encode_lfn_units(units: &[u16; LFN_CHARS_PER_ENTRY]) -> RawLfnEntry {
    let mut name1 = [U16::from(0u16); 5];
    let mut name2 = [U16::from(0u16); 6];
    let mut name3 = [U16::from(0u16); 2];
    for i in 0..5 {
        name1[i] = units[i].into();
    }
    for i in 0..6 {
        name2[i] = units[5 + i].into();
    }
    for i in 0..2 {
        name3[i] = units[11 + i].into();
    }
    RawLfnEntry {
        sequence: 0,
        name1,
        attr: attr::LONG_NAME,
        entry_type: 0,
        checksum: 0,
        name2,
        first_cluster_low: U16::from(0u16),
        name3,
    }
}

/// The full logical directory record: an optional run of LFN entries (in
/// on-disk, i.e. reverse, physical order) plus the short entry they
/// describe.
#[derive(Debug, Clone)]
pub struct FatLfnDirectoryEntry {
    pub long_name: Option<String>,
    pub short: ShortEntry,
}

impl FatLfnDirectoryEntry {
    pub fn new_short_only(short: ShortEntry) -> Self {
        Self { long_name: None, short }
    }

    pub fn with_long_name(long_name: String, short: ShortEntry) -> Self {
        Self {
            long_name: Some(long_name),
            short,
        }
    }

    /// The name callers should see: the long name if present, otherwise
    /// the short name rendered as `NAME.EXT`.
    pub fn display_name(&self) -> String {
        self.long_name.clone().unwrap_or_else(|| self.short.short_name.display())
    }

    /// Number of 32-byte entries this record occupies on disk:
    /// `ceil(len / 13) + 1`.
    pub fn entry_count(&self) -> usize {
        match &self.long_name {
            Some(name) => name.encode_utf16().count().div_ceil(LFN_CHARS_PER_ENTRY) + 1,
            None => 1,
        }
    }

    /// Serializes to on-disk order: LFN entries highest-sequence-first,
    /// then the short entry.
    pub fn encode(&self) -> Vec<[u8; ENTRY_SIZE]> {
        let mut out = Vec::with_capacity(self.entry_count());
        if let Some(name) = &self.long_name {
            let checksum = self.short.short_name.checksum();
            let units: Vec<u16> = name.encode_utf16().collect();
            let chunk_count = units.len().div_ceil(LFN_CHARS_PER_ENTRY).max(1);

            let mut lfn_entries = Vec::with_capacity(chunk_count);
            for chunk_index in 0..chunk_count {
                let start = chunk_index * LFN_CHARS_PER_ENTRY;
                let mut chunk = [0xFFFFu16; LFN_CHARS_PER_ENTRY];
                let remaining = units.len().saturating_sub(start);
                let take = remaining.min(LFN_CHARS_PER_ENTRY);
                chunk[..take].copy_from_slice(&units[start..start + take]);
                if take < LFN_CHARS_PER_ENTRY {
                    chunk[take] = 0x0000;
                }
                let mut entry = encode_lfn_units(&chunk);
                entry.checksum = checksum;
                entry.sequence = (chunk_index + 1) as u8;
                lfn_entries.push(entry);
            }
            if let Some(last) = lfn_entries.last_mut() {
                last.sequence |= LAST_LONG_ENTRY;
            }
            for entry in lfn_entries.into_iter().rev() {
                out.push(entry.as_bytes().try_into().unwrap());
            }
        }
        out.push(self.short.encode().as_bytes().try_into().unwrap());
        out
    }
}

/// Accumulates a run of LFN entries seen in on-disk order and, once the
/// associated short entry arrives, yields one [`FatLfnDirectoryEntry`].
/// Mirrors the streaming parse the spec describes: consecutive LFN
/// entries accumulate, a non-LFN entry ends the group, and a `0xE5`
/// leading byte discards whatever was pending.
#[derive(Default)]
pub struct LfnAccumulator {
    pending: Vec<RawLfnEntry>,
}

pub enum ParsedEntry {
    /// Nothing to report yet (still accumulating LFN entries, or a
    /// deleted/free slot).
    None,
    EndOfDirectory,
    Entry(FatLfnDirectoryEntry),
    /// A volume-label entry (root only): not a file or directory.
    VolumeLabel([u8; 11]),
}

impl LfnAccumulator {
    pub fn feed(&mut self, raw: &[u8; ENTRY_SIZE]) -> ParsedEntry {
        if raw[0] == FREE_MARKER {
            return ParsedEntry::EndOfDirectory;
        }
        if raw[0] == DELETED_MARKER {
            self.pending.clear();
            return ParsedEntry::None;
        }

        let attr_byte = raw[11];
        if attr_byte == attr::LONG_NAME {
            let lfn = RawLfnEntry::read_from_bytes(&raw[..]).expect("32-byte slice");
            if lfn.sequence & LAST_LONG_ENTRY != 0 {
                self.pending.clear();
            }
            self.pending.push(lfn);
            return ParsedEntry::None;
        }

        let short_raw = RawShortEntry::read_from_bytes(&raw[..]).expect("32-byte slice");
        if short_raw.attr & attr::VOLUME_ID != 0 && short_raw.attr & attr::DIRECTORY == 0 {
            self.pending.clear();
            return ParsedEntry::VolumeLabel(short_raw.name);
        }

        let short = ShortEntry::decode(&short_raw);
        let long_name = self.take_long_name(&short.short_name);
        ParsedEntry::Entry(FatLfnDirectoryEntry {
            long_name,
            short,
        })
    }

    fn take_long_name(&mut self, short_name: &ShortName) -> Option<String> {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return None;
        }

        let expected_checksum = short_name.checksum();
        let mut ordered = pending;
        ordered.sort_by_key(|entry| entry.sequence & !LAST_LONG_ENTRY);

        for (index, entry) in ordered.iter().enumerate() {
            let seq = entry.sequence & !LAST_LONG_ENTRY;
            if seq as usize != index + 1 || entry.checksum != expected_checksum {
                warn!("LFN group checksum/sequence mismatch, falling back to short name");
                return None;
            }
        }

        let mut units = Vec::with_capacity(ordered.len() * LFN_CHARS_PER_ENTRY);
        for entry in &ordered {
            units.extend_from_slice(&lfn_units(entry));
        }
        if let Some(terminator) = units.iter().position(|&u| u == 0x0000) {
            units.truncate(terminator);
        } else {
            while units.last() == Some(&0xFFFF) {
                units.pop();
            }
        }

        String::from_utf16(&units).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_short(name: &str, ext: &str) -> ShortEntry {
        ShortEntry {
            short_name: crate::short_name::ShortName::from_bytes(&{
                let mut raw = [b' '; 11];
                raw[..name.len()].copy_from_slice(name.as_bytes());
                raw[8..8 + ext.len()].copy_from_slice(ext.as_bytes());
                raw
            }),
            attributes: attr::ARCHIVE,
            created_at: DosTimestamp::EPOCH,
            last_write: DosTimestamp::EPOCH,
            last_access_date: DosTimestamp::EPOCH.date,
            first_cluster: 5,
            file_size: 0,
        }
    }

    #[test]
    fn long_name_round_trips_through_encode_and_parse() {
        let short = sample_short("HELLO~1 ", "TXT");
        let entry = FatLfnDirectoryEntry::with_long_name("héllo wörld.txt".to_string(), short);
        assert_eq!(entry.entry_count(), 3); // 15 chars -> ceil(15/13)=2 LFN entries, +1 short

        let encoded = entry.encode();
        assert_eq!(encoded.len(), 3);

        let mut accumulator = LfnAccumulator::default();
        let mut result = None;
        for raw in &encoded {
            if let ParsedEntry::Entry(parsed) = accumulator.feed(raw) {
                result = Some(parsed);
            }
        }
        let parsed = result.expect("short entry terminates the group");
        assert_eq!(parsed.long_name.as_deref(), Some("héllo wörld.txt"));
    }

    #[test]
    fn checksum_mismatch_falls_back_to_short_name() {
        let short = sample_short("HELLO~1 ", "TXT");
        let entry = FatLfnDirectoryEntry::with_long_name("long name.txt".to_string(), short);
        let mut encoded = entry.encode();
        // Corrupt the checksum byte (offset 13) of the one LFN entry.
        encoded[0][13] ^= 0xFF;

        let mut accumulator = LfnAccumulator::default();
        let mut result = None;
        for raw in &encoded {
            if let ParsedEntry::Entry(parsed) = accumulator.feed(raw) {
                result = Some(parsed);
            }
        }
        let parsed = result.unwrap();
        assert_eq!(parsed.long_name, None);
    }

    #[test]
    fn deleted_marker_clears_pending_lfn_entries() {
        let short = sample_short("HELLO~1 ", "TXT");
        let entry = FatLfnDirectoryEntry::with_long_name("long name.txt".to_string(), short);
        let mut encoded = entry.encode();
        encoded[0][0] = DELETED_MARKER; // delete the LFN entry only

        let mut accumulator = LfnAccumulator::default();
        let mut saw_entry = false;
        for raw in &encoded {
            if let ParsedEntry::Entry(_) = accumulator.feed(raw) {
                saw_entry = true;
            }
        }
        // The short entry still parses, just without its long name.
        assert!(saw_entry);
    }
}
