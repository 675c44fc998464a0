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

//! The DOS 8.3 short name carried by every primary directory entry, and
//! the generator that derives one from an arbitrary long name.

use std::collections::HashSet;

/// 11 raw bytes: 8-byte name, space-padded, followed by a 3-byte
/// extension, also space-padded. `0x05` in byte 0 stands in for a literal
/// `0xE5` (the Kanji lead byte that would otherwise be read as "deleted").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortName {
    pub name: [u8; 8],
    pub ext: [u8; 3],
}

const SPACE: u8 = b' ';

impl ShortName {
    pub const DOT: ShortName = ShortName {
        name: [b'.', SPACE, SPACE, SPACE, SPACE, SPACE, SPACE, SPACE],
        ext: [SPACE, SPACE, SPACE],
    };

    pub const DOT_DOT: ShortName = ShortName {
        name: [b'.', b'.', SPACE, SPACE, SPACE, SPACE, SPACE, SPACE],
        ext: [SPACE, SPACE, SPACE],
    };

    pub fn from_bytes(raw: &[u8; 11]) -> Self {
        let mut name = [SPACE; 8];
        name.copy_from_slice(&raw[0..8]);
        if name[0] == 0x05 {
            name[0] = 0xE5;
        }
        let mut ext = [SPACE; 3];
        ext.copy_from_slice(&raw[8..11]);
        Self { name, ext }
    }

    pub fn to_bytes(self) -> [u8; 11] {
        let mut raw = [SPACE; 11];
        raw[0..8].copy_from_slice(&self.name);
        if raw[0] == 0xE5 {
            raw[0] = 0x05;
        }
        raw[8..11].copy_from_slice(&self.ext);
        raw
    }

    fn from_parts(stem: &str, ext: &str) -> Self {
        let mut name = [SPACE; 8];
        for (slot, byte) in name.iter_mut().zip(stem.as_bytes()) {
            *slot = *byte;
        }
        let mut ext_bytes = [SPACE; 3];
        for (slot, byte) in ext_bytes.iter_mut().zip(ext.as_bytes()) {
            *slot = *byte;
        }
        Self { name, ext: ext_bytes }
    }

    pub fn is_dot_entry(&self) -> bool {
        *self == Self::DOT || *self == Self::DOT_DOT
    }

    /// Checksum over the 11 raw bytes, used to bind LFN entries to their
    /// short entry: `c = ((c >> 1) | (c << 7)) + byte (mod 256)`.
    pub fn checksum(&self) -> u8 {
        let raw = self.to_bytes();
        let mut sum: u8 = 0;
        for byte in raw {
            sum = sum.rotate_right(1).wrapping_add(byte);
        }
        sum
    }

    /// Renders as `"NAME.EXT"` (or just `"NAME"` with no extension),
    /// trimming trailing padding from each half.
    pub fn display(&self) -> String {
        let name = trim_padding(&self.name);
        let ext = trim_padding(&self.ext);
        if ext.is_empty() {
            name
        } else {
            format!("{name}.{ext}")
        }
    }
}

fn trim_padding(raw: &[u8]) -> String {
    let end = raw.iter().rposition(|&b| b != SPACE).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Characters legal (beyond letters and digits) in an 8.3 short name.
const ALLOWED_PUNCTUATION: &[u8] = b"$%'-_@~`!(){}^#&";

fn sanitize_component(input: &str) -> String {
    let mut out = String::new();
    for ch in input.chars() {
        let folded = strip_accent(ch).to_ascii_uppercase();
        if folded.is_ascii_alphanumeric() || ALLOWED_PUNCTUATION.contains(&(folded as u8)) {
            out.push(folded);
        } else if !folded.is_whitespace() || out.is_empty() {
            // Leading/embedded non-whitespace garbage collapses to '_';
            // trailing and embedded spaces are simply dropped, matching
            // how short names never carry internal spaces.
            if folded != ' ' {
                out.push('_');
            }
        }
    }
    out
}

/// A best-effort transliteration of the handful of accented Latin-1
/// letters a long name is likely to contain. Anything outside this table
/// is left as-is and then replaced with `_` by the caller.
fn strip_accent(ch: char) -> char {
    match ch {
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => 'A',
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'È' | 'É' | 'Ê' | 'Ë' => 'E',
        'è' | 'é' | 'ê' | 'ë' => 'e',
        'Ì' | 'Í' | 'Î' | 'Ï' => 'I',
        'ì' | 'í' | 'î' | 'ï' => 'i',
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' => 'O',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' => 'o',
        'Ù' | 'Ú' | 'Û' | 'Ü' => 'U',
        'ù' | 'ú' | 'û' | 'ü' => 'u',
        'Ñ' => 'N',
        'ñ' => 'n',
        'Ç' => 'C',
        'ç' => 'c',
        other => other,
    }
}

fn split_long_name(long_name: &str) -> (&str, &str) {
    match long_name.rfind('.') {
        Some(0) => (long_name, ""), // a leading dot is part of the stem
        Some(index) => (&long_name[..index], &long_name[index + 1..]),
        None => (long_name, ""),
    }
}

fn truncate(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}

fn hash4(long_name: &str) -> u16 {
    // FNV-1a, folded to 16 bits; only used to disambiguate short names
    // once plain `~N` suffixes have been exhausted.
    let mut hash: u32 = 0x811C_9DC5;
    for byte in long_name.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    ((hash >> 16) ^ (hash & 0xFFFF)) as u16
}

pub struct ShortNameGenerator;

impl ShortNameGenerator {
    /// Derives a unique 8.3 short name for `long_name` against the set of
    /// short names already present in a directory. Stable: calling this
    /// again with the same `long_name` and an unchanged `existing` set
    /// always returns the same name.
    pub fn generate(long_name: &str, existing: &HashSet<ShortName>) -> ShortName {
        let (raw_stem, raw_ext) = split_long_name(long_name);
        let stem = sanitize_component(raw_stem);
        let ext = truncate(&sanitize_component(raw_ext), 3);
        let stem8 = truncate(&stem, 8);

        let candidate = ShortName::from_parts(&stem8, &ext);
        if !existing.contains(&candidate) {
            return candidate;
        }

        for n in 1..10_000u32 {
            let suffix = format!("~{n}");
            let base = if n < 5 {
                truncate(&stem8, 8usize.saturating_sub(suffix.chars().count()))
            } else {
                format!("{:04X}", hash4(long_name))
            };
            let stem_with_suffix = truncate(&format!("{base}{suffix}"), 8);
            let candidate = ShortName::from_parts(&stem_with_suffix, &ext);
            if !existing.contains(&candidate) {
                return candidate;
            }
        }

        // Exhausting ten thousand collisions on one stem never happens in
        // practice; fall back to the last candidate tried rather than loop
        // forever.
        ShortName::from_parts(&stem8, &ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trips_through_bytes() {
        let short = ShortName::from_parts("HELLO", "TXT");
        assert_eq!(short.display(), "HELLO.TXT");
        let raw = short.to_bytes();
        assert_eq!(ShortName::from_bytes(&raw), short);
    }

    #[test]
    fn checksum_is_stable() {
        let short = ShortName::from_parts("HELLO", "TXT");
        assert_eq!(short.checksum(), short.checksum());
    }

    #[test]
    fn generate_is_stable_with_empty_set() {
        let existing = HashSet::new();
        let a = ShortNameGenerator::generate("hello.txt", &existing);
        let b = ShortNameGenerator::generate("hello.txt", &existing);
        assert_eq!(a, b);
        assert_eq!(a.display(), "HELLO.TXT");
    }

    #[test]
    fn generate_adds_numeric_tail_on_collision() {
        let mut existing = HashSet::new();
        let first = ShortNameGenerator::generate("foobar.txt", &existing);
        existing.insert(first);
        let second = ShortNameGenerator::generate("foobar.txt", &existing);
        assert_ne!(first, second);
        assert!(second.display().starts_with("FOOBAR~1") || second.display().contains('~'));
    }

    #[test]
    fn generate_sanitizes_disallowed_characters() {
        let existing = HashSet::new();
        let short = ShortNameGenerator::generate("a b+c.txt", &existing);
        assert!(!short.display().contains(' '));
        assert!(!short.display().contains('+'));
    }
}
