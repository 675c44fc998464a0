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

//! The filesystem-agnostic surface: a polymorphic file/directory tree that
//! any on-disk format (today: FAT32, in `umas_fs_fat32`) can implement.
//! Host applications only ever import this crate plus one backend.

pub use umas_err::*;

/// DOS date+time, packed exactly as it is stored in a directory entry:
/// bits 15-9 year-1980, 8-5 month, 4-0 day for the date half; bits 15-11
/// hours, 10-5 minutes, 4-0 seconds/2 for the time half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DosTimestamp {
    pub date: u16,
    pub time: u16,
    /// Tenths of a second, 0-199; only meaningful for creation time.
    pub time_tenths: u8,
}

impl DosTimestamp {
    pub const EPOCH: DosTimestamp = DosTimestamp {
        date: 0x0021, // 1980-01-01
        time: 0,
        time_tenths: 0,
    };

    pub fn new(year: u16, month: u8, day: u8, hours: u8, minutes: u8, seconds: u8) -> Self {
        let year_offset = year.saturating_sub(1980).min(0x7F);
        let date = (year_offset << 9) | ((month as u16 & 0x0F) << 5) | (day as u16 & 0x1F);
        let time = ((hours as u16 & 0x1F) << 11) | ((minutes as u16 & 0x3F) << 5) | ((seconds as u16 / 2) & 0x1F);
        Self {
            date,
            time,
            time_tenths: (seconds % 2) * 100,
        }
    }

    pub fn year(&self) -> u16 {
        1980 + (self.date >> 9)
    }

    pub fn month(&self) -> u8 {
        ((self.date >> 5) & 0x0F) as u8
    }

    pub fn day(&self) -> u8 {
        (self.date & 0x1F) as u8
    }

    pub fn hours(&self) -> u8 {
        ((self.time >> 11) & 0x1F) as u8
    }

    pub fn minutes(&self) -> u8 {
        ((self.time >> 5) & 0x3F) as u8
    }

    pub fn seconds(&self) -> u8 {
        ((self.time & 0x1F) as u8) * 2 + self.time_tenths / 100
    }
}

/// Attribute flags carried by a regular (non-LFN) directory entry.
pub mod attr {
    pub const READ_ONLY: u8 = 0x01;
    pub const HIDDEN: u8 = 0x02;
    pub const SYSTEM: u8 = 0x04;
    pub const VOLUME_ID: u8 = 0x08;
    pub const DIRECTORY: u8 = 0x10;
    pub const ARCHIVE: u8 = 0x20;
    pub const LONG_NAME: u8 = READ_ONLY | HIDDEN | SYSTEM | VOLUME_ID;
}

/// Shared metadata every node (file or directory) exposes.
pub trait Node {
    fn name(&self) -> String;
    fn is_directory(&self) -> bool;
    fn attributes(&self) -> u8;
    fn created_at(&self) -> DosTimestamp;
    fn last_modified(&self) -> DosTimestamp;
    fn last_accessed(&self) -> DosTimestamp;
}

/// A length-backed, randomly-addressable byte file.
pub trait File: Node {
    /// Lets backend-specific code (e.g. a `moveTo` implementation) recover
    /// its concrete type to check whether the source and destination share
    /// a volume.
    fn as_any(&self) -> &dyn std::any::Any;

    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize>;

    fn write(&mut self, offset: u64, buffer: &[u8]) -> Result<usize>;

    fn set_len(&mut self, len: u64) -> Result<()>;

    /// Persists size and timestamp changes held only in the parent
    /// directory's in-memory entry table.
    fn flush(&mut self) -> Result<()>;

    fn delete(self: Box<Self>) -> Result<()>;

    fn move_to(self: Box<Self>, dest: &mut dyn Directory) -> Result<()>;
}

/// A directory: a named, ordered set of child nodes.
pub trait Directory: Node {
    /// See [`File::as_any`].
    fn as_any(&self) -> &dyn std::any::Any;

    fn list(&mut self) -> Result<Vec<String>>;

    fn list_files(&mut self) -> Result<Vec<String>> {
        let mut names = self.list()?;
        names.retain(|name| {
            self.search(name)
                .ok()
                .flatten()
                .map(|node| !node.is_directory())
                .unwrap_or(false)
        });
        Ok(names)
    }

    fn create_file(&mut self, name: &str) -> Result<Box<dyn File>>;

    fn create_directory(&mut self, name: &str) -> Result<Box<dyn Directory>>;

    fn search(&mut self, path: &str) -> Result<Option<UsbFile>>;

    fn set_name(&mut self, name: &str) -> Result<()>;

    fn delete(self: Box<Self>) -> Result<()>;

    fn move_to(self: Box<Self>, dest: &mut dyn Directory) -> Result<()>;
}

/// The polymorphic node type returned by [`Directory::search`]: a directory
/// is one of two things, never both, and never anything deeper in a type
/// hierarchy.
pub enum UsbFile {
    File(Box<dyn File>),
    Directory(Box<dyn Directory>),
}

impl UsbFile {
    pub fn is_directory(&self) -> bool {
        matches!(self, UsbFile::Directory(_))
    }

    pub fn into_file(self) -> Result<Box<dyn File>> {
        match self {
            UsbFile::File(file) => Ok(file),
            UsbFile::Directory(_) => Err(Error::IsDirectory),
        }
    }

    pub fn into_directory(self) -> Result<Box<dyn Directory>> {
        match self {
            UsbFile::Directory(dir) => Ok(dir),
            UsbFile::File(_) => Err(Error::NotDirectory),
        }
    }

    pub fn name(&self) -> String {
        match self {
            UsbFile::File(file) => file.name(),
            UsbFile::Directory(dir) => dir.name(),
        }
    }
}

/// Detects a known on-disk format on a device and hands back its root
/// directory. Implemented once per backend (FAT32 today).
pub trait FileSystemFactory {
    type Device;

    fn mount(device: Self::Device) -> Result<Box<dyn Directory>>;
}
