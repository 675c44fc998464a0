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

//! The directory entry table: scanning, allocating, and rewriting 32-byte
//! slots in a directory's cluster chain, plus [`FatDirectory`] itself.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use chrono::{Datelike, Local, Timelike};
use zerocopy::IntoBytes;

use umas_ds::{DataStorage, Error, Result};
use umas_fs::{attr, Directory, DosTimestamp, File, Node, UsbFile};

use crate::cluster_chain::ClusterChain;
use crate::dir_entry::{
    FatLfnDirectoryEntry, LfnAccumulator, ParsedEntry, ShortEntry, DELETED_MARKER, ENTRY_SIZE, FREE_MARKER,
};
use crate::fat::Fat;
use crate::file::FatFile;
use crate::short_name::ShortNameGenerator;

pub(crate) type SharedChain<D> = Rc<RefCell<ClusterChain<D>>>;

/// Where a node's own directory entry lives, so it can rewrite or delete
/// itself later (`set_name`, `flush`, `delete`, `move_to`). `None` only for
/// the root directory, which has no entry of its own.
pub(crate) struct ParentLink<D: DataStorage> {
    pub(crate) chain: SharedChain<D>,
    pub(crate) group_start_offset: u64,
    pub(crate) entry_span: usize,
}

// Hand-written so this does not require `D: Clone`: only the `Rc` is
// cloned, never the device itself.
impl<D: DataStorage> Clone for ParentLink<D> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            group_start_offset: self.group_start_offset,
            entry_span: self.entry_span,
        }
    }
}

pub(crate) fn load_entries<D: DataStorage>(chain: &SharedChain<D>) -> Result<Vec<(u64, FatLfnDirectoryEntry)>> {
    let chain = chain.borrow();
    let total = chain.len_in_bytes();
    let mut offset = 0u64;
    let mut accumulator = LfnAccumulator::default();
    let mut group_start: Option<u64> = None;
    let mut entries = Vec::new();
    let mut raw = [0u8; ENTRY_SIZE];

    while offset < total {
        chain.read_at(offset, &mut raw)?;
        if raw[0] == FREE_MARKER {
            break;
        }
        if group_start.is_none() {
            group_start = Some(offset);
        }
        let is_lfn = raw[11] == attr::LONG_NAME;
        match accumulator.feed(&raw) {
            ParsedEntry::Entry(record) => entries.push((group_start.take().unwrap(), record)),
            ParsedEntry::VolumeLabel(_) => group_start = None,
            ParsedEntry::EndOfDirectory => break,
            ParsedEntry::None => {
                if !is_lfn {
                    // A deleted marker: this slot contributed nothing.
                    group_start = None;
                }
            }
        }
        offset += ENTRY_SIZE as u64;
    }
    Ok(entries)
}

pub(crate) fn existing_short_names<D: DataStorage>(chain: &SharedChain<D>) -> Result<HashSet<crate::short_name::ShortName>> {
    Ok(load_entries(chain)?.into_iter().map(|(_, e)| e.short.short_name).collect())
}

/// Finds a contiguous run of `needed` free (or deleted) 32-byte slots,
/// growing the chain by whole clusters and appending at the end if no
/// single run that large already exists.
pub(crate) fn allocate_slot<D: DataStorage>(chain: &SharedChain<D>, bytes_per_cluster: u32, needed: usize) -> Result<u64> {
    let mut chain = chain.borrow_mut();
    let total_slots = (chain.len_in_bytes() / ENTRY_SIZE as u64) as usize;
    let mut run_start = None;
    let mut run_len = 0usize;
    let mut raw = [0u8; ENTRY_SIZE];
    for slot in 0..total_slots {
        chain.read_at(slot as u64 * ENTRY_SIZE as u64, &mut raw)?;
        if raw[0] == FREE_MARKER || raw[0] == DELETED_MARKER {
            if run_start.is_none() {
                run_start = Some(slot);
            }
            run_len += 1;
            if run_len == needed {
                return Ok(run_start.unwrap() as u64 * ENTRY_SIZE as u64);
            }
        } else {
            run_start = None;
            run_len = 0;
        }
    }

    let slots_per_cluster = (bytes_per_cluster as usize / ENTRY_SIZE).max(1);
    let current_clusters = (chain.len_in_bytes() / bytes_per_cluster as u64) as u32;
    let additional_clusters = needed.div_ceil(slots_per_cluster).max(1) as u32;
    let start_offset = chain.len_in_bytes();
    chain.set_length_in_clusters(current_clusters + additional_clusters)?;
    let zeros = vec![0u8; additional_clusters as usize * bytes_per_cluster as usize];
    chain.write_at(start_offset, &zeros)?;
    Ok(start_offset)
}

pub(crate) fn write_entry_record<D: DataStorage>(chain: &SharedChain<D>, offset: u64, record: &FatLfnDirectoryEntry) -> Result<()> {
    let chain = chain.borrow();
    for (i, raw) in record.encode().into_iter().enumerate() {
        chain.write_at(offset + i as u64 * ENTRY_SIZE as u64, &raw)?;
    }
    Ok(())
}

pub(crate) fn mark_deleted<D: DataStorage>(chain: &SharedChain<D>, group_start: u64, span: usize) -> Result<()> {
    let chain = chain.borrow();
    for i in 0..span {
        chain.write_at(group_start + i as u64 * ENTRY_SIZE as u64, &[DELETED_MARKER])?;
    }
    Ok(())
}

/// The host clock, truncated to FAT's 2-second resolution. Used to stamp
/// newly-created files and directories; DOS timestamps have no timezone of
/// their own, so this follows the local wall clock like most FAT drivers do.
pub(crate) fn now_timestamp() -> DosTimestamp {
    let now = Local::now();
    DosTimestamp::new(
        now.year() as u16,
        now.month() as u8,
        now.day() as u8,
        now.hour() as u8,
        now.minute() as u8,
        now.second() as u8,
    )
}

pub(crate) fn build_record(
    name: &str,
    attributes: u8,
    created_at: DosTimestamp,
    last_write: DosTimestamp,
    first_cluster: u32,
    file_size: u32,
    existing: &HashSet<crate::short_name::ShortName>,
) -> FatLfnDirectoryEntry {
    let short_name = ShortNameGenerator::generate(name, existing);
    let short = ShortEntry {
        short_name,
        attributes,
        created_at,
        last_write,
        last_access_date: created_at.date,
        first_cluster,
        file_size,
    };
    if short_name.display() == name {
        FatLfnDirectoryEntry::new_short_only(short)
    } else {
        FatLfnDirectoryEntry::with_long_name(name.to_string(), short)
    }
}

/// A FAT32 directory: either the volume root, or a subdirectory reached
/// through some ancestor's [`Directory::search`].
pub struct FatDirectory<D: DataStorage> {
    fat: Rc<Fat<D>>,
    bytes_per_cluster: u32,
    data_area_offset: u64,
    chain: SharedChain<D>,
    parent: Option<ParentLink<D>>,
    name: RefCell<String>,
    attributes: u8,
    created_at: DosTimestamp,
    last_write: RefCell<DosTimestamp>,
}

impl<D: DataStorage + 'static> FatDirectory<D> {
    pub fn open_root(fat: Rc<Fat<D>>, bytes_per_cluster: u32, data_area_offset: u64, root_cluster: u32) -> Result<Self> {
        let chain = ClusterChain::open(fat.clone(), bytes_per_cluster, data_area_offset, root_cluster)?;
        Ok(Self {
            fat,
            bytes_per_cluster,
            data_area_offset,
            chain: Rc::new(RefCell::new(chain)),
            parent: None,
            name: RefCell::new(String::new()),
            attributes: attr::DIRECTORY,
            created_at: DosTimestamp::EPOCH,
            last_write: RefCell::new(DosTimestamp::EPOCH),
        })
    }

    fn open_child(
        fat: Rc<Fat<D>>,
        bytes_per_cluster: u32,
        data_area_offset: u64,
        entry: &FatLfnDirectoryEntry,
        parent: ParentLink<D>,
    ) -> Result<Self> {
        let chain = ClusterChain::open(fat.clone(), bytes_per_cluster, data_area_offset, entry.short.first_cluster)?;
        Ok(Self {
            fat,
            bytes_per_cluster,
            data_area_offset,
            chain: Rc::new(RefCell::new(chain)),
            parent: Some(parent),
            name: RefCell::new(entry.display_name()),
            attributes: entry.short.attributes,
            created_at: entry.short.created_at,
            last_write: RefCell::new(entry.short.last_write),
        })
    }

    pub(crate) fn find_entry(&self, name: &str) -> Result<Option<(u64, FatLfnDirectoryEntry)>> {
        Ok(load_entries(&self.chain)?
            .into_iter()
            .find(|(_, e)| e.display_name().eq_ignore_ascii_case(name)))
    }

    /// Writes a fresh "." and ".." pair into a newly-allocated subdirectory
    /// cluster, as the only contents of the directory so far.
    fn seed_dot_entries(&self, child_first_cluster: u32, created_at: DosTimestamp) -> Result<()> {
        let parent_cluster = self.chain.borrow().first_cluster();
        let dot = ShortEntry {
            short_name: crate::short_name::ShortName::DOT,
            attributes: attr::DIRECTORY,
            created_at,
            last_write: created_at,
            last_access_date: created_at.date,
            first_cluster: child_first_cluster,
            file_size: 0,
        };
        let dot_dot = ShortEntry {
            short_name: crate::short_name::ShortName::DOT_DOT,
            attributes: attr::DIRECTORY,
            created_at,
            last_write: created_at,
            last_access_date: created_at.date,
            first_cluster: parent_cluster,
            file_size: 0,
        };
        let child_chain = ClusterChain::open(self.fat.clone(), self.bytes_per_cluster, self.data_area_offset, child_first_cluster)?;
        let mut raw = [0u8; ENTRY_SIZE * 2];
        raw[0..ENTRY_SIZE].copy_from_slice(dot.encode().as_bytes());
        raw[ENTRY_SIZE..].copy_from_slice(dot_dot.encode().as_bytes());
        child_chain.write_at(0, &raw)
    }
}

impl<D: DataStorage + 'static> Node for FatDirectory<D> {
    fn name(&self) -> String {
        self.name.borrow().clone()
    }

    fn is_directory(&self) -> bool {
        true
    }

    fn attributes(&self) -> u8 {
        self.attributes
    }

    fn created_at(&self) -> DosTimestamp {
        self.created_at
    }

    fn last_modified(&self) -> DosTimestamp {
        *self.last_write.borrow()
    }

    fn last_accessed(&self) -> DosTimestamp {
        *self.last_write.borrow()
    }
}

impl<D: DataStorage + 'static> Directory for FatDirectory<D> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn list(&mut self) -> Result<Vec<String>> {
        Ok(load_entries(&self.chain)?
            .into_iter()
            .map(|(_, e)| e.display_name())
            .filter(|n| n != "." && n != "..")
            .collect())
    }

    fn create_file(&mut self, name: &str) -> Result<Box<dyn File>> {
        if self.find_entry(name)?.is_some() {
            return Err(Error::AlreadyExists);
        }
        let existing = existing_short_names(&self.chain)?;
        let now = now_timestamp();
        let record = build_record(name, attr::ARCHIVE, now, now, 0, 0, &existing);
        let offset = allocate_slot(&self.chain, self.bytes_per_cluster, record.entry_count())?;
        write_entry_record(&self.chain, offset, &record)?;

        let parent = ParentLink {
            chain: self.chain.clone(),
            group_start_offset: offset,
            entry_span: record.entry_count(),
        };
        Ok(Box::new(FatFile::new(
            self.fat.clone(),
            self.bytes_per_cluster,
            self.data_area_offset,
            &record,
            parent,
        )?))
    }

    fn create_directory(&mut self, name: &str) -> Result<Box<dyn Directory>> {
        if self.find_entry(name)?.is_some() {
            return Err(Error::AlreadyExists);
        }
        let existing = existing_short_names(&self.chain)?;
        let now = now_timestamp();

        // Directories always own at least one cluster (for "." and "..").
        let mut scratch = ClusterChain::open(self.fat.clone(), self.bytes_per_cluster, self.data_area_offset, 0)?;
        scratch.set_length_in_clusters(1)?;
        let child_first_cluster = scratch.first_cluster();

        let record = build_record(name, attr::DIRECTORY, now, now, child_first_cluster, 0, &existing);
        let offset = allocate_slot(&self.chain, self.bytes_per_cluster, record.entry_count())?;
        write_entry_record(&self.chain, offset, &record)?;
        self.seed_dot_entries(child_first_cluster, now)?;

        let parent = ParentLink {
            chain: self.chain.clone(),
            group_start_offset: offset,
            entry_span: record.entry_count(),
        };
        Ok(Box::new(Self::open_child(
            self.fat.clone(),
            self.bytes_per_cluster,
            self.data_area_offset,
            &record,
            parent,
        )?))
    }

    fn search(&mut self, path: &str) -> Result<Option<UsbFile>> {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return Err(Error::InvalidFormat("search path is empty"));
        }
        let (head, rest) = match path.split_once('/') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };

        let Some((offset, entry)) = self.find_entry(head)? else {
            return Ok(None);
        };
        let parent = ParentLink {
            chain: self.chain.clone(),
            group_start_offset: offset,
            entry_span: entry.entry_count(),
        };

        if entry.short.is_directory() {
            let mut child = Self::open_child(self.fat.clone(), self.bytes_per_cluster, self.data_area_offset, &entry, parent)?;
            match rest {
                Some(rest) if !rest.is_empty() => child.search(rest),
                _ => Ok(Some(UsbFile::Directory(Box::new(child)))),
            }
        } else {
            if rest.is_some_and(|r| !r.is_empty()) {
                return Err(Error::NotDirectory);
            }
            let file = FatFile::new(self.fat.clone(), self.bytes_per_cluster, self.data_area_offset, &entry, parent)?;
            Ok(Some(UsbFile::File(Box::new(file))))
        }
    }

    fn set_name(&mut self, name: &str) -> Result<()> {
        let parent = self.parent.as_ref().ok_or(Error::Immutable)?.clone();
        let existing = existing_short_names(&parent.chain)?;
        let record = build_record(
            name,
            self.attributes,
            self.created_at,
            *self.last_write.borrow(),
            self.chain.borrow().first_cluster(),
            0,
            &existing,
        );
        mark_deleted(&parent.chain, parent.group_start_offset, parent.entry_span)?;
        let offset = allocate_slot(&parent.chain, self.bytes_per_cluster, record.entry_count())?;
        write_entry_record(&parent.chain, offset, &record)?;

        *self.name.borrow_mut() = name.to_string();
        self.parent = Some(ParentLink {
            chain: parent.chain,
            group_start_offset: offset,
            entry_span: record.entry_count(),
        });
        Ok(())
    }

    fn delete(self: Box<Self>) -> Result<()> {
        let parent = self.parent.as_ref().ok_or(Error::Immutable)?.clone();
        self.delete_children()?;
        self.chain.borrow_mut().set_length_in_clusters(0)?;
        mark_deleted(&parent.chain, parent.group_start_offset, parent.entry_span)
    }

    fn move_to(self: Box<Self>, dest: &mut dyn Directory) -> Result<()> {
        let parent = self.parent.as_ref().ok_or(Error::Immutable)?.clone();
        let Some(dest) = dest.as_any().downcast_ref::<FatDirectory<D>>() else {
            return Err(Error::CrossFileSystem);
        };
        if dest.find_entry(&self.name.borrow())?.is_some() {
            return Err(Error::AlreadyExists);
        }

        let existing = existing_short_names(&dest.chain)?;
        let record = build_record(
            &self.name.borrow(),
            self.attributes,
            self.created_at,
            *self.last_write.borrow(),
            self.chain.borrow().first_cluster(),
            0,
            &existing,
        );
        let offset = allocate_slot(&dest.chain, dest.bytes_per_cluster, record.entry_count())?;
        write_entry_record(&dest.chain, offset, &record)?;
        mark_deleted(&parent.chain, parent.group_start_offset, parent.entry_span)
    }
}

impl<D: DataStorage + 'static> FatDirectory<D> {
    pub(crate) fn shared_chain(&self) -> SharedChain<D> {
        self.chain.clone()
    }

    pub(crate) fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_cluster
    }

    /// Recursively deletes every child entry (but not `self`'s own entry or
    /// chain), mirroring what a top-level `delete()` on each child would do.
    fn delete_children(&self) -> Result<()> {
        for (offset, entry) in load_entries(&self.chain)? {
            let name = entry.display_name();
            if name == "." || name == ".." {
                continue;
            }
            let parent = ParentLink {
                chain: self.chain.clone(),
                group_start_offset: offset,
                entry_span: entry.entry_count(),
            };
            if entry.short.is_directory() {
                let child = Self::open_child(self.fat.clone(), self.bytes_per_cluster, self.data_area_offset, &entry, parent)?;
                Directory::delete(Box::new(child))?;
            } else {
                let child = FatFile::new(self.fat.clone(), self.bytes_per_cluster, self.data_area_offset, &entry, parent)?;
                File::delete(Box::new(child))?;
            }
        }
        Ok(())
    }
}
