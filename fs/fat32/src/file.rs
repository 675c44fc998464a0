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

//! A FAT32 regular file: a byte-addressable [`ClusterChain`] plus the
//! bookkeeping needed to rewrite its own directory entry when its size or
//! first cluster changes.

use std::any::Any;
use std::rc::Rc;

use umas_ds::{DataStorage, Error, Result};
use umas_fs::{Directory, DosTimestamp, File, Node};

use crate::cluster_chain::ClusterChain;
use crate::dir_entry::{FatLfnDirectoryEntry, ShortEntry};
use crate::directory::{allocate_slot, build_record, existing_short_names, mark_deleted, now_timestamp, write_entry_record, FatDirectory, ParentLink};
use crate::fat::Fat;
use crate::short_name::ShortName;

pub struct FatFile<D: DataStorage> {
    fat: Rc<Fat<D>>,
    bytes_per_cluster: u32,
    data_area_offset: u64,
    data: ClusterChain<D>,
    parent: ParentLink<D>,
    short_name: ShortName,
    name: String,
    attributes: u8,
    len: u64,
    dirty: bool,
    created_at: DosTimestamp,
    last_write: DosTimestamp,
}

impl<D: DataStorage + 'static> FatFile<D> {
    pub(crate) fn new(
        fat: Rc<Fat<D>>,
        bytes_per_cluster: u32,
        data_area_offset: u64,
        entry: &FatLfnDirectoryEntry,
        parent: ParentLink<D>,
    ) -> Result<Self> {
        let data = ClusterChain::open(fat.clone(), bytes_per_cluster, data_area_offset, entry.short.first_cluster)?;
        Ok(Self {
            fat,
            bytes_per_cluster,
            data_area_offset,
            data,
            parent,
            short_name: entry.short.short_name,
            name: entry.display_name(),
            attributes: entry.short.attributes,
            len: entry.short.file_size as u64,
            dirty: false,
            created_at: entry.short.created_at,
            last_write: entry.short.last_write,
        })
    }

    fn current_short_entry(&self) -> ShortEntry {
        ShortEntry {
            short_name: self.short_name,
            attributes: self.attributes,
            created_at: self.created_at,
            last_write: self.last_write,
            last_access_date: self.last_write.date,
            first_cluster: self.data.first_cluster(),
            file_size: self.len as u32,
        }
    }

    /// Rewrites this file's own (fixed-position, fixed-length) directory
    /// slot in place: size and first-cluster may have changed, but the name
    /// and its slot count never do once the file exists, so this never
    /// needs to reallocate.
    fn rewrite_own_entry(&self) -> Result<()> {
        let record = if self.name == self.short_name.display() {
            FatLfnDirectoryEntry::new_short_only(self.current_short_entry())
        } else {
            FatLfnDirectoryEntry::with_long_name(self.name.clone(), self.current_short_entry())
        };
        write_entry_record(&self.parent.chain, self.parent.group_start_offset, &record)
    }

    /// Zero-fills `[start, end)`, a gap left behind either by a sparse
    /// write past the current end, or by growing the file with `set_len`.
    fn zero_fill(&self, start: u64, end: u64) -> Result<()> {
        const CHUNK: usize = 512;
        let zeros = [0u8; CHUNK];
        let mut position = start;
        while position < end {
            let len = ((end - position) as usize).min(CHUNK);
            self.data.write_at(position, &zeros[..len])?;
            position += len as u64;
        }
        Ok(())
    }
}

impl<D: DataStorage + 'static> Node for FatFile<D> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn is_directory(&self) -> bool {
        false
    }

    fn attributes(&self) -> u8 {
        self.attributes
    }

    fn created_at(&self) -> DosTimestamp {
        self.created_at
    }

    fn last_modified(&self) -> DosTimestamp {
        self.last_write
    }

    fn last_accessed(&self) -> DosTimestamp {
        self.last_write
    }
}

impl<D: DataStorage + 'static> File for FatFile<D> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn read(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        let end = offset.saturating_add(buffer.len() as u64).min(self.len);
        if offset >= end {
            return Ok(0);
        }
        let to_read = (end - offset) as usize;
        self.data.read_at(offset, &mut buffer[..to_read])?;
        Ok(to_read)
    }

    fn write(&mut self, offset: u64, buffer: &[u8]) -> Result<usize> {
        let end = offset + buffer.len() as u64;
        if end > self.data.len_in_bytes() {
            let needed_clusters = end.div_ceil(self.bytes_per_cluster as u64) as u32;
            self.data.set_length_in_clusters(needed_clusters)?;
        }
        if offset > self.len {
            self.zero_fill(self.len, offset)?;
        }
        self.data.write_at(offset, buffer)?;
        if end > self.len {
            self.len = end;
        }
        self.last_write = now_timestamp();
        self.dirty = true;
        Ok(buffer.len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        let needed_clusters = len.div_ceil(self.bytes_per_cluster.max(1) as u64) as u32;
        self.data.set_length_in_clusters(needed_clusters)?;
        if len > self.len {
            let old_len = self.len;
            self.len = len;
            self.zero_fill(old_len, len)?;
        } else {
            self.len = len;
        }
        self.dirty = true;
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.rewrite_own_entry()?;
            self.dirty = false;
        }
        Ok(())
    }

    fn delete(mut self: Box<Self>) -> Result<()> {
        self.data.set_length_in_clusters(0)?;
        mark_deleted(&self.parent.chain, self.parent.group_start_offset, self.parent.entry_span)
    }

    fn move_to(mut self: Box<Self>, dest: &mut dyn Directory) -> Result<()> {
        self.flush()?;
        let Some(dest) = dest.as_any().downcast_ref::<FatDirectory<D>>() else {
            return Err(Error::CrossFileSystem);
        };
        if dest.find_entry(&self.name)?.is_some() {
            return Err(Error::AlreadyExists);
        }
        let dest_chain = dest.shared_chain();

        let existing = existing_short_names(&dest_chain)?;
        let record = build_record(
            &self.name,
            self.attributes,
            self.created_at,
            self.last_write,
            self.data.first_cluster(),
            self.len as u32,
            &existing,
        );
        let offset = allocate_slot(&dest_chain, dest.bytes_per_cluster(), record.entry_count())?;
        write_entry_record(&dest_chain, offset, &record)?;
        mark_deleted(&self.parent.chain, self.parent.group_start_offset, self.parent.entry_span)
    }
}
