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

//! Cluster-to-successor lookup and allocation over the on-disk File
//! Allocation Table. A [`Fat`] assumes single-writer access (see the
//! crate-level concurrency note): callers serialize their own calls.

use std::cell::RefCell;
use std::rc::Rc;

use log::warn;

use umas_ds::{DataStorage, Error, Result};

use crate::boot_sector::{Fat32BootSector, FsInfo, BYTES_PER_BOOT_SECTOR};
use crate::io;

const FREE: u32 = 0x0000_0000;
const BAD: u32 = 0x0FFF_FFF7;
const END_OF_CHAIN_MIN: u32 = 0x0FFF_FFF8;
const END_OF_CHAIN_WRITE: u32 = 0x0FFF_FFFF;
const ENTRY_VALUE_MASK: u32 = 0x0FFF_FFFF;
const RESERVED_MASK: u32 = 0xF000_0000;

pub const FIRST_DATA_CLUSTER: u32 = 2;

struct FsInfoState {
    info: FsInfo,
    sector_template: [u8; BYTES_PER_BOOT_SECTOR],
}

/// The on-disk File Allocation Table: `number_of_fats` mirrored copies of
/// an array of 32-bit cluster pointers, plus the FSInfo hints. Owns its
/// device through an `Rc` so every directory and file in the tree can hold
/// a cheap handle to the same table without threading lifetimes through
/// the `Directory`/`File` trait objects.
pub struct Fat<D: DataStorage> {
    device: Rc<D>,
    fat_offset: u64,
    sectors_per_fat: u32,
    number_of_fats: u8,
    bytes_per_sector: u16,
    fs_info_offset: u64,
    total_data_clusters: u32,
    fs_info: RefCell<FsInfoState>,
}

impl<D: DataStorage> Fat<D> {
    pub fn open(device: Rc<D>, boot: &Fat32BootSector) -> Result<Self> {
        let fs_info_offset = boot.fs_info_sector as u64 * boot.bytes_per_sector as u64;
        let (info, sector_template) = FsInfo::read_device(device.as_ref(), fs_info_offset)?;
        let was_stale = info.is_stale();

        let fat = Self {
            device,
            fat_offset: boot.fat_offset,
            sectors_per_fat: boot.sectors_per_fat,
            number_of_fats: boot.number_of_fats,
            bytes_per_sector: boot.bytes_per_sector,
            fs_info_offset,
            total_data_clusters: boot.total_data_clusters(),
            fs_info: RefCell::new(FsInfoState { info, sector_template }),
        };

        if was_stale {
            warn!("FSInfo hints are stale, recomputing free cluster count by scanning the FAT");
            let free_count = fat.recompute_free_count()?;
            let updated = FsInfo {
                free_count,
                next_free: FIRST_DATA_CLUSTER,
            };
            fat.persist_fs_info(&updated)?;
        }

        Ok(fat)
    }

    pub fn device(&self) -> &Rc<D> {
        &self.device
    }

    pub fn total_data_clusters(&self) -> u32 {
        self.total_data_clusters
    }

    pub fn free_count(&self) -> u32 {
        self.fs_info.borrow().info.free_count
    }

    fn entry_offset(&self, cluster: u32, fat_index: u8) -> u64 {
        self.fat_offset
            + fat_index as u64 * self.sectors_per_fat as u64 * self.bytes_per_sector as u64
            + cluster as u64 * 4
    }

    fn read_raw_entry(&self, cluster: u32, fat_index: u8) -> Result<u32> {
        let mut bytes = [0u8; 4];
        io::read_at(self.device.as_ref(), self.entry_offset(cluster, fat_index), &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_entry(&self, cluster: u32) -> Result<u32> {
        Ok(self.read_raw_entry(cluster, 0)? & ENTRY_VALUE_MASK)
    }

    /// Writes `value` (masked to 28 bits) to every FAT copy, preserving
    /// whatever the first copy's reserved high nibble already held.
    fn write_entry(&self, cluster: u32, value: u32) -> Result<()> {
        let reserved = self.read_raw_entry(cluster, 0)? & RESERVED_MASK;
        let raw = reserved | (value & ENTRY_VALUE_MASK);
        let bytes = raw.to_le_bytes();
        for fat_index in 0..self.number_of_fats {
            io::write_at(self.device.as_ref(), self.entry_offset(cluster, fat_index), &bytes)?;
        }
        Ok(())
    }

    fn persist_fs_info(&self, info: &FsInfo) -> Result<()> {
        let mut state = self.fs_info.borrow_mut();
        info.write_into(&mut state.sector_template)?;
        state.info = *info;
        io::write_at(self.device.as_ref(), self.fs_info_offset, &state.sector_template)
    }

    fn recompute_free_count(&self) -> Result<u32> {
        let mut free = 0u32;
        for cluster in FIRST_DATA_CLUSTER..FIRST_DATA_CLUSTER + self.total_data_clusters {
            if self.read_entry(cluster)? == FREE {
                free += 1;
            }
        }
        Ok(free)
    }

    /// Follows successor links from `start` until end-of-chain. Errors on
    /// a bad-cluster sentinel or a chain that revisits more clusters than
    /// the volume has (a cycle).
    pub fn get_chain(&self, start: u32) -> Result<Vec<u32>> {
        let mut chain = Vec::new();
        let mut cluster = start;
        loop {
            if cluster == FREE {
                break;
            }
            if cluster == BAD {
                return Err(Error::InvalidFormat("cluster chain references a bad cluster"));
            }
            chain.push(cluster);
            if chain.len() as u32 > self.total_data_clusters {
                return Err(Error::InvalidFormat("cluster chain cycle detected"));
            }
            let next = self.read_entry(cluster)?;
            if next >= END_OF_CHAIN_MIN {
                break;
            }
            cluster = next;
        }
        Ok(chain)
    }

    /// Allocates `n` new clusters, appends them to `chain`, links the
    /// previous tail (if any) to the new head, and terminates the new tail
    /// with the end-of-chain sentinel. Returns the newly allocated cluster
    /// numbers. Scans forward from the FSInfo `next_free` hint, wrapping
    /// around the data area once.
    pub fn alloc(&self, chain: &mut Vec<u32>, n: u32) -> Result<Vec<u32>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let start_hint = {
            let state = self.fs_info.borrow();
            if state.info.next_free < FIRST_DATA_CLUSTER
                || state.info.next_free >= FIRST_DATA_CLUSTER + self.total_data_clusters
            {
                FIRST_DATA_CLUSTER
            } else {
                state.info.next_free
            }
        };

        let mut found = Vec::with_capacity(n as usize);
        let mut cluster = start_hint;
        let mut scanned = 0u32;
        while (found.len() as u32) < n && scanned < self.total_data_clusters {
            if self.read_entry(cluster)? == FREE {
                found.push(cluster);
            }
            cluster += 1;
            if cluster >= FIRST_DATA_CLUSTER + self.total_data_clusters {
                cluster = FIRST_DATA_CLUSTER;
            }
            scanned += 1;
        }
        if (found.len() as u32) < n {
            return Err(Error::OutOfSpace);
        }

        let mut prev = chain.last().copied();
        for (index, &next_cluster) in found.iter().enumerate() {
            if let Some(prev_cluster) = prev {
                self.write_entry(prev_cluster, next_cluster)?;
            }
            if index + 1 == found.len() {
                self.write_entry(next_cluster, END_OF_CHAIN_WRITE)?;
            }
            prev = Some(next_cluster);
        }
        chain.extend_from_slice(&found);

        let mut info = self.fs_info.borrow().info;
        info.free_count = info.free_count.saturating_sub(n);
        info.next_free = cluster;
        self.persist_fs_info(&info)?;

        Ok(found)
    }

    /// Truncates `n` clusters from the tail of `chain`, freeing them in the
    /// FAT and marking the new tail (if any remains) end-of-chain.
    pub fn free(&self, chain: &mut Vec<u32>, n: u32) -> Result<()> {
        let n = n.min(chain.len() as u32);
        for _ in 0..n {
            if let Some(cluster) = chain.pop() {
                self.write_entry(cluster, FREE)?;
            }
        }
        if let Some(&last) = chain.last() {
            self.write_entry(last, END_OF_CHAIN_WRITE)?;
        }

        let mut info = self.fs_info.borrow().info;
        info.free_count = info.free_count.saturating_add(n);
        self.persist_fs_info(&info)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use umas_ds_mem::MemoryDataStorage;

    use super::*;

    fn make_boot(total_sectors: u32, sectors_per_fat: u32) -> Fat32BootSector {
        Fat32BootSector {
            bytes_per_sector: 512,
            sectors_per_cluster: 1,
            reserved_sector_count: 32,
            number_of_fats: 2,
            total_sectors,
            sectors_per_fat,
            root_cluster: 2,
            fs_info_sector: 1,
            volume_label: *b"TESTVOL    ",
            bytes_per_cluster: 512,
            fat_offset: 32 * 512,
            data_area_offset: (32 + 2 * sectors_per_fat) as u64 * 512,
        }
    }

    fn make_device_with_fresh_fs_info(boot: &Fat32BootSector) -> MemoryDataStorage {
        let total_bytes = boot.total_sectors as usize * boot.bytes_per_sector as usize;
        let device = MemoryDataStorage::new(total_bytes);
        let mut fs_info = [0u8; 512];
        fs_info[0..4].copy_from_slice(&0x4161_5252u32.to_le_bytes());
        fs_info[484..488].copy_from_slice(&0x6141_7272u32.to_le_bytes());
        let total_data_clusters = boot.total_data_clusters();
        fs_info[488..492].copy_from_slice(&total_data_clusters.to_le_bytes());
        fs_info[492..496].copy_from_slice(&FIRST_DATA_CLUSTER.to_le_bytes());
        fs_info[508..512].copy_from_slice(&0xAA55_0000u32.to_le_bytes());
        device
            .write(boot.fs_info_sector as u64 * 512, &fs_info)
            .unwrap();
        device
    }

    #[test]
    fn alloc_then_free_restores_free_count() {
        let boot = make_boot(4096, 8);
        let device = Rc::new(make_device_with_fresh_fs_info(&boot));
        let fat = Fat::open(device, &boot).unwrap();

        let before = fat.free_count();
        let mut chain = Vec::new();
        let allocated = fat.alloc(&mut chain, 5).unwrap();
        assert_eq!(allocated.len(), 5);
        assert_eq!(chain, allocated);
        assert_eq!(fat.free_count(), before - 5);

        fat.free(&mut chain, 5).unwrap();
        assert_eq!(fat.free_count(), before);
        assert!(chain.is_empty());
    }

    #[test]
    fn get_chain_follows_links_to_end_of_chain() {
        let boot = make_boot(4096, 8);
        let device = Rc::new(make_device_with_fresh_fs_info(&boot));
        let fat = Fat::open(device, &boot).unwrap();

        let mut chain = Vec::new();
        let allocated = fat.alloc(&mut chain, 3).unwrap();
        let followed = fat.get_chain(allocated[0]).unwrap();
        assert_eq!(followed, allocated);
    }

    #[test]
    fn alloc_fails_with_out_of_space() {
        let boot = make_boot(64, 1);
        let device = Rc::new(make_device_with_fresh_fs_info(&boot));
        let fat = Fat::open(device, &boot).unwrap();
        let total = fat.total_data_clusters();

        let mut chain = Vec::new();
        assert!(matches!(
            fat.alloc(&mut chain, total + 1),
            Err(Error::OutOfSpace)
        ));
    }
}
