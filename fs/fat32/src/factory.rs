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

//! Mounts a FAT32 volume: reads the boot sector at device byte 0, opens
//! the FAT, and hands back the root directory. `device` is expected to
//! already be partition-relative -- locating the FAT32 partition on a raw
//! disk is `umas_ds_scsi`'s `PartitionTable`'s job, one layer down.

use std::marker::PhantomData;
use std::rc::Rc;

use umas_ds::{DataStorage, Result};
use umas_fs::{Directory, FileSystemFactory};

use crate::boot_sector::{Fat32BootSector, BYTES_PER_BOOT_SECTOR};
use crate::directory::FatDirectory;
use crate::fat::Fat;

/// Marker type implementing [`FileSystemFactory`] for any block device
/// carrying a FAT32 volume.
pub struct Fat32FileSystem<D> {
    _device: PhantomData<D>,
}

impl<D: DataStorage + 'static> FileSystemFactory for Fat32FileSystem<D> {
    type Device = D;

    fn mount(device: Self::Device) -> Result<Box<dyn Directory>> {
        let mut sector = [0u8; BYTES_PER_BOOT_SECTOR];
        device.read(0, &mut sector)?;
        let boot = Fat32BootSector::parse(&sector)?;

        let device = Rc::new(device);
        let fat = Rc::new(Fat::open(device, &boot)?);
        let root = FatDirectory::open_root(fat, boot.bytes_per_cluster, boot.data_area_offset, boot.root_cluster)?;
        Ok(Box::new(root))
    }
}

#[cfg(test)]
mod tests {
    use umas_ds_mem::MemoryDataStorage;
    use umas_fs::Node;

    use super::*;

    /// Builds a minimal, valid FAT32 image: boot sector + FSInfo + two FAT
    /// copies (all free) + an empty root directory cluster.
    fn make_fat32_image() -> MemoryDataStorage {
        const BYTES_PER_SECTOR: u32 = 512;
        const SECTORS_PER_CLUSTER: u8 = 1;
        const RESERVED_SECTORS: u16 = 32;
        const FATS: u8 = 2;
        const SECTORS_PER_FAT: u32 = 8;
        const ROOT_CLUSTER: u32 = 2;
        const TOTAL_SECTORS: u32 = RESERVED_SECTORS as u32 + FATS as u32 * SECTORS_PER_FAT + 64;

        let device = MemoryDataStorage::new(TOTAL_SECTORS as usize * BYTES_PER_SECTOR as usize);

        let mut boot = [0u8; 512];
        boot[11..13].copy_from_slice(&(BYTES_PER_SECTOR as u16).to_le_bytes());
        boot[13] = SECTORS_PER_CLUSTER;
        boot[14..16].copy_from_slice(&RESERVED_SECTORS.to_le_bytes());
        boot[16] = FATS;
        // root_entry_count (bytes 17-18) left 0: required for FAT32.
        boot[36..40].copy_from_slice(&SECTORS_PER_FAT.to_le_bytes());
        boot[44..48].copy_from_slice(&ROOT_CLUSTER.to_le_bytes());
        boot[48..50].copy_from_slice(&1u16.to_le_bytes()); // fs_info_sector
        boot[32..36].copy_from_slice(&TOTAL_SECTORS.to_le_bytes()); // total_sectors_32
        boot[510] = 0x55;
        boot[511] = 0xAA;
        device.write(0, &boot).unwrap();

        let mut fs_info = [0u8; 512];
        fs_info[0..4].copy_from_slice(&0x4161_5252u32.to_le_bytes());
        fs_info[484..488].copy_from_slice(&0x6141_7272u32.to_le_bytes());
        fs_info[488..492].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // stale: force a rescan
        fs_info[492..496].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        fs_info[508..512].copy_from_slice(&0xAA55_0000u32.to_le_bytes());
        device.write(BYTES_PER_SECTOR as u64, &fs_info).unwrap();

        // Mark cluster 2 (the root directory) end-of-chain in both FAT copies.
        let fat_offset = RESERVED_SECTORS as u64 * BYTES_PER_SECTOR as u64;
        for fat_index in 0..FATS as u64 {
            let copy_offset = fat_offset + fat_index * SECTORS_PER_FAT as u64 * BYTES_PER_SECTOR as u64;
            device.write(copy_offset + 2 * 4, &0x0FFF_FFFFu32.to_le_bytes()).unwrap();
        }

        device
    }

    #[test]
    fn mount_reads_boot_sector_and_exposes_empty_root() {
        let device = make_fat32_image();
        let mut root = Fat32FileSystem::<MemoryDataStorage>::mount(device).unwrap();
        assert!(root.is_directory());
        assert_eq!(root.list().unwrap(), Vec::<String>::new());
    }

    #[test]
    fn create_file_then_find_it_via_search() {
        let device = make_fat32_image();
        let mut root = Fat32FileSystem::<MemoryDataStorage>::mount(device).unwrap();

        root.create_file("hello.txt").unwrap();
        assert_eq!(root.list().unwrap(), vec!["hello.txt".to_string()]);

        let found = root.search("hello.txt").unwrap().expect("file exists");
        assert!(!found.is_directory());
    }
}
