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

//! The 512-byte BIOS Parameter Block at partition byte 0, and the FSInfo
//! sector that mirrors (but does not authoritatively own) the free-cluster
//! count.

use zerocopy::{little_endian::U32, little_endian::U16, FromBytes, Immutable, IntoBytes, KnownLayout};

use umas_ds::{DataStorage, Error, Result};

pub const BYTES_PER_BOOT_SECTOR: usize = 512;

const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawBootSector {
    jmp_boot: [u8; 3],
    oem_name: [u8; 8],
    bytes_per_sector: U16,
    sectors_per_cluster: u8,
    reserved_sector_count: U16,
    number_of_fats: u8,
    root_entry_count: U16,
    total_sectors_16: U16,
    media: u8,
    fat_size_16: U16,
    sectors_per_track: U16,
    number_of_heads: U16,
    hidden_sectors: U32,
    total_sectors_32: U32,
    // FAT32-specific extended BPB.
    fat_size_32: U32,
    ext_flags: U16,
    fs_version: U16,
    root_cluster: U32,
    fs_info_sector: U16,
    backup_boot_sector: U16,
    reserved: [u8; 12],
    drive_number: u8,
    reserved1: u8,
    boot_signature: u8,
    volume_id: U32,
    volume_label: [u8; 11],
    fs_type: [u8; 8],
    boot_code: [u8; 420],
    signature_word: [u8; 2],
}

/// Parsed BIOS Parameter Block, plus the values derived from it once at
/// mount time. Pure data: parsing this does not perform any I/O of its
/// own beyond the single 512-byte read the caller already did.
#[derive(Debug, Clone)]
pub struct Fat32BootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sector_count: u16,
    pub number_of_fats: u8,
    pub total_sectors: u32,
    pub sectors_per_fat: u32,
    pub root_cluster: u32,
    pub fs_info_sector: u16,
    pub volume_label: [u8; 11],

    /// `bytes_per_sector * sectors_per_cluster`.
    pub bytes_per_cluster: u32,
    /// Byte offset of the first FAT copy, relative to the partition.
    pub fat_offset: u64,
    /// Byte offset of cluster 2 (the first data cluster), relative to the
    /// partition.
    pub data_area_offset: u64,
}

impl Fat32BootSector {
    /// Parses and validates a 512-byte boot sector already read from
    /// partition byte 0.
    pub fn parse(sector: &[u8]) -> Result<Self> {
        if sector.len() != BYTES_PER_BOOT_SECTOR {
            return Err(Error::InvalidFormat("boot sector is not 512 bytes"));
        }
        let raw = RawBootSector::read_from_bytes(sector)
            .map_err(|_| Error::InvalidFormat("boot sector layout mismatch"))?;

        if raw.signature_word != BOOT_SIGNATURE {
            return Err(Error::InvalidFormat("boot sector signature 0x55AA missing"));
        }

        let bytes_per_sector = raw.bytes_per_sector.get();
        if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return Err(Error::InvalidFormat("bytes per sector is not 512/1024/2048/4096"));
        }

        let sectors_per_cluster = raw.sectors_per_cluster;
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(Error::InvalidFormat("sectors per cluster is not a power of two"));
        }

        if raw.fat_size_32.get() == 0 {
            return Err(Error::Unsupported("BPB_FATSz32 is zero (not a FAT32 volume)"));
        }
        if raw.root_entry_count.get() != 0 {
            return Err(Error::Unsupported("BPB_RootEntCnt is non-zero (FAT12/16, not FAT32)"));
        }

        let reserved_sector_count = raw.reserved_sector_count.get();
        let number_of_fats = raw.number_of_fats;
        let sectors_per_fat = raw.fat_size_32.get();
        let total_sectors = if raw.total_sectors_32.get() != 0 {
            raw.total_sectors_32.get()
        } else {
            raw.total_sectors_16.get() as u32
        };

        let bytes_per_cluster = bytes_per_sector as u32 * sectors_per_cluster as u32;
        let fat_offset = reserved_sector_count as u64 * bytes_per_sector as u64;
        let data_area_offset =
            fat_offset + number_of_fats as u64 * sectors_per_fat as u64 * bytes_per_sector as u64;

        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sector_count,
            number_of_fats,
            total_sectors,
            sectors_per_fat,
            root_cluster: raw.root_cluster.get(),
            fs_info_sector: raw.fs_info_sector.get(),
            volume_label: raw.volume_label,
            bytes_per_cluster,
            fat_offset,
            data_area_offset,
        })
    }

    /// Total number of addressable data clusters (cluster numbers start at
    /// 2, so this is also one less than the first out-of-range cluster
    /// number).
    pub fn total_data_clusters(&self) -> u32 {
        let fat_region_sectors =
            self.reserved_sector_count as u64 + self.number_of_fats as u64 * self.sectors_per_fat as u64;
        let data_sectors = (self.total_sectors as u64).saturating_sub(fat_region_sectors);
        (data_sectors / self.sectors_per_cluster as u64) as u32
    }

    pub fn volume_label_str(&self) -> String {
        String::from_utf8_lossy(&self.volume_label)
            .trim_end()
            .to_string()
    }
}

const FS_INFO_LEAD_SIGNATURE: u32 = 0x4161_5252;
const FS_INFO_STRUCT_SIGNATURE: u32 = 0x6141_7272;
const FS_INFO_TRAIL_SIGNATURE: u32 = 0xAA55_0000;

/// A hint cache, not an authoritative source: the free cluster count and
/// next-free-cluster hint this sector mirrors may be stale (or the
/// sentinel `0xFFFFFFFF`), in which case the authoritative free set comes
/// from scanning the FAT.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawFsInfo {
    lead_signature: U32,
    reserved1: [u8; 480],
    struct_signature: U32,
    free_count: U32,
    next_free: U32,
    reserved2: [u8; 12],
    trail_signature: U32,
}

#[derive(Debug, Clone, Copy)]
pub struct FsInfo {
    pub free_count: u32,
    pub next_free: u32,
}

impl FsInfo {
    pub const STALE: u32 = 0xFFFF_FFFF;

    pub fn read(sector: &[u8]) -> Result<Self> {
        let raw = RawFsInfo::read_from_bytes(sector)
            .map_err(|_| Error::InvalidFormat("FSInfo sector layout mismatch"))?;
        if raw.lead_signature.get() != FS_INFO_LEAD_SIGNATURE
            || raw.struct_signature.get() != FS_INFO_STRUCT_SIGNATURE
            || raw.trail_signature.get() != FS_INFO_TRAIL_SIGNATURE
        {
            return Err(Error::InvalidFormat("FSInfo signatures missing"));
        }
        Ok(Self {
            free_count: raw.free_count.get(),
            next_free: raw.next_free.get(),
        })
    }

    pub fn is_stale(&self) -> bool {
        self.free_count == Self::STALE || self.next_free == Self::STALE
    }

    /// Serializes `self` back into a full 512-byte FSInfo sector, reusing
    /// `template` for the reserved padding bytes (which must be preserved
    /// verbatim).
    pub fn write_into(&self, template: &mut [u8]) -> Result<()> {
        if template.len() != BYTES_PER_BOOT_SECTOR {
            return Err(Error::InvalidFormat("FSInfo sector is not 512 bytes"));
        }
        template[488..492].copy_from_slice(&self.free_count.to_le_bytes());
        template[492..496].copy_from_slice(&self.next_free.to_le_bytes());
        Ok(())
    }

    pub fn read_device<D: DataStorage>(device: &D, offset: u64) -> Result<(Self, [u8; BYTES_PER_BOOT_SECTOR])> {
        let mut sector = [0u8; BYTES_PER_BOOT_SECTOR];
        device.read(offset, &mut sector)?;
        Ok((Self::read(&sector)?, sector))
    }
}
