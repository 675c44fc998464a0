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

//! Master Boot Record parsing and the partition-relative view over a block
//! device that everything above it (the FAT32 engine) actually talks to.

use zerocopy::{little_endian::U32, FromBytes, Immutable, KnownLayout};

use umas_ds::{DataStorage, Error, Result};

const MBR_PARTITION_TABLE_OFFSET: usize = 0x1BE;
const MBR_SIGNATURE_OFFSET: usize = 510;
const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// Partition type bytes accepted as FAT32: LBA and CHS variants, with and
/// without the bootable flag's neighbouring bit set.
const FAT32_PARTITION_TYPES: [u8; 4] = [0x0B, 0x0C, 0x1B, 0x1C];

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
struct RawPartitionEntry {
    status: u8,
    first_chs: [u8; 3],
    partition_type: u8,
    last_chs: [u8; 3],
    first_lba: U32,
    sector_count: U32,
}

/// One entry of the four-entry MBR partition table.
#[derive(Debug, Clone, Copy)]
pub struct PartitionEntry {
    pub partition_type: u8,
    pub first_lba: u32,
    pub sector_count: u32,
}

impl PartitionEntry {
    pub fn is_fat32(&self) -> bool {
        FAT32_PARTITION_TYPES.contains(&self.partition_type)
    }
}

/// The four primary partition table entries read from device LBA 0.
pub struct PartitionTable {
    entries: [PartitionEntry; 4],
}

impl PartitionTable {
    /// Reads and parses the MBR. `device` must support reads of at least
    /// 512 bytes at offset 0 (it may be the raw block device; partition
    /// tables are always at byte 0 regardless of block size, since 512 is
    /// itself a multiple of every legal sector size only when block size is
    /// 512 — callers with a larger block size must round their buffer up to
    /// one full block and pass a sub-slice).
    pub fn read<D: DataStorage>(device: &D) -> Result<Self> {
        let mut sector = [0u8; 512];
        device.read(0, &mut sector)?;

        if sector[MBR_SIGNATURE_OFFSET..MBR_SIGNATURE_OFFSET + 2] != MBR_SIGNATURE {
            return Err(Error::InvalidFormat("MBR signature 0x55AA missing"));
        }

        let mut entries = [PartitionEntry {
            partition_type: 0,
            first_lba: 0,
            sector_count: 0,
        }; 4];
        for (index, entry) in entries.iter_mut().enumerate() {
            let offset = MBR_PARTITION_TABLE_OFFSET + index * 16;
            let raw = RawPartitionEntry::read_from_bytes(&sector[offset..offset + 16])
                .map_err(|_| Error::InvalidFormat("truncated MBR partition entry"))?;
            *entry = PartitionEntry {
                partition_type: raw.partition_type,
                first_lba: raw.first_lba.get(),
                sector_count: raw.sector_count.get(),
            };
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[PartitionEntry; 4] {
        &self.entries
    }

    /// Returns the first entry recognized as a FAT32 partition.
    pub fn find_fat32(&self) -> Option<&PartitionEntry> {
        self.entries.iter().find(|entry| entry.is_fat32())
    }
}

/// A byte-offset view into one partition of an underlying block device.
pub struct Partition<'d, D: DataStorage> {
    device: &'d D,
    byte_offset: u64,
    byte_len: u64,
}

impl<'d, D: DataStorage> Partition<'d, D> {
    pub fn new(device: &'d D, entry: &PartitionEntry) -> Self {
        let block_size = device.block_size() as u64;
        Self {
            device,
            byte_offset: entry.first_lba as u64 * block_size,
            byte_len: entry.sector_count as u64 * block_size,
        }
    }

    pub fn byte_len(&self) -> u64 {
        self.byte_len
    }
}

impl<'d, D: DataStorage> DataStorage for Partition<'d, D> {
    fn block_size(&self) -> u32 {
        self.device.block_size()
    }

    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        self.device.read(self.byte_offset + offset, buffer)
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        self.device.write(self.byte_offset + offset, buffer)
    }
}
