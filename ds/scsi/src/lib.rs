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

//! Everything below the FAT32 engine: USB Bulk-Only Transport framing,
//! the SCSI commands needed to talk to a mass storage LUN, and MBR
//! partition parsing.

mod bbb;
mod mbr;
mod transport;

pub use bbb::ScsiBlockDevice;
pub use mbr::{Partition, PartitionEntry, PartitionTable};
pub use transport::{UsbCommunication, UsbMassStorageDeviceConfig, DEFAULT_TIMEOUT_MS};

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use umas_ds::DataStorage;
    use umas_ds_mem::MemoryDataStorage;

    use super::*;

    /// A fake `UsbCommunication` that plays back a fixed sequence of SCSI
    /// responses, keyed only by the order commands are issued in -- good
    /// enough to exercise the BBB framing and the `init()` state machine
    /// without a real device.
    struct FakeTransport {
        block_size: u32,
        last_lba: u32,
        pending_in: Mutex<VecDeque<Vec<u8>>>,
    }

    impl FakeTransport {
        fn new(block_size: u32, blocks: u32) -> Self {
            Self {
                block_size,
                last_lba: blocks - 1,
                pending_in: Mutex::new(VecDeque::new()),
            }
        }
    }

    impl UsbCommunication for FakeTransport {
        fn open(&mut self) -> umas_ds::Result<()> {
            Ok(())
        }

        fn close(&mut self) -> umas_ds::Result<()> {
            Ok(())
        }

        fn bulk_out(&mut self, data: &[u8], length: usize) -> umas_ds::Result<usize> {
            // Interpret the CBW to decide what the next bulk_in calls should
            // produce: a data-in payload (if any) followed by a CSW.
            if length == 31 && &data[0..4] == b"USBC" {
                let tag = u32::from_le_bytes(data[4..8].try_into().unwrap());
                let opcode = data[15];
                let mut responses = self.pending_in.lock().unwrap();
                responses.clear();
                match opcode {
                    0x00 => {} // TEST UNIT READY: no data phase
                    0x12 => {
                        let mut inquiry = vec![0u8; 36];
                        inquiry[0] = 0x00; // direct-access block device
                        responses.push_back(inquiry);
                    }
                    0x25 => {
                        let mut capacity = vec![0u8; 8];
                        capacity[0..4].copy_from_slice(&self.last_lba.to_be_bytes());
                        capacity[4..8].copy_from_slice(&self.block_size.to_be_bytes());
                        responses.push_back(capacity);
                    }
                    0x1A => {
                        responses.push_back(vec![0u8; 192]);
                    }
                    _ => {}
                }
                let mut csw = vec![0u8; 13];
                csw[0..4].copy_from_slice(b"USBS");
                csw[4..8].copy_from_slice(&tag.to_le_bytes());
                responses.push_back(csw);
            }
            Ok(length)
        }

        fn bulk_in(&mut self, buffer: &mut [u8], length: usize) -> umas_ds::Result<usize> {
            let mut responses = self.pending_in.lock().unwrap();
            let next = responses.pop_front().unwrap_or_default();
            let copy_len = next.len().min(length).min(buffer.len());
            buffer[..copy_len].copy_from_slice(&next[..copy_len]);
            Ok(copy_len)
        }

        fn reset_recovery(&mut self) -> umas_ds::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn init_caches_geometry_from_read_capacity() {
        let transport = FakeTransport::new(512, 131072);
        let config = UsbMassStorageDeviceConfig::new(0x0781, 0x5567, 0);
        let device = ScsiBlockDevice::new(transport, config);
        device.init().unwrap();
        assert_eq!(device.get_block_size(), 512);
        assert_eq!(device.get_blocks(), 131072);
    }

    #[test]
    fn read_rejects_unaligned_offset() {
        let transport = FakeTransport::new(512, 1024);
        let config = UsbMassStorageDeviceConfig::new(0x0781, 0x5567, 0);
        let device = ScsiBlockDevice::new(transport, config);
        device.init().unwrap();
        let mut buffer = [0u8; 512];
        assert!(device.read(100, &mut buffer).is_err());
    }

    #[test]
    fn partition_offsets_every_access() {
        let backing = MemoryDataStorage::new(4096);
        let entry = PartitionEntry {
            partition_type: 0x0C,
            first_lba: 2,
            sector_count: 6,
        };
        let partition = Partition::new(&backing, &entry);
        assert_eq!(partition.byte_len(), 6 * 512);

        partition.write(0, &[0xAB; 16]).unwrap();
        let mut check = [0u8; 16];
        backing.read(2 * 512, &mut check).unwrap();
        assert_eq!(check, [0xAB; 16]);
    }

    #[test]
    fn partition_table_finds_fat32_entry() {
        let mut image = vec![0u8; 512];
        image[510] = 0x55;
        image[511] = 0xAA;
        let offset = 0x1BE + 16; // second entry
        image[offset] = 0x00; // status
        image[offset + 4] = 0x0C; // FAT32 LBA
        image[offset + 8..offset + 12].copy_from_slice(&2048u32.to_le_bytes());
        image[offset + 12..offset + 16].copy_from_slice(&131072u32.to_le_bytes());

        let backing = MemoryDataStorage::from_vec(image, 512);
        let table = PartitionTable::read(&backing).unwrap();
        let found = table.find_fat32().unwrap();
        assert_eq!(found.first_lba, 2048);
        assert_eq!(found.sector_count, 131072);
    }
}
