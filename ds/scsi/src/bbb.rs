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

//! Bulk-Only Transport framing (CBW/CSW) and the handful of SCSI block
//! commands the file system actually needs: `TEST UNIT READY`, `INQUIRY`,
//! `READ CAPACITY(10)`, `MODE SENSE(6)`, `READ(10)` and `WRITE(10)`.

use std::sync::Mutex;

use log::{debug, trace, warn};
use zerocopy::{
    big_endian::{U16 as BeU16, U32 as BeU32},
    little_endian::U32 as LeU32,
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

use umas_ds::{DataStorage, Error, Result, ScsiError, TransportError};

use crate::transport::{UsbCommunication, UsbMassStorageDeviceConfig};

const CBW_SIGNATURE: [u8; 4] = *b"USBC";
const CSW_SIGNATURE: [u8; 4] = *b"USBS";

const CBW_FLAGS_DATA_IN: u8 = 0x80;
const CBW_FLAGS_DATA_OUT: u8 = 0x00;

const CSW_STATUS_PASSED: u8 = 0x00;
const CSW_STATUS_FAILED: u8 = 0x01;
const CSW_STATUS_PHASE_ERROR: u8 = 0x02;

#[repr(C, packed)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct CommandBlockWrapper {
    signature: [u8; 4],
    tag: LeU32,
    data_transfer_length: LeU32,
    flags: u8,
    lun: u8,
    cb_length: u8,
    cb: [u8; 16],
}

#[repr(C, packed)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct CommandStatusWrapper {
    signature: [u8; 4],
    tag: LeU32,
    data_residue: LeU32,
    status: u8,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    In,
    Out,
    None,
}

/// Mutable transport state, serialized behind a mutex so [`ScsiBlockDevice`]
/// can implement [`DataStorage`] (whose methods take `&self`) while BBB
/// tags stay monotonic. The spec's own concurrency contract ("at most one
/// in-flight operation per file system instance") means this mutex is
/// never contended in practice; it exists so the type is `Sync` without
/// `unsafe`.
struct Inner<C: UsbCommunication> {
    comm: C,
    next_tag: u32,
}

/// Block-addressed read/write over a SCSI device reached through USB
/// Bulk-Only Transport.
pub struct ScsiBlockDevice<C: UsbCommunication> {
    inner: Mutex<Inner<C>>,
    config: UsbMassStorageDeviceConfig,
    block_size: Mutex<u32>,
    blocks: Mutex<u64>,
}

impl<C: UsbCommunication> ScsiBlockDevice<C> {
    pub fn new(comm: C, config: UsbMassStorageDeviceConfig) -> Self {
        Self {
            inner: Mutex::new(Inner { comm, next_tag: 1 }),
            config,
            block_size: Mutex::new(512),
            blocks: Mutex::new(0),
        }
    }

    /// Brings the device to a known-ready state and caches its geometry.
    /// Fails if `INQUIRY` or `READ CAPACITY(10)` fail; `MODE SENSE(6)` is
    /// best-effort and its failure is only logged.
    pub fn init(&self) -> Result<()> {
        self.inner.lock().unwrap().comm.open()?;

        let mut ready = false;
        for attempt in 0..20 {
            match self.test_unit_ready() {
                Ok(()) => {
                    ready = true;
                    break;
                }
                Err(Error::Scsi(ScsiError::CommandFailed { .. })) => {
                    trace!("TEST UNIT READY: not ready (attempt {attempt})");
                }
                Err(err) => return Err(err),
            }
        }
        if !ready {
            warn!("device never reported ready; continuing anyway");
        }

        let peripheral_device_type = self.inquiry()?;
        if peripheral_device_type != 0x00 {
            return Err(Error::Unsupported(
                "peripheral device type is not direct-access",
            ));
        }

        let (block_size, last_lba) = self.read_capacity_10()?;
        *self.block_size.lock().unwrap() = block_size;
        *self.blocks.lock().unwrap() = last_lba as u64 + 1;

        if let Err(err) = self.mode_sense_6(0x1A) {
            debug!("MODE SENSE(6) page 0x1A failed (best effort): {err}");
        }

        Ok(())
    }

    pub fn get_block_size(&self) -> u32 {
        *self.block_size.lock().unwrap()
    }

    pub fn get_blocks(&self) -> u64 {
        *self.blocks.lock().unwrap()
    }

    /// Runs one CBW/data-phase/CSW cycle, retrying once after a BBB reset
    /// on phase error or timeout. `in_buffer` and `out_buffer` are mutually
    /// exclusive; both `None` means a command with no data phase.
    fn execute(
        &self,
        cb: &[u8],
        mut in_buffer: Option<&mut [u8]>,
        out_buffer: Option<&[u8]>,
    ) -> Result<u32> {
        assert!(cb.len() <= 16);
        let direction = match (&in_buffer, &out_buffer) {
            (Some(_), None) => Direction::In,
            (None, Some(_)) => Direction::Out,
            (None, None) => Direction::None,
            (Some(_), Some(_)) => unreachable!("a command has at most one data phase"),
        };

        let result = self.execute_once(cb, direction, in_buffer.as_deref_mut(), out_buffer);
        let needs_reset = matches!(
            result,
            Err(Error::Scsi(ScsiError::PhaseError)) | Err(Error::Transport(TransportError::Timeout))
        );
        if needs_reset {
            warn!("BBB transfer failed, running reset recovery");
            self.inner.lock().unwrap().comm.reset_recovery()?;
        }
        result
    }

    fn execute_once(
        &self,
        cb: &[u8],
        direction: Direction,
        in_buffer: Option<&mut [u8]>,
        out_buffer: Option<&[u8]>,
    ) -> Result<u32> {
        let data_len = match direction {
            Direction::In => in_buffer.as_ref().map_or(0, |b| b.len()) as u32,
            Direction::Out => out_buffer.map_or(0, |b| b.len()) as u32,
            Direction::None => 0,
        };

        let mut cb_padded = [0u8; 16];
        cb_padded[..cb.len()].copy_from_slice(cb);

        let mut guard = self.inner.lock().unwrap();
        let tag = guard.next_tag;
        guard.next_tag = guard.next_tag.wrapping_add(1);

        let cbw = CommandBlockWrapper {
            signature: CBW_SIGNATURE,
            tag: tag.into(),
            data_transfer_length: data_len.into(),
            flags: match direction {
                Direction::In => CBW_FLAGS_DATA_IN,
                _ => CBW_FLAGS_DATA_OUT,
            },
            lun: self.config.lun & 0x0F,
            cb_length: cb.len() as u8,
            cb: cb_padded,
        };

        let cbw_bytes = cbw.as_bytes();
        let written = guard.comm.bulk_out(cbw_bytes, cbw_bytes.len())?;
        if written != cbw_bytes.len() {
            return Err(Error::Transport(TransportError::Short {
                expected: cbw_bytes.len(),
                actual: written,
            }));
        }

        match direction {
            Direction::In => {
                let buffer = in_buffer.expect("in_buffer for Direction::In");
                let len = buffer.len();
                let read = guard.comm.bulk_in(buffer, len)?;
                if read < len {
                    debug!("short read: expected {len}, got {read}");
                }
            }
            Direction::Out => {
                let buffer = out_buffer.expect("out_buffer for Direction::Out");
                let len = buffer.len();
                let written = guard.comm.bulk_out(buffer, len)?;
                if written != len {
                    return Err(Error::Transport(TransportError::Short {
                        expected: len,
                        actual: written,
                    }));
                }
            }
            Direction::None => {}
        }

        let mut csw_bytes = [0u8; 13];
        let read = guard.comm.bulk_in(&mut csw_bytes, 13)?;
        drop(guard);
        if read != 13 {
            return Err(Error::Transport(TransportError::Short {
                expected: 13,
                actual: read,
            }));
        }
        let csw = CommandStatusWrapper::read_from_bytes(&csw_bytes[..])
            .map_err(|_| Error::Scsi(ScsiError::BadSignature))?;
        if csw.signature != CSW_SIGNATURE {
            return Err(Error::Scsi(ScsiError::BadSignature));
        }
        let csw_tag: u32 = csw.tag.into();
        if csw_tag != tag {
            return Err(Error::Scsi(ScsiError::TagMismatch {
                expected: tag,
                actual: csw_tag,
            }));
        }
        let residue: u32 = csw.data_residue.into();

        match csw.status {
            CSW_STATUS_PASSED => {
                if direction == Direction::In && residue > 0 {
                    debug!("short read: residue {residue}");
                }
                Ok(residue)
            }
            CSW_STATUS_FAILED => Err(Error::Scsi(ScsiError::CommandFailed { sense_key: 0 })),
            CSW_STATUS_PHASE_ERROR => Err(Error::Scsi(ScsiError::PhaseError)),
            other => Err(Error::Scsi(ScsiError::CommandFailed { sense_key: other })),
        }
    }

    fn test_unit_ready(&self) -> Result<()> {
        let cb = [0x00u8, 0, 0, 0, 0, 0];
        self.execute(&cb, None, None)?;
        Ok(())
    }

    fn inquiry(&self) -> Result<u8> {
        let mut buffer = [0u8; 36];
        let len = buffer.len() as u8;
        let cb = [0x12u8, 0, 0, 0, len, 0];
        self.execute(&cb, Some(&mut buffer), None)?;
        Ok(buffer[0] & 0x1F)
    }

    /// Returns `(block_size, last_lba)`.
    fn read_capacity_10(&self) -> Result<(u32, u32)> {
        let mut buffer = [0u8; 8];
        let cb = [0x25u8, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        self.execute(&cb, Some(&mut buffer), None)?;
        let last_lba = BeU32::read_from_bytes(&buffer[0..4]).unwrap().get();
        let block_size = BeU32::read_from_bytes(&buffer[4..8]).unwrap().get();
        Ok((block_size, last_lba))
    }

    fn mode_sense_6(&self, page_code: u8) -> Result<()> {
        let mut buffer = [0u8; 192];
        let len = buffer.len() as u8;
        let cb = [0x1Au8, 0, page_code & 0x3F, 0, len, 0];
        self.execute(&cb, Some(&mut buffer), None)?;
        Ok(())
    }

    fn read_10(&self, lba: u32, blocks: u16, buffer: &mut [u8]) -> Result<()> {
        let cb = build_read_write_10(0x28, lba, blocks);
        self.execute(&cb, Some(buffer), None)?;
        Ok(())
    }

    fn write_10(&self, lba: u32, blocks: u16, buffer: &[u8]) -> Result<()> {
        let cb = build_read_write_10(0x2A, lba, blocks);
        self.execute(&cb, None, Some(buffer))?;
        Ok(())
    }
}

fn build_read_write_10(opcode: u8, lba: u32, blocks: u16) -> [u8; 10] {
    let mut cb = [0u8; 10];
    cb[0] = opcode;
    cb[2..6].copy_from_slice(BeU32::new(lba).as_bytes());
    cb[7..9].copy_from_slice(BeU16::new(blocks).as_bytes());
    cb
}

impl<C: UsbCommunication> DataStorage for ScsiBlockDevice<C> {
    fn block_size(&self) -> u32 {
        self.get_block_size()
    }

    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let block_size = self.get_block_size() as u64;
        if block_size == 0 || offset % block_size != 0 || buffer.len() as u64 % block_size != 0 {
            return Err(Error::InvalidFormat("read is not block-aligned"));
        }
        let lba = (offset / block_size) as u32;
        let blocks = (buffer.len() as u64 / block_size) as u16;
        self.read_10(lba, blocks, buffer)
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        let block_size = self.get_block_size() as u64;
        if block_size == 0 || offset % block_size != 0 || buffer.len() as u64 % block_size != 0 {
            return Err(Error::InvalidFormat("write is not block-aligned"));
        }
        let lba = (offset / block_size) as u32;
        let blocks = (buffer.len() as u64 / block_size) as u16;
        self.write_10(lba, blocks, buffer)
    }
}
