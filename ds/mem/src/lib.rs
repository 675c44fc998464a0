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

//! A [`DataStorage`] backed by a plain in-memory buffer.
//!
//! This is what the rest of the workspace is tested against: growing a
//! 64 MiB `Vec<u8>` is cheap and deterministic, unlike driving an actual USB
//! mass storage device, and it lets the FAT32 engine be exercised without a
//! `UsbCommunication` implementation at all.

use std::sync::Mutex;

use umas_ds::{DataStorage, Error, Result, TransportError};

pub struct MemoryDataStorage {
    block_size: u32,
    buffer: Mutex<Vec<u8>>,
}

impl MemoryDataStorage {
    pub fn new(len: usize) -> Self {
        Self::with_block_size(len, 512)
    }

    pub fn with_block_size(len: usize, block_size: u32) -> Self {
        Self {
            block_size,
            buffer: Mutex::new(vec![0u8; len]),
        }
    }

    pub fn from_vec(buffer: Vec<u8>, block_size: u32) -> Self {
        Self {
            block_size,
            buffer: Mutex::new(buffer),
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer.into_inner().unwrap()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }
}

impl DataStorage for MemoryDataStorage {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let backing = self.buffer.lock().unwrap();
        let start = offset as usize;
        let end = start
            .checked_add(buffer.len())
            .ok_or(Error::Transport(TransportError::Protocol("offset overflow")))?;
        if end > backing.len() {
            return Err(Error::Transport(TransportError::Short {
                expected: buffer.len(),
                actual: backing.len().saturating_sub(start),
            }));
        }
        buffer.copy_from_slice(&backing[start..end]);
        Ok(())
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        let mut backing = self.buffer.lock().unwrap();
        let start = offset as usize;
        let end = start
            .checked_add(buffer.len())
            .ok_or(Error::Transport(TransportError::Protocol("offset overflow")))?;
        if end > backing.len() {
            return Err(Error::Transport(TransportError::Short {
                expected: buffer.len(),
                actual: backing.len().saturating_sub(start),
            }));
        }
        backing[start..end].copy_from_slice(buffer);
        Ok(())
    }
}
