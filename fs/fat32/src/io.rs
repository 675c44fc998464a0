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

//! Every on-disk structure above the block device layer -- FAT entries,
//! directory entries, the boot sector itself -- is smaller than, or
//! unaligned to, the device's block size. These two helpers are the single
//! place that buffers a request through a scratch block so the structures
//! above never have to think about alignment.

use umas_ds::{DataStorage, Result};

fn block_window(block_size: u64, offset: u64, len: u64) -> (u64, u64) {
    let start_block = offset / block_size;
    let end_block = (offset + len).div_ceil(block_size);
    (start_block * block_size, (end_block - start_block) * block_size)
}

pub fn read_at<D: DataStorage>(device: &D, offset: u64, buffer: &mut [u8]) -> Result<()> {
    let block_size = device.block_size().max(1) as u64;
    if offset % block_size == 0 && buffer.len() as u64 % block_size == 0 {
        return device.read(offset, buffer);
    }

    let (window_offset, window_len) = block_window(block_size, offset, buffer.len() as u64);
    let mut scratch = vec![0u8; window_len as usize];
    device.read(window_offset, &mut scratch)?;
    let start = (offset - window_offset) as usize;
    buffer.copy_from_slice(&scratch[start..start + buffer.len()]);
    Ok(())
}

pub fn write_at<D: DataStorage>(device: &D, offset: u64, buffer: &[u8]) -> Result<()> {
    let block_size = device.block_size().max(1) as u64;
    if offset % block_size == 0 && buffer.len() as u64 % block_size == 0 {
        return device.write(offset, buffer);
    }

    let (window_offset, window_len) = block_window(block_size, offset, buffer.len() as u64);
    let mut scratch = vec![0u8; window_len as usize];
    device.read(window_offset, &mut scratch)?;
    let start = (offset - window_offset) as usize;
    scratch[start..start + buffer.len()].copy_from_slice(buffer);
    device.write(window_offset, &scratch)
}
