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

//! The storage abstraction every layer above is built on: a block-addressed
//! device that can be read and written at a byte granularity once wrapped by
//! a [`Partition`](umas_err::Result)-style offset view.
//!
//! Every concrete backend (the SCSI/BBB transport in `umas_ds_scsi`, or the
//! in-memory backend in `umas_ds_mem` used for tests) implements
//! [`DataStorage`]. Code above this crate never talks to a transport
//! directly.

pub use umas_err::*;

/// A byte-addressable view over a block device.
///
/// Implementors are not required to support arbitrary offsets or lengths
/// directly: [`ScsiBlockDevice`](umas_ds_scsi) only accepts block-aligned
/// requests and relies on callers to buffer partial blocks, exactly as the
/// FAT engine's `ClusterChain` does.
pub trait DataStorage {
    /// Size of the smallest addressable unit, in bytes. `1` for backends
    /// with no inherent block granularity (e.g. an in-memory buffer).
    fn block_size(&self) -> u32 {
        1
    }

    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()>;

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()>;
}

impl<T: DataStorage + ?Sized> DataStorage for &T {
    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        (**self).read(offset, buffer)
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        (**self).write(offset, buffer)
    }
}
