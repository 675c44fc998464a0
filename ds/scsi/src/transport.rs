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

//! The boundary between this crate and the outside world: opening a USB
//! device, claiming its interface and finding its bulk endpoints is someone
//! else's problem. All we need from them is the ability to push bytes
//! through a bulk-out pipe and pull them back out of a bulk-in pipe.

use umas_ds::Result;

/// Default bulk transfer timeout, per the BBB recovery guidance most mass
/// storage class devices are built against.
pub const DEFAULT_TIMEOUT_MS: u32 = 21_000;

/// Capability injected by the caller: raw bulk transfers against an already
/// opened, already claimed USB interface.
///
/// Implementors own endpoint selection, descriptor parsing and interface
/// claiming; none of that is this crate's concern. [`ScsiBlockDevice`]
/// only ever calls `bulk_out`/`bulk_in`, plus the two control requests
/// needed for bulk-only mass storage reset recovery.
pub trait UsbCommunication {
    fn open(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    /// Sends `data[..length]` out the bulk-out endpoint, returns the number
    /// of bytes actually transferred.
    fn bulk_out(&mut self, data: &[u8], length: usize) -> Result<usize>;

    /// Reads up to `length` bytes into `buffer` from the bulk-in endpoint,
    /// returns the number of bytes actually transferred.
    fn bulk_in(&mut self, buffer: &mut [u8], length: usize) -> Result<usize>;

    /// Clears a halt condition on both bulk endpoints and issues the
    /// Bulk-Only Mass Storage Reset class request. Called after a CSW
    /// phase error or a transport timeout.
    fn reset_recovery(&mut self) -> Result<()>;
}

/// Identifies the device and logical unit a [`ScsiBlockDevice`] talks to.
#[derive(Debug, Clone, Copy)]
pub struct UsbMassStorageDeviceConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface_number: u8,
    pub in_endpoint_address: u8,
    pub out_endpoint_address: u8,
    pub lun: u8,
    pub timeout_ms: u32,
}

impl UsbMassStorageDeviceConfig {
    pub fn new(vendor_id: u16, product_id: u16, interface_number: u8) -> Self {
        Self {
            vendor_id,
            product_id,
            interface_number,
            in_endpoint_address: 0x81,
            out_endpoint_address: 0x02,
            lun: 0,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}
