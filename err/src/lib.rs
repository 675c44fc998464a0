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

//! Error types shared by every layer of the file system: the SCSI/BBB
//! transport, the partition table, the FAT32 engine and the directory tree.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("scsi: {0}")]
    Scsi(#[from] ScsiError),
    #[error("invalid format: {0}")]
    InvalidFormat(&'static str),
    #[error("out of space")]
    OutOfSpace,
    #[error("already exists")]
    AlreadyExists,
    #[error("not found")]
    NotFound,
    #[error("is a directory")]
    IsDirectory,
    #[error("not a directory")]
    NotDirectory,
    #[error("read-only")]
    ReadOnly,
    #[error("immutable")]
    Immutable,
    #[error("cross file system")]
    CrossFileSystem,
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

/// Failures from the bulk transport (`UsbCommunication`), below the SCSI
/// command layer.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("bulk transfer timed out")]
    Timeout,
    #[error("bulk transfer stalled")]
    Stalled,
    #[error("short transfer: expected {expected}, got {actual}")]
    Short { expected: usize, actual: usize },
    #[error("device closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(&'static str),
}

/// Failures reported by the SCSI/BBB command layer itself, once the bulk
/// transfer completed.
#[derive(thiserror::Error, Debug)]
pub enum ScsiError {
    #[error("command failed, sense key {sense_key:#x}")]
    CommandFailed { sense_key: u8 },
    #[error("phase error")]
    PhaseError,
    #[error("CSW tag mismatch: expected {expected:#x}, got {actual:#x}")]
    TagMismatch { expected: u32, actual: u32 },
    #[error("CSW signature invalid")]
    BadSignature,
    #[error("residue exceeds requested length")]
    BadResidue,
}

pub type Result<T> = core::result::Result<T, Error>;
