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

//! A FAT32 backend for the `umas_fs` tree: mount any [`umas_ds::DataStorage`]
//! holding a FAT32 volume and get back a [`umas_fs::Directory`] tree.
//!
//! Layering, bottom to top: [`boot_sector`] and [`fat`] read the on-disk
//! metadata; [`cluster_chain`] turns a chain of clusters into a byte
//! stream; [`dir_entry`] and [`short_name`] code and decode the 32-byte
//! directory entry slots; [`directory`] and [`file`] implement the public
//! tree; [`factory`] ties it all together behind [`umas_fs::FileSystemFactory`].
//!
//! # Concurrency
//!
//! A mounted volume assumes single-writer access: every [`directory::FatDirectory`]
//! and [`file::FatFile`] sharing one [`fat::Fat`] expects to be driven from
//! one thread at a time. Sharing a mount across threads needs an external
//! lock; nothing here is `Sync`.

mod boot_sector;
mod cluster_chain;
mod dir_entry;
mod directory;
mod factory;
mod fat;
mod file;
mod io;
mod short_name;

pub use boot_sector::Fat32BootSector;
pub use directory::FatDirectory;
pub use factory::Fat32FileSystem;
pub use fat::Fat;
pub use file::FatFile;
