// Copyright 2024 Disk VM Creator Contributors
//
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

//! Backend-neutral virtual machine and virtual disk abstractions. A
//! concrete backend (currently only [`vmware`]) implements these traits;
//! the rest of the pipeline never mentions a backend-specific type.

pub mod vmware;

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::cli::Firmware;
use crate::error::DiskVmError;
use crate::extent::VirtualDiskPart;

/// Identifies which backend produced a disk or VM builder, so mismatched
/// combinations can be rejected with [`DiskVmError::UnsupportedDiskType`]
/// instead of a confusing downstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Vmware,
}

/// Parameters used to construct a new VM builder.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub name: String,
    pub memory_bytes: u64,
    pub cpus: u32,
    pub guest_os: String,
    pub firmware: Firmware,
}

/// Accumulates the extent map for one virtual disk.
pub trait VirtualDiskBuilder {
    fn backend_kind(&self) -> BackendKind;
    fn add_part(&mut self, part: VirtualDiskPart) -> Result<()>;
    /// Writes this disk's descriptor under `out_dir` using `file_stem` as
    /// the base filename, returning the path to the descriptor.
    fn write(&self, out_dir: &Path, file_stem: &str) -> Result<PathBuf>;
}

/// Accumulates disks and VM-wide parameters, then emits a machine
/// descriptor referencing each written disk descriptor.
pub trait VirtualMachineBuilder {
    fn backend_kind(&self) -> BackendKind;
    fn new_disk(&self, sector_size: u64) -> Box<dyn VirtualDiskBuilder>;
    fn add_disk(&mut self, disk: Box<dyn VirtualDiskBuilder>) -> Result<()>;
    fn write(&mut self, out_dir: &Path) -> Result<Box<dyn VirtualMachine>>;
}

/// A written, runnable VM.
pub trait VirtualMachine {
    fn start(&self) -> Result<()>;
    fn is_running(&self) -> Result<bool>;
    fn snapshot(&self, name: &str) -> Result<()>;
    /// Paths to the VM's virtual disks, re-read from the machine
    /// descriptor each call since a snapshot can rewrite them to point at
    /// a delta file referencing the original.
    fn disks(&self) -> Result<Vec<PathBuf>>;
}

/// Convenience alias for the boxed builder threaded through [`crate::model::CreatorContext`].
pub type VmBuilder = Box<dyn VirtualMachineBuilder>;

/// The host-side virtualization product (e.g. VMware Workstation):
/// availability check, builder factory, and mount/unmount of a
/// previously-written virtual disk for the writable modification pass.
pub trait VirtualizationSoftware {
    fn check_available(&self) -> Result<()>;
    fn builder(&self, spec: VmSpec) -> Box<dyn VirtualMachineBuilder>;
    fn mount_disk(&self, descriptor: &Path, writable: bool) -> Result<PathBuf>;
    fn unmount_disk(&self, descriptor: &Path, flat_path: &Path) -> Result<()>;
}

/// Resolves a `--virtualization-software` CLI value to an implementation.
pub fn resolve(name: &str) -> Result<Box<dyn VirtualizationSoftware>> {
    match name {
        "vmware" => Ok(Box::new(vmware::Vmware::new())),
        other => Err(DiskVmError::VirtualizationSoftwareNotAvailable(format!(
            "unknown backend {:?}",
            other
        ))
        .into()),
    }
}

pub(crate) fn check_backend_kind(
    expected: BackendKind,
    actual: BackendKind,
) -> Result<()> {
    if expected != actual {
        return Err(DiskVmError::UnsupportedDiskType.into());
    }
    Ok(())
}
