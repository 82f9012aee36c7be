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

//! VMware Workstation backend: `monolithicFlat` VMDK disk descriptors plus
//! a `.vmx` machine file, driven afterwards via `vmrun`/`vmware-mount`.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::cli::Firmware;
use crate::extent::{ExtentBuilder, VirtualDiskPart};
use crate::vm::{BackendKind, VirtualDiskBuilder, VirtualMachine, VirtualMachineBuilder, VmSpec};
use crate::vm::{check_backend_kind, VirtualizationSoftware};
use crate::{runcmd, runcmd_output};

const SECTOR_SIZE: u64 = 512;

pub struct VmdkDiskBuilder {
    extents: ExtentBuilder,
}

impl VmdkDiskBuilder {
    fn new(sector_size: u64) -> Self {
        VmdkDiskBuilder {
            extents: ExtentBuilder::new(sector_size),
        }
    }
}

impl VirtualDiskBuilder for VmdkDiskBuilder {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Vmware
    }

    fn add_part(&mut self, part: VirtualDiskPart) -> Result<()> {
        self.extents.add_part(part)
    }

    fn write(&self, out_dir: &Path, file_stem: &str) -> Result<PathBuf> {
        let descriptor_path = out_dir.join(format!("{}.vmdk", file_stem));
        let mut f = File::create(&descriptor_path)
            .with_context(|| format!("creating {}", descriptor_path.display()))?;

        let total_sectors = self.extents.total_length() / SECTOR_SIZE;
        writeln!(f, "# Disk DescriptorFile")?;
        writeln!(f, "version=1")?;
        writeln!(f, "CID=fffffffe")?;
        writeln!(f, "parentCID=ffffffff")?;
        writeln!(f, "createType=\"monolithicFlat\"")?;
        writeln!(f)?;
        writeln!(f, "# Extent description")?;
        for part in self.extents.parts_with_gaps_filled() {
            let sectors = part.length / SECTOR_SIZE;
            match &part.source_file {
                None => writeln!(f, "RW {} ZERO", sectors)?,
                Some(path) => writeln!(
                    f,
                    "RW {} FLAT \"{}\" {}",
                    sectors,
                    path.display(),
                    part.source_offset / SECTOR_SIZE
                )?,
            }
        }
        writeln!(f)?;
        writeln!(f, "# The Disk Data Base")?;
        writeln!(f, "#DDB")?;
        writeln!(f)?;
        writeln!(f, "ddb.virtualHWVersion = \"19\"")?;
        writeln!(f, "ddb.geometry.cylinders = \"{}\"", total_sectors / (16 * 63) + 1)?;
        writeln!(f, "ddb.geometry.heads = \"16\"")?;
        writeln!(f, "ddb.geometry.sectors = \"63\"")?;
        writeln!(f, "ddb.adapterType = \"lsilogic\"")?;

        Ok(descriptor_path)
    }
}

pub struct VmxBuilder {
    spec: VmSpec,
    disks: Vec<(Box<dyn VirtualDiskBuilder>, PathBuf)>,
}

impl VmxBuilder {
    fn new(spec: VmSpec) -> Self {
        VmxBuilder {
            spec,
            disks: Vec::new(),
        }
    }
}

impl VirtualMachineBuilder for VmxBuilder {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Vmware
    }

    fn new_disk(&self, sector_size: u64) -> Box<dyn VirtualDiskBuilder> {
        Box::new(VmdkDiskBuilder::new(sector_size))
    }

    fn add_disk(&mut self, disk: Box<dyn VirtualDiskBuilder>) -> Result<()> {
        check_backend_kind(BackendKind::Vmware, disk.backend_kind())?;
        let index = self.disks.len();
        let file_stem = format!("disk{}", index);
        // The descriptor path is resolved once the disk is actually
        // written out; stash a placeholder and fill it in in `write`.
        self.disks.push((disk, PathBuf::from(file_stem)));
        Ok(())
    }

    fn write(&mut self, out_dir: &Path) -> Result<Box<dyn VirtualMachine>> {
        let mut disk_paths = Vec::with_capacity(self.disks.len());
        for (disk, stem) in &self.disks {
            let stem = stem.to_string_lossy().into_owned();
            disk_paths.push(disk.write(out_dir, &stem)?);
        }

        let vmx_path = out_dir.join(format!("{}.vmx", self.spec.name));
        let mut f = File::create(&vmx_path)
            .with_context(|| format!("creating {}", vmx_path.display()))?;
        writeln!(f, ".encoding = \"UTF-8\"")?;
        writeln!(f, "config.version = \"8\"")?;
        writeln!(f, "virtualHW.version = \"19\"")?;
        writeln!(f, "displayName = \"{}\"", self.spec.name)?;
        writeln!(f, "guestOS = \"{}\"", self.spec.guest_os)?;
        writeln!(f, "memsize = \"{}\"", self.spec.memory_bytes / (1024 * 1024))?;
        writeln!(f, "numvcpus = \"{}\"", self.spec.cpus)?;
        if self.spec.firmware == Firmware::Efi {
            writeln!(f, "firmware = \"efi\"")?;
        }
        writeln!(f, "scsi0.present = \"TRUE\"")?;
        writeln!(f, "scsi0.virtualDev = \"lsilogic\"")?;
        for (i, path) in disk_paths.iter().enumerate() {
            writeln!(f, "scsi0:{}.present = \"TRUE\"", i)?;
            writeln!(
                f,
                "scsi0:{}.fileName = \"{}\"",
                i,
                path.file_name().unwrap_or_default().to_string_lossy()
            )?;
        }

        Ok(Box::new(VmwareMachine { vmx_path }))
    }
}

pub struct VmwareMachine {
    vmx_path: PathBuf,
}

impl VirtualMachine for VmwareMachine {
    fn start(&self) -> Result<()> {
        runcmd!("vmrun", "start", &self.vmx_path, "nogui")
    }

    fn is_running(&self) -> Result<bool> {
        let out = runcmd_output!("vmrun", "list")?;
        Ok(out
            .lines()
            .any(|l| l.trim() == self.vmx_path.to_string_lossy()))
    }

    fn snapshot(&self, name: &str) -> Result<()> {
        runcmd!("vmrun", "snapshot", &self.vmx_path, name)
    }

    fn disks(&self) -> Result<Vec<PathBuf>> {
        let dir = self
            .vmx_path
            .parent()
            .context("vmx path has no parent directory")?;
        let text = std::fs::read_to_string(&self.vmx_path)
            .with_context(|| format!("reading {}", self.vmx_path.display()))?;
        let mut disks = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                if key.ends_with(".fileName") && (key.starts_with("scsi") || key.starts_with("ide")) {
                    let value = value.trim().trim_matches('"');
                    disks.push(dir.join(value));
                }
            }
        }
        Ok(disks)
    }
}

pub struct Vmware;

impl Vmware {
    pub fn new() -> Self {
        Vmware
    }
}

impl Default for Vmware {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualizationSoftware for Vmware {
    fn check_available(&self) -> Result<()> {
        runcmd_output!("vmware", "--version").map(|_| ())
    }

    fn builder(&self, spec: VmSpec) -> Box<dyn VirtualMachineBuilder> {
        Box::new(VmxBuilder::new(spec))
    }

    fn mount_disk(&self, descriptor: &Path, writable: bool) -> Result<PathBuf> {
        let mountpoint = tempfile::Builder::new()
            .prefix("diskvm-vmdk-")
            .tempdir()
            .context("creating vmdk mount directory")?
            .into_path();
        if writable {
            runcmd!("vmware-mount", "-f", descriptor, &mountpoint)?;
        } else {
            runcmd!("vmware-mount", "-r", "-f", descriptor, &mountpoint)?;
        }
        Ok(mountpoint)
    }

    fn unmount_disk(&self, _descriptor: &Path, flat_path: &Path) -> Result<()> {
        runcmd!("vmware-mount", "-K", flat_path)
    }
}
