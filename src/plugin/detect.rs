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

//! OS family and firmware auto-detection.

use anyhow::Result;

use crate::cli::Firmware;
use crate::model::{CreatorContext, Disk};
use crate::plugin::Plugin;

#[derive(Default)]
pub struct OsDetectPlugin;

impl Plugin for OsDetectPlugin {
    fn name(&self) -> &str {
        "os_detect"
    }

    fn mounted_filesystem(&self, disk: &mut Disk, volume_id: usize, ctx: &mut CreatorContext) -> Result<()> {
        if ctx.guest_os.is_some() {
            return Ok(());
        }
        let fs_mount = match disk.volume(volume_id).and_then(|v| v.filesystem_mount.clone()) {
            Some(p) => p,
            None => return Ok(()),
        };

        if fs_mount.join("etc").join("passwd").is_file() {
            ctx.guest_os = Some("other-linux-64".into());
            return Ok(());
        }

        let software_hive = fs_mount.join("Windows").join("System32").join("config").join("SOFTWARE");
        if software_hive.is_file() {
            // A 64-bit Windows install keeps a WOW64 redirection tree for
            // 32-bit programs; a 32-bit install has no such directory.
            let is_64bit = fs_mount.join("Program Files (x86)").is_dir();
            ctx.guest_os = Some(if is_64bit { "windows9-64".into() } else { "windows9".into() });
        }
        Ok(())
    }
}

/// Sets firmware to EFI if any partition has the ESP type, else BIOS.
#[derive(Default)]
pub struct EfiDetectPlugin;

impl Plugin for EfiDetectPlugin {
    fn name(&self) -> &str {
        "efi_detect"
    }

    fn mounted_disk(&self, disk: &mut Disk, ctx: &mut CreatorContext) -> Result<()> {
        if ctx.firmware.is_some() {
            return Ok(());
        }
        let has_esp = disk
            .volumes
            .iter()
            .filter_map(|v| v.partition.as_ref())
            .any(|p| p.is_esp());
        ctx.firmware = Some(if has_esp { Firmware::Efi } else { Firmware::Bios });
        Ok(())
    }
}
