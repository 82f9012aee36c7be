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

//! LUKS volumes: unlocking with a candidate master key, adding a
//! well-known recovery password, and on-the-fly decryption overlays.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::PathBuf;

use crate::extent::whole_file_part;
use crate::model::{CreatorContext, Disk, FdeKind, Volume};
use crate::plugin::{MountResult, Plugin};
use crate::{runcmd, runcmd_output};

/// Password added to unlocked LUKS volumes during the modify pass, so the
/// resulting VM can be booted without the original passphrase.
pub const RECOVERY_PASSWORD: &str = "newpwd";

#[derive(Default)]
pub struct LuksMountPlugin;

impl Plugin for LuksMountPlugin {
    fn name(&self) -> &str {
        "luks_mount"
    }

    fn mount(&self, disk: &mut Disk, volume_id: usize, ctx: &mut CreatorContext) -> Result<MountResult> {
        let flat_mount = match disk.volume(volume_id).and_then(|v| v.flat_mount.clone()) {
            Some(p) => p,
            None => return Ok(MountResult::NotMine),
        };

        if runcmd!("cryptsetup", "isLuks", &flat_mount).is_err() {
            return Ok(MountResult::NotMine);
        }

        let mapper_name = format!("diskvm-luks-{}", volume_id);
        for key in ctx.options.candidate_keys() {
            if let Ok(mapper_path) = try_open(&flat_mount, &mapper_name, &key) {
                let mut child = Volume::new_child(disk.next_volume_id(), volume_id, mapper_path);
                child.annotations.fde_kind = Some(FdeKind::Luks);
                child.annotations.fde_master_key = Some(key);
                return Ok(MountResult::Volumes(vec![child]));
            }
        }
        log::info!("no candidate key unlocked LUKS volume {}", volume_id);
        Ok(MountResult::NotMine)
    }

    fn unmount_volume(&self, disk: &mut Disk, volume_id: usize, _ctx: &mut CreatorContext) -> Result<bool> {
        let is_luks_child = disk
            .volume(volume_id)
            .map(|v| v.annotations.fde_kind == Some(FdeKind::Luks))
            .unwrap_or(false);
        if !is_luks_child {
            return Ok(false);
        }
        let mapper_name = format!("diskvm-luks-{}", volume_id);
        runcmd!("cryptsetup", "close", &mapper_name).context("closing LUKS mapping")?;
        Ok(true)
    }
}

fn try_open(device: &std::path::Path, mapper_name: &str, key: &[u8]) -> Result<PathBuf> {
    let mut keyfile = tempfile::NamedTempFile::new().context("creating temporary key file")?;
    keyfile.write_all(key).context("writing candidate key")?;
    runcmd!(
        "cryptsetup",
        "open",
        "--type=luks",
        "--key-file",
        keyfile.path(),
        device,
        mapper_name
    )?;
    Ok(PathBuf::from(format!("/dev/mapper/{}", mapper_name)))
}

/// Adds [`RECOVERY_PASSWORD`] as an extra LUKS keyslot, using the master
/// key that unlocked the volume.
#[derive(Default)]
pub struct LuksAddPasswordPlugin;

impl Plugin for LuksAddPasswordPlugin {
    fn name(&self) -> &str {
        "luks_add_pw"
    }

    fn modify_volume(&self, disk: &mut Disk, volume_id: usize, _ctx: &mut CreatorContext) -> Result<()> {
        let (kind, device, key) = match disk.volume(volume_id) {
            Some(v) => (
                v.annotations.fde_kind,
                v.parent.and_then(|p| disk.volume(p)).and_then(|p| p.flat_mount.clone()),
                v.annotations.fde_master_key.clone(),
            ),
            None => return Ok(()),
        };
        if kind != Some(FdeKind::Luks) {
            return Ok(());
        }
        let (device, key) = match (device, key) {
            (Some(d), Some(k)) => (d, k),
            _ => return Ok(()),
        };

        let mut keyfile = tempfile::NamedTempFile::new().context("creating temporary key file")?;
        keyfile.write_all(&key).context("writing master key")?;
        let mut pwfile = tempfile::NamedTempFile::new().context("creating temporary password file")?;
        writeln!(pwfile, "{}", RECOVERY_PASSWORD).context("writing recovery password")?;

        runcmd!(
            "cryptsetup",
            "luksAddKey",
            "--key-file",
            keyfile.path(),
            &device,
            pwfile.path()
        )
        .context("adding recovery password to LUKS volume")
    }
}

/// During `before_create_disk`, overlays the plaintext view of each
/// unlocked LUKS volume onto the virtual disk, so the VM sees decrypted
/// data without the original encrypted bytes ever being copied.
#[derive(Default)]
pub struct LuksOnTheFlyDecryptPlugin;

impl Plugin for LuksOnTheFlyDecryptPlugin {
    fn name(&self) -> &str {
        "luks_otf_mount"
    }

    fn before_create_disk(
        &self,
        disk: &mut Disk,
        disk_builder: &mut dyn crate::vm::VirtualDiskBuilder,
        _ctx: &mut CreatorContext,
    ) -> Result<()> {
        let targets: Vec<(PathBuf, u64, u64)> = disk
            .volumes
            .iter()
            .filter(|v| v.annotations.fde_kind == Some(FdeKind::Luks))
            .filter_map(|v| {
                let parent = v.parent?;
                let parent = disk.volume(parent)?;
                Some((v.flat_mount.clone()?, parent.offset, parent.length))
            })
            .collect();

        for (plaintext_device, offset, length) in targets {
            let length = crate::blockdev::get_length_for_path(&plaintext_device).unwrap_or(length);
            disk_builder.add_part(extent_for(&plaintext_device, offset, length))?;
        }
        if !disk.volumes.is_empty() {
            disk.keep_mounted = disk.volumes.iter().any(|v| v.annotations.fde_kind == Some(FdeKind::Luks))
                || disk.keep_mounted;
        }
        Ok(())
    }
}

fn extent_for(device: &std::path::Path, target_offset: u64, length: u64) -> crate::extent::VirtualDiskPart {
    let mut part = whole_file_part(device, length);
    part.target_offset = target_offset;
    part
}
