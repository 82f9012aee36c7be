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

//! Fallback plugin: mounts whatever filesystem `blkid` can identify on a
//! volume's flat device. Always present, run last among "mount" hooks so
//! more specific plugins (LUKS, BitLocker, VeraCrypt, LVM) get first shot
//! at a volume.

use anyhow::{Context, Result};
use nix::mount::MsFlags;
use std::path::{Path, PathBuf};

use crate::blockdev;
use crate::model::{CreatorContext, Disk};
use crate::plugin::{MountResult, Plugin};

/// Repairs an NTFS filesystem left in a hibernated/unsafe-shutdown state
/// via `ntfsfix` before retrying the mount. Disabled by default: doing
/// this unconditionally can make the original Windows installation
/// unbootable (it commits the journal replay), so it is opt-in only.
#[derive(Default)]
pub struct GenericFilesystemPlugin {
    pub repair_ntfs: bool,
}

impl Plugin for GenericFilesystemPlugin {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn mount(&self, disk: &mut Disk, volume_id: usize, _ctx: &mut CreatorContext) -> Result<MountResult> {
        let flat_mount = match disk.volume(volume_id).and_then(|v| v.flat_mount.clone()) {
            Some(p) => p,
            None => return Ok(MountResult::NotMine),
        };
        let device = flat_mount.to_string_lossy().into_owned();

        let fstype = match blockdev::blkid_fstype(&flat_mount)? {
            Some(t) => t,
            None => return Ok(MountResult::NotMine),
        };

        let flags = if disk.readonly {
            MsFlags::MS_RDONLY
        } else {
            MsFlags::empty()
        };

        match mount_fresh(&device, &fstype, flags) {
            Ok(path) => Ok(MountResult::Filesystem(path)),
            Err(e) if fstype == "ntfs" && self.repair_ntfs => {
                log::warn!("mounting ntfs volume {} failed ({:#}), attempting ntfsfix", volume_id, e);
                crate::runcmd!("ntfsfix", &device).context("running ntfsfix")?;
                let path = mount_fresh(&device, &fstype, flags)?;
                Ok(MountResult::Filesystem(path))
            }
            Err(_) => Ok(MountResult::NotMine),
        }
    }

    fn unmount_filesystem(&self, disk: &mut Disk, volume_id: usize, _ctx: &mut CreatorContext) -> Result<bool> {
        let path = match disk.volume(volume_id).and_then(|v| v.filesystem_mount.clone()) {
            Some(p) => p,
            None => return Ok(false),
        };
        unmount_path(&path)?;
        Ok(true)
    }

    fn unmount_volume(&self, disk: &mut Disk, volume_id: usize, _ctx: &mut CreatorContext) -> Result<bool> {
        let flat = match disk.volume(volume_id).and_then(|v| v.flat_mount.clone()) {
            Some(p) => p,
            None => return Ok(false),
        };
        if flat.to_string_lossy().contains("loop") {
            blockdev::losetup_detach(&flat)?;
            return Ok(true);
        }
        Ok(false)
    }
}

fn unmount_path(path: &PathBuf) -> Result<()> {
    crate::util::retry(10, std::time::Duration::from_millis(500), || {
        nix::mount::umount(path.as_path()).map_err(|e| anyhow::anyhow!(e))
    })
    .with_context(|| format!("unmounting {}", path.display()))?;
    std::fs::remove_dir(path).with_context(|| format!("removing {}", path.display()))
}

fn mount_fresh(device: &str, fstype: &str, flags: MsFlags) -> Result<PathBuf> {
    let mountpoint = tempfile::Builder::new()
        .prefix("diskvm-creator-fs-")
        .tempdir()
        .context("creating temporary directory")?
        .into_path();
    nix::mount::mount::<str, Path, str, str>(Some(device), &mountpoint, Some(fstype), flags, None)
        .with_context(|| format!("mounting {} on {}", device, mountpoint.display()))?;
    Ok(mountpoint)
}
