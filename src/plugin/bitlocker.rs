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

//! BitLocker volumes, mounted through `dislocker-fuse`. `cryptsetup`
//! reports success even with a wrong FVEK, so every unlock attempt is
//! validated by checking the plaintext begins with the NTFS signature.

use anyhow::{Context, Result};
use std::io::{Read, Seek, SeekFrom};
use std::io::Write as IoWrite;
use std::path::PathBuf;

use crate::model::{CreatorContext, Disk, FdeKind, Volume};
use crate::plugin::{MountResult, Plugin};
use crate::runcmd;

const FVE_SIGNATURE: &[u8] = b"-FVE-FS-";
const FVE_SIGNATURE_OFFSET: u64 = 3;
const NTFS_SIGNATURE: &[u8] = b"NTFS    ";

#[derive(Default)]
pub struct BitlockerMountPlugin {
    pub try_clearkey: bool,
}

impl Plugin for BitlockerMountPlugin {
    fn name(&self) -> &str {
        "bitlocker_mount"
    }

    fn mount(&self, disk: &mut Disk, volume_id: usize, ctx: &mut CreatorContext) -> Result<MountResult> {
        let flat_mount = match disk.volume(volume_id).and_then(|v| v.flat_mount.clone()) {
            Some(p) => p,
            None => return Ok(MountResult::NotMine),
        };

        if !has_fve_signature(&flat_mount)? {
            return Ok(MountResult::NotMine);
        }

        let mountpoint = tempfile::Builder::new()
            .prefix("diskvm-dislocker-")
            .tempdir()
            .context("creating dislocker mountpoint")?
            .into_path();

        let mut candidates: Vec<Option<Vec<u8>>> =
            ctx.options.candidate_keys().into_iter().map(Some).collect();
        if self.try_clearkey {
            candidates.push(None);
        }

        for key in candidates {
            if try_dislocker(&flat_mount, &mountpoint, key.as_deref(), disk.readonly).is_ok() {
                let dislocker_file = mountpoint.join("dislocker-file");
                if validates_as_ntfs(&dislocker_file).unwrap_or(false) {
                    let mut child = Volume::new_child(disk.next_volume_id(), volume_id, dislocker_file);
                    child.annotations.fde_kind = Some(FdeKind::BitLocker);
                    child.annotations.fde_master_key = key;
                    child
                        .annotations
                        .extra
                        .insert("dislocker_mountpoint".into(), mountpoint.to_string_lossy().into_owned());
                    return Ok(MountResult::Volumes(vec![child]));
                }
                let _ = runcmd!("fusermount", "-u", &mountpoint);
            }
        }
        Ok(MountResult::NotMine)
    }

    fn unmount_volume(&self, disk: &mut Disk, volume_id: usize, _ctx: &mut CreatorContext) -> Result<bool> {
        let is_bitlocker_child = disk
            .volume(volume_id)
            .map(|v| v.annotations.fde_kind == Some(FdeKind::BitLocker))
            .unwrap_or(false);
        if !is_bitlocker_child {
            return Ok(false);
        }
        let mountpoint = disk
            .volume(volume_id)
            .and_then(|v| v.annotations.extra.get("dislocker_mountpoint").cloned());
        if let Some(mountpoint) = mountpoint {
            runcmd!("fusermount", "-u", &mountpoint).context("unmounting dislocker-fuse")?;
        }
        Ok(true)
    }
}

fn has_fve_signature(device: &std::path::Path) -> Result<bool> {
    let mut f = std::fs::File::open(device).with_context(|| format!("opening {}", device.display()))?;
    f.seek(SeekFrom::Start(FVE_SIGNATURE_OFFSET))?;
    let mut buf = [0u8; FVE_SIGNATURE.len()];
    if f.read_exact(&mut buf).is_err() {
        return Ok(false);
    }
    Ok(buf == FVE_SIGNATURE)
}

fn validates_as_ntfs(dislocker_file: &std::path::Path) -> Result<bool> {
    let mut f = std::fs::File::open(dislocker_file)
        .with_context(|| format!("opening {}", dislocker_file.display()))?;
    let mut buf = [0u8; 8];
    f.read_exact(&mut buf)?;
    Ok(buf == NTFS_SIGNATURE)
}

fn try_dislocker(
    device: &std::path::Path,
    mountpoint: &std::path::Path,
    key: Option<&[u8]>,
    readonly: bool,
) -> Result<()> {
    let mut cmd = std::process::Command::new("dislocker-fuse");
    cmd.arg("--volume").arg(device);
    if readonly {
        cmd.arg("--readonly");
    }
    let mut keyfile_holder = None;
    match key {
        Some(key) => {
            let mut f = tempfile::NamedTempFile::new().context("creating temporary FVEK file")?;
            f.write_all(key).context("writing FVEK")?;
            cmd.arg("--fvek").arg(f.path());
            keyfile_holder = Some(f);
        }
        None => {
            cmd.arg("--clearkey");
        }
    }
    cmd.arg("--").arg(mountpoint);
    crate::util::run(&mut cmd)?;
    drop(keyfile_holder);
    Ok(())
}

/// Adds a clear key to the volume's BitLocker header so the on-the-fly
/// decrypt plugin and the resulting VM can unlock it without the original
/// recovery key.
#[derive(Default)]
pub struct BitlockerAddClearkeyPlugin;

impl Plugin for BitlockerAddClearkeyPlugin {
    fn name(&self) -> &str {
        "bitlocker_add_clearkey"
    }

    fn modify_volume(&self, disk: &mut Disk, volume_id: usize, _ctx: &mut CreatorContext) -> Result<()> {
        let (kind, parent_device) = match disk.volume(volume_id) {
            Some(v) => (
                v.annotations.fde_kind,
                v.parent.and_then(|p| disk.volume(p)).and_then(|p| p.flat_mount.clone()),
            ),
            None => return Ok(()),
        };
        if kind != Some(FdeKind::BitLocker) {
            return Ok(());
        }
        let device = match parent_device {
            Some(d) => d,
            None => return Ok(()),
        };
        runcmd!("dislocker-pwreset", "--volume", &device, "--clear-key").context("adding BitLocker clear key")
    }
}

/// During `before_create_disk`, overlays the decrypted `dislocker-file`
/// plaintext view onto the virtual disk.
#[derive(Default)]
pub struct BitlockerOnTheFlyDecryptPlugin;

impl Plugin for BitlockerOnTheFlyDecryptPlugin {
    fn name(&self) -> &str {
        "bitlocker_otf_mount"
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
            .filter(|v| v.annotations.fde_kind == Some(FdeKind::BitLocker))
            .filter_map(|v| {
                let parent = v.parent?;
                let parent = disk.volume(parent)?;
                Some((v.flat_mount.clone()?, parent.offset, parent.length))
            })
            .collect();

        let mut any = false;
        for (plaintext_device, offset, length) in targets {
            any = true;
            let length = crate::blockdev::get_length_for_path(&plaintext_device).unwrap_or(length);
            let mut part = crate::extent::whole_file_part(&plaintext_device, length);
            part.target_offset = offset;
            disk_builder.add_part(part)?;
        }
        if any {
            disk.keep_mounted = true;
        }
        Ok(())
    }
}
