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

//! VeraCrypt system encryption. Unlike LUKS or BitLocker, a VeraCrypt
//! system-encrypted partition carries no on-disk signature of its own; it
//! is detected indirectly from an `EFI/VeraCrypt` bootloader directory on
//! the disk's ESP. Candidate master keys are tried directly against the
//! volume body using `cryptsetup`'s headerless "plain" mode with
//! `aes-xts-plain64`, since by this point in the pipeline the key is
//! already known (no password-derived header decryption is needed to
//! *read* the volume).

use anyhow::{Context, Result};
use openssl::pkcs5::pbkdf2_hmac;
use openssl::hash::MessageDigest;
use rand::RngCore;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::binpack::{VeraCryptHeader, FLAG_SYSTEM_ENCRYPTION, HEADER_SIZE, MASTER_KEYS_SIZE, SALT_SIZE, SECTOR_SIZE};
use crate::model::{CreatorContext, Disk, FdeKind, Volume};
use crate::plugin::luks::RECOVERY_PASSWORD;
use crate::plugin::{MountResult, Plugin};
use crate::runcmd;

/// Header LBA for VeraCrypt system encryption (the backup header area used
/// by the bootloader before the OS's own partition table is reachable).
const HEADER_LBA: u64 = 62;
const PBKDF2_ITERATIONS: usize = 500_000;
const NTFS_SIGNATURE: &[u8] = b"NTFS    ";

/// Detects VeraCrypt system encryption from the presence of its EFI
/// bootloader directory on a mounted ESP, flagging the owning disk.
#[derive(Default)]
pub struct VeracryptDetectPlugin;

impl Plugin for VeracryptDetectPlugin {
    fn name(&self) -> &str {
        "veracrypt_detect"
    }

    fn mounted_filesystem(&self, disk: &mut Disk, volume_id: usize, _ctx: &mut CreatorContext) -> Result<()> {
        let fs_mount = match disk.volume(volume_id).and_then(|v| v.filesystem_mount.clone()) {
            Some(p) => p,
            None => return Ok(()),
        };
        if fs_mount.join("EFI").join("VeraCrypt").is_dir() {
            disk.annotations
                .insert("veracrypt_system_encrypted".into(), "true".into());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct VeracryptMountPlugin;

impl Plugin for VeracryptMountPlugin {
    fn name(&self) -> &str {
        "veracrypt_mount"
    }

    fn mount(&self, disk: &mut Disk, volume_id: usize, ctx: &mut CreatorContext) -> Result<MountResult> {
        if disk.annotations.get("veracrypt_system_encrypted").map(String::as_str) != Some("true") {
            return Ok(MountResult::NotMine);
        }
        // Only consider root partitions: a VeraCrypt system volume is never
        // nested inside LUKS/LVM/BitLocker.
        let volume = match disk.volume(volume_id) {
            Some(v) if v.parent.is_none() => v,
            _ => return Ok(MountResult::NotMine),
        };
        let flat_mount = match &volume.flat_mount {
            Some(p) => p.clone(),
            None => return Ok(MountResult::NotMine),
        };
        // Already claimed by a more specific signature-based plugin.
        if crate::blockdev::blkid_fstype(&flat_mount)?.is_some() {
            return Ok(MountResult::NotMine);
        }

        let skip_sectors = volume.offset / disk.sector_size;
        let mapper_name = format!("diskvm-veracrypt-{}", volume_id);
        for key in ctx.options.candidate_keys() {
            if let Ok(mapper_path) = try_open_plain(&flat_mount, &mapper_name, &key, skip_sectors) {
                if validates_as_ntfs(&mapper_path).unwrap_or(false) {
                    let mut child = Volume::new_child(disk.next_volume_id(), volume_id, mapper_path);
                    child.annotations.fde_kind = Some(FdeKind::VeraCrypt);
                    child.annotations.fde_master_key = Some(key);
                    return Ok(MountResult::Volumes(vec![child]));
                }
                let _ = runcmd!("cryptsetup", "close", &mapper_name);
            }
        }
        Ok(MountResult::NotMine)
    }

    fn unmount_volume(&self, disk: &mut Disk, volume_id: usize, _ctx: &mut CreatorContext) -> Result<bool> {
        let is_veracrypt_child = disk
            .volume(volume_id)
            .map(|v| v.annotations.fde_kind == Some(FdeKind::VeraCrypt))
            .unwrap_or(false);
        if !is_veracrypt_child {
            return Ok(false);
        }
        let mapper_name = format!("diskvm-veracrypt-{}", volume_id);
        runcmd!("cryptsetup", "close", &mapper_name).context("closing VeraCrypt mapping")?;
        Ok(true)
    }
}

fn try_open_plain(device: &Path, mapper_name: &str, key: &[u8], skip_sectors: u64) -> Result<PathBuf> {
    let mut keyfile = tempfile::NamedTempFile::new().context("creating temporary key file")?;
    keyfile.write_all(key).context("writing candidate key")?;
    runcmd!(
        "cryptsetup",
        "open",
        "--type=plain",
        "--cipher",
        "aes-xts-plain64",
        "--key-size",
        (key.len() * 8).to_string(),
        "--skip",
        skip_sectors.to_string(),
        "--key-file",
        keyfile.path(),
        device,
        mapper_name
    )?;
    Ok(PathBuf::from(format!("/dev/mapper/{}", mapper_name)))
}

fn validates_as_ntfs(mapper_path: &Path) -> Result<bool> {
    let mut f = std::fs::File::open(mapper_path).with_context(|| format!("opening {}", mapper_path.display()))?;
    let mut buf = [0u8; 8];
    f.read_exact(&mut buf)?;
    Ok(buf == NTFS_SIGNATURE)
}

/// Rewrites the VeraCrypt system header so the volume is unlockable with
/// [`RECOVERY_PASSWORD`], without disturbing the underlying data: the
/// master key stored in the new header is the same key that was used to
/// unlock the volume, only the password-derived wrapping changes.
#[derive(Default)]
pub struct VeracryptOverwritePasswordPlugin;

impl Plugin for VeracryptOverwritePasswordPlugin {
    fn name(&self) -> &str {
        "veracrypt_overwrite_pw"
    }

    fn modify_volume(&self, disk: &mut Disk, volume_id: usize, _ctx: &mut CreatorContext) -> Result<()> {
        let (kind, key) = match disk.volume(volume_id) {
            Some(v) => (v.annotations.fde_kind, v.annotations.fde_master_key.clone()),
            None => return Ok(()),
        };
        if kind != Some(FdeKind::VeraCrypt) {
            return Ok(());
        }
        let key = match key {
            Some(k) => k,
            None => return Ok(()),
        };
        let (parent_offset, parent_length) = match disk.volume(volume_id).and_then(|v| v.parent).and_then(|p| disk.volume(p)) {
            Some(p) => (p.offset, p.length),
            None => return Ok(()),
        };

        let mut master_keys = [0u8; MASTER_KEYS_SIZE];
        let n = key.len().min(MASTER_KEYS_SIZE);
        master_keys[..n].copy_from_slice(&key[..n]);

        let header = VeraCryptHeader {
            size_volume: parent_length,
            offset: parent_offset,
            size_encrypted: parent_length,
            flags: FLAG_SYSTEM_ENCRYPTION,
            master_keys,
            ..Default::default()
        };

        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut derived_key = [0u8; 64];
        pbkdf2_hmac(
            RECOVERY_PASSWORD.as_bytes(),
            &salt,
            PBKDF2_ITERATIONS,
            MessageDigest::sha512(),
            &mut derived_key,
        )
        .context("deriving VeraCrypt header key")?;

        let plaintext_header = header.pack().context("packing VeraCrypt header")?;
        let encrypted_header = xts_encrypt(&derived_key, &plaintext_header)?;

        let mut record = Vec::with_capacity(SALT_SIZE + HEADER_SIZE);
        record.extend_from_slice(&salt);
        record.extend_from_slice(&encrypted_header);

        // The backup header lives at a disk-absolute sector, not an offset
        // within the (already partition-relative) loop device, so this
        // writes through the whole-disk flat file.
        let flat_path = disk.flat_path.clone();
        let mut f = OpenOptions::new()
            .write(true)
            .open(&flat_path)
            .with_context(|| format!("opening {} for writing", flat_path.display()))?;
        f.seek(SeekFrom::Start(HEADER_LBA * SECTOR_SIZE as u64))?;
        f.write_all(&record)
            .context("writing VeraCrypt header")?;
        Ok(())
    }
}

fn xts_encrypt(derived_key: &[u8; 64], plaintext: &[u8]) -> Result<Vec<u8>> {
    use openssl::symm::{Cipher, Crypter, Mode};
    let zero_tweak = [0u8; 16];
    let mut crypter = Crypter::new(Cipher::aes_256_xts(), Mode::Encrypt, derived_key, Some(&zero_tweak))
        .context("initializing AES-256-XTS")?;
    crypter.pad(false);
    let mut out = vec![0u8; plaintext.len() + Cipher::aes_256_xts().block_size()];
    let mut count = crypter.update(plaintext, &mut out).context("encrypting VeraCrypt header")?;
    count += crypter.finalize(&mut out[count..]).context("finalizing VeraCrypt header encryption")?;
    out.truncate(count);
    Ok(out)
}

/// During `before_create_disk`, overlays the decrypted `cryptsetup plain`
/// mapper device onto the virtual disk.
#[derive(Default)]
pub struct VeracryptOnTheFlyDecryptPlugin;

impl Plugin for VeracryptOnTheFlyDecryptPlugin {
    fn name(&self) -> &str {
        "veracrypt_otf_mount"
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
            .filter(|v| v.annotations.fde_kind == Some(FdeKind::VeraCrypt))
            .filter_map(|v| {
                let parent = v.parent?;
                let parent = disk.volume(parent)?;
                Some((v.flat_mount.clone()?, parent.offset, parent.length))
            })
            .collect();

        let mut any = false;
        for (plaintext_device, target_offset, length) in targets {
            any = true;
            let length = crate::blockdev::get_length_for_path(&plaintext_device).unwrap_or(length);
            let mut part = crate::extent::whole_file_part(&plaintext_device, length);
            part.target_offset = target_offset;
            disk_builder.add_part(part)?;
        }
        if any {
            disk.keep_mounted = true;
        }
        Ok(())
    }
}

/// Restores the system's original bootloader over VeraCrypt's own boot
/// loader on the ESP, so the VM boots straight into Windows instead of
/// into a VeraCrypt pre-boot screen that can no longer authenticate.
#[derive(Default)]
pub struct VeracryptBootloaderRestorePlugin;

impl Plugin for VeracryptBootloaderRestorePlugin {
    fn name(&self) -> &str {
        "veracrypt_bootloader_restore"
    }

    fn modify_filesystem(&self, disk: &mut Disk, volume_id: usize, _ctx: &mut CreatorContext) -> Result<()> {
        if disk.annotations.get("veracrypt_system_encrypted").map(String::as_str) != Some("true") {
            return Ok(());
        }
        let volume = match disk.volume(volume_id) {
            Some(v) => v,
            None => return Ok(()),
        };
        let is_esp = volume.partition.as_ref().map(|p| p.is_esp()).unwrap_or(false);
        let fs_mount = match &volume.filesystem_mount {
            Some(p) if is_esp => p.clone(),
            _ => return Ok(()),
        };

        let boot_dir = fs_mount.join("EFI").join("Boot");
        restore_one(&boot_dir, "original_bootx64.vc_backup", "bootx64.efi")?;
        restore_one(&boot_dir, "original_bootia32.vc_backup", "bootia32.efi")?;
        Ok(())
    }
}

fn restore_one(boot_dir: &Path, backup_name: &str, target_name: &str) -> Result<()> {
    let backup = boot_dir.join(backup_name);
    if !backup.is_file() {
        return Ok(());
    }
    let target = boot_dir.join(target_name);
    std::fs::rename(&backup, &target)
        .with_context(|| format!("restoring original bootloader to {}", target.display()))?;
    Ok(())
}
