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

//! Low-level block device helpers: bind mounts, loop device attach/detach,
//! filesystem mount/unmount, sector-size ioctls, and MBR/GPT partition
//! table parsing.

use anyhow::{anyhow, bail, Context, Result};
use gptman::GPT;
use mbrman::MBR;
use nix::mount::{self, MsFlags};
use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::num::{NonZeroU32, NonZeroU64};
use std::os::raw::c_int;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use crate::model::PartitionEntry;
use crate::util::retry;
use crate::{runcmd, runcmd_output};

/// A bind mount or filesystem mount, torn down (with retries) on drop.
#[derive(Debug)]
pub struct Mount {
    device: String,
    mountpoint: PathBuf,
    owned: bool,
}

impl Mount {
    /// Mounts `device` with filesystem type `fstype` at a freshly created
    /// temporary directory.
    pub fn try_mount(device: &str, fstype: &str, flags: MsFlags) -> Result<Mount> {
        let mountpoint = tempfile::Builder::new()
            .prefix("diskvm-creator-")
            .tempdir()
            .context("creating temporary directory")?
            .into_path();

        mount::mount::<str, Path, str, str>(Some(device), &mountpoint, Some(fstype), flags, None)
            .with_context(|| format!("mounting device {} on {}", device, mountpoint.display()))?;

        Ok(Mount {
            device: device.to_string(),
            mountpoint,
            owned: true,
        })
    }

    /// Bind-mounts `source` onto a freshly created temporary directory,
    /// read-only if requested. Used to expose the raw disk image under a
    /// path the rest of the pipeline can treat uniformly, without ever
    /// opening the original file for writing.
    pub fn bind_mount(source: &Path, readonly: bool) -> Result<Mount> {
        let mountpoint = tempfile::Builder::new()
            .prefix("diskvm-creator-disk-")
            .tempdir()
            .context("creating temporary directory")?
            .into_path();

        mount::mount::<Path, Path, str, str>(
            Some(source),
            &mountpoint,
            None,
            MsFlags::MS_BIND,
            None,
        )
        .with_context(|| format!("bind-mounting {} on {}", source.display(), mountpoint.display()))?;

        if readonly {
            mount::mount::<str, Path, str, str>(
                None,
                &mountpoint,
                None,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None,
            )
            .with_context(|| format!("remounting {} read-only", mountpoint.display()))?;
        }

        Ok(Mount {
            device: source.to_string_lossy().into_owned(),
            mountpoint,
            owned: true,
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    fn unmount(&mut self) -> Result<()> {
        if !self.owned {
            return Ok(());
        }
        retry(10, Duration::from_millis(500), || {
            mount::umount(&self.mountpoint).map_err(|e| anyhow!(e))
        })
        .with_context(|| format!("unmounting {}", self.mountpoint.display()))?;
        self.owned = false;
        Ok(())
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        for retries in (0..20).rev() {
            match mount::umount(&self.mountpoint) {
                Ok(_) => break,
                Err(err) => {
                    if retries == 0 {
                        log::warn!(
                            "failed to unmount {}, giving up: {}",
                            self.mountpoint.display(),
                            err
                        );
                    } else {
                        sleep(Duration::from_millis(100));
                    }
                }
            }
        }
    }
}

/// Explicit unmount, surfacing the error instead of only logging it as
/// `Drop` does.
pub fn unmount(mount: &mut Mount) -> Result<()> {
    mount.unmount()
}

/// Attaches a loop device over `[offset, offset+length)` of `backing`.
pub fn losetup_attach(backing: &Path, offset: u64, length: u64, readonly: bool) -> Result<PathBuf> {
    let mut args: Vec<String> = vec!["--find".into(), "--show".into()];
    if readonly {
        args.push("--read-only".into());
    }
    args.push("--offset".into());
    args.push(offset.to_string());
    args.push("--sizelimit".into());
    args.push(length.to_string());
    args.push(backing.to_string_lossy().into_owned());

    let mut cmd = std::process::Command::new("losetup");
    cmd.args(&args);
    let out = crate::util::cmd_output(&mut cmd)?;
    Ok(PathBuf::from(out.trim()))
}

pub fn losetup_detach(device: &Path) -> Result<()> {
    runcmd!("losetup", "--detach", device)
}

/// Gets the logical sector size of an open block device.
pub fn get_sector_size(file: &File) -> Result<NonZeroU32> {
    let fd = file.as_raw_fd();
    let mut size: c_int = 0;
    match unsafe { ioctl::blksszget(fd, &mut size) } {
        Ok(_) => {
            let size_u32: u32 = size
                .try_into()
                .with_context(|| format!("sector size {} doesn't fit in u32", size))?;
            NonZeroU32::new(size_u32).ok_or_else(|| anyhow!("found sector size of zero"))
        }
        Err(e) => Err(anyhow!(e).context("getting sector size")),
    }
}

pub fn get_sector_size_for_path(device: &Path) -> Result<NonZeroU32> {
    let dev = OpenOptions::new()
        .read(true)
        .open(device)
        .with_context(|| format!("opening {}", device.display()))?;
    if dev
        .metadata()
        .with_context(|| format!("getting metadata for {}", device.display()))?
        .file_type()
        .is_block_device()
    {
        get_sector_size(&dev)
    } else {
        Ok(NonZeroU32::new(512).expect("512 is nonzero"))
    }
}

/// Gets the byte length of an open block device.
pub fn get_block_device_size(file: &File) -> Result<NonZeroU64> {
    let fd = file.as_raw_fd();
    let mut size: libc::size_t = 0;
    match unsafe { ioctl::blkgetsize64(fd, &mut size) } {
        Ok(_) => NonZeroU64::new(size as u64).ok_or_else(|| anyhow!("found block size of zero")),
        Err(e) => Err(anyhow!(e).context("getting block size")),
    }
}

/// Gets the byte length of a path that may be a regular file or a block
/// device.
pub fn get_length_for_path(path: &Path) -> Result<u64> {
    let f = OpenOptions::new()
        .read(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let meta = f
        .metadata()
        .with_context(|| format!("getting metadata for {}", path.display()))?;
    if meta.file_type().is_block_device() {
        Ok(get_block_device_size(&f)?.get())
    } else {
        Ok(meta.len())
    }
}

/// Rereads the partition table of an open block device.
pub fn reread_partition_table(file: &File) -> Result<()> {
    let fd = file.as_raw_fd();
    for retries in (0..20).rev() {
        match unsafe { ioctl::blkrrpart(fd) } {
            Ok(_) => return Ok(()),
            Err(err) => {
                if retries == 0 {
                    return Err(err).context("couldn't reread partition table");
                }
                sleep(Duration::from_millis(100));
            }
        }
    }
    Ok(())
}

/// Formats a raw 16-byte GPT partition type GUID (mixed-endian on-disk
/// layout) as the conventional hyphenated, upper-case string.
fn format_gpt_guid(guid: &[u8; 16]) -> String {
    format!(
        "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        guid[3], guid[2], guid[1], guid[0],
        guid[5], guid[4],
        guid[7], guid[6],
        guid[8], guid[9],
        guid[10], guid[11], guid[12], guid[13], guid[14], guid[15],
    )
}

/// Parses the partition table at the start of `path` (a flat disk view,
/// not necessarily a real block device -- works equally on a bind-mounted
/// regular file). Returns an empty list and [`crate::model::PartitionScheme::Unknown`]
/// if neither a GPT nor an MBR signature is present.
pub fn parse_partition_table(
    path: &Path,
) -> Result<(crate::model::PartitionScheme, u64, Vec<PartitionEntry>)> {
    use crate::model::PartitionScheme;

    let mut f = File::open(path).with_context(|| format!("opening {}", path.display()))?;

    if let Ok(gpt) = GPT::find_from(&mut f) {
        let sector_size = gpt.sector_size;
        let mut entries = Vec::new();
        for (index, partition) in gpt.iter() {
            if partition.is_used() {
                entries.push(PartitionEntry {
                    index: index as u32,
                    start_lba: partition.starting_lba,
                    sector_count: partition.ending_lba - partition.starting_lba + 1,
                    type_tag: format_gpt_guid(&partition.partition_type_guid),
                });
            }
        }
        return Ok((PartitionScheme::Gpt, sector_size, entries));
    }

    f.seek(SeekFrom::Start(0)).context("seeking to start")?;
    if let Ok(mbr) = MBR::read_from(&mut f, 512) {
        let sector_size = 512u64;
        let mut entries = Vec::new();
        for (index, partition) in mbr.iter() {
            if partition.sectors == 0 {
                continue;
            }
            entries.push(PartitionEntry {
                index: index as u32,
                start_lba: partition.starting_lba as u64,
                sector_count: partition.sectors as u64,
                type_tag: format!("0x{:02X}", partition.sys),
            });
        }
        return Ok((PartitionScheme::Mbr, sector_size, entries));
    }

    Ok((PartitionScheme::Unknown, 512, Vec::new()))
}

/// Runs `udevadm settle`, giving the kernel a moment to publish partition
/// device nodes after a `losetup`/reread-partition-table call.
pub fn udev_settle() -> Result<()> {
    if !Path::new("/run/udev/control").exists() {
        bail!("udevd socket missing; are we running in a container without /run/udev mounted?");
    }
    sleep(Duration::from_millis(200));
    runcmd!("udevadm", "settle")?;
    Ok(())
}

/// Looks up the filesystem type `blkid` would report for `device`, if any.
pub fn blkid_fstype(device: &Path) -> Result<Option<String>> {
    let mut cmd = std::process::Command::new("blkid");
    cmd.arg("-o").arg("value").arg("-s").arg("TYPE").arg(device);
    match crate::util::cmd_output(&mut cmd) {
        Ok(out) => {
            let t = out.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        // blkid exits 2 when it finds nothing to report
        Err(_) => Ok(None),
    }
}

#[allow(clippy::missing_safety_doc)]
mod ioctl {
    use super::c_int;
    use nix::{ioctl_none, ioctl_read, ioctl_read_bad, request_code_none};
    ioctl_none!(blkrrpart, 0x12, 95);
    ioctl_read_bad!(blksszget, request_code_none!(0x12, 104), c_int);
    ioctl_read!(blkgetsize64, 0x12, 114, libc::size_t);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn unknown_scheme_on_empty_file() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 4096]).unwrap();
        let (scheme, _sector_size, entries) = parse_partition_table(f.path()).unwrap();
        assert!(matches!(scheme, crate::model::PartitionScheme::Unknown));
        assert!(entries.is_empty());
    }
}
