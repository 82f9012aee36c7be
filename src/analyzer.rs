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

//! Disk analysis: partition table parsing and the iterative mount pipeline
//! that unwraps partitions into loop devices, those into decrypted/LVM
//! volumes, and those into mounted filesystems.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::blockdev;
use crate::model::{CreatorContext, Disk, Volume};
use crate::plugin::{MountResult, PluginHost};

/// Builds a [`Disk`] over `flat_path` (a bind-mounted disk image or a
/// backend's virtual disk mount), parses its partition table, and runs the
/// mount pipeline over every partition until nothing further can be
/// unwrapped or mounted.
pub fn analyze_disk(flat_path: PathBuf, readonly: bool, host: &PluginHost, ctx: &mut CreatorContext) -> Result<Disk> {
    let mut disk = Disk::new(flat_path, readonly);
    let (scheme, sector_size, partitions) = blockdev::parse_partition_table(&disk.flat_path)
        .with_context(|| format!("parsing partition table of {}", disk.flat_path.display()))?;
    disk.scheme = scheme;
    disk.sector_size = sector_size;

    for partition in partitions {
        let offset = partition.start_offset(sector_size);
        let length = partition.length(sector_size);
        let loop_dev = blockdev::losetup_attach(&disk.flat_path, offset, length, readonly)
            .with_context(|| format!("attaching loop device for partition {}", partition.index))?;
        let id = disk.next_volume_id();
        disk.volumes.push(Volume::new_root(id, partition, loop_dev, offset, length));
    }
    blockdev::udev_settle().ok();

    host.broadcast_mounted_disk(&mut disk, ctx)?;
    run_mount_pipeline(&mut disk, host, ctx)?;
    Ok(disk)
}

fn run_mount_pipeline(disk: &mut Disk, host: &PluginHost, ctx: &mut CreatorContext) -> Result<()> {
    let mut i = 0;
    while i < disk.volumes.len() {
        host.broadcast_mounted_volume(disk, i, ctx)?;
        if !disk.readonly {
            host.broadcast_modify_volume(disk, i, ctx)?;
        }
        match host.dispatch_mount(disk, i, ctx)? {
            MountResult::NotMine => {}
            MountResult::Filesystem(path) => {
                if let Some(v) = disk.volume_mut(i) {
                    v.filesystem_mount = Some(path);
                }
                host.broadcast_mounted_filesystem(disk, i, ctx)?;
                if !disk.readonly {
                    host.broadcast_modify_filesystem(disk, i, ctx)?;
                }
            }
            MountResult::Volumes(children) => {
                disk.volumes.extend(children);
            }
        }
        i += 1;
    }
    Ok(())
}

/// Tears down every volume's filesystem and flat mounts in decreasing
/// depth order (children before parents), so a loop device or mapper is
/// never detached while something is still mounted on top of it.
///
/// Must not be called for a disk with `keep_mounted` set: its mounts are
/// meant to outlive analysis, backing the virtual disk's on-the-fly
/// decryption overlay for as long as the resulting VM exists.
pub fn teardown_disk(disk: &mut Disk, host: &PluginHost, ctx: &mut CreatorContext) -> Result<()> {
    debug_assert!(!disk.keep_mounted, "teardown_disk called on a disk meant to stay mounted");
    let mut ids: Vec<usize> = disk.volumes.iter().map(|v| v.id).collect();
    ids.sort_by_key(|&id| std::cmp::Reverse(disk.depth(id)));
    for id in ids {
        if disk.volume(id).and_then(|v| v.filesystem_mount.as_ref()).is_some() {
            if !host.dispatch_unmount_filesystem(disk, id, ctx) {
                log::warn!("no plugin unmounted filesystem of volume {}", id);
            } else if let Some(v) = disk.volume_mut(id) {
                v.filesystem_mount = None;
            }
        }
        if !host.dispatch_unmount_volume(disk, id, ctx) {
            log::debug!("no plugin tore down volume {} (root partition, nothing to do)", id);
        }
    }
    Ok(())
}

/// Best-effort recursive cleanup, used when an earlier step already failed
/// and the pipeline is unwinding: logs failures instead of propagating them.
pub fn teardown_disk_best_effort(disk: &mut Disk, host: &PluginHost, ctx: &mut CreatorContext) {
    if disk.keep_mounted {
        return;
    }
    if let Err(e) = teardown_disk(disk, host, ctx) {
        log::warn!("error tearing down disk {}: {:#}", disk.flat_path.display(), e);
    }
}

/// Detaches the loop devices for a disk's root partitions. Root partitions
/// have no owning plugin, so [`teardown_disk`]'s `dispatch_unmount_volume`
/// intentionally leaves them; the caller (after every child has been torn
/// down) detaches them directly.
pub fn detach_root_loop_devices(disk: &Disk) -> Result<()> {
    for volume in &disk.volumes {
        if volume.parent.is_none() {
            if let Some(dev) = &volume.flat_mount {
                if dev.to_string_lossy().contains("/dev/loop") {
                    blockdev::losetup_detach(dev)
                        .with_context(|| format!("detaching loop device {}", dev.display()))?;
                }
            }
        }
    }
    Ok(())
}

pub fn bind_mount_source(path: &Path, readonly: bool) -> Result<blockdev::Mount> {
    blockdev::Mount::bind_mount(path, readonly)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Firmware, PwBypass};
    use crate::model::CreatorOptions;
    use std::io::Write;

    fn fake_ctx() -> CreatorContext {
        CreatorContext::new(CreatorOptions {
            out_dir: PathBuf::from("/tmp"),
            disks: vec![],
            name: "test".into(),
            start_vm: false,
            virtualization_software: "vmware".into(),
            vm_memory_bytes: 0,
            vm_cpus: 1,
            guest_os: None,
            firmware: Firmware::Auto,
            pw_bypass: PwBypass::None,
            fde_bypass: vec![],
            master_keys: vec![],
            xts_combine_keys: true,
        })
    }

    #[test]
    fn empty_image_yields_no_volumes_without_root() {
        // Parsing a zeroed image never attaches a loop device, so this
        // exercises the partition-table branch without requiring root
        // privileges for losetup.
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 4096]).unwrap();
        let (scheme, _sector_size, entries) = blockdev::parse_partition_table(f.path()).unwrap();
        assert!(matches!(scheme, crate::model::PartitionScheme::Unknown));
        assert!(entries.is_empty());
    }

    #[test]
    fn mount_pipeline_stops_when_nothing_claims_a_volume() {
        use crate::model::PartitionEntry;
        let mut disk = Disk::new(PathBuf::from("/tmp/disk"), true);
        let partition = PartitionEntry {
            index: 0,
            start_lba: 0,
            sector_count: 8,
            type_tag: "0x83".into(),
        };
        disk.volumes.push(Volume::new_root(0, partition, PathBuf::from("/dev/null"), 0, 4096));
        let host = PluginHost::new();
        let mut ctx = fake_ctx();
        run_mount_pipeline(&mut disk, &host, &mut ctx).unwrap();
        assert_eq!(disk.volumes.len(), 1);
        assert!(disk.volumes[0].filesystem_mount.is_none());
    }
}
