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

//! Unwraps an LVM physical volume into one child [`Volume`] per logical
//! volume in its volume group.

use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::model::{CreatorContext, Disk, Volume};
use crate::plugin::{MountResult, Plugin};
use crate::{runcmd, runcmd_output};

#[derive(Default)]
pub struct LvmPlugin;

impl Plugin for LvmPlugin {
    fn name(&self) -> &str {
        "lvm"
    }

    fn mount(&self, disk: &mut Disk, volume_id: usize, _ctx: &mut CreatorContext) -> Result<MountResult> {
        let flat_mount = match disk.volume(volume_id).and_then(|v| v.flat_mount.clone()) {
            Some(p) => p,
            None => return Ok(MountResult::NotMine),
        };

        let vg_name = match physical_volume_group(&flat_mount)? {
            Some(vg) => vg,
            None => return Ok(MountResult::NotMine),
        };

        runcmd!("vgchange", "--activate", "y", &vg_name).context("activating volume group")?;

        let logical_volumes = logical_volumes_in(&vg_name)?;
        let mut children = Vec::with_capacity(logical_volumes.len());
        for (i, lv_path) in logical_volumes.into_iter().enumerate() {
            let mut child = Volume::new_child(disk.next_volume_id() + i, volume_id, lv_path);
            child.annotations.lvm_volume_group = Some(vg_name.clone());
            children.push(child);
        }
        Ok(MountResult::Volumes(children))
    }

    fn unmount_volume(&self, disk: &mut Disk, volume_id: usize, _ctx: &mut CreatorContext) -> Result<bool> {
        let vg_name = match disk
            .volume(volume_id)
            .and_then(|v| v.annotations.lvm_volume_group.clone())
        {
            Some(vg) => vg,
            None => return Ok(false),
        };
        runcmd!("vgchange", "--activate", "n", &vg_name).context("deactivating volume group")?;
        Ok(true)
    }
}

fn physical_volume_group(device: &std::path::Path) -> Result<Option<String>> {
    let out = match runcmd_output!("pvdisplay", "--colon", device) {
        Ok(o) => o,
        Err(_) => return Ok(None),
    };
    for line in out.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        // pvdisplay --colon: pv_name:vg_name:...
        if fields.len() >= 2 && !fields[1].is_empty() {
            return Ok(Some(fields[1].to_string()));
        }
    }
    Ok(None)
}

fn logical_volumes_in(vg_name: &str) -> Result<Vec<PathBuf>> {
    let out = runcmd_output!("lvdisplay", "--colon", vg_name).context("listing logical volumes")?;
    let mut volumes = Vec::new();
    for line in out.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        // lvdisplay --colon: lv_name:vg_name:...
        if let Some(path) = fields.first() {
            if !path.is_empty() {
                volumes.push(PathBuf::from(path.trim()));
            }
        }
    }
    Ok(volumes)
}
