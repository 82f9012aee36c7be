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

//! The plugin host: a trait with eleven optional hooks, dispatched either
//! as a broadcast (every plugin runs) or as a race for the first
//! non-null/truthy result.

pub mod bitlocker;
pub mod detect;
pub mod filesystem;
pub mod luks;
pub mod lvm;
pub mod passwd;
pub mod veracrypt;

use anyhow::Result;

use crate::model::{CreatorContext, Disk, Volume};
use crate::vm::VirtualDiskBuilder;

/// The result of attempting to mount a volume: either nothing could mount
/// it, a filesystem was mounted at a path, or it was unwrapped into one or
/// more child volumes to descend into.
pub enum MountResult {
    NotMine,
    Filesystem(std::path::PathBuf),
    Volumes(Vec<Volume>),
}

/// Optional hooks a plugin may implement. All default to a no-op so a
/// plugin only overrides what it actually does.
pub trait Plugin {
    fn name(&self) -> &str;

    fn mounted_disk(&self, _disk: &mut Disk, _ctx: &mut CreatorContext) -> Result<()> {
        Ok(())
    }

    fn mounted_volume(&self, _disk: &mut Disk, _volume_id: usize, _ctx: &mut CreatorContext) -> Result<()> {
        Ok(())
    }

    fn mount(&self, _disk: &mut Disk, _volume_id: usize, _ctx: &mut CreatorContext) -> Result<MountResult> {
        Ok(MountResult::NotMine)
    }

    fn mounted_filesystem(&self, _disk: &mut Disk, _volume_id: usize, _ctx: &mut CreatorContext) -> Result<()> {
        Ok(())
    }

    fn before_create_disk(
        &self,
        _disk: &mut Disk,
        _disk_builder: &mut dyn VirtualDiskBuilder,
        _ctx: &mut CreatorContext,
    ) -> Result<()> {
        Ok(())
    }

    fn before_create_vm(&self, _ctx: &mut CreatorContext) -> Result<()> {
        Ok(())
    }

    fn modify_disk(&self, _disk: &mut Disk, _ctx: &mut CreatorContext) -> Result<()> {
        Ok(())
    }

    fn modify_volume(&self, _disk: &mut Disk, _volume_id: usize, _ctx: &mut CreatorContext) -> Result<()> {
        Ok(())
    }

    fn modify_filesystem(&self, _disk: &mut Disk, _volume_id: usize, _ctx: &mut CreatorContext) -> Result<()> {
        Ok(())
    }

    /// Returns `true` if this plugin unmounted the volume's filesystem.
    fn unmount_filesystem(&self, _disk: &mut Disk, _volume_id: usize, _ctx: &mut CreatorContext) -> Result<bool> {
        Ok(false)
    }

    /// Returns `true` if this plugin tore down the volume's flat mount.
    fn unmount_volume(&self, _disk: &mut Disk, _volume_id: usize, _ctx: &mut CreatorContext) -> Result<bool> {
        Ok(false)
    }
}

/// Ordered collection of plugins: user-requested plugins first, then the
/// always-on fallbacks (generic filesystem mount, LVM).
#[derive(Default)]
pub struct PluginHost {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginHost {
    pub fn new() -> Self {
        PluginHost::default()
    }

    pub fn push(&mut self, plugin: Box<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn broadcast_mounted_disk(&self, disk: &mut Disk, ctx: &mut CreatorContext) -> Result<()> {
        for p in &self.plugins {
            p.mounted_disk(disk, ctx)?;
        }
        Ok(())
    }

    pub fn broadcast_mounted_volume(
        &self,
        disk: &mut Disk,
        volume_id: usize,
        ctx: &mut CreatorContext,
    ) -> Result<()> {
        for p in &self.plugins {
            p.mounted_volume(disk, volume_id, ctx)?;
        }
        Ok(())
    }

    pub fn broadcast_mounted_filesystem(
        &self,
        disk: &mut Disk,
        volume_id: usize,
        ctx: &mut CreatorContext,
    ) -> Result<()> {
        for p in &self.plugins {
            p.mounted_filesystem(disk, volume_id, ctx)?;
        }
        Ok(())
    }

    pub fn broadcast_before_create_disk(
        &self,
        disk: &mut Disk,
        disk_builder: &mut dyn VirtualDiskBuilder,
        ctx: &mut CreatorContext,
    ) -> Result<()> {
        for p in &self.plugins {
            p.before_create_disk(disk, disk_builder, ctx)?;
        }
        Ok(())
    }

    pub fn broadcast_before_create_vm(&self, ctx: &mut CreatorContext) -> Result<()> {
        for p in &self.plugins {
            p.before_create_vm(ctx)?;
        }
        Ok(())
    }

    pub fn broadcast_modify_disk(&self, disk: &mut Disk, ctx: &mut CreatorContext) -> Result<()> {
        for p in &self.plugins {
            if let Err(e) = p.modify_disk(disk, ctx) {
                log::warn!("plugin {} failed to modify disk: {:#}", p.name(), e);
            }
        }
        Ok(())
    }

    pub fn broadcast_modify_volume(
        &self,
        disk: &mut Disk,
        volume_id: usize,
        ctx: &mut CreatorContext,
    ) -> Result<()> {
        for p in &self.plugins {
            if let Err(e) = p.modify_volume(disk, volume_id, ctx) {
                log::warn!("plugin {} failed to modify volume: {:#}", p.name(), e);
            }
        }
        Ok(())
    }

    pub fn broadcast_modify_filesystem(
        &self,
        disk: &mut Disk,
        volume_id: usize,
        ctx: &mut CreatorContext,
    ) -> Result<()> {
        for p in &self.plugins {
            if let Err(e) = p.modify_filesystem(disk, volume_id, ctx) {
                log::warn!("plugin {} failed to modify filesystem: {:#}", p.name(), e);
            }
        }
        Ok(())
    }

    /// First-non-null dispatch: stop at the first plugin that claims the
    /// volume.
    pub fn dispatch_mount(
        &self,
        disk: &mut Disk,
        volume_id: usize,
        ctx: &mut CreatorContext,
    ) -> Result<MountResult> {
        for p in &self.plugins {
            match p.mount(disk, volume_id, ctx)? {
                MountResult::NotMine => continue,
                other => {
                    log::info!("volume {} mounted by plugin {}", volume_id, p.name());
                    return Ok(other);
                }
            }
        }
        Ok(MountResult::NotMine)
    }

    /// First-truthy dispatch for filesystem teardown.
    pub fn dispatch_unmount_filesystem(
        &self,
        disk: &mut Disk,
        volume_id: usize,
        ctx: &mut CreatorContext,
    ) -> bool {
        for p in &self.plugins {
            match p.unmount_filesystem(disk, volume_id, ctx) {
                Ok(true) => return true,
                Ok(false) => continue,
                Err(e) => {
                    log::warn!(
                        "plugin {} failed to unmount filesystem of volume {}: {:#}",
                        p.name(),
                        volume_id,
                        e
                    );
                }
            }
        }
        false
    }

    /// First-truthy dispatch for volume teardown.
    pub fn dispatch_unmount_volume(&self, disk: &mut Disk, volume_id: usize, ctx: &mut CreatorContext) -> bool {
        for p in &self.plugins {
            match p.unmount_volume(disk, volume_id, ctx) {
                Ok(true) => return true,
                Ok(false) => continue,
                Err(e) => {
                    log::warn!(
                        "plugin {} failed to unmount volume {}: {:#}",
                        p.name(),
                        volume_id,
                        e
                    );
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::path::PathBuf;

    struct Recorder {
        name: &'static str,
        claims: bool,
        log: std::rc::Rc<RefCell<Vec<String>>>,
    }

    impl Plugin for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn mount(&self, _disk: &mut Disk, _volume_id: usize, _ctx: &mut CreatorContext) -> Result<MountResult> {
            self.log.borrow_mut().push(self.name.to_string());
            if self.claims {
                Ok(MountResult::Filesystem(PathBuf::from("/mnt/x")))
            } else {
                Ok(MountResult::NotMine)
            }
        }
    }

    fn fake_ctx() -> CreatorContext {
        use crate::cli::{Firmware, PwBypass};
        use crate::model::CreatorOptions;
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
    fn first_non_null_stops_dispatch() {
        let log = std::rc::Rc::new(RefCell::new(Vec::new()));
        let mut host = PluginHost::new();
        host.push(Box::new(Recorder {
            name: "a",
            claims: false,
            log: log.clone(),
        }));
        host.push(Box::new(Recorder {
            name: "b",
            claims: true,
            log: log.clone(),
        }));
        host.push(Box::new(Recorder {
            name: "c",
            claims: true,
            log: log.clone(),
        }));

        let mut disk = Disk::new(PathBuf::from("/tmp/disk"), true);
        let mut ctx = fake_ctx();
        let result = host.dispatch_mount(&mut disk, 0, &mut ctx).unwrap();
        assert!(matches!(result, MountResult::Filesystem(_)));
        assert_eq!(*log.borrow(), vec!["a", "b"]);
    }
}
