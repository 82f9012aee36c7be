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

//! The data model shared by the analyzer, the plugins and the orchestrator:
//! disks, the volumes discovered inside them, and the per-run context
//! threaded through every plugin call.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::cli::{Firmware, FdeBypass, PwBypass};
use crate::vm::VmBuilder;

/// Partition scheme detected on a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionScheme {
    Gpt,
    Mbr,
    Unknown,
}

/// A single partition-table entry, scheme-agnostic.
#[derive(Debug, Clone)]
pub struct PartitionEntry {
    pub index: u32,
    pub start_lba: u64,
    pub sector_count: u64,
    /// GPT partition type GUID (uppercase, hyphenated) or MBR type byte
    /// formatted as `0xNN`.
    pub type_tag: String,
}

impl PartitionEntry {
    pub fn start_offset(&self, sector_size: u64) -> u64 {
        self.start_lba * sector_size
    }

    pub fn length(&self, sector_size: u64) -> u64 {
        self.sector_count * sector_size
    }

    pub fn is_esp(&self) -> bool {
        self.type_tag.eq_ignore_ascii_case("C12A7328-F81F-11D2-BA4B-00A0C93EC93B")
            || self.type_tag.eq_ignore_ascii_case("0xEF")
    }
}

/// Well-known per-plugin annotations attached to a [`Volume`].
///
/// Plugins that need to stash extra state alongside a volume get a typed
/// slot here; anything else goes in `extra`.
#[derive(Debug, Clone, Default)]
pub struct VolumeAnnotations {
    pub lvm_volume_group: Option<String>,
    pub fde_master_key: Option<Vec<u8>>,
    pub fde_kind: Option<FdeKind>,
    pub extra: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdeKind {
    Luks,
    BitLocker,
    VeraCrypt,
}

/// One node in the containment forest rooted at a disk's partitions.
#[derive(Debug, Clone)]
pub struct Volume {
    pub id: usize,
    pub parent: Option<usize>,
    /// Block-level path backing this volume (loop device, mapper device,
    /// dislocker-file, logical volume device node).
    pub flat_mount: Option<PathBuf>,
    /// Mounted filesystem path, if any.
    pub filesystem_mount: Option<PathBuf>,
    pub offset: u64,
    pub length: u64,
    pub partition: Option<PartitionEntry>,
    pub annotations: VolumeAnnotations,
}

impl Volume {
    pub fn new_root(id: usize, partition: PartitionEntry, flat_mount: PathBuf, offset: u64, length: u64) -> Self {
        Volume {
            id,
            parent: None,
            flat_mount: Some(flat_mount),
            filesystem_mount: None,
            offset,
            length,
            partition: Some(partition),
            annotations: VolumeAnnotations::default(),
        }
    }

    pub fn new_child(id: usize, parent: usize, flat_mount: PathBuf) -> Self {
        Volume {
            id,
            parent: Some(parent),
            flat_mount: Some(flat_mount),
            filesystem_mount: None,
            offset: 0,
            length: 0,
            partition: None,
            annotations: VolumeAnnotations::default(),
        }
    }
}

/// A mounted disk image undergoing analysis.
pub struct Disk {
    pub readonly: bool,
    /// Path to the flat byte view of the whole disk (a bind mount of the
    /// source file, or the backend's writable mount of a virtual disk).
    pub flat_path: PathBuf,
    pub scheme: PartitionScheme,
    pub sector_size: u64,
    pub volumes: Vec<Volume>,
    /// Set by a plugin that needs its mounts to outlive disk analysis
    /// (on-the-fly decryption overlays kept alive for the VM's lifetime).
    pub keep_mounted: bool,
    pub annotations: HashMap<String, String>,
}

impl Disk {
    pub fn new(flat_path: PathBuf, readonly: bool) -> Self {
        Disk {
            readonly,
            flat_path,
            scheme: PartitionScheme::Unknown,
            sector_size: 512,
            volumes: Vec::new(),
            keep_mounted: false,
            annotations: HashMap::new(),
        }
    }

    pub fn volume(&self, id: usize) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.id == id)
    }

    pub fn volume_mut(&mut self, id: usize) -> Option<&mut Volume> {
        self.volumes.iter_mut().find(|v| v.id == id)
    }

    pub fn next_volume_id(&self) -> usize {
        self.volumes.len()
    }

    /// Depth of `volume` in the containment forest: 0 for a root partition.
    pub fn depth(&self, volume_id: usize) -> usize {
        let mut depth = 0;
        let mut cur = volume_id;
        while let Some(parent) = self.volume(cur).and_then(|v| v.parent) {
            depth += 1;
            cur = parent;
        }
        depth
    }
}

/// User-supplied configuration for one creation run.
#[derive(Debug, Clone)]
pub struct CreatorOptions {
    pub out_dir: PathBuf,
    pub disks: Vec<PathBuf>,
    pub name: String,
    pub start_vm: bool,
    pub virtualization_software: String,
    pub vm_memory_bytes: u64,
    pub vm_cpus: u32,
    pub guest_os: Option<String>,
    pub firmware: Firmware,
    pub pw_bypass: PwBypass,
    pub fde_bypass: Vec<FdeBypass>,
    pub master_keys: Vec<Vec<u8>>,
    pub xts_combine_keys: bool,
}

impl CreatorOptions {
    /// All candidate master keys, including pairwise concatenations of
    /// equal-length keys when `xts_combine_keys` is set (reconstructs a
    /// split XTS key from independently recovered fragments).
    pub fn candidate_keys(&self) -> Vec<Vec<u8>> {
        let mut keys = self.master_keys.clone();
        if self.xts_combine_keys {
            for (i, a) in self.master_keys.iter().enumerate() {
                for (j, b) in self.master_keys.iter().enumerate() {
                    if i == j || a.len() != b.len() {
                        continue;
                    }
                    let mut combined = a.clone();
                    combined.extend_from_slice(b);
                    keys.push(combined);
                }
            }
        }
        keys
    }
}

/// A release action registered while acquiring a scoped resource (a mount,
/// a loop device, a temp directory). Released in reverse order.
pub type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Stack of pending cleanup actions, released in reverse acquisition order
/// on drop -- the same role as the host project's `Mount`/`PartTableKpartx`
/// `Drop` impls, generalized to an arbitrary nested acquisition sequence.
#[derive(Default)]
pub struct ScopedResources {
    releases: Vec<ReleaseFn>,
}

impl ScopedResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer(&mut self, release: ReleaseFn) {
        self.releases.push(release);
    }

    /// Moves all pending releases into `other`, so they outlive this scope.
    pub fn transfer_into(&mut self, other: &mut ScopedResources) {
        other.releases.append(&mut self.releases);
    }

    /// Runs every pending release in reverse order, logging but not
    /// propagating individual failures (releases are infallible by type;
    /// fallible teardown steps must log their own errors before returning).
    pub fn release_all(&mut self) {
        while let Some(release) = self.releases.pop() {
            release();
        }
    }
}

impl Drop for ScopedResources {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Per-run state threaded through every plugin call.
pub struct CreatorContext {
    pub options: CreatorOptions,
    pub vm_builder: Option<VmBuilder>,
    pub guest_os: Option<String>,
    pub firmware: Option<Firmware>,
    pub long_lived: ScopedResources,
    pub extra: HashMap<String, String>,
}

impl CreatorContext {
    pub fn new(options: CreatorOptions) -> Self {
        CreatorContext {
            options,
            vm_builder: None,
            guest_os: None,
            firmware: None,
            long_lived: ScopedResources::new(),
            extra: HashMap::new(),
        }
    }
}
