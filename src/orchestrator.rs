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

//! End-to-end disk-to-VM pipeline: analyze every source disk read-only,
//! build the virtual machine and an initial snapshot, then reopen each
//! virtual disk writable for the credential-recovery and FDE-bypass pass
//! before taking the snapshot the VM is actually meant to boot from.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::analyzer;
use crate::blockdev;
use crate::model::CreatorContext;
use crate::plugin::PluginHost;
use crate::vm::{self, VmSpec};

const DEFAULT_GUEST_OS: &str = "otherlinux-64";
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const POLL_ATTEMPTS: u32 = 12;

pub fn run(mut ctx: CreatorContext, host: PluginHost) -> Result<()> {
    validate_options(&ctx)?;
    std::fs::create_dir_all(&ctx.options.out_dir)
        .with_context(|| format!("creating output directory {}", ctx.options.out_dir.display()))?;

    let backend = vm::resolve(&ctx.options.virtualization_software)?;
    backend.check_available().context("checking virtualization software availability")?;

    log::info!("analyzing {} source disk(s) read-only", ctx.options.disks.len());
    let mut disks = Vec::with_capacity(ctx.options.disks.len());
    for path in ctx.options.disks.clone() {
        let mount = analyzer::bind_mount_source(&path, true)
            .with_context(|| format!("bind-mounting {}", path.display()))?;
        let disk = analyzer::analyze_disk(mount.mountpoint().to_path_buf(), true, &host, &mut ctx)
            .with_context(|| format!("analyzing {}", path.display()))?;
        disks.push((disk, mount));
    }

    let vm_spec = VmSpec {
        name: ctx.options.name.clone(),
        memory_bytes: ctx.options.vm_memory_bytes,
        cpus: ctx.options.vm_cpus,
        guest_os: ctx.guest_os.clone().unwrap_or_else(|| DEFAULT_GUEST_OS.to_string()),
        firmware: ctx.firmware.unwrap_or(crate::cli::Firmware::Bios),
    };
    log::info!("creating VM {:?} ({} vCPU, {} MiB, {:?})", vm_spec.name, vm_spec.cpus, vm_spec.memory_bytes / (1024 * 1024), vm_spec.firmware);
    let mut vm_builder = backend.builder(vm_spec);

    for (disk, _mount) in &mut disks {
        let mut disk_builder = vm_builder.new_disk(disk.sector_size);
        host.broadcast_before_create_disk(disk, disk_builder.as_mut(), &mut ctx)?;
        if !disk.keep_mounted {
            // No plugin overlaid an on-the-fly decrypted view, so map the
            // flat disk through unmodified.
            let length = blockdev::get_length_for_path(&disk.flat_path)?;
            disk_builder.add_part(crate::extent::whole_file_part(&disk.flat_path, length))?;
        }
        vm_builder.add_disk(disk_builder)?;
    }

    host.broadcast_before_create_vm(&mut ctx)?;
    let machine = vm_builder.write(&ctx.options.out_dir).context("writing virtual machine descriptor")?;
    machine.snapshot("Initial").context("taking Initial snapshot")?;

    for (disk, _mount) in &mut disks {
        if disk.keep_mounted {
            log::debug!("leaving {} mounted for on-the-fly decryption", disk.flat_path.display());
            continue;
        }
        analyzer::teardown_disk(disk, &host, &mut ctx)?;
        analyzer::detach_root_loop_devices(disk)?;
    }
    // `_mount` (the bind mount of the original source file) is dropped here,
    // unmounting it; the original image itself was never opened writable.
    drop(disks);

    run_modify_pass(&machine.disks()?, backend.as_ref(), &host, &mut ctx)?;
    machine.snapshot("InitFinished").context("taking InitFinished snapshot")?;

    if ctx.options.start_vm {
        machine.start().context("starting VM")?;
        for attempt in 0..POLL_ATTEMPTS {
            std::thread::sleep(POLL_INTERVAL);
            match machine.is_running() {
                Ok(true) => {
                    log::info!("VM is running");
                    break;
                }
                Ok(false) if attempt + 1 == POLL_ATTEMPTS => {
                    log::warn!("VM did not report running after {} attempts", POLL_ATTEMPTS);
                }
                Ok(false) => continue,
                Err(e) => {
                    log::warn!("error polling VM state: {:#}", e);
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Reopens each of the VM's virtual disks writable through the backend and
/// re-analyzes it. `analyze_disk`'s mount pipeline dispatches
/// `modify_volume`/`modify_filesystem` inline as each volume/filesystem is
/// discovered (since the disk is no longer readonly); `modify_disk` is a
/// whole-disk hook, so it fires once re-analysis has settled.
fn run_modify_pass(
    vm_disks: &[PathBuf],
    backend: &dyn vm::VirtualizationSoftware,
    host: &PluginHost,
    ctx: &mut CreatorContext,
) -> Result<()> {
    for descriptor in vm_disks {
        let flat_path = backend
            .mount_disk(descriptor, true)
            .with_context(|| format!("mounting {} writable", descriptor.display()))?;

        let result = (|| -> Result<()> {
            let mut disk = analyzer::analyze_disk(flat_path.clone(), false, host, ctx)
                .with_context(|| format!("re-analyzing {}", descriptor.display()))?;
            host.broadcast_modify_disk(&mut disk, ctx)?;

            if !disk.keep_mounted {
                analyzer::teardown_disk(&mut disk, host, ctx)?;
                analyzer::detach_root_loop_devices(&disk)?;
            }
            Ok(())
        })();

        backend
            .unmount_disk(descriptor, &flat_path)
            .with_context(|| format!("unmounting {}", descriptor.display()))?;
        result?;
    }
    Ok(())
}

fn validate_options(ctx: &CreatorContext) -> Result<()> {
    if ctx.options.disks.is_empty() {
        bail!("at least one source disk is required");
    }
    for path in &ctx.options.disks {
        if !path.exists() {
            bail!("{} does not exist", path.display());
        }
    }
    if ctx.options.vm_cpus == 0 {
        bail!("vm_cpus must be at least 1");
    }
    Ok(())
}
