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

mod analyzer;
mod binpack;
mod blockdev;
mod cli;
mod error;
mod extent;
mod hive;
mod model;
mod orchestrator;
mod plugin;
mod util;
mod vm;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use cli::{Cli, FdeBypass, PwBypass};
use model::{CreatorContext, CreatorOptions};
use plugin::PluginHost;

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::new().filter_level(cli.log_level_filter()).init();

    if let Err(e) = run(cli) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let master_keys = cli.all_master_keys()?;
    let name = cli.name.clone().unwrap_or_else(|| file_stem_or_default(&cli.disk_image));

    let options = CreatorOptions {
        out_dir: cli.out_dir.clone(),
        disks: vec![cli.disk_image.clone()],
        name,
        start_vm: cli.start_vm,
        virtualization_software: cli.virtualization_software.clone(),
        vm_memory_bytes: cli.vm_memory,
        vm_cpus: cli.vm_cpus,
        guest_os: cli.guest_os.clone(),
        firmware: cli.firmware,
        pw_bypass: cli.pw_bypass,
        fde_bypass: cli.fde_bypass.clone(),
        master_keys,
        xts_combine_keys: cli.xts_combine_keys,
    };

    let mut ctx = CreatorContext::new(options);
    if cli.firmware != cli::Firmware::Auto {
        ctx.firmware = Some(cli.firmware);
    }
    if let Some(guest_os) = &cli.guest_os {
        ctx.guest_os = Some(guest_os.clone());
    }

    let host = build_plugin_host(&cli);
    orchestrator::run(ctx, host)
}

fn file_stem_or_default(path: &PathBuf) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "diskvm".to_string())
}

/// Builds the plugin list from the CLI's bypass flags. `Auto` resolves to
/// every applicable plugin; `None` resolves to none; a specific variant
/// enables just that one mechanism.
fn build_plugin_host(cli: &Cli) -> PluginHost {
    let mut host = PluginHost::new();

    // Mount-time plugins: order matters, first claim wins.
    //
    // `auto` only ever implies the add-password/override-password
    // mechanisms (never on-the-fly decrypt, which leaves OS-level mounts
    // running for the lifetime of the VM and must be opted into
    // explicitly); it still needs the volume unlocked to learn the
    // master key those plugins patch in, so it also gates mount-time
    // detection here.
    let fde_auto = cli.fde_bypass.contains(&FdeBypass::Auto);
    if fde_auto || cli.fde_bypass.contains(&FdeBypass::LuksOtfMount) || cli.fde_bypass.contains(&FdeBypass::LuksAddPw) {
        host.push(Box::<plugin::luks::LuksMountPlugin>::default());
    }
    if fde_auto || cli.fde_bypass.contains(&FdeBypass::BitlockerOtfMount) || cli.fde_bypass.contains(&FdeBypass::BitlockerAddClearkey) {
        host.push(Box::new(plugin::bitlocker::BitlockerMountPlugin { try_clearkey: true }));
    }
    if fde_auto || cli.fde_bypass.contains(&FdeBypass::VeracryptOtfMount) || cli.fde_bypass.contains(&FdeBypass::VeracryptOverwritePw) {
        host.push(Box::<plugin::veracrypt::VeracryptDetectPlugin>::default());
        host.push(Box::<plugin::veracrypt::VeracryptMountPlugin>::default());
    }
    host.push(Box::<plugin::lvm::LvmPlugin>::default());
    host.push(Box::new(plugin::filesystem::GenericFilesystemPlugin { repair_ntfs: false }));

    // Detection, always on.
    host.push(Box::<plugin::detect::OsDetectPlugin>::default());
    host.push(Box::<plugin::detect::EfiDetectPlugin>::default());

    // Writable-pass plugins: credential recovery and FDE bypass persistence.
    let pw_auto = cli.pw_bypass == PwBypass::Auto;
    if pw_auto || cli.pw_bypass == PwBypass::Linux {
        host.push(Box::<plugin::passwd::ShadowResetPlugin>::default());
    }
    if pw_auto || cli.pw_bypass == PwBypass::Windows {
        host.push(Box::<plugin::passwd::WindowsSamResetPlugin>::default());
    }

    if fde_auto || cli.fde_bypass.contains(&FdeBypass::LuksAddPw) {
        host.push(Box::<plugin::luks::LuksAddPasswordPlugin>::default());
    }
    if cli.fde_bypass.contains(&FdeBypass::LuksOtfMount) {
        host.push(Box::<plugin::luks::LuksOnTheFlyDecryptPlugin>::default());
    }
    if fde_auto || cli.fde_bypass.contains(&FdeBypass::BitlockerAddClearkey) {
        host.push(Box::<plugin::bitlocker::BitlockerAddClearkeyPlugin>::default());
    }
    if cli.fde_bypass.contains(&FdeBypass::BitlockerOtfMount) {
        host.push(Box::<plugin::bitlocker::BitlockerOnTheFlyDecryptPlugin>::default());
    }
    if fde_auto || cli.fde_bypass.contains(&FdeBypass::VeracryptOverwritePw) {
        host.push(Box::<plugin::veracrypt::VeracryptOverwritePasswordPlugin>::default());
    }
    if cli.fde_bypass.contains(&FdeBypass::VeracryptOtfMount) {
        host.push(Box::<plugin::veracrypt::VeracryptOnTheFlyDecryptPlugin>::default());
        host.push(Box::<plugin::veracrypt::VeracryptBootloaderRestorePlugin>::default());
    }

    host
}
