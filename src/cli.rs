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

//! Command-line surface. Parsing is pure except for reading
//! `--master-keys-file`, so most of it is covered by unit tests that
//! construct argv vectors directly.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs::read_to_string;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Firmware {
    Auto,
    Bios,
    Efi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PwBypass {
    Auto,
    None,
    Linux,
    Windows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum FdeBypass {
    None,
    Auto,
    BitlockerOtfMount,
    BitlockerAddClearkey,
    LuksAddPw,
    LuksOtfMount,
    VeracryptOtfMount,
    VeracryptOverwritePw,
}

#[derive(Debug, Parser)]
#[command(
    name = "diskvm-creator",
    about = "Converts a raw disk image into a bootable VM without modifying the original image"
)]
pub struct Cli {
    /// Path to the raw disk image or block device to convert.
    pub disk_image: PathBuf,

    /// Directory to write the VM and its virtual disks into.
    #[arg(long)]
    pub out_dir: PathBuf,

    /// Name of the created VM. Defaults to the image's file stem.
    #[arg(long)]
    pub name: Option<String>,

    /// Start the VM once it has been created.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub start_vm: bool,

    #[arg(long, default_value = "vmware")]
    pub virtualization_software: String,

    /// VM memory, e.g. `4GB`, `512MB`.
    #[arg(long, default_value = "4GB", value_parser = parse_size)]
    pub vm_memory: u64,

    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u32).range(1..))]
    pub vm_cpus: u32,

    /// Guest OS identifier passed to the backend. Defaults to auto-detection.
    #[arg(long)]
    pub guest_os: Option<String>,

    #[arg(long, value_enum, default_value_t = Firmware::Auto)]
    pub firmware: Firmware,

    #[arg(long, value_enum, default_value_t = PwBypass::Auto)]
    pub pw_bypass: PwBypass,

    #[arg(long, value_enum, default_values_t = [FdeBypass::None])]
    pub fde_bypass: Vec<FdeBypass>,

    /// A candidate FDE master key in hex. May be repeated.
    #[arg(long, value_parser = parse_hex_key)]
    pub master_key: Vec<Vec<u8>>,

    /// File containing one hex-encoded candidate master key per line.
    #[arg(long)]
    pub master_keys_file: Option<PathBuf>,

    /// Also try every ordered concatenation of two equal-length candidate
    /// keys, to reconstruct a split XTS key.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub xts_combine_keys: bool,

    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// All master keys supplied directly or via `--master-keys-file`.
    pub fn all_master_keys(&self) -> Result<Vec<Vec<u8>>> {
        let mut keys = self.master_key.clone();
        if let Some(path) = &self.master_keys_file {
            let contents = read_to_string(path)
                .with_context(|| format!("reading master keys file {}", path.display()))?;
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                keys.push(parse_hex_key(line)?);
            }
        }
        Ok(keys)
    }

    pub fn log_level_filter(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        }
    }
}

fn parse_hex_key(s: &str) -> Result<Vec<u8>> {
    hex::decode(s.trim()).with_context(|| format!("decoding hex key {:?}", s))
}

/// Parses a byte-size string of the form `<N>[KMGT]B?`, e.g. `4GB`,
/// `512MB`, `100`.
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let s = s.strip_suffix(['b', 'B']).unwrap_or(s);
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => (&s[..idx], &s[idx..]),
        None => (s, ""),
    };
    if digits.is_empty() {
        bail!("invalid size {:?}: no numeric value", s);
    }
    let value: u64 = digits.parse().with_context(|| format!("invalid size {:?}", s))?;
    let multiplier: u64 = match unit.to_ascii_uppercase().as_str() {
        "" => 1,
        "K" => 1024,
        "M" => 1024 * 1024,
        "G" => 1024 * 1024 * 1024,
        "T" => 1024 * 1024 * 1024 * 1024,
        other => bail!("invalid size unit {:?} in {:?}", other, s),
    };
    value
        .checked_mul(multiplier)
        .with_context(|| format!("size {:?} overflows u64", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults() {
        let cli = Cli::parse_from(["diskvm-creator", "disk.img", "--out-dir", "/tmp/out"]);
        assert!(cli.start_vm);
        assert_eq!(cli.virtualization_software, "vmware");
        assert_eq!(cli.vm_memory, 4 * 1024 * 1024 * 1024);
        assert_eq!(cli.vm_cpus, 2);
        assert_eq!(cli.firmware, Firmware::Auto);
        assert_eq!(cli.pw_bypass, PwBypass::Auto);
        assert!(cli.xts_combine_keys);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn parses_memory_sizes() {
        assert_eq!(parse_size("4GB").unwrap(), 4 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("512MB").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("100").unwrap(), 100);
        assert!(parse_size("nope").is_err());
    }

    #[test]
    fn parses_hex_master_keys() {
        let cli = Cli::parse_from([
            "diskvm-creator",
            "disk.img",
            "--out-dir",
            "/tmp/out",
            "--master-key",
            "deadbeef",
        ]);
        assert_eq!(cli.master_key, vec![vec![0xde, 0xad, 0xbe, 0xef]]);
    }

    #[test]
    fn verbosity_maps_to_log_level() {
        let cli = Cli::parse_from(["diskvm-creator", "disk.img", "--out-dir", "/tmp/out", "-vv"]);
        assert_eq!(cli.log_level_filter(), log::LevelFilter::Debug);
    }
}
