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

use anyhow::{Context, Result};
use std::process::Command;

use crate::error::{format_argv, DiskVmError};

/// Runs the provided command. The first macro argument is the executable, and following arguments
/// are passed to the command. Returns a Result<()> describing whether the command failed. Errors
/// are adequately prefixed with the full command and carry [`DiskVmError::SubprocessFailed`].
#[macro_export]
macro_rules! runcmd {
    ($cmd:expr) => (runcmd!($cmd,));
    ($cmd:expr, $($args:expr),*) => {{
        let mut cmd = std::process::Command::new($cmd);
        $( cmd.arg($args); )*
        $crate::util::run(&mut cmd)
    }}
}

/// Runs the provided command, captures its stdout, and swallows its stderr except on failure.
/// The first macro argument is the executable, and following arguments are passed to the command.
/// Returns a Result<String> describing whether the command failed, and if not, its standard
/// output. Output is assumed to be UTF-8. Errors are adequately prefixed with the full command.
#[macro_export]
macro_rules! runcmd_output {
    ($cmd:expr) => (runcmd_output!($cmd,));
    ($cmd:expr, $($args:expr),*) => {{
        let mut cmd = std::process::Command::new($cmd);
        $( cmd.arg($args); )*
        $crate::util::cmd_output(&mut cmd)
    }}
}

/// Runs the provided Command object, logging the invocation and raising
/// `SubprocessFailed` on a non-zero exit.
pub fn run(cmd: &mut Command) -> Result<()> {
    log::debug!("running {:?}", cmd);
    let status = cmd
        .status()
        .with_context(|| format!("running {:?}", cmd))?;
    if !status.success() {
        return Err(DiskVmError::SubprocessFailed {
            argv: format_argv(cmd),
            stderr: format!("exited with {}", status),
        }
        .into());
    }
    Ok(())
}

/// Runs the provided Command object, captures its stdout, and swallows its stderr except on
/// failure. Returns a Result<String> describing whether the command failed, and if not, its
/// standard output. Output is assumed to be UTF-8. Errors are adequately prefixed with the full
/// command.
pub fn cmd_output(cmd: &mut Command) -> Result<String> {
    log::debug!("running {:?}", cmd);
    let result = cmd
        .output()
        .with_context(|| format!("running {:?}", cmd))?;
    if !result.status.success() {
        return Err(DiskVmError::SubprocessFailed {
            argv: format_argv(cmd),
            stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
        }
        .into());
    }
    String::from_utf8(result.stdout)
        .with_context(|| format!("decoding as UTF-8 output of {:?}", cmd))
}

/// Retries `f` up to `attempts` times, sleeping `delay` between tries.
/// Used to ride out "device/target is busy" races during unmount.
pub fn retry<T, F>(attempts: u32, delay: std::time::Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut last_err = None;
    for attempt in 0..attempts {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < attempts {
                    std::thread::sleep(delay);
                }
            }
        }
    }
    Err(last_err.expect("attempts > 0"))
}
