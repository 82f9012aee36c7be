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

use std::process::Command;
use thiserror::Error;

/// Structured error kinds for the core disk-to-VM pipeline.
///
/// Most code propagates failures through `anyhow::Error` with `.context()`;
/// this type exists for the handful of call sites that need to match on the
/// failure kind (e.g. the CLI deciding on an exit code, or a backend
/// deciding whether a disk builder is usable).
#[derive(Error, Debug)]
pub enum DiskVmError {
    #[error("{0} is not a valid disk image")]
    InvalidDisk(String),

    #[error("invalid virtual disk part: {0}")]
    InvalidDiskPart(String),

    #[error("disk builder is not compatible with this virtualization backend")]
    UnsupportedDiskType,

    #[error("virtualization software is not available: {0}")]
    VirtualizationSoftwareNotAvailable(String),

    #[error("{argv} failed: {stderr}")]
    SubprocessFailed { argv: String, stderr: String },
}

/// Formats a `Command` for inclusion in a [`DiskVmError::SubprocessFailed`].
pub fn format_argv(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}
