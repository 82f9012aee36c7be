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

//! Sparse extent map for a single virtual disk.
//!
//! A [`VirtualDiskPart`] names a byte range of the *target* (virtual) disk
//! and the source bytes that back it: either a region of some file on the
//! host, or nothing (an implicit zero-fill run when written out). Plugins
//! overlay decrypted or modified regions by inserting new parts; overlapping
//! existing parts are trimmed or split so the part list stays disjoint and
//! sorted.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::error::DiskVmError;

/// One extent of a virtual disk's target address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDiskPart {
    /// Host file or block device backing this extent, or `None` for a
    /// zero-filled region.
    pub source_file: Option<PathBuf>,
    pub source_offset: u64,
    pub target_offset: u64,
    pub length: u64,
}

impl VirtualDiskPart {
    fn target_end(&self) -> u64 {
        self.target_offset + self.length
    }
}

/// Accumulates a sorted, non-overlapping list of [`VirtualDiskPart`]s.
#[derive(Debug, Default, Clone)]
pub struct ExtentBuilder {
    sector_size: u64,
    parts: Vec<VirtualDiskPart>,
}

impl ExtentBuilder {
    pub fn new(sector_size: u64) -> Self {
        ExtentBuilder {
            sector_size,
            parts: Vec::new(),
        }
    }

    pub fn parts(&self) -> &[VirtualDiskPart] {
        &self.parts
    }

    /// Inserts `new`, merging with any existing parts it overlaps.
    ///
    /// `new.target_offset` and `new.target_offset + new.length` must both be
    /// sector-aligned, or this returns [`DiskVmError::InvalidDiskPart`].
    pub fn add_part(&mut self, new: VirtualDiskPart) -> Result<()> {
        if new.target_offset % self.sector_size != 0 {
            return Err(DiskVmError::InvalidDiskPart(format!(
                "target offset {} is not aligned to sector size {}",
                new.target_offset, self.sector_size
            ))
            .into());
        }
        if new.target_end() % self.sector_size != 0 {
            return Err(DiskVmError::InvalidDiskPart(format!(
                "target end {} is not aligned to sector size {}",
                new.target_end(),
                self.sector_size
            ))
            .into());
        }
        if let Some(path) = &new.source_file {
            if !path.exists() {
                return Err(DiskVmError::InvalidDiskPart(format!(
                    "source file {} does not exist",
                    path.display()
                ))
                .into());
            }
        }

        let mut merged = Vec::with_capacity(self.parts.len() + 1);
        for p in self.parts.drain(..) {
            // Case 1: disjoint, entirely before or after `new`.
            if p.target_end() <= new.target_offset || p.target_offset >= new.target_end() {
                merged.push(p);
                continue;
            }
            // Case 2: `p` fully inside `new` -- drop it.
            if p.target_offset >= new.target_offset && p.target_end() <= new.target_end() {
                continue;
            }
            // Case 3: `p`'s tail overlaps `new`'s head -- truncate `p`'s tail.
            if p.target_offset < new.target_offset && p.target_end() <= new.target_end() {
                let overlap = p.target_end() - new.target_offset;
                let mut head = p.clone();
                head.length -= overlap;
                merged.push(head);
                continue;
            }
            // Case 4: `p`'s head overlaps `new`'s tail -- advance `p`'s start.
            if p.target_offset >= new.target_offset && p.target_end() > new.target_end() {
                let overlap = new.target_end() - p.target_offset;
                let mut tail = p.clone();
                tail.target_offset += overlap;
                tail.source_offset += overlap;
                tail.length -= overlap;
                merged.push(tail);
                continue;
            }
            // Case 5: `new` is strictly inside `p` -- split into head and tail.
            debug_assert!(p.target_offset < new.target_offset && p.target_end() > new.target_end());
            let head_len = new.target_offset - p.target_offset;
            let mut head = p.clone();
            head.length = head_len;
            merged.push(head);

            let tail_overlap = new.target_end() - p.target_offset;
            let mut tail = p;
            tail.target_offset += tail_overlap;
            tail.source_offset += tail_overlap;
            tail.length -= tail_overlap;
            merged.push(tail);
        }
        merged.push(new);
        merged.sort_by_key(|p| p.target_offset);
        self.parts = merged;
        Ok(())
    }

    /// Total length of the virtual disk, i.e. the end of the last part.
    pub fn total_length(&self) -> u64 {
        self.parts.last().map(|p| p.target_end()).unwrap_or(0)
    }

    /// Returns the parts plus explicit zero-fill runs for any gaps between
    /// them, ready for a backend to serialize into its descriptor format.
    pub fn parts_with_gaps_filled(&self) -> Vec<VirtualDiskPart> {
        let mut out = Vec::with_capacity(self.parts.len());
        let mut cursor = 0u64;
        for p in &self.parts {
            if p.target_offset > cursor {
                out.push(VirtualDiskPart {
                    source_file: None,
                    source_offset: 0,
                    target_offset: cursor,
                    length: p.target_offset - cursor,
                });
            }
            cursor = p.target_end();
            out.push(p.clone());
        }
        out
    }
}

/// Convenience constructor for a part that maps a whole file onto the disk
/// starting at target offset 0.
pub fn whole_file_part(path: &Path, length: u64) -> VirtualDiskPart {
    VirtualDiskPart {
        source_file: Some(path.to_path_buf()),
        source_offset: 0,
        target_offset: 0,
        length,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn tmp() -> PathBuf {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 4096]).unwrap();
        f.keep().unwrap().1
    }

    #[test]
    fn disjoint_parts_are_kept_sorted() {
        let src = tmp();
        let mut b = ExtentBuilder::new(512);
        b.add_part(VirtualDiskPart {
            source_file: Some(src.clone()),
            source_offset: 512,
            target_offset: 512,
            length: 512,
        })
        .unwrap();
        b.add_part(VirtualDiskPart {
            source_file: Some(src.clone()),
            source_offset: 0,
            target_offset: 0,
            length: 512,
        })
        .unwrap();
        let parts = b.parts();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].target_offset, 0);
        assert_eq!(parts[1].target_offset, 512);
    }

    #[test]
    fn new_part_fully_replaces_existing() {
        let src = tmp();
        let mut b = ExtentBuilder::new(512);
        b.add_part(VirtualDiskPart {
            source_file: Some(src.clone()),
            source_offset: 0,
            target_offset: 0,
            length: 2048,
        })
        .unwrap();
        b.add_part(VirtualDiskPart {
            source_file: Some(src.clone()),
            source_offset: 1024,
            target_offset: 0,
            length: 2048,
        })
        .unwrap();
        assert_eq!(b.parts().len(), 1);
        assert_eq!(b.parts()[0].source_offset, 1024);
    }

    #[test]
    fn overlap_truncates_existing_tail() {
        let src = tmp();
        let mut b = ExtentBuilder::new(512);
        b.add_part(VirtualDiskPart {
            source_file: Some(src.clone()),
            source_offset: 0,
            target_offset: 0,
            length: 1536,
        })
        .unwrap();
        b.add_part(VirtualDiskPart {
            source_file: Some(src.clone()),
            source_offset: 0,
            target_offset: 1024,
            length: 1024,
        })
        .unwrap();
        let parts = b.parts();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].length, 1024);
        assert_eq!(parts[1].target_offset, 1024);
    }

    #[test]
    fn overlap_advances_existing_head() {
        let src = tmp();
        let mut b = ExtentBuilder::new(512);
        b.add_part(VirtualDiskPart {
            source_file: Some(src.clone()),
            source_offset: 0,
            target_offset: 1024,
            length: 1536,
        })
        .unwrap();
        b.add_part(VirtualDiskPart {
            source_file: Some(src.clone()),
            source_offset: 0,
            target_offset: 512,
            length: 1024,
        })
        .unwrap();
        let parts = b.parts();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].target_offset, 1536);
        assert_eq!(parts[1].source_offset, 512);
    }

    #[test]
    fn new_part_splits_existing_in_two() {
        let src = tmp();
        let mut b = ExtentBuilder::new(512);
        b.add_part(VirtualDiskPart {
            source_file: Some(src.clone()),
            source_offset: 0,
            target_offset: 0,
            length: 3072,
        })
        .unwrap();
        b.add_part(VirtualDiskPart {
            source_file: Some(src.clone()),
            source_offset: 0,
            target_offset: 1024,
            length: 512,
        })
        .unwrap();
        let parts = b.parts();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].target_offset, 0);
        assert_eq!(parts[0].length, 1024);
        assert_eq!(parts[1].target_offset, 1024);
        assert_eq!(parts[2].target_offset, 1536);
        assert_eq!(parts[2].source_offset, 1536);
        assert_eq!(parts[2].length, 1536);
    }

    #[test]
    fn misaligned_part_is_rejected() {
        let src = tmp();
        let mut b = ExtentBuilder::new(512);
        let err = b
            .add_part(VirtualDiskPart {
                source_file: Some(src),
                source_offset: 0,
                target_offset: 100,
                length: 512,
            })
            .unwrap_err();
        assert!(err.to_string().contains("not aligned"));
    }

    #[test]
    fn gaps_are_filled_with_zero_runs() {
        let src = tmp();
        let mut b = ExtentBuilder::new(512);
        b.add_part(VirtualDiskPart {
            source_file: Some(src),
            source_offset: 0,
            target_offset: 1024,
            length: 512,
        })
        .unwrap();
        let filled = b.parts_with_gaps_filled();
        assert_eq!(filled.len(), 2);
        assert!(filled[0].source_file.is_none());
        assert_eq!(filled[0].target_offset, 0);
        assert_eq!(filled[0].length, 1024);
    }
}
