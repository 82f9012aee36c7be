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

//! A minimal, read-mostly parser for the Windows registry hive binary
//! format (`regf`/`hbin`/`nk`/`vk` cells), just enough to walk a key path,
//! enumerate subkeys, and locate the *file offset* of a value's raw data
//! so the password-reset plugins can patch it in place without rewriting
//! the hive's internal bookkeeping.
//!
//! This intentionally does not attempt to be a general-purpose hive
//! library: no write support for keys/values, no security descriptors, no
//! big-data (`db`) value support.

use anyhow::{anyhow, bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};

const HBIN_BASE: usize = 0x1000;

pub struct Hive {
    pub data: Vec<u8>,
    root_offset: usize,
}

impl Hive {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        if data.len() < HBIN_BASE + 4 || &data[0..4] != b"regf" {
            bail!("{} is not a registry hive", path.display());
        }
        let root_offset = LittleEndian::read_u32(&data[0x24..0x28]) as usize;
        Ok(Hive { data, root_offset })
    }

    fn cell_data_offset(&self, offset: usize) -> usize {
        HBIN_BASE + offset + 4
    }

    fn root(&self) -> Result<KeyNode<'_>> {
        KeyNode::read(self, self.root_offset)
    }

    /// Walks a `\`-separated, case-insensitive path of subkey names from
    /// the hive root.
    pub fn key_by_path(&self, path: &str) -> Result<KeyNode<'_>> {
        let mut node = self.root()?;
        for component in path.split('\\').filter(|c| !c.is_empty()) {
            node = node
                .subkey(self, component)?
                .ok_or_else(|| anyhow!("registry key component {:?} not found in {:?}", component, path))?;
        }
        Ok(node)
    }
}

pub struct KeyNode<'a> {
    hive: std::marker::PhantomData<&'a Hive>,
    cell_offset: usize,
    num_subkeys: u32,
    subkey_list_offset: u32,
    num_values: u32,
    value_list_offset: u32,
    class_name_offset: i32,
    class_name_length: u16,
}

impl<'a> KeyNode<'a> {
    fn read(hive: &'a Hive, offset: usize) -> Result<Self> {
        let base = hive.cell_data_offset(offset);
        let data = &hive.data;
        if base + 0x50 > data.len() || &data[base..base + 2] != b"nk" {
            bail!("corrupt key node at offset {:#x}", offset);
        }
        Ok(KeyNode {
            hive: std::marker::PhantomData,
            cell_offset: offset,
            num_subkeys: LittleEndian::read_u32(&data[base + 0x14..base + 0x18]),
            subkey_list_offset: LittleEndian::read_u32(&data[base + 0x1C..base + 0x20]),
            num_values: LittleEndian::read_u32(&data[base + 0x24..base + 0x28]),
            value_list_offset: LittleEndian::read_u32(&data[base + 0x28..base + 0x2C]),
            class_name_offset: LittleEndian::read_i32(&data[base + 0x30..base + 0x34]),
            class_name_length: LittleEndian::read_u16(&data[base + 0x4A..base + 0x4C]),
        })
    }

    pub fn class_name(&self, hive: &Hive) -> Option<String> {
        if self.class_name_offset < 0 || self.class_name_length == 0 {
            return None;
        }
        let base = hive.cell_data_offset(self.class_name_offset as usize);
        let len = self.class_name_length as usize;
        let bytes = hive.data.get(base..base + len)?;
        let u16s: Vec<u16> = bytes.chunks_exact(2).map(|c| LittleEndian::read_u16(c)).collect();
        Some(String::from_utf16_lossy(&u16s))
    }

    fn subkey_offsets(&self, hive: &Hive, list_offset: u32, out: &mut Vec<u32>) -> Result<()> {
        if list_offset == 0xFFFF_FFFF {
            return Ok(());
        }
        let base = hive.cell_data_offset(list_offset as usize);
        let data = &hive.data;
        if base + 4 > data.len() {
            bail!("corrupt subkey list at offset {:#x}", list_offset);
        }
        let sig = &data[base..base + 2];
        let count = LittleEndian::read_u16(&data[base + 2..base + 4]) as usize;
        match sig {
            b"lf" | b"lh" => {
                for i in 0..count {
                    let entry = base + 4 + i * 8;
                    out.push(LittleEndian::read_u32(&data[entry..entry + 4]));
                }
            }
            b"ri" => {
                for i in 0..count {
                    let entry = base + 4 + i * 4;
                    let sub_list = LittleEndian::read_u32(&data[entry..entry + 4]);
                    self.subkey_offsets(hive, sub_list, out)?;
                }
            }
            other => bail!("unsupported subkey list signature {:?}", other),
        }
        Ok(())
    }

    pub fn subkey(&self, hive: &'a Hive, name: &str) -> Result<Option<KeyNode<'a>>> {
        let mut offsets = Vec::new();
        self.subkey_offsets(hive, self.subkey_list_offset, &mut offsets)?;
        for offset in offsets {
            let node = KeyNode::read(hive, offset as usize)?;
            if node.name(hive).eq_ignore_ascii_case(name) {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    pub fn subkeys(&self, hive: &'a Hive) -> Result<Vec<KeyNode<'a>>> {
        let mut offsets = Vec::new();
        self.subkey_offsets(hive, self.subkey_list_offset, &mut offsets)?;
        offsets
            .into_iter()
            .map(|o| KeyNode::read(hive, o as usize))
            .collect()
    }

    pub fn name(&self, hive: &Hive) -> String {
        let base = hive.cell_data_offset(self.cell_offset);
        let data = &hive.data;
        let len = LittleEndian::read_u16(&data[base + 0x48..base + 0x4A]) as usize;
        String::from_utf8_lossy(&data[base + 0x4C..base + 0x4C + len]).into_owned()
    }

    /// Returns the file offset and length of a named value's raw data, if
    /// the value exists and its data is stored out-of-line (the common
    /// case for anything larger than 4 bytes, which covers every hash
    /// record this module cares about).
    pub fn value_data_location(&self, hive: &Hive, name: &str) -> Result<Option<(usize, usize)>> {
        if self.value_list_offset == 0xFFFF_FFFF {
            return Ok(None);
        }
        let list_base = hive.cell_data_offset(self.value_list_offset as usize);
        let data = &hive.data;
        for i in 0..self.num_values as usize {
            let entry = list_base + i * 4;
            if entry + 4 > data.len() {
                break;
            }
            let vk_offset = LittleEndian::read_u32(&data[entry..entry + 4]);
            let vk_base = hive.cell_data_offset(vk_offset as usize);
            if vk_base + 0x14 > data.len() || &data[vk_base..vk_base + 2] != b"vk" {
                continue;
            }
            let name_len = LittleEndian::read_u16(&data[vk_base + 2..vk_base + 4]) as usize;
            let raw_len = LittleEndian::read_i32(&data[vk_base + 4..vk_base + 8]);
            let data_offset = LittleEndian::read_u32(&data[vk_base + 8..vk_base + 0xC]);
            let value_name = String::from_utf8_lossy(&data[vk_base + 0x14..vk_base + 0x14 + name_len]);
            if !value_name.eq_ignore_ascii_case(name) {
                continue;
            }
            if raw_len < 0 {
                // Inline data (<=4 bytes), stored directly in the offset field.
                return Ok(None);
            }
            let len = raw_len as usize;
            let base = hive.cell_data_offset(data_offset as usize);
            return Ok(Some((base, len)));
        }
        Ok(None)
    }
}
