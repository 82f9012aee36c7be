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

//! Packing and unpacking of the fixed-layout binary records used by the
//! full-disk-encryption plugins (the VeraCrypt system encryption header,
//! primarily). Fields are big-endian, matching VeraCrypt's own on-disk
//! format.

use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

pub const SECTOR_SIZE: usize = 512;
pub const HEADER_SIZE: usize = 512;
pub const SALT_SIZE: usize = 64;
pub const MASTER_KEYS_SIZE: usize = 256;
const SIGNATURE: &[u8; 4] = b"VERA";
const HEADER_FORMAT_VERSION: u16 = 5;
const MIN_PROGRAM_VERSION: u16 = 0x010b;
/// System-encryption flag bit within the header's `flags` field.
pub const FLAG_SYSTEM_ENCRYPTION: u32 = 0x1;

/// The plaintext fields of a decrypted VeraCrypt volume header.
///
/// This mirrors the 512-byte record VeraCrypt writes starting at the
/// system-encryption header location (LBA 62 on an encrypted system
/// drive): a fixed layout of big-endian integers plus two CRC-32
/// checksums and a 256-byte master-key area. `reserved1`/`reserved2` and
/// the version fields are preserved across parse/pack rather than
/// discarded, so re-packing a header parsed from a real volume doesn't
/// clobber bytes this code doesn't otherwise interpret.
#[derive(Debug, Clone)]
pub struct VeraCryptHeader {
    pub header_format_version: u16,
    pub min_program_version: u16,
    pub reserved1: [u8; 16],
    pub size_hidden_volume: u64,
    pub size_volume: u64,
    pub offset: u64,
    pub size_encrypted: u64,
    pub flags: u32,
    pub sector_size: u32,
    pub reserved2: [u8; 120],
    pub master_keys: [u8; MASTER_KEYS_SIZE],
}

impl Default for VeraCryptHeader {
    fn default() -> Self {
        VeraCryptHeader {
            header_format_version: HEADER_FORMAT_VERSION,
            min_program_version: MIN_PROGRAM_VERSION,
            reserved1: [0u8; 16],
            size_hidden_volume: 0,
            size_volume: 0,
            offset: 0,
            size_encrypted: 0,
            flags: 0,
            sector_size: SECTOR_SIZE as u32,
            reserved2: [0u8; 120],
            master_keys: [0u8; MASTER_KEYS_SIZE],
        }
    }
}

impl VeraCryptHeader {
    /// Parses a decrypted 512-byte header buffer, validating both the
    /// signature and the two CRC-32 checksums.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() != HEADER_SIZE {
            bail!("VeraCrypt header must be {} bytes, got {}", HEADER_SIZE, buf.len());
        }
        if &buf[0..4] != SIGNATURE {
            bail!("not a VeraCrypt header: bad signature");
        }
        let mut cur = Cursor::new(buf);
        cur.set_position(4);
        let header_format_version = cur.read_u16::<BigEndian>()?;
        let min_program_version = cur.read_u16::<BigEndian>()?;
        let checksum_master_keys = cur.read_u32::<BigEndian>()?;
        let mut reserved1 = [0u8; 16];
        cur.read_exact(&mut reserved1)?;
        let size_hidden_volume = cur.read_u64::<BigEndian>()?;
        let size_volume = cur.read_u64::<BigEndian>()?;
        let offset = cur.read_u64::<BigEndian>()?;
        let size_encrypted = cur.read_u64::<BigEndian>()?;
        let flags = cur.read_u32::<BigEndian>()?;
        let sector_size = cur.read_u32::<BigEndian>()?;
        let mut reserved2 = [0u8; 120];
        cur.read_exact(&mut reserved2)?;
        let checksum_header_fields = cur.read_u32::<BigEndian>()?;

        let mut header_fields_crc = crc32fast::Hasher::new();
        header_fields_crc.update(&buf[0..188]);
        if header_fields_crc.finalize() != checksum_header_fields {
            bail!("VeraCrypt header field checksum mismatch");
        }

        let mut master_keys = [0u8; MASTER_KEYS_SIZE];
        master_keys.copy_from_slice(&buf[256..256 + MASTER_KEYS_SIZE]);
        let mut master_keys_crc = crc32fast::Hasher::new();
        master_keys_crc.update(&master_keys);
        if master_keys_crc.finalize() != checksum_master_keys {
            bail!("VeraCrypt master key checksum mismatch");
        }

        Ok(VeraCryptHeader {
            header_format_version,
            min_program_version,
            reserved1,
            size_hidden_volume,
            size_volume,
            offset,
            size_encrypted,
            flags,
            sector_size,
            reserved2,
            master_keys,
        })
    }

    /// Serializes back to a 512-byte plaintext header, recomputing both
    /// checksums.
    pub fn pack(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut buf = [0u8; HEADER_SIZE];
        {
            let mut w = Cursor::new(&mut buf[..]);
            w.write_all(SIGNATURE)?;
            w.write_u16::<BigEndian>(self.header_format_version)?;
            w.write_u16::<BigEndian>(self.min_program_version)?;
            // checksum_master_keys filled in below
            w.write_u32::<BigEndian>(0)?;
            w.write_all(&self.reserved1)?;
            w.write_u64::<BigEndian>(self.size_hidden_volume)?;
            w.write_u64::<BigEndian>(self.size_volume)?;
            w.write_u64::<BigEndian>(self.offset)?;
            w.write_u64::<BigEndian>(self.size_encrypted)?;
            w.write_u32::<BigEndian>(self.flags)?;
            w.write_u32::<BigEndian>(self.sector_size)?;
            w.write_all(&self.reserved2)?;
        }
        buf[256..256 + MASTER_KEYS_SIZE].copy_from_slice(&self.master_keys);

        let mut master_keys_crc = crc32fast::Hasher::new();
        master_keys_crc.update(&self.master_keys);
        let checksum_master_keys = master_keys_crc.finalize();
        (&mut buf[8..12])
            .write_u32::<BigEndian>(checksum_master_keys)
            .context("writing master key checksum")?;

        let mut header_fields_crc = crc32fast::Hasher::new();
        header_fields_crc.update(&buf[0..188]);
        let checksum_header_fields = header_fields_crc.finalize();
        (&mut buf[188..192])
            .write_u32::<BigEndian>(checksum_header_fields)
            .context("writing header field checksum")?;

        Ok(buf)
    }
}

/// Reads exactly `N` bytes from `r` into a fixed-size array.
pub fn read_exact_array<R: Read, const N: usize>(r: &mut R) -> std::io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let mut master_keys = [0u8; MASTER_KEYS_SIZE];
        for (i, b) in master_keys.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        let mut reserved1 = [0u8; 16];
        for (i, b) in reserved1.iter_mut().enumerate() {
            *b = (i * 3 % 256) as u8;
        }
        let mut reserved2 = [0u8; 120];
        for (i, b) in reserved2.iter_mut().enumerate() {
            *b = (i * 7 % 256) as u8;
        }
        let header = VeraCryptHeader {
            header_format_version: 5,
            min_program_version: 0x10b,
            reserved1,
            size_hidden_volume: 0,
            size_volume: 100 * 1024 * 1024 * 1024,
            offset: SECTOR_SIZE as u64 * 256,
            size_encrypted: 100 * 1024 * 1024 * 1024 - SECTOR_SIZE as u64 * 256,
            flags: FLAG_SYSTEM_ENCRYPTION,
            sector_size: SECTOR_SIZE as u32,
            reserved2,
            master_keys,
        };
        let packed = header.pack().unwrap();
        let parsed = VeraCryptHeader::parse(&packed).unwrap();
        assert_eq!(parsed.header_format_version, header.header_format_version);
        assert_eq!(parsed.min_program_version, header.min_program_version);
        assert_eq!(parsed.reserved1, header.reserved1);
        assert_eq!(parsed.size_hidden_volume, header.size_hidden_volume);
        assert_eq!(parsed.size_volume, header.size_volume);
        assert_eq!(parsed.offset, header.offset);
        assert_eq!(parsed.size_encrypted, header.size_encrypted);
        assert_eq!(parsed.flags, header.flags);
        assert_eq!(parsed.sector_size, header.sector_size);
        assert_eq!(parsed.reserved2[..], header.reserved2[..]);
        assert_eq!(parsed.master_keys, header.master_keys);

        let repacked = parsed.pack().unwrap();
        assert_eq!(&repacked[..], &packed[..]);
    }

    #[test]
    fn corrupted_header_fails_checksum() {
        let header = VeraCryptHeader {
            size_volume: 1,
            size_encrypted: 1,
            ..Default::default()
        };
        let mut packed = header.pack().unwrap();
        packed[300] ^= 0xff;
        assert!(VeraCryptHeader::parse(&packed).is_err());
    }

    #[test]
    fn rejects_wrong_signature() {
        let buf = [0u8; HEADER_SIZE];
        assert!(VeraCryptHeader::parse(&buf).is_err());
    }
}
