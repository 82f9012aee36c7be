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

//! Credential recovery: resets local account passwords inside the mounted
//! guest filesystem rather than requiring them up front.
//!
//! Windows accounts are reset by patching the NT hash stored in the SAM
//! hive's per-RID `V` value in place; the hive is never rewritten
//! structurally, only the hash bytes inside an existing cell are replaced,
//! following the boot-key derivation and hash obfuscation scheme publicly
//! documented by the Samba and Impacket projects. Linux accounts are reset
//! by replacing their `/etc/shadow` hash with a freshly computed SHA-256
//! crypt (`$5$`) hash.

use anyhow::{bail, Context, Result};
use openssl::hash::{hash, MessageDigest};
use openssl::sha::Sha256;
use openssl::symm::{Cipher, Crypter, Mode};
use std::io::Write;

use crate::hive::Hive;
use crate::model::{CreatorContext, Disk};
use crate::plugin::Plugin;

pub const NEW_PASSWORD: &str = "newpwd";

const LSA_CLASS_NAMES: [&str; 4] = ["JD", "Skew1", "GBG", "Data"];
// Fixed scramble used to derive the SYSKEY boot key from the four LSA
// class-name hex strings.
const BOOTKEY_PERMUTE: [usize; 16] = [0x8, 0x5, 0x4, 0x2, 0xb, 0x9, 0xd, 0x3, 0x0, 0x6, 0x1, 0xc, 0xe, 0xa, 0xf, 0x7];

const QWERTY: &[u8] = b"!@#$%^&*()qwertyUIOPAzxcvbnmQQQQQQQQQQQQ)(*@&%";
const NUMS: &[u8] = b"0123456789012345678901234567890123456789";

/// Resets every non-locked Windows local account found in a mounted SAM
/// hive to [`NEW_PASSWORD`].
#[derive(Default)]
pub struct WindowsSamResetPlugin;

impl Plugin for WindowsSamResetPlugin {
    fn name(&self) -> &str {
        "windows_sam_reset"
    }

    fn modify_filesystem(&self, disk: &mut Disk, volume_id: usize, _ctx: &mut CreatorContext) -> Result<()> {
        let fs_mount = match disk.volume(volume_id).and_then(|v| v.filesystem_mount.clone()) {
            Some(p) => p,
            None => return Ok(()),
        };
        let config_dir = fs_mount.join("Windows").join("System32").join("config");
        let system_path = config_dir.join("SYSTEM");
        let sam_path = config_dir.join("SAM");
        if !system_path.is_file() || !sam_path.is_file() {
            return Ok(());
        }

        let system = Hive::open(&system_path)?;
        let boot_key = bootkey(&system)?;

        let mut sam_bytes = std::fs::read(&sam_path).with_context(|| format!("reading {}", sam_path.display()))?;
        let sam = Hive::open(&sam_path)?;
        let hashed_boot_key = hashed_boot_key(&sam, &boot_key)?;

        let users = sam.key_by_path("SAM\\Domains\\Account\\Users")?;
        let new_nt_hash = nt_hash(NEW_PASSWORD);
        let mut patched = 0u32;
        for user in users.subkeys(&sam)? {
            let name = user.name(&sam);
            let rid = match u32::from_str_radix(&name, 16) {
                Ok(rid) => rid,
                Err(_) => continue,
            };
            let (offset, len) = match user.value_data_location(&sam, "V")? {
                Some(loc) => loc,
                None => continue,
            };
            let v_value = sam_bytes[offset..offset + len].to_vec();
            match patch_v_value(&v_value, rid, &hashed_boot_key, &new_nt_hash) {
                Ok(patched_value) => {
                    sam_bytes[offset..offset + len].copy_from_slice(&patched_value);
                    patched += 1;
                }
                Err(e) => log::warn!("could not reset password for RID {}: {:#}", rid, e),
            }
        }

        if patched > 0 {
            std::fs::write(&sam_path, &sam_bytes).with_context(|| format!("writing {}", sam_path.display()))?;
            log::info!("reset {} Windows account password(s) in {}", patched, sam_path.display());
        }
        Ok(())
    }
}

fn bootkey(system: &Hive) -> Result<[u8; 16]> {
    let lsa = system.key_by_path("ControlSet001\\Control\\Lsa").or_else(|_| {
        system.key_by_path("CurrentControlSet\\Control\\Lsa")
    })?;
    let mut scrambled = Vec::with_capacity(16);
    for name in LSA_CLASS_NAMES {
        let key = lsa
            .subkey(system, name)?
            .with_context(|| format!("Lsa\\{} not found", name))?;
        let class = key.class_name(system).context("missing class name")?;
        let bytes = hex::decode(&class).with_context(|| format!("Lsa\\{} class name is not hex", name))?;
        scrambled.extend_from_slice(&bytes);
    }
    if scrambled.len() != 16 {
        bail!("unexpected boot key material length {}", scrambled.len());
    }
    let mut boot_key = [0u8; 16];
    for (i, &src) in BOOTKEY_PERMUTE.iter().enumerate() {
        boot_key[i] = scrambled[src];
    }
    Ok(boot_key)
}

/// Decrypts the hashed boot key out of `SAM\Domains\Account`'s `F` value,
/// supporting both the legacy RC4 (revision 1) and AES (revision 2)
/// obfuscation formats.
fn hashed_boot_key(sam: &Hive, boot_key: &[u8; 16]) -> Result<[u8; 16]> {
    let account = sam.key_by_path("SAM\\Domains\\Account")?;
    let (offset, len) = account
        .value_data_location(sam, "F")?
        .context("SAM\\Domains\\Account\\F value not found")?;
    let f = &sam.data[offset..offset + len];
    if f.len() < 0x90 {
        bail!("F value too short ({} bytes)", f.len());
    }
    let revision = u32::from_le_bytes(f[0..4].try_into().unwrap());
    let mut out = [0u8; 16];
    if revision == 2 {
        let salt: [u8; 16] = f[0x68..0x78].try_into().unwrap();
        let encrypted = &f[0x80..0x80 + 32];
        let plain = aes_cbc_decrypt(boot_key, &salt, encrypted)?;
        out.copy_from_slice(&plain[0..16]);
    } else {
        let data = &f[0x70..0x80];
        let mut rc4_input = Vec::new();
        rc4_input.extend_from_slice(&data[0..16]);
        rc4_input.extend_from_slice(QWERTY);
        rc4_input.extend_from_slice(boot_key);
        rc4_input.extend_from_slice(NUMS);
        let rc4_key = md5(&rc4_input);
        let decrypted = rc4(&rc4_key, &f[0x80..0x90])?;
        out.copy_from_slice(&decrypted[0..16]);
    }
    Ok(out)
}

/// Replaces the NT hash embedded in a user's `V` value with `new_hash`,
/// re-encrypting it the same way it was found (legacy RC4+DES or AES),
/// keyed on the account's RID so the obfuscation key matches.
fn patch_v_value(v_value: &[u8], rid: u32, hashed_boot_key: &[u8; 16], new_hash: &[u8; 16]) -> Result<Vec<u8>> {
    // The V value is a structured blob of offset/length/type triples
    // (an "SAM_USER_HASH" table) starting at a fixed header; the NT hash
    // record is the third triple (after name and LM hash), conventionally
    // located at a fixed offset into the trailing data blob for accounts
    // without additional SID history.
    const HASH_RECORD_OFFSET_FIELD: usize = 0x9c;
    let header_len = u32::from_le_bytes(v_value[HASH_RECORD_OFFSET_FIELD..HASH_RECORD_OFFSET_FIELD + 4].try_into()?);
    let data_start = 0xCC + header_len as usize;
    if data_start + 20 > v_value.len() {
        bail!("V value too short to contain an NT hash record");
    }
    let record = &v_value[data_start..data_start + 20];
    let revision = record[2];
    let mut patched = v_value.to_vec();

    if revision == 2 {
        let salt = record[4..20].to_vec();
        let encrypted_start = data_start + 20;
        let encrypted = &v_value[encrypted_start..encrypted_start + 16];
        let mut key_material = Vec::new();
        key_material.extend_from_slice(hashed_boot_key);
        key_material.extend_from_slice(&salt);
        key_material.extend_from_slice(b"NTPASSWORD\0");
        let key = sha256(&key_material);
        let new_encrypted = aes_cbc_encrypt_nopad(&key[0..16], &salt[0..16], new_hash)?;
        patched[encrypted_start..encrypted_start + 16].copy_from_slice(&new_encrypted);
    } else {
        let encrypted_start = data_start + 4;
        let mut rc4_input = Vec::new();
        rc4_input.extend_from_slice(hashed_boot_key);
        rc4_input.extend_from_slice(&rid.to_le_bytes());
        rc4_input.extend_from_slice(NT_PASSWORD_MAGIC);
        let rc4_key = md5(&rc4_input);
        let new_encrypted = rc4(&rc4_key, new_hash)?;
        patched[encrypted_start..encrypted_start + 16].copy_from_slice(&new_encrypted);
    }
    Ok(patched)
}

const NT_PASSWORD_MAGIC: &[u8] = b"NTPASSWORD\0";

fn nt_hash(password: &str) -> [u8; 16] {
    let utf16: Vec<u8> = password.encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
    let digest = hash(MessageDigest::md4(), &utf16).expect("MD4 available");
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    out
}

fn md5(data: &[u8]) -> Vec<u8> {
    hash(MessageDigest::md5(), data).expect("MD5 available").to_vec()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finish()
}

fn rc4(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let cipher = Cipher::rc4();
    let mut crypter = Crypter::new(cipher, Mode::Encrypt, key, None)?;
    let mut out = vec![0u8; data.len() + cipher.block_size()];
    let mut count = crypter.update(data, &mut out)?;
    count += crypter.finalize(&mut out[count..])?;
    out.truncate(count);
    Ok(out)
}

fn aes_cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    let cipher = Cipher::aes_128_cbc();
    let mut crypter = Crypter::new(cipher, Mode::Decrypt, key, Some(iv))?;
    crypter.pad(false);
    let mut out = vec![0u8; data.len() + cipher.block_size()];
    let mut count = crypter.update(data, &mut out)?;
    count += crypter.finalize(&mut out[count..])?;
    out.truncate(count);
    Ok(out)
}

fn aes_cbc_encrypt_nopad(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let cipher = Cipher::aes_128_cbc();
    let mut crypter = Crypter::new(cipher, Mode::Encrypt, key, Some(iv))?;
    crypter.pad(false);
    let mut out = vec![0u8; data.len() + cipher.block_size()];
    let mut count = crypter.update(data, &mut out)?;
    count += crypter.finalize(&mut out[count..])?;
    out.truncate(count);
    Ok(out)
}

/// Resets every account in `/etc/shadow` that has a real hash (not empty,
/// not locked with `!` or `*`) to [`NEW_PASSWORD`].
#[derive(Default)]
pub struct ShadowResetPlugin;

impl Plugin for ShadowResetPlugin {
    fn name(&self) -> &str {
        "shadow_reset"
    }

    fn modify_filesystem(&self, disk: &mut Disk, volume_id: usize, _ctx: &mut CreatorContext) -> Result<()> {
        let fs_mount = match disk.volume(volume_id).and_then(|v| v.filesystem_mount.clone()) {
            Some(p) => p,
            None => return Ok(()),
        };
        let shadow_path = fs_mount.join("etc").join("shadow");
        if !shadow_path.is_file() {
            return Ok(());
        }
        let contents = std::fs::read_to_string(&shadow_path).with_context(|| format!("reading {}", shadow_path.display()))?;

        let mut changed = 0u32;
        let mut out_lines = Vec::new();
        for line in contents.lines() {
            let mut fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 2 {
                out_lines.push(line.to_string());
                continue;
            }
            let hash = fields[1];
            if hash.is_empty() || hash.starts_with('!') || hash.starts_with('*') {
                out_lines.push(line.to_string());
                continue;
            }
            let new_hash = sha256_crypt(NEW_PASSWORD.as_bytes(), &random_salt());
            fields[1] = &new_hash;
            out_lines.push(fields.join(":"));
            changed += 1;
        }

        if changed > 0 {
            let mut f = std::fs::File::create(&shadow_path).with_context(|| format!("writing {}", shadow_path.display()))?;
            for line in &out_lines {
                writeln!(f, "{}", line)?;
            }
            log::info!("reset {} Linux account password(s) in {}", changed, shadow_path.display());
        }
        Ok(())
    }
}

fn random_salt() -> String {
    use rand::RngCore;
    const ALPHABET: &[u8] = b"./ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    raw.iter().map(|b| ALPHABET[*b as usize % ALPHABET.len()] as char).collect()
}

const SHA256_ROUNDS: usize = 5000;
const B64_TABLE: &[u8] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// A from-scratch implementation of glibc's `$5$` SHA-256 crypt, following
/// Ulrich Drepper's published algorithm.
fn sha256_crypt(password: &[u8], salt: &str) -> String {
    let salt = &salt.as_bytes()[..salt.len().min(16)];

    let mut b_ctx = Sha256::new();
    b_ctx.update(password);
    b_ctx.update(salt);
    b_ctx.update(password);
    let digest_b = b_ctx.finish();

    let mut a_ctx = Sha256::new();
    a_ctx.update(password);
    a_ctx.update(salt);
    let mut remaining = password.len();
    while remaining > 32 {
        a_ctx.update(&digest_b);
        remaining -= 32;
    }
    a_ctx.update(&digest_b[..remaining]);
    let mut plen = password.len();
    while plen > 0 {
        if plen & 1 != 0 {
            a_ctx.update(&digest_b);
        } else {
            a_ctx.update(password);
        }
        plen >>= 1;
    }
    let mut digest_a = a_ctx.finish();

    let mut dp_ctx = Sha256::new();
    for _ in 0..password.len() {
        dp_ctx.update(password);
    }
    let dp = dp_ctx.finish();
    let mut p_seq = Vec::with_capacity(password.len());
    while p_seq.len() < password.len() {
        let take = (password.len() - p_seq.len()).min(32);
        p_seq.extend_from_slice(&dp[..take]);
    }

    let mut ds_ctx = Sha256::new();
    let repeat = 16 + digest_a[0] as usize;
    for _ in 0..repeat {
        ds_ctx.update(salt);
    }
    let ds = ds_ctx.finish();
    let mut s_seq = Vec::with_capacity(salt.len());
    while s_seq.len() < salt.len() {
        let take = (salt.len() - s_seq.len()).min(32);
        s_seq.extend_from_slice(&ds[..take]);
    }

    for i in 0..SHA256_ROUNDS {
        let mut ctx = Sha256::new();
        if i % 2 != 0 {
            ctx.update(&p_seq);
        } else {
            ctx.update(&digest_a);
        }
        if i % 3 != 0 {
            ctx.update(&s_seq);
        }
        if i % 7 != 0 {
            ctx.update(&p_seq);
        }
        if i % 2 != 0 {
            ctx.update(&digest_a);
        } else {
            ctx.update(&p_seq);
        }
        digest_a = ctx.finish();
    }

    fn b64_3(out: &mut String, a: u8, b: u8, c: u8, n: usize) {
        let mut w = ((a as u32) << 16) | ((b as u32) << 8) | c as u32;
        for _ in 0..n {
            out.push(B64_TABLE[(w & 0x3f) as usize] as char);
            w >>= 6;
        }
    }

    let d = digest_a;
    let mut encoded = String::new();
    b64_3(&mut encoded, d[0], d[10], d[20], 4);
    b64_3(&mut encoded, d[21], d[1], d[11], 4);
    b64_3(&mut encoded, d[12], d[22], d[2], 4);
    b64_3(&mut encoded, d[3], d[13], d[23], 4);
    b64_3(&mut encoded, d[24], d[4], d[14], 4);
    b64_3(&mut encoded, d[15], d[25], d[5], 4);
    b64_3(&mut encoded, d[6], d[16], d[26], 4);
    b64_3(&mut encoded, d[27], d[7], d[17], 4);
    b64_3(&mut encoded, d[18], d[28], d[8], 4);
    b64_3(&mut encoded, d[9], d[19], d[29], 4);
    b64_3(&mut encoded, 0, d[31], d[30], 3);

    format!("$5${}${}", String::from_utf8_lossy(salt), encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_crypt_is_stable_for_same_salt() {
        let a = sha256_crypt(b"newpwd", "abcdefghijklmnop");
        let b = sha256_crypt(b"newpwd", "abcdefghijklmnop");
        assert_eq!(a, b);
        assert!(a.starts_with("$5$abcdefghijklmnop$"));
    }

    #[test]
    fn sha256_crypt_differs_by_password() {
        let a = sha256_crypt(b"newpwd", "samesaltsamesalt");
        let b = sha256_crypt(b"otherpwd", "samesaltsamesalt");
        assert_ne!(a, b);
    }

    #[test]
    fn nt_hash_is_deterministic() {
        assert_eq!(nt_hash("newpwd"), nt_hash("newpwd"));
        assert_ne!(nt_hash("newpwd"), nt_hash("otherpwd"));
    }
}
