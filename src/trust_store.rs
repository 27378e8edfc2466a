//! Trust Store (C1): the persisted known-hosts database.
//!
//! Line format and append discipline are grounded on
//! `thrussh-keys/src/lib.rs`'s `check_known_hosts_path` /
//! `learn_known_hosts_path` (plain `hostpattern key_type base64` lines,
//! byte-equal key comparison, append-with-newline-repair on insert);
//! hashed (`|1|salt|hash`) entries and the `OK`/`NEW`/`CHANGED`/`REVOKED`
//! lookup result set follow spec.md §3/§4.1 and the decision table in
//! `examples/original_source/sshconnect.c`'s `check_host_in_hostfile`.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use data_encoding::BASE64;
use hmac::{Hmac, Mac, NewMac};
use rand::RngCore;
use sha1::Sha1;

use crate::error::Result;

type HmacSha1 = Hmac<Sha1>;

/// A bare `(algorithm, wire-encoded blob)` pair. Kept independent of any
/// live transport type so this module is testable with hand-built
/// fixtures, per the "injected transport handle" design note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    pub algorithm: String,
    pub blob: Vec<u8>,
}

impl HostKey {
    pub fn new(algorithm: impl Into<String>, blob: Vec<u8>) -> Self {
        HostKey {
            algorithm: algorithm.into(),
            blob,
        }
    }

    pub fn from_thrussh(key: &thrussh_keys::key::PublicKey) -> Self {
        use thrussh_keys::PublicKeyBase64;
        HostKey::new(key.name().to_string(), key.public_key_bytes())
    }

    fn base64(&self) -> String {
        BASE64.encode(&self.blob)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    New,
    Changed,
    Revoked,
}

#[derive(Debug, Clone)]
pub struct MatchedRecord {
    pub line_number: usize,
    pub key: HostKey,
}

struct ParsedLine {
    hashed: Option<(Vec<u8>, Vec<u8>)>, // (salt, hash)
    patterns: Vec<String>,
    revoked: bool,
    key: HostKey,
}

fn hmac_sha1_hash(salt: &[u8], name: &str) -> Vec<u8> {
    let mut mac = HmacSha1::new_varkey(salt).expect("HMAC accepts any key length");
    mac.update(name.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// The OpenSSH `HashKnownHosts` scheme: `|1|base64(salt)|base64(hmac-sha1(salt, name))`.
fn hash_name(name: &str, salt: &[u8]) -> String {
    let digest = hmac_sha1_hash(salt, name);
    format!("|1|{}|{}", BASE64.encode(salt), BASE64.encode(&digest))
}

fn new_salt() -> Vec<u8> {
    let mut salt = vec![0u8; 20];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

fn parse_line(raw: &str) -> Option<ParsedLine> {
    let line = raw.trim_end_matches(['\r', '\n'].as_ref());
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (revoked, rest) = if let Some(r) = line.strip_prefix("@revoked ") {
        (true, r)
    } else {
        (false, line)
    };
    let mut parts = rest.splitn(3, ' ');
    let host_field = parts.next()?;
    let key_type = parts.next()?;
    let material = parts.next()?;
    let blob = BASE64.decode(material.as_bytes()).ok()?;
    let key = HostKey::new(key_type, blob);

    if let Some(hashed) = host_field.strip_prefix("|1|") {
        let mut hp = hashed.splitn(2, '|');
        let salt = BASE64.decode(hp.next()?.as_bytes()).ok()?;
        let hash = BASE64.decode(hp.next()?.as_bytes()).ok()?;
        Some(ParsedLine {
            hashed: Some((salt, hash)),
            patterns: Vec::new(),
            revoked,
            key,
        })
    } else {
        let patterns = host_field.split(',').map(|s| s.to_string()).collect();
        Some(ParsedLine {
            hashed: None,
            patterns,
            revoked,
            key,
        })
    }
}

fn line_matches(parsed: &ParsedLine, host_key_name: &str) -> bool {
    if let Some((salt, hash)) = &parsed.hashed {
        hmac_sha1_hash(salt, host_key_name) == *hash
    } else {
        parsed.patterns.iter().any(|p| p == host_key_name)
    }
}

/// Stream `file` looking for a line naming `host_key_name`. Per spec.md
/// §4.1: the first matching line wins; if its key type equals the
/// presented type, byte-equal key material yields `OK`, otherwise
/// `CHANGED` (and that line number is reported for diagnostics); a
/// `@revoked` line for a matching name/type always yields `REVOKED`
/// regardless of key material; no matching name line at all yields
/// `NEW`.
pub fn lookup(
    file: &Path,
    host_key_name: &str,
    presented_key: &HostKey,
) -> Result<(Status, Option<MatchedRecord>)> {
    let f = match std::fs::File::open(file) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((Status::New, None));
        }
        Err(e) => return Err(e.into()),
    };
    let reader = BufReader::new(f);
    for (idx, raw) in reader.lines().enumerate() {
        let raw = raw?;
        let line_number = idx + 1;
        let parsed = match parse_line(&raw) {
            Some(p) => p,
            None => continue,
        };
        if !line_matches(&parsed, host_key_name) {
            continue;
        }
        if parsed.revoked && parsed.key.algorithm == presented_key.algorithm {
            return Ok((
                Status::Revoked,
                Some(MatchedRecord {
                    line_number,
                    key: parsed.key,
                }),
            ));
        }
        if parsed.key.algorithm != presented_key.algorithm {
            continue;
        }
        if parsed.key.blob == presented_key.blob {
            return Ok((
                Status::Ok,
                Some(MatchedRecord {
                    line_number,
                    key: parsed.key,
                }),
            ));
        } else {
            return Ok((
                Status::Changed,
                Some(MatchedRecord {
                    line_number,
                    key: parsed.key,
                }),
            ));
        }
    }
    Ok((Status::New, None))
}

/// Return any key of `key_type` recorded for `host_key_name`, regardless
/// of whether it matches a presented key. Used by the "other keys are
/// already known" diagnostic (spec.md §4.2 supplement, grounded on
/// `sshconnect.c`'s `show_other_keys`).
pub fn lookup_any(file: &Path, host_key_name: &str, key_type: &str) -> Result<Option<HostKey>> {
    let f = match std::fs::File::open(file) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let reader = BufReader::new(f);
    for raw in reader.lines() {
        let raw = raw?;
        let parsed = match parse_line(&raw) {
            Some(p) => p,
            None => continue,
        };
        if parsed.key.algorithm == key_type && line_matches(&parsed, host_key_name) {
            return Ok(Some(parsed.key));
        }
    }
    Ok(None)
}

/// Append a new record for `host_key_name`. `hash_flag` selects between
/// a plain-text pattern and a hashed entry; the file is created if
/// necessary and a missing trailing newline is repaired before
/// appending, exactly mirroring `learn_known_hosts_path`.
pub fn insert(file: &Path, host_key_name: &str, key: &HostKey, hash_flag: bool) -> Result<bool> {
    if let Some(parent) = file.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut f = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(file)?;

    let mut ends_in_newline = true;
    let mut buf = [0u8; 1];
    if f.seek(SeekFrom::End(0))? > 0 {
        f.seek(SeekFrom::End(-1))?;
        f.read_exact(&mut buf)?;
        ends_in_newline = buf[0] == b'\n';
    }
    f.seek(SeekFrom::End(0))?;

    let mut w = std::io::BufWriter::new(f);
    if !ends_in_newline {
        w.write_all(b"\n")?;
    }
    let host_field = if hash_flag {
        hash_name(host_key_name, &new_salt())
    } else {
        host_key_name.to_string()
    };
    writeln!(w, "{} {} {}", host_field, key.algorithm, key.base64())?;
    w.flush()?;
    Ok(true)
}

#[cfg(test)]
mod test {
    use super::*;
    use tempdir::TempDir;

    fn key(byte: u8) -> HostKey {
        HostKey::new("ssh-ed25519", vec![byte; 32])
    }

    #[test]
    fn round_trip_insert_then_ok() {
        let dir = TempDir::new("rssh-trust-store").unwrap();
        let path = dir.path().join("known_hosts");
        let k = key(1);
        insert(&path, "example.com", &k, false).unwrap();
        let (status, rec) = lookup(&path, "example.com", &k).unwrap();
        assert_eq!(status, Status::Ok);
        assert_eq!(rec.unwrap().key, k);
    }

    #[test]
    fn changed_key_of_same_type() {
        let dir = TempDir::new("rssh-trust-store").unwrap();
        let path = dir.path().join("known_hosts");
        insert(&path, "example.com", &key(1), false).unwrap();
        let (status, _) = lookup(&path, "example.com", &key(2)).unwrap();
        assert_eq!(status, Status::Changed);
    }

    #[test]
    fn unknown_host_is_new() {
        let dir = TempDir::new("rssh-trust-store").unwrap();
        let path = dir.path().join("known_hosts");
        insert(&path, "example.com", &key(1), false).unwrap();
        let (status, _) = lookup(&path, "other.example.com", &key(1)).unwrap();
        assert_eq!(status, Status::New);
    }

    #[test]
    fn missing_file_is_new() {
        let dir = TempDir::new("rssh-trust-store").unwrap();
        let path = dir.path().join("does-not-exist");
        let (status, _) = lookup(&path, "example.com", &key(1)).unwrap();
        assert_eq!(status, Status::New);
    }

    #[test]
    fn hashed_entry_round_trips() {
        let dir = TempDir::new("rssh-trust-store").unwrap();
        let path = dir.path().join("known_hosts");
        insert(&path, "example.com", &key(1), true).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("|1|"));
        let (status, _) = lookup(&path, "example.com", &key(1)).unwrap();
        assert_eq!(status, Status::Ok);
    }

    #[test]
    fn revoked_entry_rejects_regardless_of_key_material() {
        let dir = TempDir::new("rssh-trust-store").unwrap();
        let path = dir.path().join("known_hosts");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "@revoked example.com ssh-ed25519 {}", key(9).base64()).unwrap();
        let (status, _) = lookup(&path, "example.com", &key(1)).unwrap();
        assert_eq!(status, Status::Revoked);
    }

    #[test]
    fn comma_list_patterns_match_any_member() {
        let dir = TempDir::new("rssh-trust-store").unwrap();
        let path = dir.path().join("known_hosts");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "a.example.com,b.example.com ssh-ed25519 {}", key(1).base64()).unwrap();
        let (status, _) = lookup(&path, "b.example.com", &key(1)).unwrap();
        assert_eq!(status, Status::Ok);
    }
}
