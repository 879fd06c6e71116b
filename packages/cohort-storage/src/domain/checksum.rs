//! SHA-256 content checksums for items

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::Result;

/// Checksum every file of a file-set, keyed by its name within the set
///
/// Directories are walked recursively and their files keyed by
/// `<dir name>/<relative path>`.
pub fn file_checksums(paths: &[PathBuf]) -> Result<BTreeMap<String, String>> {
    let mut checksums = BTreeMap::new();
    for path in paths {
        let name = file_name(path);
        if path.is_dir() {
            checksum_dir(path, &name, &mut checksums)?;
        } else {
            checksums.insert(name, checksum_file(path)?);
        }
    }
    Ok(checksums)
}

/// Checksum of a field value over its JSON encoding (object keys sorted)
pub fn value_checksum(value: &serde_json::Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hex(&bytes))
}

/// Collapse a checksum map into one digest
pub fn digest_checksums(checksums: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (name, sum) in checksums {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(sum.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

fn checksum_dir(dir: &Path, prefix: &str, out: &mut BTreeMap<String, String>) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let key = format!("{}/{}", prefix, entry.file_name().to_string_lossy());
        if path.is_dir() {
            checksum_dir(&path, &key, out)?;
        } else {
            out.insert(key, checksum_file(&path)?);
        }
    }
    Ok(())
}

fn checksum_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    Ok(hex(&bytes))
}

fn hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
