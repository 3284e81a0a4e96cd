use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::Context;
use walkdir::WalkDir;

/// Deterministic fingerprint of a source tree.
///
/// Regular files are collected, sorted by relative path, hashed
/// individually, and the sorted `"<hash>  <path>\n"` lines are hashed into
/// the final digest. Two trees with the same relative paths and contents
/// fingerprint identically regardless of walk order. `.git` is skipped so
/// VCS bookkeeping does not churn the result.
pub fn dir_fingerprint(root: &Path) -> anyhow::Result<String> {
    let mut entries: Vec<(String, String)> = Vec::new();

    for entry in WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
    {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let hash = file_hash(entry.path())?;
        entries.push((rel, hash));
    }

    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = blake3::Hasher::new();
    for (rel, hash) in &entries {
        hasher.update(hash.as_bytes());
        hasher.update(b"  ");
        hasher.update(rel.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hasher.finalize().to_hex().to_string())
}

fn file_hash(path: &Path) -> anyhow::Result<String> {
    let mut f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}
