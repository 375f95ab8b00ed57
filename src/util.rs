use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;

pub fn ensure_dir(p: &Path) -> Result<()> {
    std::fs::create_dir_all(p).with_context(|| format!("create_dir_all {}", p.display()))
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

pub fn unix_seconds() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Stable digest over a config string and the contents of every input file.
/// Directories are walked one level deep in name order; missing paths are
/// skipped.
pub fn fingerprint(cfg_norm: &str, inputs: &[&Path]) -> Result<String> {
    let mut h = Sha256::new();
    h.update(cfg_norm.as_bytes());

    for input in inputs {
        for path in files_under(input)? {
            h.update(path.display().to_string().as_bytes());
            let mut f = File::open(&path)
                .with_context(|| format!("open {}", path.display()))?;
            let mut buf = vec![0u8; 1024 * 1024];
            loop {
                let n = f.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                h.update(&buf[..n]);
            }
        }
    }

    Ok(format!("{:x}", h.finalize()))
}

fn files_under(p: &Path) -> Result<Vec<PathBuf>> {
    if p.is_file() {
        return Ok(vec![p.to_path_buf()]);
    }
    if !p.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(p).with_context(|| format!("read_dir {}", p.display()))? {
        let path = entry?.path();
        if path.is_file() {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}
