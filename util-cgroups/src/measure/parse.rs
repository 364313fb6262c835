//! Helpers for the kernel's cgroup file formats.
//!
//! Units come and go between scrapes, so every read opens the file anew; the
//! content is always small (a handful of lines at most).

use std::{fs, io, path::Path};

use rustc_hash::FxHashMap;

/// Reads a file that contains a single integer.
pub(crate) fn read_u64(path: &Path) -> io::Result<u64> {
    let content = fs::read_to_string(path)?;
    content.trim().parse().map_err(|_| invalid_data(path, &content))
}

/// Reads a limit file: a single integer, or the literal `max` which maps to
/// the all-ones sentinel.
pub(crate) fn read_limit(path: &Path) -> io::Result<u64> {
    let content = fs::read_to_string(path)?;
    let trimmed = content.trim();
    if trimmed == "max" {
        return Ok(u64::MAX);
    }
    trimmed.parse().map_err(|_| invalid_data(path, &content))
}

/// Reads a `key value` per line file, like `cpu.stat` or `memory.stat`.
///
/// Lines without a parseable `key value` pair are skipped: the keys present
/// depend on the kernel configuration and we only look a few of them up.
pub(crate) fn read_kv(path: &Path) -> io::Result<FxHashMap<String, u64>> {
    let content = fs::read_to_string(path)?;
    let mut map = FxHashMap::default();
    for line in content.lines() {
        if let Some((key, value)) = line.split_once(' ') {
            if let Ok(value) = value.trim().parse() {
                map.insert(key.to_string(), value);
            }
        }
    }
    Ok(map)
}

/// Yields the `key=value` tokens of one line, as found in `io.stat` and
/// `rdma.current`.
pub(crate) fn eq_tokens(line: &str) -> impl Iterator<Item = (&str, u64)> {
    line.split_whitespace().filter_map(|token| {
        let (key, value) = token.split_once('=')?;
        Some((key, value.parse().ok()?))
    })
}

fn invalid_data(path: &Path, content: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected content in {}: {:?}", path.display(), content.trim()),
    )
}
