//! Unicode escapes in cgroup names.
//!
//! libvirt writes machine scopes with escaped characters, for example
//! `machine-qemu\x2d1\x2dinstance-0000000a.scope`. The escapes must be decoded
//! before a resource-manager id can be extracted from the path.

use std::fmt;

/// Error returned when a path contains a malformed `\xNN` escape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnescapeError {
    /// Byte offset of the offending escape.
    pub position: usize,
}

impl std::error::Error for UnescapeError {}

impl fmt::Display for UnescapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed \\xNN escape at byte {}", self.position)
    }
}

/// Decodes `\xNN` escape sequences into the characters they stand for.
/// Everything else is copied verbatim.
pub fn unescape_path(path: &str) -> Result<String, UnescapeError> {
    let mut out = String::with_capacity(path.len());
    let mut rest = path;
    let mut offset = 0;
    while let Some(pos) = rest.find("\\x") {
        out.push_str(&rest[..pos]);
        let hex = rest.get(pos + 2..pos + 4).ok_or(UnescapeError {
            position: offset + pos,
        })?;
        let value = u8::from_str_radix(hex, 16).map_err(|_| UnescapeError {
            position: offset + pos,
        })?;
        out.push(value as char);
        offset += pos + 4;
        rest = &rest[pos + 4..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Re-encodes the characters that systemd-style cgroup names escape.
///
/// `unescape_path(&escape_path(s))` is the identity for any `s`.
pub fn escape_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            '-' | '\\' => out.push_str(&format!("\\x{:02x}", c as u32)),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn unescape_libvirt_scope() {
        let escaped = r"/machine.slice/machine-qemu\x2d1\x2dinstance\x2d0000000a.scope";
        let decoded = unescape_path(escaped).unwrap();
        assert_eq!(decoded, "/machine.slice/machine-qemu-1-instance-0000000a.scope");
    }

    #[test]
    fn unescape_plain_path_is_identity() {
        let plain = "/system.slice/slurmstepd.scope/job_42";
        assert_eq!(unescape_path(plain).unwrap(), plain);
    }

    #[test]
    fn unescape_rejects_truncated_escape() {
        assert_eq!(unescape_path(r"abc\x2").unwrap_err(), UnescapeError { position: 3 });
        assert_eq!(unescape_path(r"abc\xzz").unwrap_err(), UnescapeError { position: 3 });
    }

    #[test]
    fn escape_then_unescape_round_trips() {
        for s in [
            "machine-qemu-1-instance-0000000a.scope",
            "no escapes here",
            r"already\x2descaped",
            "",
            "-",
        ] {
            assert_eq!(unescape_path(&escape_path(s)).unwrap(), s);
        }
    }
}
