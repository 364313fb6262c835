//! The kernel's cpuset list format: comma-separated integers and inclusive
//! ranges, e.g. `0-3,7,9-11`.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CpusetError {
    #[error("empty cpuset")]
    Empty,
    #[error("invalid cpuset entry: {0:?}")]
    Invalid(String),
}

/// Expands a cpuset list into the CPUs it contains.
pub fn parse_cpuset(list: &str) -> Result<Vec<u32>, CpusetError> {
    let list = list.trim();
    if list.is_empty() {
        return Err(CpusetError::Empty);
    }
    let mut cpus = Vec::new();
    for entry in list.split(',') {
        let (start, end) = match entry.split_once('-') {
            Some((start, end)) => (parse_cpu(start)?, parse_cpu(end)?),
            None => {
                let cpu = parse_cpu(entry)?;
                (cpu, cpu)
            }
        };
        if end < start {
            return Err(CpusetError::Invalid(entry.to_string()));
        }
        cpus.extend(start..=end);
    }
    Ok(cpus)
}

/// Collapses a sorted, duplicate-free list of CPUs back into the kernel's
/// list syntax. Inverse of [`parse_cpuset`].
pub fn format_cpuset(cpus: &[u32]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut i = 0;
    while i < cpus.len() {
        let start = cpus[i];
        let mut end = start;
        while i + 1 < cpus.len() && cpus[i + 1] == end + 1 {
            i += 1;
            end = cpus[i];
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
        i += 1;
    }
    parts.join(",")
}

fn parse_cpu(entry: &str) -> Result<u32, CpusetError> {
    entry
        .trim()
        .parse()
        .map_err(|_| CpusetError::Invalid(entry.to_string()))
}
