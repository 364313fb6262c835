//! Pressure Stall Information files (`cpu.pressure`, `memory.pressure`,
//! `io.pressure`), unified hierarchy only.

/// Extracts the total `full` stall time from a PSI file, in seconds.
/// The kernel reports the total in microseconds.
///
/// Returns `None` when the file has no parseable `full` line, e.g. for the
/// CPU controller on kernels that only report `some`.
pub fn full_stall_seconds(content: &str) -> Option<f64> {
    for line in content.lines() {
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("full") {
            continue;
        }
        for token in tokens {
            if let Some(value) = token.strip_prefix("total=") {
                return value.parse::<u64>().ok().map(|usec| usec as f64 / 1e6);
            }
        }
    }
    None
}
