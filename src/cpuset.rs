//! CPU list parsing and formatting.
//!
//! Linux exposes core sets in sysfs (`online`, `related_cpus`,
//! `thread_siblings_list`) using the same list syntax as taskset/numactl:
//! `"0-3,8-11"`, `"0,2,4,6"`. Placements are logged in the same syntax.

use crate::error::{Result, TuneError};

/// Parse a CPU list into sorted, deduplicated CPU IDs.
///
/// ```
/// use tuneloop::cpuset::parse_cpuset;
///
/// assert_eq!(parse_cpuset("0-3,8-9").unwrap(), vec![0, 1, 2, 3, 8, 9]);
/// assert_eq!(parse_cpuset("4,2,2").unwrap(), vec![2, 4]);
/// ```
///
/// # Errors
///
/// Returns `TuneError::InvalidCpuSet` if the string is empty or malformed.
pub fn parse_cpuset(s: &str) -> Result<Vec<usize>> {
    let parse_id = |text: &str, part: &str| -> Result<usize> {
        text.trim()
            .parse()
            .map_err(|_| TuneError::InvalidCpuSet(format!("invalid CPU ID in '{part}'")))
    };

    let mut cpus = Vec::new();
    for part in s.trim().split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let (lo, hi) = (parse_id(lo, part)?, parse_id(hi, part)?);
                if lo > hi {
                    return Err(TuneError::InvalidCpuSet(format!(
                        "descending range in '{part}'"
                    )));
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(parse_id(part, part)?),
        }
    }

    if cpus.is_empty() {
        return Err(TuneError::InvalidCpuSet(format!("no CPU IDs in '{s}'")));
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

/// Format CPU IDs as a compact list, collapsing consecutive runs.
///
/// ```
/// use tuneloop::cpuset::format_cpuset;
///
/// assert_eq!(format_cpuset(&[0, 1, 2, 3, 8, 10, 11]), "0-3,8,10-11");
/// ```
pub fn format_cpuset(cpus: &[usize]) -> String {
    let mut sorted = cpus.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
    }
    parts.join(",")
}

/// CPU IDs this process may run on, via `core_affinity`.
pub fn available_cpus() -> Vec<usize> {
    core_affinity::get_core_ids()
        .map(|ids| ids.into_iter().map(|id| id.id).collect())
        .unwrap_or_default()
}

/// Check that every CPU in `cpus` is in the process affinity mask.
///
/// # Errors
///
/// Returns `TuneError::CpuNotAvailable` for the first missing CPU.
pub fn validate_cpuset(cpus: &[usize]) -> Result<()> {
    let available = available_cpus();
    match cpus.iter().find(|c| !available.contains(c)) {
        Some(&missing) => Err(TuneError::CpuNotAvailable(missing)),
        None => Ok(()),
    }
}
