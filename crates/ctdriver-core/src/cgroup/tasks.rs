//! Cgroup task list parsing.

use std::num::NonZeroU32;
use std::path::Path;

use ctdriver_common::error::{DriverError, Result};

/// Parses a task list: one process id per non-empty line.
///
/// # Errors
///
/// Returns [`DriverError::InvalidPid`] carrying the offending line if any
/// line is not a valid process id. Zero is never a process id.
pub fn parse_pids(contents: &str) -> Result<Vec<u32>> {
    contents
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<NonZeroU32>()
                .map(NonZeroU32::get)
                .map_err(|source| DriverError::InvalidPid {
                    value: line.to_string(),
                    source,
                })
        })
        .collect()
}

/// Reads and parses the task list file at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains an invalid id.
pub fn read_pids(path: &Path) -> Result<Vec<u32>> {
    let contents = std::fs::read_to_string(path).map_err(|e| DriverError::io(path, e))?;
    parse_pids(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_pid_per_line() {
        assert_eq!(parse_pids("123\n456\n").expect("parse"), vec![123, 456]);
    }

    #[test]
    fn empty_lines_are_skipped() {
        assert_eq!(parse_pids("\n7\n\n8").expect("parse"), vec![7, 8]);
        assert!(parse_pids("").expect("parse").is_empty());
    }

    #[test]
    fn non_numeric_line_is_reported() {
        let err = parse_pids("123\nX\n").unwrap_err();
        match err {
            DriverError::InvalidPid { value, .. } => assert_eq!(value, "X"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_is_not_a_pid() {
        let err = parse_pids("12\n0\n").unwrap_err();
        match err {
            DriverError::InvalidPid { value, source } => {
                assert_eq!(value, "0");
                assert_eq!(*source.kind(), std::num::IntErrorKind::Zero);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unreadable_file_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = read_pids(&dir.path().join("tasks")).unwrap_err();
        assert!(matches!(err, DriverError::Io { .. }));
    }
}
