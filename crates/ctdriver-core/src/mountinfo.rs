//! Parser for the `/proc/<pid>/mountinfo` table.
//!
//! Each row looks like:
//!
//! ```text
//! 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 shared:7 - ext3 /dev/root rw,errors=continue
//! ```
//!
//! Fields before the lone `-` separator are fixed (six of them) followed by
//! zero or more optional tags; after it come the filesystem type, the mount
//! source and the super-block options.

use std::path::PathBuf;

/// One row of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    /// Mount point relative to the process root, with octal escapes decoded.
    pub mount_point: PathBuf,
    /// Optional tags such as `shared:7` or `master:1`.
    pub optional_fields: Vec<String>,
    /// Filesystem type (`ext4`, `cgroup`, `cgroup2`, ...).
    pub fs_type: String,
    /// Mount source.
    pub source: String,
    /// Comma-separated super-block options.
    pub super_options: String,
}

impl MountInfo {
    /// Returns `true` if this mount is a member of a shared peer group.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.optional_fields.iter().any(|f| f.starts_with("shared"))
    }

    /// Iterates over the super-block options.
    pub fn super_options(&self) -> impl Iterator<Item = &str> {
        self.super_options.split(',').filter(|o| !o.is_empty())
    }
}

/// Parses a single mountinfo row. Returns `None` for malformed rows.
#[must_use]
pub fn parse_line(line: &str) -> Option<MountInfo> {
    let mut fields = line.split(' ');
    let mount_point = fields.nth(4)?;
    let _options = fields.next()?;

    let mut optional_fields = Vec::new();
    loop {
        match fields.next()? {
            "-" => break,
            tag => optional_fields.push(tag.to_string()),
        }
    }

    let fs_type = fields.next()?.to_string();
    let source = fields.next()?.to_string();
    let super_options = fields.next().unwrap_or_default().to_string();

    Some(MountInfo {
        mount_point: PathBuf::from(unescape(mount_point)),
        optional_fields,
        fs_type,
        source,
        super_options,
    })
}

/// Parses a whole mount table, skipping blank and malformed rows.
#[must_use]
pub fn parse(table: &str) -> Vec<MountInfo> {
    table
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(parse_line)
        .collect()
}

/// Decodes the `\NNN` octal escapes the kernel uses for spaces, tabs,
/// newlines and backslashes in paths.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let octal = std::str::from_utf8(&bytes[i + 1..i + 4]).ok();
            if let Some(value) = octal.and_then(|o| u8::from_str_radix(o, 8).ok()) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
