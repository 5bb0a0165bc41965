// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Read-only view of `/proc` for namespace introspection
//!
//! Processes come and go while we read. Every accessor maps `NotFound` (and
//! `ESRCH` surfaced as other kinds by some kernels) for a pid to `Ok(None)`
//! so callers treat it as "process exited".

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfoEntry {
    pub mount_id: u32,
    pub parent_id: u32,
    pub major: u32,
    pub minor: u32,
    pub root: PathBuf,
    pub mount_point: PathBuf,
    pub options: String,
    pub fs_type: String,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Numeric entries of the proc root
    pub fn list_pids(&self) -> io::Result<Vec<String>> {
        let mut pids = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let Ok(entry) = entry else { continue };
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) {
                pids.push(name.to_string());
            }
        }
        pids.sort_by_key(|p| p.parse::<u64>().unwrap_or(u64::MAX));
        Ok(pids)
    }

    pub fn mount_namespace(&self, pid: &str) -> io::Result<Option<String>> {
        gone_is_none(crate::infrastructure::namespace::mount_namespace_of(&self.root, pid))
    }

    pub fn mountinfo(&self, pid: &str) -> io::Result<Option<Vec<MountInfoEntry>>> {
        let path = self.root.join(pid).join("mountinfo");
        let content = match gone_is_none(std::fs::read_to_string(path))? {
            Some(content) => content,
            None => return Ok(None),
        };
        Ok(Some(parse_mountinfo(&content)))
    }

    /// Path of `mount_point` as seen from inside `pid`'s root
    pub fn path_in_root(&self, pid: &str, mount_point: &Path) -> PathBuf {
        let relative = mount_point.strip_prefix("/").unwrap_or(mount_point);
        self.root.join(pid).join("root").join(relative)
    }

    /// Whether a block device is mounted anywhere in our own namespace
    pub fn is_device_mounted(&self, major: u32, minor: u32) -> io::Result<bool> {
        Ok(self
            .mountinfo("self")?
            .unwrap_or_default()
            .iter()
            .any(|m| m.major == major && m.minor == minor))
    }
}

fn gone_is_none<T>(result: io::Result<T>) -> io::Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Parse the content of a `mountinfo` file; malformed lines are skipped
pub fn parse_mountinfo(content: &str) -> Vec<MountInfoEntry> {
    content.lines().filter_map(parse_mountinfo_line).collect()
}

fn parse_mountinfo_line(line: &str) -> Option<MountInfoEntry> {
    let (pre, post) = line.split_once(" - ")?;
    let mut pre = pre.split(' ');
    let mount_id = pre.next()?.parse().ok()?;
    let parent_id = pre.next()?.parse().ok()?;
    let (major, minor) = pre.next()?.split_once(':')?;
    let root = pre.next()?;
    let mount_point = pre.next()?;
    let options = pre.next()?;

    let mut post = post.split(' ');
    let fs_type = post.next()?;
    let source = post.next().unwrap_or("");

    Some(MountInfoEntry {
        mount_id,
        parent_id,
        major: major.parse().ok()?,
        minor: minor.parse().ok()?,
        root: PathBuf::from(unescape_octal(root)),
        mount_point: PathBuf::from(unescape_octal(mount_point)),
        options: options.to_string(),
        fs_type: fs_type.to_string(),
        source: unescape_octal(source),
    })
}

/// Undo the kernel's `\NNN` escaping of space, tab, newline and backslash
fn unescape_octal(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + (d - b'0') as u32);
                if let Ok(b) = u8::try_from(value) {
                    out.push(b);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
