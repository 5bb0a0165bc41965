// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Private mount namespace for the engine process
//!
//! Must run before any threads are spawned: `unshare(CLONE_NEWNS)` only
//! affects the calling thread, so the CLI calls it before building the tokio
//! runtime. Mounts made afterwards (the data filesystem and the reference
//! marker tmpfs) disappear with the namespace when the process dies, which
//! is what lets the orphan scanner detect abandoned images.

use std::ffi::CString;
use std::io;
use std::path::Path;

pub fn enter_private_mount_namespace() -> io::Result<()> {
    // SAFETY: plain syscalls with no pointers except the constant path below
    let rc = unsafe { libc::unshare(libc::CLONE_NEWNS) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    let root = CString::new("/").map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `root` outlives the call; null source/fstype/data are allowed
    // for a propagation change.
    let rc = unsafe {
        libc::mount(
            std::ptr::null(),
            root.as_ptr(),
            std::ptr::null(),
            libc::MS_REC | libc::MS_PRIVATE,
            std::ptr::null(),
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    tracing::debug!("Entered private mount namespace");
    Ok(())
}

/// Mount namespace link target of a process, e.g. `mnt:[4026531841]`
pub fn mount_namespace_of(proc_root: &Path, pid: &str) -> io::Result<String> {
    let link = std::fs::read_link(proc_root.join(pid).join("ns").join("mnt"))?;
    Ok(link.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_namespace_link() {
        let root = tempfile::tempdir().unwrap();
        let ns = root.path().join("42").join("ns");
        std::fs::create_dir_all(&ns).unwrap();
        std::os::unix::fs::symlink("mnt:[4026531841]", ns.join("mnt")).unwrap();

        assert_eq!(mount_namespace_of(root.path(), "42").unwrap(), "mnt:[4026531841]");
        assert!(mount_namespace_of(root.path(), "43").is_err());
    }
}
