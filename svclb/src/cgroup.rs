use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{Error, Result};

const PROC_MOUNTS: &str = "/proc/mounts";

/// Returns the mount point of the first cgroup2 filesystem on the host.
pub fn detect_cgroup2() -> Result<PathBuf> {
    let mounts = std::fs::read_to_string(PROC_MOUNTS)?;
    let path = find_cgroup2(&mounts).ok_or(Error::CgroupNotMounted)?;
    debug!(path = %path.display(), "found cgroup2 mount");
    Ok(path)
}

/// Uses `path` when given, otherwise looks the cgroup2 mount up.
pub fn cgroup_path(path: Option<&Path>) -> Result<PathBuf> {
    match path {
        Some(path) => Ok(path.to_path_buf()),
        None => detect_cgroup2(),
    }
}

/// Parses `/proc/mounts` content: `<source> <target> <fstype> <opts> <dump> <pass>`.
pub fn find_cgroup2(mounts: &str) -> Option<PathBuf> {
    mounts.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let _source = fields.next()?;
        let target = fields.next()?;
        let fstype = fields.next()?;
        (fstype == "cgroup2").then(|| PathBuf::from(unescape_mount_path(target)))
    })
}

// the kernel octal-escapes whitespace and backslashes in mount paths
fn unescape_mount_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut rest = path;
    while let Some(idx) = rest.find('\\') {
        out.push_str(&rest[..idx]);
        let escaped = rest.get(idx + 1..idx + 4);
        match escaped.and_then(|digits| u8::from_str_radix(digits, 8).ok()) {
            Some(byte) => {
                out.push(char::from(byte));
                rest = &rest[idx + 4..];
            }
            None => {
                out.push('\\');
                rest = &rest[idx + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_find_cgroup2() {
        let mounts = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
cgroup /sys/fs/cgroup/cpu cgroup rw,cpu 0 0
cgroup2 /sys/fs/cgroup cgroup2 rw,nosuid,nodev,noexec,relatime,nsdelegate 0 0
cgroup2 /run/other cgroup2 rw 0 0
";
        assert_eq!(find_cgroup2(mounts), Some(PathBuf::from("/sys/fs/cgroup")));
    }

    #[test]
    fn test_find_cgroup2_missing() {
        let mounts = "cgroup /sys/fs/cgroup/memory cgroup rw,memory 0 0\n\n";
        assert_eq!(find_cgroup2(mounts), None);
    }

    #[test]
    fn test_find_cgroup2_escaped_path() {
        let mounts = "none /mnt/my\\040cgroup cgroup2 rw 0 0\n";
        assert_eq!(find_cgroup2(mounts), Some(PathBuf::from("/mnt/my cgroup")));
    }

    #[test]
    fn test_explicit_path_wins() -> crate::Result<()> {
        let path = cgroup_path(Some(Path::new("/sys/fs/cgroup/kubepods")))?;
        assert_eq!(path, PathBuf::from("/sys/fs/cgroup/kubepods"));
        Ok(())
    }
}
