//! File-identity snapshots used for optimistic concurrency control.

use std::fs;
#[cfg(unix)]
use std::os::unix::fs::MetadataExt;
use std::time::SystemTime;

/// Identity of one observed file version.
///
/// Two snapshots match iff they observe the same underlying file (device +
/// inode where available) with identical size and modification time. The
/// same-file predicate survives replacement by rename: a renamed-over file
/// gets a new inode, so a stale observer conflicts even when size and
/// mtime happen to collide.
#[derive(Debug, Clone)]
pub(crate) struct FileSnapshot {
    #[cfg(unix)]
    dev: u64,
    #[cfg(unix)]
    ino: u64,
    len: u64,
    modified: Option<SystemTime>,
    permissions: fs::Permissions,
}

impl FileSnapshot {
    pub(crate) fn of(meta: &fs::Metadata) -> Self {
        FileSnapshot {
            #[cfg(unix)]
            dev: meta.dev(),
            #[cfg(unix)]
            ino: meta.ino(),
            len: meta.len(),
            modified: meta.modified().ok(),
            permissions: meta.permissions(),
        }
    }

    pub(crate) fn matches(&self, other: &FileSnapshot) -> bool {
        self.same_file(other) && self.len == other.len && self.modified == other.modified
    }

    #[cfg(unix)]
    fn same_file(&self, other: &FileSnapshot) -> bool {
        self.dev == other.dev && self.ino == other.ino
    }

    #[cfg(not(unix))]
    fn same_file(&self, _other: &FileSnapshot) -> bool {
        // No inode concept; size and mtime carry the comparison.
        true
    }

    /// Permission bits of the observed file, copied onto replacement temp
    /// files before rename.
    pub(crate) fn permissions(&self) -> fs::Permissions {
        self.permissions.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn snapshot_matches_itself_and_detects_growth() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("f.json");
        fs::write(&path, b"{}").expect("write");

        let first = FileSnapshot::of(&fs::metadata(&path).expect("stat"));
        assert!(first.matches(&FileSnapshot::of(&fs::metadata(&path).expect("stat"))));

        let mut f = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open");
        f.write_all(b"\n\n").expect("append");
        drop(f);

        let second = FileSnapshot::of(&fs::metadata(&path).expect("stat"));
        assert!(!first.matches(&second), "size change must be detected");
    }

    #[cfg(unix)]
    #[test]
    fn rename_replacement_changes_identity() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("f.json");
        fs::write(&path, b"{}").expect("write");
        let first = FileSnapshot::of(&fs::metadata(&path).expect("stat"));

        // Replace with a different inode of identical length.
        let tmp = dir.path().join("f.json.tmp-test");
        fs::write(&tmp, b"{}").expect("write tmp");
        fs::rename(&tmp, &path).expect("rename");

        let second = FileSnapshot::of(&fs::metadata(&path).expect("stat"));
        assert!(!first.matches(&second), "inode change must be detected");
    }
}
