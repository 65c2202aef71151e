//! Mount trees: several filesystems presented as one namespace.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use vms_error::{Result, VmsError};
use vms_fs::{
    FileKind, FileStat, FileSystem, FsFile, MAX_SYMLINK_FOLLOWS, join_path, normalize_path,
    parent_and_name,
};

/// Guest operating system a tree was assembled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestOs {
    Linux,
    Windows,
}

/// A filesystem attached at a point of the tree.
#[derive(Clone)]
pub struct MountPoint {
    /// Absolute path in the tree; Windows drives other than `C:` sit at
    /// `/<letter>:`.
    pub point: String,
    /// The fstab spec or drive letter that placed it.
    pub spec: String,
    /// Name of the volume the filesystem lives on.
    pub volume: String,
    pub fs: Arc<dyn FileSystem>,
}

impl fmt::Debug for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountPoint")
            .field("point", &self.point)
            .field("spec", &self.spec)
            .field("volume", &self.volume)
            .field("fs_type", &self.fs.fs_type())
            .finish()
    }
}

/// One guest's filesystems joined at their mount points.
///
/// Every path operation first expands symlinks one component at a time in
/// tree space, since a link on one filesystem may point into another, and
/// then hands the expanded path to the filesystem with the longest matching
/// mount point. The root filesystem owns everything no other mount claims.
///
/// Windows trees accept `X:` prefixes and either separator. `C:` is the
/// tree root and paths without a drive letter resolve on it.
#[derive(Debug)]
pub struct MountTree {
    os: GuestOs,
    mounts: Vec<MountPoint>,
    cwd: Mutex<String>,
}

impl MountTree {
    /// `mounts` must start with the root filesystem at `/`.
    pub(crate) fn new(os: GuestOs, mounts: Vec<MountPoint>) -> Result<Self> {
        match mounts.first() {
            Some(root) if root.point == "/" => {}
            _ => {
                return Err(VmsError::InvalidConfig(
                    "mount tree needs a root filesystem at /".to_owned(),
                ));
            }
        }
        Ok(Self {
            os,
            mounts,
            cwd: Mutex::new("/".to_owned()),
        })
    }

    #[must_use]
    pub fn os(&self) -> GuestOs {
        self.os
    }

    /// Mounts in the order they were added, root first.
    #[must_use]
    pub fn mounts(&self) -> &[MountPoint] {
        &self.mounts
    }

    #[must_use]
    pub fn root(&self) -> &MountPoint {
        &self.mounts[0]
    }

    /// Filesystem owning the tree path `path` (already expanded) and the
    /// path local to it.
    fn owner(&self, path: &str) -> (&MountPoint, String) {
        let mut best = &self.mounts[0];
        for m in &self.mounts[1..] {
            let claims = path == m.point
                || path
                    .strip_prefix(m.point.as_str())
                    .is_some_and(|rest| rest.starts_with('/'));
            if claims && m.point.len() > best.point.len() {
                best = m;
            }
        }
        let local = if best.point == "/" {
            path.to_owned()
        } else {
            match &path[best.point.len()..] {
                "" => "/".to_owned(),
                rest => rest.to_owned(),
            }
        };
        (best, local)
    }

    // ── path translation ───────────────────────────────────────────────────

    /// Tree-space absolute path for a caller path.
    fn locate(&self, path: &str) -> String {
        match self.os {
            GuestOs::Linux => join_path(&self.cwd.lock(), path),
            GuestOs::Windows => {
                let cwd = self.cwd.lock().clone();
                windows_locate(&cwd, path)
            }
        }
    }

    /// Caller-facing form of a tree path.
    fn display(&self, path: &str) -> String {
        match self.os {
            GuestOs::Linux => path.to_owned(),
            GuestOs::Windows => {
                let (drive, local) = split_tree_drive(path);
                format!("{drive}:{local}")
            }
        }
    }

    /// Directory a link target starts from, and the target's path relative
    /// to it. `dir` is the tree directory holding the link.
    fn link_base(&self, dir: &str, target: &str) -> (String, String) {
        match self.os {
            GuestOs::Linux if target.starts_with('/') => ("/".to_owned(), target.to_owned()),
            GuestOs::Linux => (dir.to_owned(), target.to_owned()),
            GuestOs::Windows => {
                let target = target.replace('\\', "/");
                if let Some((letter, rest)) = target.split_once(':') {
                    if let Some(drive) = drive_of_component(&format!("{letter}:")) {
                        return (drive_point(drive), rest.to_owned());
                    }
                }
                if target.starts_with('/') {
                    ("/".to_owned(), target)
                } else {
                    (dir.to_owned(), target)
                }
            }
        }
    }

    /// Step out of `path`, staying inside its drive on Windows.
    fn parent_of(&self, path: &str) -> String {
        if self.os == GuestOs::Windows && is_drive_root(path) {
            return path.to_owned();
        }
        parent_and_name(path).0
    }

    /// Expand every symlink in `path`. The final component is expanded only
    /// when `follow_final` is set.
    fn expand(&self, path: &str, follow_final: bool) -> Result<String> {
        let mut done = "/".to_owned();
        let mut pending: VecDeque<String> = components(path);
        let mut follows = 0_usize;
        while let Some(comp) = pending.pop_front() {
            match comp.as_str() {
                "." => continue,
                ".." => {
                    done = self.parent_of(&done);
                    continue;
                }
                _ => {}
            }
            let candidate = join_path(&done, &comp);
            if pending.is_empty() && !follow_final {
                done = candidate;
                break;
            }
            let (mount, local) = self.owner(&candidate);
            let st = mount.fs.stat(&local).map_err(|err| self.rename(err, &candidate))?;
            if st.kind == FileKind::Symlink {
                follows += 1;
                if follows > MAX_SYMLINK_FOLLOWS {
                    return Err(VmsError::SymlinkLoop(self.display(path)));
                }
                let target = mount.fs.read_link(&local)?;
                let (base, rest) = self.link_base(&done, &target);
                done = base;
                for part in components(&rest).into_iter().rev() {
                    pending.push_front(part);
                }
                continue;
            }
            if !pending.is_empty() && st.kind != FileKind::Directory {
                return Err(VmsError::NotDirectory(self.display(&candidate)));
            }
            done = candidate;
        }
        Ok(done)
    }

    /// Report lookup failures with the tree path rather than the local one.
    fn rename(&self, err: VmsError, path: &str) -> VmsError {
        match err {
            VmsError::NotFound(_) => VmsError::NotFound(self.display(path)),
            VmsError::NotDirectory(_) => VmsError::NotDirectory(self.display(path)),
            other => other,
        }
    }

    fn resolve(&self, path: &str, follow_final: bool) -> Result<(&MountPoint, String, String)> {
        let expanded = self.expand(&self.locate(path), follow_final)?;
        let (mount, local) = self.owner(&expanded);
        Ok((mount, local, expanded))
    }
}

impl FileSystem for MountTree {
    fn fs_type(&self) -> &'static str {
        "mount"
    }

    fn volume_name(&self) -> Option<String> {
        self.root().fs.volume_name()
    }

    fn fs_id(&self) -> String {
        self.root().fs.fs_id()
    }

    /// Free space of the filesystem holding the working directory.
    fn free_bytes(&self) -> Result<u64> {
        let cwd = self.cwd.lock().clone();
        self.owner(&cwd).0.fs.free_bytes()
    }

    fn pwd(&self) -> String {
        self.display(&self.cwd.lock())
    }

    fn chdir(&self, path: &str) -> Result<()> {
        let (mount, local, expanded) = self.resolve(path, true)?;
        let st = mount.fs.stat(&local).map_err(|err| self.rename(err, &expanded))?;
        if st.kind != FileKind::Directory {
            return Err(VmsError::NotDirectory(self.display(&expanded)));
        }
        *self.cwd.lock() = expanded;
        Ok(())
    }

    fn stat(&self, path: &str) -> Result<FileStat> {
        let (mount, local, expanded) = self.resolve(path, false)?;
        mount.fs.stat(&local).map_err(|err| self.rename(err, &expanded))
    }

    fn dir_entries(&self, path: &str) -> Result<Vec<String>> {
        let (mount, local, expanded) = self.resolve(path, true)?;
        mount
            .fs
            .dir_entries(&local)
            .map_err(|err| self.rename(err, &expanded))
    }

    fn read_link(&self, path: &str) -> Result<String> {
        let (mount, local, _) = self.resolve(path, false)?;
        mount.fs.read_link(&local)
    }

    fn open(&self, path: &str) -> Result<FsFile> {
        let (mount, local, expanded) = self.resolve(path, true)?;
        mount.fs.open(&local).map_err(|err| self.rename(err, &expanded))
    }

    fn stat_follow(&self, path: &str) -> Result<FileStat> {
        let (mount, local, expanded) = self.resolve(path, true)?;
        mount.fs.stat(&local).map_err(|err| self.rename(err, &expanded))
    }
}

fn components(path: &str) -> VecDeque<String> {
    path.split('/')
        .filter(|c| !c.is_empty())
        .map(str::to_owned)
        .collect()
}

// ── Windows drive letters ──────────────────────────────────────────────────

/// Tree point of a drive: `C:` is the root, others sit at `/<letter>:`.
pub(crate) fn drive_point(letter: char) -> String {
    let letter = letter.to_ascii_uppercase();
    if letter == 'C' {
        "/".to_owned()
    } else {
        format!("/{letter}:")
    }
}

fn is_drive_root(path: &str) -> bool {
    path == "/" || drive_of_component(path.trim_start_matches('/')).is_some()
}

/// `Some('D')` for a component spelled `D:`.
fn drive_of_component(comp: &str) -> Option<char> {
    let mut chars = comp.chars();
    match (chars.next(), chars.next(), chars.next()) {
        (Some(letter), Some(':'), None) if letter.is_ascii_alphabetic() => {
            Some(letter.to_ascii_uppercase())
        }
        _ => None,
    }
}

/// Split a tree path into drive letter and drive-local path.
fn split_tree_drive(path: &str) -> (char, String) {
    let trimmed = path.trim_start_matches('/');
    let (first, rest) = trimmed.split_once('/').unwrap_or((trimmed, ""));
    match drive_of_component(first) {
        Some(letter) => (letter, format!("/{rest}")),
        None => ('C', path.to_owned()),
    }
}

/// Tree path for a Windows path taken relative to the tree path `cwd`.
/// `..` never leaves the drive it starts on.
fn windows_locate(cwd: &str, path: &str) -> String {
    let path = path.replace('\\', "/");
    let (drive, local) = match path.split_once(':') {
        Some((letter, rest)) if drive_of_component(&format!("{letter}:")).is_some() => {
            let letter = letter.chars().next().map_or('C', |c| c.to_ascii_uppercase());
            (letter, normalize_path(rest))
        }
        _ if path.starts_with('/') => ('C', normalize_path(&path)),
        _ => {
            let (letter, base) = split_tree_drive(cwd);
            (letter, join_path(&base, &path))
        }
    };
    let point = drive_point(drive);
    match (point.as_str(), local.as_str()) {
        ("/", _) => local,
        (_, "/") => point,
        _ => format!("{point}{local}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_paths_map_into_the_tree() {
        assert_eq!(windows_locate("/", r"C:\Windows\System32"), "/Windows/System32");
        assert_eq!(windows_locate("/", "d:/data"), "/D:/data");
        assert_eq!(windows_locate("/", "D:"), "/D:");
        assert_eq!(windows_locate("/", r"\Users"), "/Users");
        assert_eq!(windows_locate("/D:/data", r"..\..\..\x"), "/D:/x");
        assert_eq!(windows_locate("/D:/data", "logs"), "/D:/data/logs");
        assert_eq!(windows_locate("/Windows", ".."), "/");
    }

    #[test]
    fn tree_drive_split() {
        assert_eq!(split_tree_drive("/D:/a/b"), ('D', "/a/b".to_owned()));
        assert_eq!(split_tree_drive("/D:"), ('D', "/".to_owned()));
        assert_eq!(split_tree_drive("/Windows"), ('C', "/Windows".to_owned()));
        assert!(is_drive_root("/E:"));
        assert!(!is_drive_root("/E:/x"));
        assert_eq!(drive_of_component("ab"), None);
        assert_eq!(drive_of_component("1:"), None);
    }
}
