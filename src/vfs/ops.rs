//! File operations over a computer's mount table.
//!
//! Each call locks the table only long enough to resolve the path, then does
//! its I/O on the resolved location, so a concurrent mount change affects the
//! next call and never one already in flight.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use super::FsError;
use super::mount::{Location, MountTable, ResolveOptions, Resolved};
use super::path::{combine, normalize, normalize_pattern, wildcard_regex};
use super::virtual_fs::{VirtualEntry, VirtualRegistry};

/// Host files that are never shown to guests.
const HIDDEN: &[&str] = &[".DS_Store", "desktop.ini"];

/// Sandboxed filesystem view for one computer.
#[derive(Clone)]
pub struct SandboxFs {
    mounts: Arc<Mutex<MountTable>>,
    images: Arc<VirtualRegistry>,
}

impl SandboxFs {
    pub fn new(mounts: Arc<Mutex<MountTable>>, images: Arc<VirtualRegistry>) -> Self {
        Self { mounts, images }
    }

    pub fn mounts(&self) -> MutexGuard<'_, MountTable> {
        self.mounts.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn images(&self) -> &VirtualRegistry {
        &self.images
    }

    pub fn resolve(&self, path: &str, opts: ResolveOptions) -> Result<Resolved, FsError> {
        self.mounts().resolve(path, opts, &self.images)
    }

    /// Sorted directory listing, including mount points below `path`.
    pub fn list(&self, path: &str) -> Result<Vec<String>, FsError> {
        let segments = normalize(path).ok_or_else(|| FsError::NotFound(path.to_string()))?;
        self.list_segments(path, &segments)
    }

    fn list_segments(&self, display: &str, segments: &[String]) -> Result<Vec<String>, FsError> {
        let (resolved, mount_names) = {
            let table = self.mounts();
            let resolved =
                table.resolve_segments(display, segments.to_vec(), ResolveOptions::all(), &self.images);
            (resolved, table.mounts_under(segments))
        };

        let mut names: BTreeSet<String> = mount_names.into_iter().collect();
        let mut any_dir = !names.is_empty();
        if let Ok(resolved) = resolved {
            for location in &resolved.candidates {
                if !location.is_dir(&self.images) {
                    continue;
                }
                any_dir = true;
                match location {
                    Location::Real(dir) => {
                        let entries = std::fs::read_dir(dir).map_err(|e| FsError::io(display, e))?;
                        for entry in entries.flatten() {
                            names.insert(entry.file_name().to_string_lossy().into_owned());
                        }
                    }
                    Location::Virtual { image, path } => {
                        if let Some(node) = self.images.lookup(*image, path) {
                            names.extend(node.child_names());
                        }
                    }
                }
            }
        } else if names.is_empty() {
            return Err(FsError::NotFound(display.to_string()));
        }

        if !any_dir {
            return Err(FsError::NotADirectory(display.to_string()));
        }
        names.retain(|n| !HIDDEN.contains(&n.as_str()));
        Ok(names.into_iter().collect())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path, ResolveOptions::read()).is_ok()
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.resolve(path, ResolveOptions::all())
            .is_ok_and(|r| r.is_mount_point() || r.candidates.iter().any(|c| c.is_dir(&self.images)))
    }

    /// Read-only if the covering mount is, or the host file itself is.
    pub fn is_read_only(&self, path: &str) -> Result<bool, FsError> {
        let resolved = self.resolve(path, ResolveOptions::default())?;
        if resolved.read_only {
            return Ok(true);
        }
        Ok(match resolved.location() {
            Location::Real(p) => p.metadata().is_ok_and(|m| m.permissions().readonly()),
            Location::Virtual { .. } => true,
        })
    }

    pub fn size(&self, path: &str) -> Result<u64, FsError> {
        let resolved = self.resolve(path, ResolveOptions::read())?;
        match resolved.location() {
            Location::Real(p) => {
                let meta = p.metadata().map_err(|e| FsError::io(path, e))?;
                Ok(if meta.is_dir() { 0 } else { meta.len() })
            }
            Location::Virtual { image, path: inner } => Ok(self
                .images
                .lookup(*image, inner)
                .map(|n| n.size())
                .unwrap_or(0)),
        }
    }

    /// Drive label for an existing path.
    pub fn drive(&self, path: &str) -> Result<String, FsError> {
        self.resolve(path, ResolveOptions::read())?;
        self.mounts().drive(path)
    }

    pub fn read(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let resolved = self.resolve(path, ResolveOptions::read())?;
        match resolved.location() {
            Location::Real(p) => {
                if p.is_dir() {
                    return Err(FsError::IsADirectory(path.to_string()));
                }
                std::fs::read(p).map_err(|e| FsError::io(path, e))
            }
            Location::Virtual { image, path: inner } => {
                match self.images.lookup(*image, inner) {
                    Some(VirtualEntry::File(data)) => Ok(data),
                    Some(VirtualEntry::Dir(_)) => Err(FsError::IsADirectory(path.to_string())),
                    None => Err(FsError::NotFound(path.to_string())),
                }
            }
        }
    }

    /// Write `data`, creating parent directories. Appends when `append`.
    pub fn write(&self, path: &str, data: &[u8], append: bool) -> Result<(), FsError> {
        let resolved = self.resolve(path, ResolveOptions::write())?;
        if resolved.is_mount_point() {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        let target = real_target(&resolved, path)?;
        if target.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FsError::io(path, e))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(target)
            .map_err(|e| FsError::io(path, e))?;
        file.write_all(data).map_err(|e| FsError::io(path, e))
    }

    pub fn make_dir(&self, path: &str) -> Result<(), FsError> {
        let resolved = self.resolve(path, ResolveOptions::write())?;
        let target = real_target(&resolved, path)?;
        if target.is_file() {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        std::fs::create_dir_all(target).map_err(|e| FsError::io(path, e))
    }

    pub fn delete(&self, path: &str) -> Result<(), FsError> {
        let resolved = self.resolve(path, ResolveOptions { must_exist: true, for_write: true, want_all: false })?;
        if resolved.is_mount_point() {
            return Err(FsError::MountPoint(path.to_string()));
        }
        let target = real_target(&resolved, path)?;
        let result = if target.is_dir() {
            std::fs::remove_dir_all(target)
        } else {
            std::fs::remove_file(target)
        };
        result.map_err(|e| FsError::io(path, e))
    }

    /// Move a file or directory. Falls back to copy-then-delete across
    /// devices.
    pub fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        let source = self.resolve(from, ResolveOptions { must_exist: true, for_write: true, want_all: false })?;
        if source.is_mount_point() {
            return Err(FsError::MountPoint(from.to_string()));
        }
        let dest = self.prepare_destination(from, to, &source)?;
        let src_path = real_target(&source, from)?;
        if std::fs::rename(src_path, &dest).is_ok() {
            return Ok(());
        }
        debug!(from, to, "rename failed, copying instead");
        copy_real(src_path, &dest).map_err(|e| FsError::io(to, e))?;
        self.delete(from)
    }

    pub fn copy(&self, from: &str, to: &str) -> Result<(), FsError> {
        let source = self.resolve(from, ResolveOptions::read())?;
        let dest = self.prepare_destination(from, to, &source)?;
        match source.location() {
            Location::Real(p) => copy_real(p, &dest).map_err(|e| FsError::io(to, e)),
            Location::Virtual { image, path } => {
                let node = self
                    .images
                    .lookup(*image, path)
                    .ok_or_else(|| FsError::NotFound(from.to_string()))?;
                copy_virtual(&node, &dest).map_err(|e| FsError::io(to, e))
            }
        }
    }

    fn prepare_destination(
        &self,
        from: &str,
        to: &str,
        source: &Resolved,
    ) -> Result<std::path::PathBuf, FsError> {
        let dest = self.resolve(to, ResolveOptions::write())?;
        if dest.is_mount_point() {
            return Err(FsError::MountPoint(to.to_string()));
        }
        if dest.location().exists(&self.images) {
            return Err(FsError::AlreadyExists(to.to_string()));
        }
        if starts_with_segments(&dest.segments, &source.segments) {
            return Err(FsError::MountRejected {
                path: to.to_string(),
                reason: format!("cannot copy {from} into itself"),
            });
        }
        let target = real_target(&dest, to)?.to_path_buf();
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FsError::io(to, e))?;
        }
        Ok(target)
    }

    /// Expand a `*` pattern one segment at a time.
    pub fn find(&self, pattern: &str) -> Result<Vec<String>, FsError> {
        let Some(parts) = normalize_pattern(pattern) else {
            return Ok(Vec::new());
        };
        let mut current: Vec<Vec<String>> = vec![Vec::new()];
        for part in &parts {
            let re = wildcard_regex(part).map_err(|e| FsError::MountRejected {
                path: pattern.to_string(),
                reason: e.to_string(),
            })?;
            let mut next: BTreeSet<Vec<String>> = BTreeSet::new();
            for base in &current {
                let Ok(children) = self.list_segments(&combine(base), base) else {
                    continue;
                };
                for name in children.into_iter().filter(|n| re.is_match(n)) {
                    let mut candidate = base.clone();
                    candidate.push(name);
                    next.insert(candidate);
                }
            }
            current = next.into_iter().collect();
            if current.is_empty() {
                break;
            }
        }
        let mut results: Vec<String> = current
            .iter()
            .filter(|c| !c.is_empty())
            .map(|c| combine(c))
            .collect();
        results.sort();
        results.dedup();
        Ok(results)
    }
}

fn real_target<'a>(resolved: &'a Resolved, display: &str) -> Result<&'a Path, FsError> {
    resolved
        .location()
        .as_real()
        .ok_or_else(|| FsError::ReadOnly(display.to_string()))
}

fn starts_with_segments(path: &[String], prefix: &[String]) -> bool {
    path.len() > prefix.len() && path[..prefix.len()] == *prefix
}

fn copy_real(from: &Path, to: &Path) -> std::io::Result<()> {
    if from.is_dir() {
        std::fs::create_dir_all(to)?;
        for entry in std::fs::read_dir(from)? {
            let entry = entry?;
            copy_real(&entry.path(), &to.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        std::fs::copy(from, to).map(|_| ())
    }
}

fn copy_virtual(node: &VirtualEntry, to: &Path) -> std::io::Result<()> {
    match node {
        VirtualEntry::File(data) => std::fs::write(to, data),
        VirtualEntry::Dir(children) => {
            std::fs::create_dir_all(to)?;
            for (name, child) in children {
                copy_virtual(child, &to.join(name))?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::Backing;

    fn sandbox() -> (tempfile::TempDir, SandboxFs) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        let images = Arc::new(VirtualRegistry::new());
        let id = images.register(
            VirtualEntry::dir()
                .with("programs/hello.lua", VirtualEntry::file("print('hello')"))
                .with("programs/edit.lua", VirtualEntry::file(""))
                .with("bios.lua", VirtualEntry::file("")),
        );
        let mut table = MountTable::new(&root);
        table.add("rom", format!("{id}:").parse().unwrap(), true, &images).unwrap();
        (tmp, SandboxFs::new(Arc::new(Mutex::new(table)), images))
    }

    #[test]
    fn write_then_read_back() {
        let (_tmp, fs) = sandbox();
        fs.write("docs/notes.txt", b"one", false).unwrap();
        fs.write("docs/notes.txt", b" two", true).unwrap();
        assert_eq!(fs.read("docs/notes.txt").unwrap(), b"one two");
        assert_eq!(fs.size("docs/notes.txt").unwrap(), 7);
        assert!(fs.is_dir("docs"));
    }

    #[test]
    fn listing_injects_mount_points_and_hides_host_files() {
        let (_tmp, fs) = sandbox();
        fs.write("startup.lua", b"", false).unwrap();
        fs.write(".DS_Store", b"", false).unwrap();
        assert_eq!(fs.list("/").unwrap(), vec!["rom", "startup.lua"]);
        assert_eq!(fs.list("rom").unwrap(), vec!["bios.lua", "programs"]);
        assert!(matches!(fs.list("startup.lua"), Err(FsError::NotADirectory(_))));
    }

    #[test]
    fn rom_is_read_only_and_mount_points_are_protected() {
        let (_tmp, fs) = sandbox();
        assert!(fs.is_read_only("rom/bios.lua").unwrap());
        assert!(!fs.is_read_only("startup.lua").unwrap());
        assert!(matches!(fs.write("rom/new.lua", b"", false), Err(FsError::ReadOnly(_))));
        assert!(matches!(fs.delete("rom"), Err(e) if e.is_sandbox_violation()));
        assert!(matches!(fs.delete("/"), Err(FsError::MountPoint(_))));
        assert!(matches!(fs.rename("rom", "other"), Err(e) if e.is_sandbox_violation()));
    }

    #[test]
    fn copy_out_of_a_virtual_image() {
        let (_tmp, fs) = sandbox();
        fs.copy("rom/programs", "mine").unwrap();
        assert_eq!(fs.read("mine/hello.lua").unwrap(), b"print('hello')");
        assert!(matches!(fs.copy("rom/bios.lua", "mine/hello.lua"), Err(FsError::AlreadyExists(_))));
    }

    #[test]
    fn rename_and_delete() {
        let (_tmp, fs) = sandbox();
        fs.write("a.txt", b"x", false).unwrap();
        fs.rename("a.txt", "dir/b.txt").unwrap();
        assert!(!fs.exists("a.txt"));
        assert_eq!(fs.read("dir/b.txt").unwrap(), b"x");
        fs.delete("dir").unwrap();
        assert!(!fs.exists("dir/b.txt"));
    }

    #[test]
    fn find_expands_wildcards_across_mounts() {
        let (_tmp, fs) = sandbox();
        fs.write("programs/local.lua", b"", false).unwrap();
        assert_eq!(
            fs.find("rom/programs/*.lua").unwrap(),
            vec!["rom/programs/edit.lua", "rom/programs/hello.lua"]
        );
        assert_eq!(
            fs.find("*/programs/*").unwrap(),
            vec!["rom/programs/edit.lua", "rom/programs/hello.lua"]
        );
        assert_eq!(fs.find("r*").unwrap(), vec!["rom"]);
        assert!(fs.find("nothing/*").unwrap().is_empty());
        assert_eq!(fs.find("programs/local.lua").unwrap(), vec!["programs/local.lua"]);
    }

    #[test]
    fn overlapping_mounts_merge_listings() {
        let (tmp, fs) = sandbox();
        let extra = tmp.path().join("extra");
        std::fs::create_dir_all(&extra).unwrap();
        std::fs::write(extra.join("added.lua"), "").unwrap();
        fs.mounts()
            .add("rom", Backing::Real(extra), true, fs.images())
            .unwrap();
        assert_eq!(fs.list("rom").unwrap(), vec!["added.lua", "bios.lua", "programs"]);
        assert_eq!(fs.drive("rom/added.lua").unwrap(), "rom");
    }
}
