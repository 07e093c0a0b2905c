//! Per-computer mount table and path resolution.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, info};

use super::FsError;
use super::path::{combine, normalize, starts_with};
use super::virtual_fs::{VirtualId, VirtualRegistry};

/// Where a mount's files actually live.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Backing {
    Real(PathBuf),
    Virtual { image: VirtualId, root: Vec<String> },
}

impl Backing {
    fn join(&self, remainder: &[String]) -> Location {
        match self {
            Backing::Real(root) => {
                let mut path = root.clone();
                path.extend(remainder);
                Location::Real(path)
            }
            Backing::Virtual { image, root } => {
                let mut path = root.clone();
                path.extend(remainder.iter().cloned());
                Location::Virtual { image: *image, path }
            }
        }
    }
}

/// `"N:"` / `"N:sub/dir"` name a virtual image, anything else a host path.
impl FromStr for Backing {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((id, rest)) = s.split_once(':') {
            if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(n) = id.parse::<u32>() {
                    return Ok(Backing::Virtual {
                        image: VirtualId(n),
                        root: normalize(rest).unwrap_or_default(),
                    });
                }
            }
        }
        Ok(Backing::Real(PathBuf::from(s)))
    }
}

impl fmt::Display for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backing::Real(path) => write!(f, "{}", path.display()),
            Backing::Virtual { image, root } => write!(f, "{image}:{}", combine(root)),
        }
    }
}

/// A concrete place a guest path resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Real(PathBuf),
    Virtual { image: VirtualId, path: Vec<String> },
}

impl Location {
    pub fn exists(&self, images: &VirtualRegistry) -> bool {
        match self {
            Location::Real(path) => path.symlink_metadata().is_ok(),
            Location::Virtual { image, path } => images.contains(*image, path),
        }
    }

    pub fn is_dir(&self, images: &VirtualRegistry) -> bool {
        match self {
            Location::Real(path) => path.is_dir(),
            Location::Virtual { image, path } => images.is_dir(*image, path),
        }
    }

    fn parent_exists(&self, images: &VirtualRegistry) -> bool {
        match self {
            Location::Real(path) => path.parent().is_some_and(Path::is_dir),
            Location::Virtual { image, path } => {
                let parent = &path[..path.len().saturating_sub(1)];
                images.is_dir(*image, parent)
            }
        }
    }

    pub fn as_real(&self) -> Option<&Path> {
        match self {
            Location::Real(path) => Some(path),
            Location::Virtual { .. } => None,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Real(path) => write!(f, "{}", path.display()),
            Location::Virtual { image, path } => write!(f, "{image}:{}", combine(path)),
        }
    }
}

#[derive(Debug, Clone)]
struct Mount {
    components: Vec<String>,
    backing: Backing,
    read_only: bool,
    system: bool,
    seq: u64,
}

/// Snapshot of one mount for listing.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MountInfo {
    pub path: String,
    pub backing: String,
    pub read_only: bool,
}

/// Flags for [`MountTable::resolve`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Keep only candidates that exist; fail with NotFound if none do.
    pub must_exist: bool,
    /// Fail if the selected mount is read-only.
    pub for_write: bool,
    /// Return every tied candidate instead of only the first.
    pub want_all: bool,
}

impl ResolveOptions {
    pub fn read() -> Self {
        Self { must_exist: true, ..Self::default() }
    }

    pub fn write() -> Self {
        Self { for_write: true, ..Self::default() }
    }

    pub fn all() -> Self {
        Self { must_exist: true, want_all: true, ..Self::default() }
    }
}

/// Result of resolving a guest path.
#[derive(Debug, Clone)]
pub struct Resolved {
    /// Full normalized guest path.
    pub segments: Vec<String>,
    /// Path of the matched mount point.
    pub mount: Vec<String>,
    /// Segments below the mount point.
    pub remainder: Vec<String>,
    /// Read-only flag of the mount backing the first candidate.
    pub read_only: bool,
    /// Candidate locations, most recently mounted first.
    pub candidates: Vec<Location>,
}

impl Resolved {
    /// The single location used by open/delete style operations.
    pub fn location(&self) -> &Location {
        &self.candidates[0]
    }

    /// True when the path names a mount point itself.
    pub fn is_mount_point(&self) -> bool {
        self.remainder.is_empty()
    }
}

/// Ordered set of mounts for one computer.
///
/// The private root (empty path) is created with the table and can never be
/// removed.
#[derive(Debug, Clone)]
pub struct MountTable {
    mounts: Vec<Mount>,
    next_seq: u64,
}

impl MountTable {
    /// Create a table whose private root is backed by `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            mounts: vec![Mount {
                components: Vec::new(),
                backing: Backing::Real(root.into()),
                read_only: false,
                system: true,
                seq: 0,
            }],
            next_seq: 1,
        }
    }

    /// Mount `backing` at guest path `at`.
    ///
    /// The backing must exist, and must be writable unless `read_only`.
    /// Virtual images are always mounted read-only.
    pub fn add(
        &mut self,
        at: &str,
        backing: Backing,
        read_only: bool,
        images: &VirtualRegistry,
    ) -> Result<(), FsError> {
        self.insert(at, backing, read_only, false, images)
    }

    /// Like [`add`](Self::add) but the mount refuses later removal.
    pub fn add_system(
        &mut self,
        at: &str,
        backing: Backing,
        read_only: bool,
        images: &VirtualRegistry,
    ) -> Result<(), FsError> {
        self.insert(at, backing, read_only, true, images)
    }

    fn insert(
        &mut self,
        at: &str,
        backing: Backing,
        read_only: bool,
        system: bool,
        images: &VirtualRegistry,
    ) -> Result<(), FsError> {
        let rejected = |reason: &str| FsError::MountRejected {
            path: at.to_string(),
            reason: reason.to_string(),
        };
        let components = normalize(at).ok_or_else(|| rejected("path escapes the root"))?;

        let read_only = match &backing {
            Backing::Real(path) => {
                let meta = std::fs::metadata(path).map_err(|_| rejected("backing path does not exist"))?;
                if !read_only && meta.permissions().readonly() {
                    return Err(rejected("backing path is not writable"));
                }
                if meta.is_dir() && std::fs::read_dir(path).is_err() {
                    return Err(rejected("backing path is not readable"));
                }
                read_only
            }
            Backing::Virtual { image, root } => {
                if !images.contains(*image, root) {
                    return Err(rejected("virtual image not found"));
                }
                true
            }
        };

        if self
            .mounts
            .iter()
            .any(|m| m.components == components && m.backing == backing)
        {
            return Err(FsError::DuplicateMount(at.to_string()));
        }

        info!(path = %combine(&components), backing = %backing, read_only, "mounted");
        self.mounts.push(Mount {
            components,
            backing,
            read_only,
            system,
            seq: self.next_seq,
        });
        self.next_seq += 1;
        Ok(())
    }

    /// Remove every mount at `at`. Returns how many were removed.
    pub fn remove(&mut self, at: &str) -> Result<usize, FsError> {
        let components = normalize(at).ok_or_else(|| FsError::NotMounted(at.to_string()))?;
        if components.is_empty() {
            return Err(FsError::ProtectedMount(at.to_string()));
        }
        let matching: Vec<&Mount> = self
            .mounts
            .iter()
            .filter(|m| m.components == components)
            .collect();
        if matching.is_empty() {
            return Err(FsError::NotMounted(at.to_string()));
        }
        if matching.iter().any(|m| m.system) {
            return Err(FsError::ProtectedMount(at.to_string()));
        }
        let before = self.mounts.len();
        self.mounts.retain(|m| m.components != components);
        let removed = before - self.mounts.len();
        info!(path = %combine(&components), removed, "unmounted");
        Ok(removed)
    }

    /// Every mount in insertion order.
    pub fn list(&self) -> Vec<MountInfo> {
        self.mounts
            .iter()
            .map(|m| MountInfo {
                path: combine(&m.components),
                backing: m.backing.to_string(),
                read_only: m.read_only,
            })
            .collect()
    }

    /// Names of mounts sitting directly below `dir`.
    pub fn mounts_under(&self, dir: &[String]) -> Vec<String> {
        let mut names: Vec<String> = self
            .mounts
            .iter()
            .filter(|m| m.components.len() == dir.len() + 1 && starts_with(&m.components, dir))
            .filter_map(|m| m.components.last().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Mounts tied for the longest prefix of `segments`, most recent first.
    fn best_matches(&self, segments: &[String]) -> Vec<&Mount> {
        let best = self
            .mounts
            .iter()
            .filter(|m| starts_with(segments, &m.components))
            .map(|m| m.components.len())
            .max()
            .unwrap_or(0);
        let mut tied: Vec<&Mount> = self
            .mounts
            .iter()
            .filter(|m| m.components.len() == best && starts_with(segments, &m.components))
            .collect();
        tied.sort_by(|a, b| b.seq.cmp(&a.seq));
        tied
    }

    /// Resolve a guest path against the table.
    pub fn resolve(
        &self,
        path: &str,
        opts: ResolveOptions,
        images: &VirtualRegistry,
    ) -> Result<Resolved, FsError> {
        let segments = normalize(path).ok_or_else(|| {
            debug!(path, "path climbs above the root");
            FsError::NotFound(path.to_string())
        })?;
        self.resolve_segments(path, segments, opts, images)
    }

    pub(crate) fn resolve_segments(
        &self,
        display: &str,
        segments: Vec<String>,
        opts: ResolveOptions,
        images: &VirtualRegistry,
    ) -> Result<Resolved, FsError> {
        let tied = self.best_matches(&segments);
        let Some(first) = tied.first() else {
            return Err(FsError::NotFound(display.to_string()));
        };
        let depth = first.components.len();
        let mount = first.components.clone();
        let remainder = segments[depth..].to_vec();

        let mut candidates: Vec<(Location, bool)> = tied
            .iter()
            .map(|m| (m.backing.join(&remainder), m.read_only))
            .collect();

        if opts.must_exist {
            candidates.retain(|(loc, _)| loc.exists(images));
            if candidates.is_empty() {
                return Err(FsError::NotFound(display.to_string()));
            }
        } else if candidates.len() > 1 {
            // Prefer an existing file, then a candidate whose directory exists.
            if let Some(pos) = candidates.iter().position(|(loc, _)| loc.exists(images)) {
                candidates.swap(0, pos);
            } else if let Some(pos) = candidates.iter().position(|(loc, _)| loc.parent_exists(images)) {
                candidates.swap(0, pos);
            }
        }

        let read_only = candidates[0].1;
        if opts.for_write && read_only {
            return Err(FsError::ReadOnly(display.to_string()));
        }
        if !opts.want_all {
            candidates.truncate(1);
        }

        Ok(Resolved {
            segments,
            mount,
            remainder,
            read_only,
            candidates: candidates.into_iter().map(|(loc, _)| loc).collect(),
        })
    }

    /// Read-only flag of the mount covering `path`.
    pub fn is_read_only(&self, path: &str) -> Result<bool, FsError> {
        let segments = normalize(path).ok_or_else(|| FsError::NotFound(path.to_string()))?;
        Ok(self
            .best_matches(&segments)
            .first()
            .is_some_and(|m| m.read_only))
    }

    /// Drive label of the mount covering `path`: `hdd` for the root.
    pub fn drive(&self, path: &str) -> Result<String, FsError> {
        let segments = normalize(path).ok_or_else(|| FsError::NotFound(path.to_string()))?;
        let tied = self.best_matches(&segments);
        match tied.first() {
            Some(m) if m.components.is_empty() => Ok("hdd".to_string()),
            Some(m) => Ok(combine(&m.components)),
            None => Err(FsError::NotFound(path.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::VirtualEntry;

    fn rom_image(images: &VirtualRegistry) -> VirtualId {
        images.register(VirtualEntry::dir().with("x.lua", VirtualEntry::file("print(1)")))
    }

    #[test]
    fn virtual_rom_resolves_read_only() {
        let tmp = tempfile::tempdir().unwrap();
        let images = VirtualRegistry::new();
        let id = rom_image(&images);
        let mut table = MountTable::new(tmp.path());
        table.add("rom", format!("{id}:").parse().unwrap(), true, &images).unwrap();

        let resolved = table.resolve("rom/x.lua", ResolveOptions::read(), &images).unwrap();
        assert_eq!(resolved.location().to_string(), "0:x.lua");
        assert!(resolved.read_only);

        let err = table.resolve("rom/x.lua", ResolveOptions::write(), &images).unwrap_err();
        assert!(err.is_sandbox_violation());

        let startup = table.resolve("startup.lua", ResolveOptions::write(), &images).unwrap();
        assert_eq!(startup.location(), &Location::Real(tmp.path().join("startup.lua")));
    }

    #[test]
    fn root_mount_cannot_be_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let mut table = MountTable::new(tmp.path());
        assert!(matches!(table.remove("/"), Err(FsError::ProtectedMount(_))));
        assert!(matches!(table.remove(""), Err(FsError::ProtectedMount(_))));
        assert!(matches!(table.remove("nope"), Err(FsError::NotMounted(_))));
        assert_eq!(table.list().len(), 1);
    }

    #[test]
    fn duplicate_and_missing_backings_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let images = VirtualRegistry::new();
        let mut table = MountTable::new(tmp.path());
        let share = tmp.path().join("share");
        std::fs::create_dir(&share).unwrap();

        table.add("disk", Backing::Real(share.clone()), false, &images).unwrap();
        assert!(matches!(
            table.add("disk", Backing::Real(share), false, &images),
            Err(FsError::DuplicateMount(_))
        ));
        assert!(matches!(
            table.add("gone", Backing::Real(tmp.path().join("missing")), true, &images),
            Err(FsError::MountRejected { .. })
        ));
        assert!(matches!(
            table.add("../up", Backing::Real(tmp.path().to_path_buf()), true, &images),
            Err(FsError::MountRejected { .. })
        ));
        assert!(matches!(
            table.add("img", "7:".parse().unwrap(), true, &images),
            Err(FsError::MountRejected { .. })
        ));
    }

    #[test]
    fn escaping_paths_are_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let images = VirtualRegistry::new();
        let table = MountTable::new(tmp.path());
        for path in ["..", "../etc/passwd", "a/../../b", "rom/../../x"] {
            assert!(matches!(
                table.resolve(path, ResolveOptions::default(), &images),
                Err(FsError::NotFound(_))
            ));
        }
    }

    #[test]
    fn most_recent_mount_wins_ties() {
        let tmp = tempfile::tempdir().unwrap();
        let images = VirtualRegistry::new();
        let first = tmp.path().join("first");
        let second = tmp.path().join("second");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();
        std::fs::write(first.join("only_first.txt"), "1").unwrap();

        let mut table = MountTable::new(tmp.path().join("root"));
        table.add("share", Backing::Real(first.clone()), false, &images).unwrap();
        table.add("share", Backing::Real(second.clone()), false, &images).unwrap();

        let fresh = table.resolve("share/new.txt", ResolveOptions::write(), &images).unwrap();
        assert_eq!(fresh.location(), &Location::Real(second.join("new.txt")));

        let existing = table.resolve("share/only_first.txt", ResolveOptions::read(), &images).unwrap();
        assert_eq!(existing.location(), &Location::Real(first.join("only_first.txt")));

        let all = table.resolve("share", ResolveOptions::all(), &images).unwrap();
        assert_eq!(all.candidates.len(), 2);
        assert!(all.is_mount_point());
    }

    #[test]
    fn mounts_under_lists_direct_children_only() {
        let tmp = tempfile::tempdir().unwrap();
        let images = VirtualRegistry::new();
        let id = rom_image(&images);
        let mut table = MountTable::new(tmp.path());
        table.add("rom", format!("{id}:").parse().unwrap(), true, &images).unwrap();
        table.add("disk/a", format!("{id}:").parse().unwrap(), true, &images).unwrap();

        assert_eq!(table.mounts_under(&[]), vec!["rom"]);
        assert_eq!(table.mounts_under(&["disk".to_string()]), vec!["a"]);
        assert_eq!(table.drive("rom/x.lua").unwrap(), "rom");
        assert_eq!(table.drive("startup.lua").unwrap(), "hdd");
    }

    #[test]
    fn backing_strings_parse() {
        assert_eq!(
            "3:lib/apis".parse::<Backing>().unwrap(),
            Backing::Virtual { image: VirtualId(3), root: vec!["lib".into(), "apis".into()] }
        );
        assert_eq!(
            "/srv/share".parse::<Backing>().unwrap(),
            Backing::Real(PathBuf::from("/srv/share"))
        );
        assert_eq!(
            "C:\\data".parse::<Backing>().unwrap(),
            Backing::Real(PathBuf::from("C:\\data"))
        );
    }
}
