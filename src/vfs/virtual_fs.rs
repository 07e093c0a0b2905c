//! In-memory read-only images used as mount backings.
//!
//! An image is an immutable tree registered once with the host's
//! [`VirtualRegistry`]; mounts refer to it as `N:` or `N:sub/dir`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Index of a registered image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VirtualId(pub u32);

impl fmt::Display for VirtualId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node of an in-memory image.
#[derive(Debug, Clone, PartialEq)]
pub enum VirtualEntry {
    File(Vec<u8>),
    Dir(BTreeMap<String, VirtualEntry>),
}

/// Serialized form: strings are files, objects are directories.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum EntrySpec {
    File(String),
    Dir(BTreeMap<String, EntrySpec>),
}

impl From<EntrySpec> for VirtualEntry {
    fn from(spec: EntrySpec) -> Self {
        match spec {
            EntrySpec::File(text) => VirtualEntry::File(text.into_bytes()),
            EntrySpec::Dir(children) => VirtualEntry::Dir(
                children.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

impl VirtualEntry {
    pub fn dir() -> Self {
        VirtualEntry::Dir(BTreeMap::new())
    }

    pub fn file(data: impl Into<Vec<u8>>) -> Self {
        VirtualEntry::File(data.into())
    }

    /// Builder helper: insert `entry` at a `/`-separated `path`, creating
    /// intermediate directories.
    pub fn with(mut self, path: &str, entry: VirtualEntry) -> Self {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return entry;
        }
        insert_at(&mut self, &segments, entry);
        self
    }

    /// Parse the JSON image format (`{"startup.lua": "print(1)", "lib": {...}}`).
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        let spec: EntrySpec = serde_json::from_str(text)?;
        Ok(spec.into())
    }

    /// Pack a host directory tree into an image.
    pub fn from_dir(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        if meta.is_file() {
            return Ok(VirtualEntry::File(std::fs::read(path)?));
        }
        let mut children = BTreeMap::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            children.insert(name, VirtualEntry::from_dir(&entry.path())?);
        }
        Ok(VirtualEntry::Dir(children))
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, VirtualEntry::Dir(_))
    }

    /// Walk child names from this node.
    pub fn lookup<S: AsRef<str>>(&self, segments: &[S]) -> Option<&VirtualEntry> {
        let mut node = self;
        for segment in segments {
            match node {
                VirtualEntry::Dir(children) => node = children.get(segment.as_ref())?,
                VirtualEntry::File(_) => return None,
            }
        }
        Some(node)
    }

    pub fn child_names(&self) -> Vec<String> {
        match self {
            VirtualEntry::Dir(children) => children.keys().cloned().collect(),
            VirtualEntry::File(_) => Vec::new(),
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            VirtualEntry::File(data) => data.len() as u64,
            VirtualEntry::Dir(_) => 0,
        }
    }
}

fn insert_at(node: &mut VirtualEntry, segments: &[&str], entry: VirtualEntry) {
    if !node.is_dir() {
        *node = VirtualEntry::dir();
    }
    let VirtualEntry::Dir(children) = node else {
        return;
    };
    match segments {
        [] => {}
        [last] => {
            children.insert((*last).to_string(), entry);
        }
        [first, rest @ ..] => {
            let child = children
                .entry((*first).to_string())
                .or_insert_with(VirtualEntry::dir);
            insert_at(child, rest, entry);
        }
    }
}

/// Process-wide table of registered images.
#[derive(Debug, Default)]
pub struct VirtualRegistry {
    images: RwLock<Vec<Arc<VirtualEntry>>>,
}

impl VirtualRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, image: VirtualEntry) -> VirtualId {
        let mut images = self.images.write().unwrap_or_else(|e| e.into_inner());
        images.push(Arc::new(image));
        let id = VirtualId((images.len() - 1) as u32);
        debug!(image = %id, "registered virtual image");
        id
    }

    pub fn get(&self, id: VirtualId) -> Option<Arc<VirtualEntry>> {
        self.images
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id.0 as usize)
            .cloned()
    }

    pub fn lookup<S: AsRef<str>>(&self, id: VirtualId, segments: &[S]) -> Option<VirtualEntry> {
        self.get(id)?.lookup(segments).cloned()
    }

    /// Existence check without cloning the node.
    pub fn contains<S: AsRef<str>>(&self, id: VirtualId, segments: &[S]) -> bool {
        self.get(id).is_some_and(|image| image.lookup(segments).is_some())
    }

    pub fn is_dir<S: AsRef<str>>(&self, id: VirtualId, segments: &[S]) -> bool {
        self.get(id)
            .is_some_and(|image| image.lookup(segments).is_some_and(VirtualEntry::is_dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_creates_intermediate_dirs() {
        let image = VirtualEntry::dir()
            .with("programs/hello.lua", VirtualEntry::file("print('hi')"))
            .with("startup.lua", VirtualEntry::file(""));
        assert!(image.lookup(&["programs"]).unwrap().is_dir());
        assert_eq!(
            image.lookup(&["programs", "hello.lua"]),
            Some(&VirtualEntry::file("print('hi')"))
        );
        assert_eq!(image.child_names(), vec!["programs", "startup.lua"]);
    }

    #[test]
    fn lookup_through_a_file_fails() {
        let image = VirtualEntry::dir().with("a.txt", VirtualEntry::file("x"));
        assert!(image.lookup(&["a.txt", "b"]).is_none());
        assert!(image.lookup(&["missing"]).is_none());
    }

    #[test]
    fn json_strings_are_files_and_objects_are_dirs() {
        let image = VirtualEntry::from_json(r#"{"bios.lua": "boot()", "apis": {"a.lua": ""}}"#)
            .unwrap();
        assert_eq!(image.lookup(&["bios.lua"]).unwrap().size(), 6);
        assert!(image.lookup(&["apis"]).unwrap().is_dir());
    }

    #[test]
    fn registry_hands_out_sequential_ids() {
        let registry = VirtualRegistry::new();
        let a = registry.register(VirtualEntry::dir());
        let b = registry.register(VirtualEntry::dir().with("x", VirtualEntry::file("1")));
        assert_eq!(a, VirtualId(0));
        assert_eq!(b, VirtualId(1));
        assert!(registry.contains(b, &["x"]));
        assert!(!registry.contains(a, &["x"]));
        assert!(registry.get(VirtualId(9)).is_none());
    }
}
