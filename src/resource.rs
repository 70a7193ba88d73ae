//! Resource-loading contexts: named byte providers the resolver can
//! search.
//!
//! A context is an opaque lookup-by-name capability supplied by the
//! embedding environment. The resolver never inspects which variant it
//! received; it only distinguishes results that are already loadable on
//! disk from raw bytes that need extraction first. Each context instance
//! carries a process-unique identity so that two contexts exposing
//! different bytes for the same logical name never share a cache entry.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flate2::read::GzDecoder;

/// What a context lookup produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceData {
    /// Already on disk, loadable in place.
    File(PathBuf),
    /// Raw bytes that must be extracted before loading.
    Bytes(Vec<u8>),
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique context identity.
fn next_context_id() -> u64 {
    NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A named-resource provider consulted during resolution.
pub trait ResourceContext: Send + Sync {
    /// Look up a resource by name. A leading `/` anchors the name at the
    /// context root; otherwise the name is context-relative. Names resolve
    /// byte-for-byte; non-ASCII names are never transliterated.
    fn lookup(&self, name: &str) -> Option<ResourceData>;

    /// Process-unique identity of this context instance, used to keep
    /// cached libraries from different contexts apart.
    fn identity(&self) -> u64;
}

/// Context backed by a directory tree. Hits are served in place.
pub struct DirContext {
    root: PathBuf,
    id: u64,
}

impl DirContext {
    /// Create a context rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            id: next_context_id(),
        }
    }

    /// The directory this context serves from.
    pub fn root(&self) -> &PathBuf {
        &self.root
    }
}

impl ResourceContext for DirContext {
    fn lookup(&self, name: &str) -> Option<ResourceData> {
        let path = self.root.join(name.trim_start_matches('/'));
        if path.is_file() {
            Some(ResourceData::File(path))
        } else {
            None
        }
    }

    fn identity(&self) -> u64 {
        self.id
    }
}

/// Context serving gzip-compressed entries stored as `<name>.gz` under a
/// root directory. Hits come back as bytes and go through extraction.
pub struct GzContext {
    root: PathBuf,
    id: u64,
}

impl GzContext {
    /// Create a context over compressed entries under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            id: next_context_id(),
        }
    }
}

impl ResourceContext for GzContext {
    fn lookup(&self, name: &str) -> Option<ResourceData> {
        let path = self
            .root
            .join(format!("{}.gz", name.trim_start_matches('/')));
        let file = File::open(path).ok()?;
        let mut bytes = Vec::new();
        GzDecoder::new(file).read_to_end(&mut bytes).ok()?;
        Some(ResourceData::Bytes(bytes))
    }

    fn identity(&self) -> u64 {
        self.id
    }
}

/// First-hit chain over other contexts.
pub struct ChainContext {
    links: Vec<Arc<dyn ResourceContext>>,
    id: u64,
}

impl ChainContext {
    /// Chain `links`, searched in order.
    pub fn new(links: Vec<Arc<dyn ResourceContext>>) -> Self {
        Self {
            links,
            id: next_context_id(),
        }
    }
}

impl ResourceContext for ChainContext {
    fn lookup(&self, name: &str) -> Option<ResourceData> {
        self.links.iter().find_map(|link| link.lookup(name))
    }

    fn identity(&self) -> u64 {
        self.id
    }
}
