//! Process-wide native module cache and reference-counted handles.
//!
//! At most one native module per cache key is open at a time. The first
//! caller for a key performs the resolution and the native open inside a
//! per-key critical section; racing callers block on that section and
//! then observe the published handle. Reference counts change only under
//! the same per-key lock, so a release never races a reload of its key.

use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use libloading::Library;
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::error::{LinkError, Result};
use crate::resolve::{self, ResolvedLocation};
use crate::resource::ResourceContext;
use crate::search::{self, SearchPaths};

/// Key separating cached modules: the requested name plus the identity
/// of the resource context that resolved it. Two contexts may expose
/// different bytes for one logical name; their modules never share an
/// entry. The process's own handle has a key of its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Named { name: String, context: Option<u64> },
    Process,
}

impl CacheKey {
    fn named(name: &str, context: Option<&dyn ResourceContext>) -> Self {
        CacheKey::Named {
            name: name.to_string(),
            context: context.map(|c| c.identity()),
        }
    }
}

enum SlotState {
    Empty,
    Loaded(Arc<NativeLibrary>),
}

/// Per-key critical section plus the published handle.
struct Slot {
    state: Mutex<SlotState>,
}

static CACHE: Mutex<Vec<(CacheKey, Arc<Slot>)>> = Mutex::new(Vec::new());

/// Fetch or create the slot for `key`. The cache lock is held only for
/// the lookup; loading happens under the slot's own lock.
fn slot_for(key: &CacheKey) -> Arc<Slot> {
    let mut cache = CACHE.lock();
    if let Some((_, slot)) = cache.iter().find(|(k, _)| k == key) {
        return Arc::clone(slot);
    }
    let slot = Arc::new(Slot {
        state: Mutex::new(SlotState::Empty),
    });
    cache.push((key.clone(), Arc::clone(&slot)));
    slot
}

/// A loaded native module, shared through the process-wide cache.
///
/// The module closes when the last acquired reference is explicitly
/// released; dropping the `Arc` alone never unloads.
pub struct NativeLibrary {
    key: CacheKey,
    location: ResolvedLocation,
    module: RwLock<Option<Library>>,
    symbols: RwLock<HashMap<String, usize>>,
    refs: AtomicUsize,
}

impl NativeLibrary {
    /// Resolve and open `name`, or return the cached handle with one more
    /// reference.
    pub fn open(name: &str) -> Result<Arc<Self>> {
        Self::open_in(name, None, search::global())
    }

    /// Resolve through `context`. Distinct contexts cache separately.
    pub fn open_with(name: &str, context: &dyn ResourceContext) -> Result<Arc<Self>> {
        Self::open_in(name, Some(context), search::global())
    }

    /// Full-control variant for embedders with a private search registry.
    pub fn open_in(
        name: &str,
        context: Option<&dyn ResourceContext>,
        registry: &SearchPaths,
    ) -> Result<Arc<Self>> {
        let key = CacheKey::named(name, context);
        Self::get_or_load(key, || resolve::resolve_with(name, context, registry))
    }

    /// Handle over the running process's own export table.
    pub fn the_process() -> Result<Arc<Self>> {
        Self::get_or_load(CacheKey::Process, || Ok(ResolvedLocation::Process))
    }

    fn get_or_load<F>(key: CacheKey, resolve: F) -> Result<Arc<Self>>
    where
        F: FnOnce() -> Result<ResolvedLocation>,
    {
        let slot = slot_for(&key);
        let mut state = slot.state.lock();
        if let SlotState::Loaded(handle) = &*state {
            handle.refs.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(handle));
        }

        // First loader for this key. Resolve and open while holding the
        // per-key lock; the entry is published only after the open
        // succeeds, so a failure leaves the slot empty.
        let location = resolve()?;
        let module = open_module(&location)?;
        let handle = Arc::new(NativeLibrary {
            key,
            location,
            module: RwLock::new(Some(module)),
            symbols: RwLock::new(HashMap::new()),
            refs: AtomicUsize::new(1),
        });
        debug!("loaded {}", handle.location.describe());
        *state = SlotState::Loaded(Arc::clone(&handle));
        Ok(handle)
    }

    /// Take one more reference, under the key's lock. No-op on a closed
    /// handle.
    pub(crate) fn retain(self: &Arc<Self>) {
        let slot = slot_for(&self.key);
        let _state = slot.state.lock();
        if self.module.read().is_some() {
            self.refs.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop one reference; the module closes when the count reaches zero.
    /// Releasing more times than the handle was acquired is a no-op.
    pub fn release(self: &Arc<Self>) {
        let slot = slot_for(&self.key);
        let mut state = slot.state.lock();
        if self.refs.load(Ordering::Relaxed) == 0 {
            return;
        }
        if self.refs.fetch_sub(1, Ordering::Relaxed) == 1 {
            *state = SlotState::Empty;
            drop(self.module.write().take());
            debug!("closed {}", self.location.describe());
        }
    }

    /// Where this module was loaded from.
    pub fn location(&self) -> &ResolvedLocation {
        &self.location
    }

    /// Whether the underlying module is still open.
    pub fn is_open(&self) -> bool {
        self.module.read().is_some()
    }

    /// Current reference count.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Relaxed)
    }

    /// Address of the exported `name`.
    ///
    /// Results are cached per handle; a module's export table does not
    /// change after load.
    pub fn find_symbol(&self, name: &str) -> Result<usize> {
        if let Some(&address) = self.symbols.read().get(name) {
            return Ok(address);
        }

        let c_name = CString::new(name).map_err(|_| LinkError::SymbolNotFound {
            symbol: name.to_string(),
            library: self.location.describe(),
            reason: "symbol name contains an interior NUL byte".to_string(),
        })?;

        let module = self.module.read();
        let module = module.as_ref().ok_or(LinkError::Closed)?;
        // Safety: the symbol is treated as an opaque address; signature
        // correctness is the call site's contract.
        let symbol = unsafe {
            module
                .get::<*const ()>(c_name.as_bytes_with_nul())
                .map_err(|e| LinkError::SymbolNotFound {
                    symbol: name.to_string(),
                    library: self.location.describe(),
                    reason: e.to_string(),
                })?
        };
        let address = *symbol as usize;

        self.symbols.write().insert(name.to_string(), address);
        Ok(address)
    }
}

impl fmt::Debug for NativeLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeLibrary")
            .field("location", &self.location)
            .field("refs", &self.ref_count())
            .field("open", &self.is_open())
            .finish()
    }
}

fn open_module(location: &ResolvedLocation) -> Result<Library> {
    match location {
        ResolvedLocation::Path(path) => {
            #[cfg(windows)]
            if crate::platform::capabilities().altered_dependent_search {
                use libloading::os::windows::{
                    Library as WinLibrary, LOAD_WITH_ALTERED_SEARCH_PATH,
                };
                // Dependent modules are searched beside the loaded one.
                // Safety: same contract as the plain open below.
                let module = unsafe {
                    WinLibrary::load_with_flags(path, LOAD_WITH_ALTERED_SEARCH_PATH)
                }
                .map_err(|e| load_err(location, e))?;
                return Ok(Library::from(module));
            }
            // Safety: loading a native module runs its initializer code;
            // the path is what resolution produced for the caller.
            unsafe { Library::new(path) }.map_err(|e| load_err(location, e))
        }
        ResolvedLocation::System(name) => {
            // Safety: as above, by loader-visible name.
            unsafe { Library::new(name) }.map_err(|e| load_err(location, e))
        }
        ResolvedLocation::Process => open_self().map_err(|e| load_err(location, e)),
    }
}

fn load_err(location: &ResolvedLocation, source: libloading::Error) -> LinkError {
    LinkError::Load {
        location: location.describe(),
        reason: source.to_string(),
    }
}

#[cfg(unix)]
fn open_self() -> std::result::Result<Library, libloading::Error> {
    Ok(Library::from(libloading::os::unix::Library::this()))
}

#[cfg(windows)]
fn open_self() -> std::result::Result<Library, libloading::Error> {
    Ok(Library::from(libloading::os::windows::Library::this()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_keys_separate_contexts() {
        let a = CacheKey::Named {
            name: "same".to_string(),
            context: Some(1),
        };
        let b = CacheKey::Named {
            name: "same".to_string(),
            context: Some(2),
        };
        let bare = CacheKey::Named {
            name: "same".to_string(),
            context: None,
        };
        assert_ne!(a, b);
        assert_ne!(a, bare);
        assert_ne!(bare, CacheKey::Process);
    }

    #[test]
    fn test_open_failure_leaves_slot_empty() {
        let name = format!("never-exists-{}", std::process::id());
        assert!(NativeLibrary::open(&name).is_err());
        // A later attempt runs resolution again rather than observing a
        // half-initialized entry.
        assert!(NativeLibrary::open(&name).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_process_handle_opens_and_balances() {
        let first = NativeLibrary::the_process().expect("process handle");
        assert!(first.is_open());
        let second = NativeLibrary::the_process().expect("process handle again");
        assert!(Arc::ptr_eq(&first, &second));
        first.release();
        second.release();
    }
}
