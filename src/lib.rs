//! Loadstone - native library resolution, caching, and dispatch proxies
//!
//! Resolves a logical native-library name to a loaded in-process module,
//! caches that module process-wide, and exposes its exports through a
//! dispatch proxy bound to an application-declared interface.
//!
//! # Resolution order
//!
//! 1. The literal filesystem path, verbatim (with a platform-mapped
//!    basename retry for undecorated absolute paths)
//! 2. Directories registered through [`add_search_path`]
//! 3. The caller's [`ResourceContext`], extracting byte-only hits to a
//!    loadable file
//! 4. The platform default search, including versioned shared objects
//!    and the OS loader's own cache
//! 5. The bundle convention, on platforms that define one
//!
//! # Example
//!
//! ```no_run
//! use loadstone::{load_interface, InterfaceDescriptor, ProxyOptions, Value};
//!
//! # fn main() -> loadstone::Result<()> {
//! let interface = InterfaceDescriptor::new()
//!     .declare("i32 strlen(cstr)")?;
//! let c = load_interface("c", interface, ProxyOptions::new())?;
//!
//! let len = c.invoke("strlen", &[Value::Str("hello".to_string())])?;
//! assert_eq!(len, Value::Int(5));
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! name or path
//!      │
//!      ▼
//! ┌──────────┐     ┌────────────────┐     ┌────────────┐
//! │ Resolver │ ──▶ │ Cache & Handle │ ──▶ │ Call Proxy │
//! └────┬─────┘     └───────┬────────┘     └────────────┘
//!      │                   │
//!  search paths        libloading
//!  resource ctx
//!  extraction
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod extract;
pub mod library;
pub mod platform;
pub mod proxy;
pub mod resolve;
pub mod resource;
pub mod search;
pub mod types;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use error::{LinkError, Result};
pub use extract::{extract_to_file, extraction_root};
pub use library::NativeLibrary;
pub use platform::{capabilities, os_family, Capabilities, OsFamily, POINTER_BITS};
pub use proxy::{
    CallConvention, InterfaceDescriptor, LibraryProxy, NameMapper, OptionValue, ProxyOptions,
};
pub use resolve::{resolve, resolve_with, ResolvedLocation};
pub use resource::{ChainContext, DirContext, GzContext, ResourceContext, ResourceData};
pub use search::{add_search_path, paths_for, SearchPaths};
pub use types::{MethodSignature, Value, ValueKind};

use std::sync::Arc;

/// One-call flow: resolve and load `name`, then bind `descriptor` over
/// the handle. The returned proxy owns the only cache reference;
/// dropping it releases the library.
pub fn load_interface(
    name: &str,
    descriptor: InterfaceDescriptor,
    options: ProxyOptions,
) -> Result<LibraryProxy> {
    let handle = NativeLibrary::open(name)?;
    let proxy = match LibraryProxy::bind(descriptor, Arc::clone(&handle), options) {
        Ok(proxy) => proxy,
        Err(e) => {
            handle.release();
            return Err(e);
        }
    };
    handle.release();
    Ok(proxy)
}

/// Bind `descriptor` over the running process's own export table.
pub fn process_interface(
    descriptor: InterfaceDescriptor,
    options: ProxyOptions,
) -> Result<LibraryProxy> {
    let handle = NativeLibrary::the_process()?;
    let proxy = match LibraryProxy::bind(descriptor, Arc::clone(&handle), options) {
        Ok(proxy) => proxy,
        Err(e) => {
            handle.release();
            return Err(e);
        }
    };
    handle.release();
    Ok(proxy)
}
