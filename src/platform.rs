//! Platform facts: OS family, pointer width, library name mapping, and
//! default search locations.
//!
//! Everything here is a pure lookup. Platform-conditional resolution
//! behavior is expressed as a [`Capabilities`] table consumed by the
//! resolver, so the resolution algorithm itself stays platform-agnostic.

use std::path::PathBuf;

/// Operating system family the process is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Linux,
    MacOs,
    Windows,
    Other,
}

/// The running OS family.
pub fn os_family() -> OsFamily {
    if cfg!(target_os = "linux") {
        OsFamily::Linux
    } else if cfg!(target_os = "macos") {
        OsFamily::MacOs
    } else if cfg!(target_os = "windows") {
        OsFamily::Windows
    } else {
        OsFamily::Other
    }
}

/// Pointer width of the running process, in bits.
pub const POINTER_BITS: usize = std::mem::size_of::<usize>() * 8;

/// Platform-conditional resolution behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Application-bundle (framework) resolution applies.
    pub bundle_convention: bool,
    /// Path-based loads search for dependent modules beside the loaded one.
    pub altered_dependent_search: bool,
    /// Shared objects may carry trailing version suffixes (`libm.so.6`).
    pub versioned_so_match: bool,
    /// Stdcall symbol decoration is meaningful.
    pub stdcall_decoration: bool,
}

/// Capability table for the running platform.
pub fn capabilities() -> Capabilities {
    match os_family() {
        OsFamily::MacOs => Capabilities {
            bundle_convention: true,
            altered_dependent_search: false,
            versioned_so_match: false,
            stdcall_decoration: false,
        },
        OsFamily::Windows => Capabilities {
            bundle_convention: false,
            altered_dependent_search: true,
            versioned_so_match: false,
            stdcall_decoration: true,
        },
        OsFamily::Linux | OsFamily::Other => Capabilities {
            bundle_convention: false,
            altered_dependent_search: false,
            versioned_so_match: true,
            stdcall_decoration: false,
        },
    }
}

/// Map a logical library name to the platform file name.
///
/// Names already carrying the platform prefix and suffix pass through
/// unchanged, as do versioned ELF names such as `libc.so.6`.
pub fn map_library_name(name: &str) -> String {
    match os_family() {
        OsFamily::Windows => {
            if name.ends_with(".dll") {
                name.to_string()
            } else {
                format!("{}.dll", name)
            }
        }
        OsFamily::MacOs => {
            if name.starts_with("lib") && name.ends_with(".dylib") {
                name.to_string()
            } else {
                format!("lib{}.dylib", name)
            }
        }
        OsFamily::Linux | OsFamily::Other => {
            if name.starts_with("lib") && name.contains(".so") {
                name.to_string()
            } else {
                format!("lib{}.so", name)
            }
        }
    }
}

/// Default directories the platform loader consults, scanned by the
/// resolver's default-search strategy.
pub fn default_search_paths() -> Vec<PathBuf> {
    #[allow(unused_mut)]
    let mut paths = Vec::new();

    #[cfg(target_os = "linux")]
    {
        if let Ok(ld_path) = std::env::var("LD_LIBRARY_PATH") {
            paths.extend(std::env::split_paths(&ld_path));
        }
        // Debian-style multiarch directories first; they carry the live
        // runtime libraries on those systems.
        #[cfg(target_arch = "x86_64")]
        {
            paths.push(PathBuf::from("/usr/lib/x86_64-linux-gnu"));
            paths.push(PathBuf::from("/lib/x86_64-linux-gnu"));
        }
        #[cfg(target_arch = "aarch64")]
        {
            paths.push(PathBuf::from("/usr/lib/aarch64-linux-gnu"));
            paths.push(PathBuf::from("/lib/aarch64-linux-gnu"));
        }
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/usr/lib"));
        paths.push(PathBuf::from("/lib"));
        paths.push(PathBuf::from("/usr/lib64"));
        paths.push(PathBuf::from("/lib64"));
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(dyld_path) = std::env::var("DYLD_LIBRARY_PATH") {
            paths.extend(std::env::split_paths(&dyld_path));
        }
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/opt/homebrew/lib"));
        paths.push(PathBuf::from("/usr/lib"));
        if let Ok(fallback) = std::env::var("DYLD_FALLBACK_LIBRARY_PATH") {
            paths.extend(std::env::split_paths(&fallback));
        }
    }

    #[cfg(target_os = "windows")]
    {
        paths.push(PathBuf::from("C:\\Windows\\System32"));
        if let Ok(path) = std::env::var("PATH") {
            paths.extend(std::env::split_paths(&path));
        }
    }

    paths
}

/// Standard roots searched for bare bundle names on bundle-based
/// platforms.
pub fn framework_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(home) = std::env::var("HOME") {
        roots.push(PathBuf::from(home).join("Library/Frameworks"));
    }
    roots.push(PathBuf::from("/Library/Frameworks"));
    roots.push(PathBuf::from("/System/Library/Frameworks"));
    roots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_width_nonzero() {
        assert!(POINTER_BITS > 0);
        assert_eq!(POINTER_BITS % 8, 0);
    }

    #[test]
    fn test_map_library_name() {
        let mapped = map_library_name("testlib");
        #[cfg(target_os = "linux")]
        assert_eq!(mapped, "libtestlib.so");
        #[cfg(target_os = "macos")]
        assert_eq!(mapped, "libtestlib.dylib");
        #[cfg(target_os = "windows")]
        assert_eq!(mapped, "testlib.dll");
        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        assert_eq!(mapped, "libtestlib.so");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_versioned_name_passes_through() {
        assert_eq!(map_library_name("libc.so.6"), "libc.so.6");
        assert_eq!(map_library_name("libtest.so"), "libtest.so");
    }

    #[test]
    fn test_unicode_name_maps_byte_for_byte() {
        let mapped = map_library_name("\u{444}\u{43b}\u{441}\u{432}\u{443}");
        assert!(mapped.contains("\u{444}\u{43b}\u{441}\u{432}\u{443}"));
    }

    #[test]
    fn test_capabilities_match_family() {
        let caps = capabilities();
        match os_family() {
            OsFamily::MacOs => assert!(caps.bundle_convention),
            OsFamily::Windows => {
                assert!(caps.altered_dependent_search);
                assert!(caps.stdcall_decoration);
            }
            OsFamily::Linux | OsFamily::Other => {
                assert!(caps.versioned_so_match);
                assert!(!caps.bundle_convention);
            }
        }
    }
}
