//! Library resolution: turns a logical name or path into a loadable
//! location.
//!
//! Strategies run in a fixed order and the first hit wins: the literal
//! filesystem path, registered search paths, the resource context (with
//! extraction for byte-only hits), the platform default search, and the
//! bundle convention where the platform defines one. A failure reports
//! every candidate tried, in order.

use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{LinkError, Result};
use crate::extract;
use crate::platform;
use crate::resource::{ResourceContext, ResourceData};
use crate::search::{self, SearchPaths};

/// A concrete loadable location produced by resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedLocation {
    /// A module file on disk.
    Path(PathBuf),
    /// Loadable through the platform loader's own search under this file
    /// name (loader caches have no portable directory scan).
    System(String),
    /// The running process's own export table.
    Process,
}

impl ResolvedLocation {
    /// Human-readable location for diagnostics and load errors.
    pub fn describe(&self) -> String {
        match self {
            ResolvedLocation::Path(path) => path.display().to_string(),
            ResolvedLocation::System(name) => format!("<system:{}>", name),
            ResolvedLocation::Process => "<current process>".to_string(),
        }
    }
}

/// Resolve against the process-wide search registry, without a resource
/// context.
pub fn resolve(name_or_path: &str) -> Result<ResolvedLocation> {
    resolve_with(name_or_path, None, search::global())
}

/// Resolve `name_or_path`, consulting `context` for resource lookups and
/// `registry` for registered search paths.
///
/// An omitted context only skips the resource strategy; it is never
/// itself a failure. Extraction failures are final and surface
/// immediately — the remaining strategies are not tried over a
/// half-materialized resource.
pub fn resolve_with(
    name_or_path: &str,
    context: Option<&dyn ResourceContext>,
    registry: &SearchPaths,
) -> Result<ResolvedLocation> {
    let mut attempts = Vec::new();

    if let Some(found) = try_literal_path(name_or_path, &mut attempts) {
        return Ok(found);
    }
    if let Some(found) = try_search_paths(name_or_path, registry, &mut attempts) {
        return Ok(found);
    }
    if let Some(ctx) = context {
        if let Some(found) = try_context(name_or_path, ctx, &mut attempts)? {
            return Ok(found);
        }
    }
    if let Some(found) = try_default_search(name_or_path, &mut attempts) {
        return Ok(found);
    }
    if platform::capabilities().bundle_convention {
        if let Some(found) = try_framework(name_or_path, &mut attempts) {
            return Ok(found);
        }
    }

    Err(LinkError::NotFound {
        name: name_or_path.to_string(),
        attempts,
    })
}

fn try_literal_path(name: &str, attempts: &mut Vec<String>) -> Option<ResolvedLocation> {
    let path = Path::new(name);
    attempts.push(format!("literal path {}", name));
    if path.is_file() {
        debug!("resolved '{}' as a literal path", name);
        return Some(ResolvedLocation::Path(path.to_path_buf()));
    }
    // An absolute path given without platform decoration: retry the
    // mapped file name of the final component in the same directory.
    if path.is_absolute() {
        if let (Some(parent), Some(leaf)) =
            (path.parent(), path.file_name().and_then(|n| n.to_str()))
        {
            let mapped = parent.join(platform::map_library_name(leaf));
            if mapped != path {
                attempts.push(format!("literal path {}", mapped.display()));
                if mapped.is_file() {
                    debug!("resolved '{}' as {}", name, mapped.display());
                    return Some(ResolvedLocation::Path(mapped));
                }
            }
        }
    }
    None
}

fn try_search_paths(
    name: &str,
    registry: &SearchPaths,
    attempts: &mut Vec<String>,
) -> Option<ResolvedLocation> {
    let mapped = platform::map_library_name(name);
    for dir in registry.paths_for(name) {
        let candidate = dir.join(&mapped);
        attempts.push(format!("search path {}", candidate.display()));
        if candidate.is_file() {
            debug!("resolved '{}' via registered search path", name);
            return Some(ResolvedLocation::Path(candidate));
        }
    }
    None
}

fn try_context(
    name: &str,
    context: &dyn ResourceContext,
    attempts: &mut Vec<String>,
) -> Result<Option<ResolvedLocation>> {
    // A leading slash is an absolute-style resource name: those bytes are
    // looked up exactly before falling back to the mapped file name.
    let mut names = Vec::new();
    if name.starts_with('/') {
        names.push(name.to_string());
    }
    let mapped = platform::map_library_name(name.trim_start_matches('/'));
    if !names.contains(&mapped) {
        names.push(mapped);
    }

    for resource_name in &names {
        attempts.push(format!("resource {}", resource_name));
        match context.lookup(resource_name) {
            Some(ResourceData::File(path)) => {
                debug!("resolved '{}' via resource context in place", name);
                return Ok(Some(ResolvedLocation::Path(path)));
            }
            Some(ResourceData::Bytes(bytes)) => {
                let suggested = resource_name
                    .rsplit('/')
                    .next()
                    .unwrap_or(resource_name.as_str());
                let path = extract::extract_to_file(&bytes, suggested)?;
                debug!("resolved '{}' via resource context extraction", name);
                return Ok(Some(ResolvedLocation::Path(path)));
            }
            None => {}
        }
    }
    Ok(None)
}

fn try_default_search(name: &str, attempts: &mut Vec<String>) -> Option<ResolvedLocation> {
    let mapped = platform::map_library_name(name);
    let versioned_match = platform::capabilities().versioned_so_match
        && !name.contains('/')
        && !name.contains(".so");

    for dir in platform::default_search_paths() {
        let candidate = dir.join(&mapped);
        attempts.push(format!("default path {}", candidate.display()));
        if candidate.is_file() && is_loadable_module(&candidate) {
            debug!("resolved '{}' via default search", name);
            return Some(ResolvedLocation::Path(candidate));
        }
        if versioned_match {
            if let Some(versioned) = match_versioned_so(&dir, name) {
                attempts.push(format!("default path {}", versioned.display()));
                debug!("resolved '{}' via versioned match", name);
                return Some(ResolvedLocation::Path(versioned));
            }
        }
    }

    // The loader's own search (ld.so cache and friends) covers locations
    // no directory scan can enumerate, including modules the process
    // already links.
    attempts.push(format!("system loader {}", mapped));
    if trial_open(&mapped) {
        debug!("resolved '{}' through the system loader as {}", name, mapped);
        return Some(ResolvedLocation::System(mapped));
    }
    None
}

/// Pick the highest-versioned `lib<name>.so.<version>` in `dir`. ELF
/// systems often ship only versioned runtime names, leaving the bare
/// `.so` link to the dev package.
fn match_versioned_so(dir: &Path, name: &str) -> Option<PathBuf> {
    let prefix = format!("lib{}.so.", name);
    let entries = std::fs::read_dir(dir).ok()?;
    let mut best: Option<(Vec<u64>, PathBuf)> = None;
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let file_name = match file_name.to_str() {
            Some(n) => n,
            None => continue,
        };
        let version = match file_name.strip_prefix(&prefix) {
            Some(v) => v,
            None => continue,
        };
        if !entry.path().is_file() {
            continue;
        }
        let key: Vec<u64> = version
            .split('.')
            .map(|part| part.parse().unwrap_or(0))
            .collect();
        if best.as_ref().map_or(true, |(existing, _)| key > *existing) {
            best = Some((key, entry.path()));
        }
    }
    best.map(|(_, path)| path)
}

/// Whether `path` starts with the platform's module magic. ELF systems
/// ship text linker scripts under the bare `.so` name when the dev
/// package is installed; those must not win the default search.
fn is_loadable_module(path: &Path) -> bool {
    use std::io::Read;

    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_err() {
        return false;
    }
    match platform::os_family() {
        platform::OsFamily::Linux | platform::OsFamily::Other => {
            magic == [0x7f, b'E', b'L', b'F']
        }
        platform::OsFamily::MacOs => matches!(
            magic,
            [0xcf, 0xfa, 0xed, 0xfe] | [0xce, 0xfa, 0xed, 0xfe] | [0xca, 0xfe, 0xba, 0xbe]
        ),
        platform::OsFamily::Windows => magic[..2] == *b"MZ",
    }
}

/// Probe loadability through the OS loader. The module is dropped
/// immediately; the cache performs the real open.
fn trial_open(mapped: &str) -> bool {
    // Safety: probing an OS-loader-visible name; initializer code running
    // here would also run for the real load.
    unsafe { libloading::Library::new(mapped).is_ok() }
}

/// Candidate paths for the platform bundle convention, in try order:
/// the exact path as given, then the `.framework`-derived leaf, and for
/// bare names each standard framework root. Pure generation — callers
/// keep only candidates that exist as files, since loose matching
/// differs across loader variants.
pub fn framework_candidates(name: &str) -> Vec<PathBuf> {
    let path = Path::new(name);
    let mut candidates = Vec::new();

    if path.is_absolute() {
        let leaf = match path.file_name().and_then(|n| n.to_str()) {
            Some(leaf) => leaf,
            None => return candidates,
        };
        candidates.push(path.to_path_buf());
        if let Some(stem) = leaf.strip_suffix(".framework") {
            // `<path>.framework` carries its module as `<path>.framework/<stem>`.
            candidates.push(path.join(stem));
        } else if path.extension().is_none() {
            // Truncated form: `<path>` names `<path>.framework/<leaf>`.
            let mut bundle = path.as_os_str().to_os_string();
            bundle.push(".framework");
            candidates.push(PathBuf::from(bundle).join(leaf));
        }
    } else if !name.contains('/') {
        for root in platform::framework_roots() {
            candidates.push(root.join(format!("{}.framework", name)).join(name));
        }
    }

    candidates
}

fn try_framework(name: &str, attempts: &mut Vec<String>) -> Option<ResolvedLocation> {
    for candidate in framework_candidates(name) {
        attempts.push(format!("framework {}", candidate.display()));
        if candidate.is_file() {
            debug!("resolved '{}' via bundle convention", name);
            return Some(ResolvedLocation::Path(candidate));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::DirContext;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "loadstone_test_resolve_{}_{}",
            tag,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn test_literal_path_verbatim() {
        let dir = scratch_dir("literal");
        let file = dir.join("libliteral.so");
        std::fs::write(&file, b"module").expect("write");

        let resolved = resolve_with(
            file.to_str().expect("utf-8 path"),
            None,
            &SearchPaths::new(),
        )
        .expect("resolves");
        assert_eq!(resolved, ResolvedLocation::Path(file));
    }

    #[test]
    fn test_literal_path_mapped_basename_retry() {
        let dir = scratch_dir("truncated");
        let mapped = platform::map_library_name("truncated");
        std::fs::write(dir.join(&mapped), b"module").expect("write");

        // The undecorated absolute path does not exist; its mapped
        // sibling does.
        let given = dir.join("truncated");
        let resolved = resolve_with(
            given.to_str().expect("utf-8 path"),
            None,
            &SearchPaths::new(),
        )
        .expect("resolves");
        assert_eq!(resolved, ResolvedLocation::Path(dir.join(mapped)));
    }

    #[test]
    fn test_registered_search_path_wins() {
        let dir = scratch_dir("registered");
        let mapped = platform::map_library_name("registered-demo");
        let file = dir.join(&mapped);
        std::fs::write(&file, b"module").expect("write");

        let registry = SearchPaths::new();
        registry.add("registered-demo", &dir);
        let resolved =
            resolve_with("registered-demo", None, &registry).expect("resolves");
        assert_eq!(resolved, ResolvedLocation::Path(file));
    }

    #[test]
    fn test_search_paths_tried_in_registration_order() {
        let first = scratch_dir("order_first");
        let second = scratch_dir("order_second");
        let mapped = platform::map_library_name("ordered-demo");
        std::fs::write(second.join(&mapped), b"second").expect("write");

        let registry = SearchPaths::new();
        registry.add("ordered-demo", &first);
        registry.add("ordered-demo", &second);
        let resolved = resolve_with("ordered-demo", None, &registry).expect("resolves");
        assert_eq!(resolved, ResolvedLocation::Path(second.join(&mapped)));

        // A hit in the earlier directory shadows the later one.
        std::fs::write(first.join(&mapped), b"first").expect("write");
        let resolved = resolve_with("ordered-demo", None, &registry).expect("resolves");
        assert_eq!(resolved, ResolvedLocation::Path(first.join(&mapped)));
    }

    #[test]
    fn test_context_hit_served_in_place() {
        let dir = scratch_dir("ctx");
        let mapped = platform::map_library_name("ctx-demo");
        let file = dir.join(&mapped);
        std::fs::write(&file, b"module").expect("write");

        let ctx = DirContext::new(&dir);
        let resolved =
            resolve_with("ctx-demo", Some(&ctx), &SearchPaths::new()).expect("resolves");
        assert_eq!(resolved, ResolvedLocation::Path(file));
    }

    #[test]
    fn test_absolute_resource_name_exact_first() {
        let dir = scratch_dir("ctx_abs");
        std::fs::write(dir.join("exact-name"), b"module").expect("write");

        let ctx = DirContext::new(&dir);
        let resolved = resolve_with("/exact-name", Some(&ctx), &SearchPaths::new())
            .expect("resolves");
        assert_eq!(resolved, ResolvedLocation::Path(dir.join("exact-name")));
    }

    #[test]
    fn test_not_found_enumerates_default_search() {
        let name = format!("no-such-library-{}", std::process::id());
        let err = resolve_with(&name, None, &SearchPaths::new())
            .expect_err("cannot resolve");
        match err {
            LinkError::NotFound { name: failed, attempts } => {
                assert_eq!(failed, name);
                assert!(attempts.iter().any(|a| a.starts_with("literal path")));
                assert!(
                    attempts
                        .iter()
                        .any(|a| a.starts_with("default path") || a.starts_with("system loader")),
                    "default search missing from attempts: {:?}",
                    attempts
                );
            }
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_framework_candidates_for_bundle_path() {
        let candidates = framework_candidates("/Root/CoreServices.framework");
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("/Root/CoreServices.framework"),
                PathBuf::from("/Root/CoreServices.framework/CoreServices"),
            ]
        );
    }

    #[test]
    fn test_framework_candidates_for_truncated_path() {
        let candidates = framework_candidates("/Root/CoreServices");
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("/Root/CoreServices"),
                PathBuf::from("/Root/CoreServices.framework/CoreServices"),
            ]
        );
    }

    #[test]
    fn test_framework_candidates_for_full_path() {
        let candidates =
            framework_candidates("/Root/CoreServices.framework/CoreServices");
        assert_eq!(
            candidates.first(),
            Some(&PathBuf::from("/Root/CoreServices.framework/CoreServices"))
        );
    }

    #[test]
    fn test_framework_candidates_for_bare_name() {
        let candidates = framework_candidates("CoreServices");
        assert!(!candidates.is_empty());
        assert!(candidates
            .iter()
            .all(|c| c.ends_with("CoreServices.framework/CoreServices")));
    }

    #[test]
    fn test_framework_existence_precheck_selects_inner_module() {
        // Bundle directory exists, module file exists inside it: the
        // directory is skipped, the file wins.
        let root = scratch_dir("fw");
        let bundle = root.join("Demo.framework");
        std::fs::create_dir_all(&bundle).expect("bundle dir");
        std::fs::write(bundle.join("Demo"), b"module").expect("write");

        let name = bundle.to_str().expect("utf-8 path").to_string();
        let selected = framework_candidates(&name)
            .into_iter()
            .find(|c| c.is_file());
        assert_eq!(selected, Some(bundle.join("Demo")));
    }

    #[test]
    fn test_framework_truncated_path_resolves_via_suffix() {
        let root = scratch_dir("fw_trunc");
        let bundle = root.join("Demo.framework");
        std::fs::create_dir_all(&bundle).expect("bundle dir");
        std::fs::write(bundle.join("Demo"), b"module").expect("write");

        let truncated = root.join("Demo");
        let name = truncated.to_str().expect("utf-8 path").to_string();
        let selected = framework_candidates(&name)
            .into_iter()
            .find(|c| c.is_file());
        assert_eq!(selected, Some(bundle.join("Demo")));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_versioned_so_match_prefers_highest() {
        let dir = scratch_dir("versioned");
        std::fs::write(dir.join("libvdemo.so.1"), b"old").expect("write");
        std::fs::write(dir.join("libvdemo.so.2.5"), b"mid").expect("write");
        std::fs::write(dir.join("libvdemo.so.10"), b"new").expect("write");

        let best = match_versioned_so(&dir, "vdemo").expect("matches");
        assert_eq!(best, dir.join("libvdemo.so.10"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_default_search_finds_versioned_c_runtime() {
        // Non-glibc systems name their C runtime differently; only the
        // positive path is asserted.
        match resolve("c") {
            Ok(ResolvedLocation::Path(path)) => {
                let name = path.file_name().and_then(|n| n.to_str()).expect("name");
                assert!(name.starts_with("libc.so"), "unexpected match: {}", name);
            }
            Ok(ResolvedLocation::System(name)) => assert!(name.contains("libc")),
            Ok(other) => panic!("unexpected location {:?}", other),
            Err(LinkError::NotFound { .. }) => {}
            Err(other) => panic!("unexpected failure: {}", other),
        }
    }
}
