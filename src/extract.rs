//! Materializes resource bytes as loadable files.
//!
//! Extracted files land in a crate-owned directory under the system temp
//! area. Re-extraction of bit-identical content reuses the existing file;
//! a content mismatch under the same suggested name publishes to a
//! content-tagged sibling instead, so stale bytes are never served.
//! Files created by this process are removed best-effort at exit.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Once;

use log::debug;
use parking_lot::Mutex;
use ring::digest;

use crate::error::{LinkError, Result};

static EXTRACT_ROOT_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);
static CLEANUP: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());
static CLEANUP_HOOK: Once = Once::new();

/// Directory extracted files land in. Defaults to a crate-owned
/// subdirectory of the system temp area; overridable through
/// [`crate::config::Config`].
pub fn extraction_root() -> PathBuf {
    if let Some(root) = EXTRACT_ROOT_OVERRIDE.lock().clone() {
        return root;
    }
    std::env::temp_dir().join("loadstone")
}

/// Install or clear the extraction-directory override.
pub(crate) fn set_extraction_root(root: Option<PathBuf>) {
    *EXTRACT_ROOT_OVERRIDE.lock() = root;
}

/// Copy `bytes` to a loadable file named after `suggested_name`.
///
/// The name is preserved verbatim, including non-ASCII characters. When a
/// file of that name already holds identical content it is reused;
/// differing content forces a content-tagged name. Publication is atomic
/// (write to a unique sibling, then rename), so concurrent extraction of
/// one name never yields a torn file.
pub fn extract_to_file(bytes: &[u8], suggested_name: &str) -> Result<PathBuf> {
    let root = extraction_root();
    fs::create_dir_all(&root)
        .map_err(|e| extraction_err(suggested_name, &root, e))?;

    let content_digest = sha256(bytes);
    let primary = root.join(suggested_name);
    match existing_matches(&primary, &content_digest) {
        Some(true) => {
            debug!("reusing extracted copy at {}", primary.display());
            Ok(primary)
        }
        Some(false) => {
            // Same suggested name, different bytes: publish under a name
            // tagged with the content digest, itself reusable.
            let tagged = root.join(tagged_name(suggested_name, &content_digest));
            if let Some(true) = existing_matches(&tagged, &content_digest) {
                debug!("reusing extracted copy at {}", tagged.display());
                return Ok(tagged);
            }
            publish(bytes, &tagged, suggested_name)
        }
        None => publish(bytes, &primary, suggested_name),
    }
}

fn sha256(bytes: &[u8]) -> Vec<u8> {
    digest::digest(&digest::SHA256, bytes).as_ref().to_vec()
}

/// Whether `path` exists with exactly `content_digest`. `None` when the
/// file is absent or unreadable.
fn existing_matches(path: &Path, content_digest: &[u8]) -> Option<bool> {
    let existing = fs::read(path).ok()?;
    Some(sha256(&existing) == content_digest)
}

fn tagged_name(suggested: &str, content_digest: &[u8]) -> String {
    let tag: String = content_digest
        .iter()
        .take(4)
        .map(|b| format!("{:02x}", b))
        .collect();
    match suggested.rsplit_once('.') {
        Some((stem, ext)) => format!("{}-{}.{}", stem, tag, ext),
        None => format!("{}-{}", suggested, tag),
    }
}

fn publish(bytes: &[u8], dest: &Path, name: &str) -> Result<PathBuf> {
    let file_name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name);
    let staging = dest.with_file_name(format!(".{}.{}.part", file_name, std::process::id()));
    {
        let mut out =
            fs::File::create(&staging).map_err(|e| extraction_err(name, &staging, e))?;
        out.write_all(bytes)
            .map_err(|e| extraction_err(name, &staging, e))?;
    }
    fs::rename(&staging, dest).map_err(|e| extraction_err(name, dest, e))?;
    register_cleanup(dest.to_path_buf());
    debug!("extracted {} byte(s) to {}", bytes.len(), dest.display());
    Ok(dest.to_path_buf())
}

fn extraction_err(name: &str, dest: &Path, source: std::io::Error) -> LinkError {
    LinkError::Extraction {
        name: name.to_string(),
        dest: dest.to_path_buf(),
        source,
    }
}

fn register_cleanup(path: PathBuf) {
    CLEANUP_HOOK.call_once(|| {
        // Failure to register just means the files persist, which the
        // temp area tolerates.
        #[cfg(unix)]
        // Safety: the handler only touches process-local state and does
        // not unwind.
        unsafe {
            libc::atexit(remove_extracted_files);
        }
    });
    CLEANUP.lock().push(path);
}

#[cfg(unix)]
extern "C" fn remove_extracted_files() {
    let paths = std::mem::take(&mut *CLEANUP.lock());
    for path in paths {
        let _ = fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_bytes_reuse_path() {
        let name = format!("libreuse-{}.so", std::process::id());
        let first = extract_to_file(b"module payload", &name).expect("first extraction");
        let second = extract_to_file(b"module payload", &name).expect("second extraction");
        assert_eq!(first, second);
        assert_eq!(fs::read(&first).expect("read back"), b"module payload");
    }

    #[test]
    fn test_mismatched_bytes_get_distinct_path() {
        let name = format!("libclash-{}.so", std::process::id());
        let first = extract_to_file(b"payload one", &name).expect("first extraction");
        let second = extract_to_file(b"payload two", &name).expect("second extraction");
        assert_ne!(first, second);
        assert_eq!(fs::read(&first).expect("read first"), b"payload one");
        assert_eq!(fs::read(&second).expect("read second"), b"payload two");

        // The tagged name is itself idempotent.
        let third = extract_to_file(b"payload two", &name).expect("third extraction");
        assert_eq!(second, third);
    }

    #[test]
    fn test_unicode_name_preserved_verbatim() {
        let unicode = "\u{444}\u{43b}\u{441}\u{432}\u{443}";
        let name = format!("lib{}-{}.so", unicode, std::process::id());
        let path = extract_to_file(b"unicode payload", &name).expect("extraction");
        let file_name = path.file_name().and_then(|n| n.to_str()).expect("file name");
        assert!(file_name.contains(unicode));
        assert_eq!(fs::read(&path).expect("read back"), b"unicode payload");
    }

    #[test]
    fn test_no_staging_leftovers() {
        let name = format!("libstaging-{}.so", std::process::id());
        let path = extract_to_file(b"staged payload", &name).expect("extraction");
        let dir = path.parent().expect("parent dir");
        let leftovers: Vec<_> = fs::read_dir(dir)
            .expect("read dir")
            .flatten()
            .filter(|e| {
                let n = e.file_name();
                let n = n.to_string_lossy().into_owned();
                n.contains(&name) && n.ends_with(".part")
            })
            .collect();
        assert!(leftovers.is_empty());
    }
}
