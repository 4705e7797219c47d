//! Extended-attribute store.
//!
//! # Platform Behavior
//! - **macOS**: keys are used verbatim (`civitai.sha256sum`), matching what
//!   Finder and Spotlight already index.
//! - **Linux**: unprivileged processes may only write the `user.` namespace,
//!   so logical keys are stored as `user.<key>` and stripped on listing.

// Direct libc calls are this module's purpose; each block documents its SAFETY.
#![allow(unsafe_code)]

use super::AttributeStore;
use crate::{IntakeError, Result};
use std::ffi::{CString, OsStr};
use std::io;
use std::path::Path;

#[cfg(target_os = "linux")]
const OS_KEY_PREFIX: &str = "user.";
#[cfg(target_os = "macos")]
const OS_KEY_PREFIX: &str = "";

#[cfg(target_os = "linux")]
const MISSING_ATTR: i32 = libc::ENODATA;
#[cfg(target_os = "macos")]
const MISSING_ATTR: i32 = libc::ENOATTR;

/// Attribute store backed by OS extended attributes.
#[derive(Debug, Clone, Default)]
pub struct XattrStore;

impl XattrStore {
    pub fn new() -> Self {
        Self
    }
}

fn c_path(path: &Path) -> Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| IntakeError::attribute(path, "*", "path contains a NUL byte"))
}

fn c_key(path: &Path, key: &str) -> Result<CString> {
    CString::new(format!("{OS_KEY_PREFIX}{key}"))
        .map_err(|_| IntakeError::attribute(path, key, "key contains a NUL byte"))
}

fn os_error(path: &Path, key: &str, err: io::Error) -> IntakeError {
    IntakeError::AttributeIo {
        path: path.to_path_buf(),
        key: key.to_string(),
        message: err.to_string(),
        source: Some(err),
    }
}

#[cfg(target_os = "linux")]
fn raw_get(path: &CString, name: &CString, buf: &mut [u8]) -> isize {
    // SAFETY: both pointers come from live CStrings; `buf` is valid for
    // `buf.len()` bytes (a zero length with a dangling pointer is a size query).
    unsafe {
        libc::getxattr(
            path.as_ptr(),
            name.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    }
}

#[cfg(target_os = "macos")]
fn raw_get(path: &CString, name: &CString, buf: &mut [u8]) -> isize {
    // SAFETY: as above; position 0 and no options.
    unsafe {
        libc::getxattr(
            path.as_ptr(),
            name.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
            0,
            0,
        )
    }
}

#[cfg(target_os = "linux")]
fn raw_set(path: &CString, name: &CString, value: &[u8]) -> i32 {
    // SAFETY: pointers come from live CStrings and a live slice of `value.len()` bytes.
    unsafe {
        libc::setxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
        )
    }
}

#[cfg(target_os = "macos")]
fn raw_set(path: &CString, name: &CString, value: &[u8]) -> i32 {
    // SAFETY: as above; position 0 and no options.
    unsafe {
        libc::setxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
            0,
        )
    }
}

#[cfg(target_os = "linux")]
fn raw_list(path: &CString, buf: &mut [u8]) -> isize {
    // SAFETY: `path` is a live CString and `buf` is valid for `buf.len()` bytes.
    unsafe { libc::listxattr(path.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) }
}

#[cfg(target_os = "macos")]
fn raw_list(path: &CString, buf: &mut [u8]) -> isize {
    // SAFETY: as above; no options.
    unsafe { libc::listxattr(path.as_ptr(), buf.as_mut_ptr().cast(), buf.len(), 0) }
}

impl AttributeStore for XattrStore {
    fn get(&self, path: &Path, key: &str) -> Result<Option<Vec<u8>>> {
        let cpath = c_path(path)?;
        let name = c_key(path, key)?;

        // The value can change size between the query and the read; retry.
        loop {
            let size = raw_get(&cpath, &name, &mut []);
            if size < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(MISSING_ATTR) {
                    return Ok(None);
                }
                return Err(os_error(path, key, err));
            }

            let mut buf = vec![0u8; size as usize];
            let read = raw_get(&cpath, &name, &mut buf);
            if read < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(code) if code == MISSING_ATTR => return Ok(None),
                    Some(libc::ERANGE) => continue,
                    _ => return Err(os_error(path, key, err)),
                }
            }
            buf.truncate(read as usize);
            return Ok(Some(buf));
        }
    }

    fn set(&self, path: &Path, key: &str, value: &[u8]) -> Result<()> {
        let cpath = c_path(path)?;
        let name = c_key(path, key)?;
        if raw_set(&cpath, &name, value) != 0 {
            return Err(os_error(path, key, io::Error::last_os_error()));
        }
        Ok(())
    }

    fn list(&self, path: &Path) -> Result<Vec<String>> {
        let cpath = c_path(path)?;
        loop {
            let size = raw_list(&cpath, &mut []);
            if size < 0 {
                return Err(os_error(path, "*", io::Error::last_os_error()));
            }
            if size == 0 {
                return Ok(Vec::new());
            }

            let mut buf = vec![0u8; size as usize];
            let read = raw_list(&cpath, &mut buf);
            if read < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ERANGE) {
                    continue;
                }
                return Err(os_error(path, "*", err));
            }
            buf.truncate(read as usize);

            return Ok(buf
                .split(|b| *b == 0)
                .filter(|name| !name.is_empty())
                .filter_map(|name| {
                    use std::os::unix::ffi::OsStrExt;
                    OsStr::from_bytes(name)
                        .to_str()?
                        .strip_prefix(OS_KEY_PREFIX)
                        .map(str::to_string)
                })
                .collect());
        }
    }
}
