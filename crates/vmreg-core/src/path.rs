//! Translation between browser paths and bracketed datastore paths.
//!
//! Enumeration yields hierarchical browser paths such as
//! `vmstores:\esxi.example.local\Datastore1\VM1\VM1.vmx`, while registration
//! expects the datastore-relative form `[Datastore1] VM1/VM1.vmx`.

use crate::config::RegistrationConfig;
use crate::{Result, VmregError};

fn is_separator(c: char) -> bool {
    c == '\\' || c == '/'
}

fn chars_match(a: char, b: char) -> bool {
    a == b || (is_separator(a) && is_separator(b)) || a.to_lowercase().eq(b.to_lowercase())
}

/// Return the part of `full_path` that follows `root` and its separator.
///
/// Comparison ignores case and treats `\` and `/` as the same separator.
fn strip_root<'a>(full_path: &'a str, root: &str) -> Option<&'a str> {
    let root = root.trim_end_matches(is_separator);
    let mut full_chars = full_path.char_indices();

    for root_char in root.chars() {
        let (_, full_char) = full_chars.next()?;
        if !chars_match(root_char, full_char) {
            return None;
        }
    }

    match full_chars.next() {
        Some((idx, c)) if is_separator(c) => Some(&full_path[idx..]),
        _ => None,
    }
}

/// Convert a browser path into the bracketed form used for registration.
///
/// Fails with [`VmregError::InvalidPath`] when `full_path` does not live under
/// `browser_root` or names the root itself.
pub fn correct_path(full_path: &str, browser_root: &str, datastore_name: &str) -> Result<String> {
    let invalid = || VmregError::InvalidPath {
        path: full_path.to_string(),
        root: browser_root.to_string(),
    };

    let remainder = strip_root(full_path, browser_root)
        .ok_or_else(invalid)?
        .trim_start_matches(is_separator);
    if remainder.is_empty() {
        return Err(invalid());
    }

    Ok(format!(
        "[{}] {}",
        datastore_name,
        remainder.replace('\\', "/")
    ))
}

/// Browser root of a datastore on a host: `vmstores:\<host>\<datastore>`.
pub fn browser_root_for(host: &str, datastore: &str) -> String {
    format!(
        "{}\\{}\\{}",
        RegistrationConfig::BROWSER_SCHEME,
        host,
        datastore
    )
}

/// Append a forward-slash relative path to a browser root.
pub fn join_browser_path(root: &str, relative: &str) -> String {
    let relative = relative.trim_matches(is_separator).replace('/', "\\");
    format!("{}\\{}", root.trim_end_matches(is_separator), relative)
}
