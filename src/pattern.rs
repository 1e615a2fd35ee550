//! Observe-pattern matching.
//!
//! Patterns are Unix globs on the basename plus an optional directory part.
//! The directory part is split at `**` markers; each remaining segment must
//! occur, in order, somewhere in the path's directory.

use std::path::{Component, Path, PathBuf};

use globset::Glob;

/// Reports whether `path` matches `pattern`.
///
/// The basename of the pattern is a standard Unix glob (`*`, `?`, character
/// classes). A pattern directory of `.` matches any location. Otherwise each
/// non-empty `**`-delimited segment of the pattern directory is consumed from
/// the path directory by first-occurrence substring removal; a segment that
/// cannot be consumed fails the match.
pub fn matches(pattern: &str, path: &str) -> bool {
    let (pdir, pbase) = split_dir_base(pattern);
    let (dir, base) = split_dir_base(path);

    let Ok(glob) = Glob::new(&pbase) else {
        return false;
    };
    if !glob.compile_matcher().is_match(&base) {
        return false;
    }

    if pdir == "." {
        return true;
    }

    let mut rest = dir;
    for segment in pdir.split("**") {
        if segment.is_empty() {
            continue;
        }
        let segment = clean_path(segment);
        match rest.find(&segment) {
            Some(pos) => rest.replace_range(pos..pos + segment.len(), ""),
            None => return false,
        }
    }
    true
}

// Equivalent of splitting into dirname and basename, where a bare name has
// directory ".".
fn split_dir_base(p: &str) -> (String, String) {
    let path = Path::new(p);
    let base = path
        .file_name()
        .map(|b| b.to_string_lossy().into_owned())
        .unwrap_or_else(|| p.to_string());
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            parent.to_string_lossy().into_owned()
        }
        _ => ".".to_string(),
    };
    (dir, base)
}

// Lexical path cleanup: collapses repeated separators and `.` components and
// drops trailing slashes, without touching the filesystem.
fn clean_path(p: &str) -> String {
    let absolute = p.starts_with('/');
    let mut cleaned = PathBuf::new();
    for component in Path::new(p).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    cleaned.push("..");
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    let joined = cleaned.to_string_lossy().into_owned();
    if joined.is_empty() {
        return if absolute { "/".to_string() } else { ".".to_string() };
    }
    joined
}
