//! Validation and decomposition of hierarchical keys.
//!
//! Every key in the namespace is a `/`-separated path. The root `/` always
//! exists; every other path starts with `/`, never ends with `/`, and has
//! non-empty segments free of NUL bytes.

use failure::Fail;

/// Reasons a path can be rejected.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Fail)]
pub enum PathError {
    /// The path is the empty string.
    #[fail(display = "path is empty")]
    Empty,

    /// The path does not start with `/`.
    #[fail(display = "path does not start with '/'")]
    NoLeadingSlash,

    /// The path ends with `/` (and is not the root).
    #[fail(display = "path ends with '/'")]
    TrailingSlash,

    /// The path contains an empty segment (`//`).
    #[fail(display = "path contains an empty segment")]
    EmptySegment,

    /// The path contains a NUL byte.
    #[fail(display = "path contains a NUL character")]
    NulChar,
}

/// Check that `path` is a well-formed hierarchical key.
pub fn validate(path: &str) -> Result<(), PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    if !path.starts_with('/') {
        return Err(PathError::NoLeadingSlash);
    }
    if path.contains('\0') {
        return Err(PathError::NulChar);
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(PathError::TrailingSlash);
    }
    if path.contains("//") {
        return Err(PathError::EmptySegment);
    }
    Ok(())
}

/// The parent of a valid non-root path: the longest strict prefix ending
/// before the final `/`. `parent("/x") == "/"`.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

/// The final segment of a valid non-root path.
pub fn segment(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Prepend a chroot prefix to a client-side path. An empty root leaves the
/// path untouched; joining the root path onto a non-empty root yields the
/// root itself.
pub fn join(root: &str, path: &str) -> String {
    if root.is_empty() {
        path.to_string()
    } else if path == "/" {
        root.to_string()
    } else {
        format!("{}{}", root, path)
    }
}

/// Strip a chroot prefix from a server-side path, the inverse of [`join`].
/// Paths outside the root are returned unchanged.
pub fn strip(root: &str, path: &str) -> String {
    if root.is_empty() {
        path.to_string()
    } else if path == root {
        "/".to_string()
    } else if let Some(rest) = path.strip_prefix(root) {
        rest.to_string()
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_well_formed_paths() {
        for p in &["/", "/a", "/a/b", "/q-", "/a/q-0000000001"] {
            assert_eq!(validate(p), Ok(()), "{}", p);
        }
    }

    #[test]
    fn rejects_malformed_paths() {
        assert_eq!(validate(""), Err(PathError::Empty));
        assert_eq!(validate("a/b"), Err(PathError::NoLeadingSlash));
        assert_eq!(validate("/a/"), Err(PathError::TrailingSlash));
        assert_eq!(validate("/a//b"), Err(PathError::EmptySegment));
        assert_eq!(validate("/a\0b"), Err(PathError::NulChar));
    }

    #[test]
    fn parent_and_segment() {
        assert_eq!(parent("/x"), "/");
        assert_eq!(parent("/a/b/c"), "/a/b");
        assert_eq!(segment("/x"), "x");
        assert_eq!(segment("/a/b/c"), "c");
    }

    #[test]
    fn chroot_round_trip() {
        assert_eq!(join("", "/a"), "/a");
        assert_eq!(join("/app", "/"), "/app");
        assert_eq!(join("/app", "/a/b"), "/app/a/b");
        assert_eq!(strip("/app", "/app/a/b"), "/a/b");
        assert_eq!(strip("/app", "/app"), "/");
        assert_eq!(strip("", "/a"), "/a");
    }
}
