//! Drive path normalization.
//!
//! Every path is stored in canonical absolute form: a leading `/`, no empty,
//! `.` or `..` segments, and no trailing slash (except the root itself).
//! `..` pops one segment and is inert at the root, so no path can escape the
//! drive. Normalization never fails.

/// The drive root.
pub const ROOT: &str = "/";

/// Canonical absolute form of `path`.
///
/// ```
/// use vault_meta::path::normalize;
///
/// assert_eq!(normalize("../hello.txt"), "/hello.txt");
/// assert_eq!(normalize("a//b/./c/../d/"), "/a/b/d");
/// assert_eq!(normalize(""), "/");
/// ```
pub fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return ROOT.to_string();
    }
    let mut out = String::with_capacity(path.len() + 1);
    for s in segments {
        out.push('/');
        out.push_str(s);
    }
    out
}

pub fn is_root(path: &str) -> bool {
    path == ROOT
}

/// Parent of a normalized path; `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if is_root(path) {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

/// Last segment of a normalized path; empty for the root.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

/// Strict ancestors of a normalized path, nearest first, excluding the root.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(parent(path), |p| parent(*p)).filter(|p| !is_root(p))
}

/// Prefix shared by every descendant of a normalized directory path.
pub fn child_prefix(dir: &str) -> String {
    if is_root(dir) {
        ROOT.to_string()
    } else {
        format!("{dir}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn dot_dot_is_inert_at_root() {
        assert_eq!(normalize(".."), "/");
        assert_eq!(normalize("/../../etc/passwd"), "/etc/passwd");
        assert_eq!(normalize("../hello.txt"), "/hello.txt");
    }

    #[test]
    fn separators_and_dots_collapse() {
        assert_eq!(normalize("/a/./b//c/"), "/a/b/c");
        assert_eq!(normalize("a\\b"), "/a/b");
        assert_eq!(normalize("/a/b/../c"), "/a/c");
    }

    #[test]
    fn parent_and_basename() {
        assert_eq!(parent("/a/b/c"), Some("/a/b"));
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(basename("/a/b/c.txt"), "c.txt");
        assert_eq!(basename("/"), "");
    }

    #[test]
    fn ancestors_nearest_first() {
        assert_eq!(ancestors("/a/b/c").collect::<Vec<_>>(), vec!["/a/b", "/a"]);
        assert_eq!(ancestors("/a").count(), 0);
    }

    #[test]
    fn child_prefixes() {
        assert_eq!(child_prefix("/"), "/");
        assert_eq!(child_prefix("/docs"), "/docs/");
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent_and_rooted(input in "[a-z./\\\\]{0,40}") {
            let once = normalize(&input);
            prop_assert!(once.starts_with('/'));
            prop_assert!(!once.contains("/../"));
            prop_assert!(!once.ends_with("/..") );
            prop_assert!(once == "/" || !once.ends_with('/'));
            prop_assert_eq!(normalize(&once), once.clone());
        }
    }
}
