// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! File-system path helpers.
//!
//! The VFS works on absolute, `/`-separated paths. These helpers split paths into
//! components with `.`/`..` handling (`..` never climbs above the root) and derive
//! parent/leaf names for entry insertion and removal.

/// Split an absolute path into normalized components.
///
/// `.` components are dropped and `..` pops the previous component (never above the
/// root). Empty components (doubled slashes, trailing slash) are ignored.
pub fn normalized_components(path: &str) -> Vec<&str> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            _ => parts.push(part),
        }
    }
    parts
}

/// Join `base` (absolute) and `path`, producing an absolute path. Relative paths are
/// interpreted against `base`.
pub fn absolutize(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_owned();
    }
    if path.starts_with('/') {
        return path.to_owned();
    }
    if base == "/" {
        format!("/{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Split an absolute path into `(parent, name)`. The root has no parent.
pub fn parent_and_name(path: &str) -> Option<(String, &str)> {
    let components = normalized_components(path);
    let (&name, ancestors) = components.split_last()?;
    let parent = if ancestors.is_empty() {
        "/".to_owned()
    } else {
        format!("/{}", ancestors.join("/"))
    };
    Some((parent, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization() {
        assert_eq!(normalized_components("/a/b/c"), ["a", "b", "c"]);
        assert_eq!(normalized_components("/a/./b//c/"), ["a", "b", "c"]);
        assert_eq!(normalized_components("/a/b/../c"), ["a", "c"]);
        // `..` never climbs above the root.
        assert_eq!(normalized_components("/../../a"), ["a"]);
        assert!(normalized_components("/").is_empty());
    }

    #[test]
    fn parents() {
        assert_eq!(parent_and_name("/a/b"), Some(("/a".to_owned(), "b")));
        assert_eq!(parent_and_name("/a"), Some(("/".to_owned(), "a")));
        assert_eq!(parent_and_name("/"), None);
    }

    #[test]
    fn absolutize_relative() {
        assert_eq!(absolutize("/", "bin"), "/bin");
        assert_eq!(absolutize("/usr", "bin"), "/usr/bin");
        assert_eq!(absolutize("/usr", "/bin"), "/bin");
        assert_eq!(absolutize("/usr", ""), "/usr");
    }
}
