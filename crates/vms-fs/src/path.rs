//! Path handling shared by the filesystem readers and the mount tree.

use std::collections::VecDeque;

use vms_error::{Result, VmsError};

/// Symlinks followed while resolving one path before giving up.
pub const MAX_SYMLINK_FOLLOWS: usize = 40;

/// Lexically normalise `path` into an absolute path: collapse separators,
/// drop `.` and apply `..` without going above `/`.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Absolute normalised form of `path` taken relative to `base`.
#[must_use]
pub fn join_path(base: &str, path: &str) -> String {
    if path.starts_with('/') {
        normalize_path(path)
    } else {
        normalize_path(&format!("{base}/{path}"))
    }
}

/// Split a normalised absolute path into parent directory and final name.
/// The root has an empty name.
#[must_use]
pub fn parent_and_name(path: &str) -> (String, String) {
    let norm = normalize_path(path);
    match norm.rfind('/') {
        Some(0) => ("/".to_owned(), norm[1..].to_owned()),
        Some(idx) => (norm[..idx].to_owned(), norm[idx + 1..].to_owned()),
        None => ("/".to_owned(), norm),
    }
}

/// Directory-tree access a reader provides to the resolver.
pub(crate) trait Namespace {
    type Node: Clone;

    fn root(&self) -> Result<Self::Node>;

    /// Entry `name` in directory `dir`, or `None` when absent.
    fn lookup(&self, dir: &Self::Node, name: &str) -> Result<Option<Self::Node>>;

    fn is_dir(&self, node: &Self::Node) -> Result<bool>;

    /// Target of `node` in this filesystem's `/` namespace when it is a
    /// symlink.
    fn symlink_target(&self, node: &Self::Node) -> Result<Option<String>>;
}

#[derive(Debug, Clone)]
pub(crate) struct Resolved<N> {
    pub node: N,
    /// Canonical absolute path of `node` with every followed link applied.
    pub path: String,
}

/// Walk `path` (relative to `cwd`) through `ns`.
///
/// `..` steps back along the walked chain, so after a followed symlink it
/// leaves the link target rather than the link. The final component is
/// followed only when `follow_final` is set.
pub(crate) fn resolve<N: Namespace + ?Sized>(
    ns: &N,
    cwd: &str,
    path: &str,
    follow_final: bool,
) -> Result<Resolved<N::Node>> {
    let full = if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("{cwd}/{path}")
    };
    let root = ns.root()?;
    let mut chain: Vec<(String, N::Node)> = Vec::new();
    let mut pending: VecDeque<String> = split(&full);
    let mut follows = 0_usize;

    while let Some(comp) = pending.pop_front() {
        match comp.as_str() {
            "." => continue,
            ".." => {
                chain.pop();
                continue;
            }
            _ => {}
        }
        let dir = chain.last().map_or_else(|| root.clone(), |(_, n)| n.clone());
        if !ns.is_dir(&dir)? {
            return Err(VmsError::NotDirectory(display(&chain)));
        }
        let Some(node) = ns.lookup(&dir, &comp)? else {
            return Err(VmsError::NotFound(normalize_path(path_with(&chain, &comp).as_str())));
        };
        if pending.is_empty() && !follow_final {
            chain.push((comp, node));
            break;
        }
        if let Some(target) = ns.symlink_target(&node)? {
            follows += 1;
            if follows > MAX_SYMLINK_FOLLOWS {
                return Err(VmsError::SymlinkLoop(full));
            }
            if target.starts_with('/') {
                chain.clear();
            }
            for part in split(&target).into_iter().rev() {
                pending.push_front(part);
            }
            continue;
        }
        chain.push((comp, node));
    }

    let path = display(&chain);
    let node = chain.pop().map_or(root, |(_, n)| n);
    Ok(Resolved { node, path })
}

fn split(path: &str) -> VecDeque<String> {
    path.split('/')
        .filter(|c| !c.is_empty())
        .map(str::to_owned)
        .collect()
}

fn display<N>(chain: &[(String, N)]) -> String {
    let names: Vec<&str> = chain.iter().map(|(name, _)| name.as_str()).collect();
    format!("/{}", names.join("/"))
}

fn path_with<N>(chain: &[(String, N)], name: &str) -> String {
    format!("{}/{name}", display(chain))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn normalize_collapses_dots_and_slashes() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("//usr/./lib/../bin/"), "/usr/bin");
        assert_eq!(normalize_path("/../.."), "/");
        assert_eq!(join_path("/etc", "../var/log"), "/var/log");
        assert_eq!(join_path("/etc", "/boot"), "/boot");
    }

    #[test]
    fn parent_and_name_splits() {
        assert_eq!(
            parent_and_name("/etc/fstab"),
            ("/etc".to_owned(), "fstab".to_owned())
        );
        assert_eq!(parent_and_name("/etc"), ("/".to_owned(), "etc".to_owned()));
        assert_eq!(parent_and_name("/"), ("/".to_owned(), String::new()));
    }

    /// Flat namespace keyed by absolute path; values are `None` for
    /// directories, `Some(target)` for symlinks and `Some("")` for files.
    struct Tree(HashMap<&'static str, Option<&'static str>>);

    impl Namespace for Tree {
        type Node = String;

        fn root(&self) -> Result<String> {
            Ok("/".to_owned())
        }

        fn lookup(&self, dir: &String, name: &str) -> Result<Option<String>> {
            let path = join_path(dir, name);
            Ok(self.0.contains_key(path.as_str()).then_some(path))
        }

        fn is_dir(&self, node: &String) -> Result<bool> {
            Ok(node == "/" || matches!(self.0.get(node.as_str()), Some(None)))
        }

        fn symlink_target(&self, node: &String) -> Result<Option<String>> {
            Ok(match self.0.get(node.as_str()) {
                Some(Some(t)) if !t.is_empty() => Some((*t).to_owned()),
                _ => None,
            })
        }
    }

    fn tree() -> Tree {
        Tree(HashMap::from([
            ("/etc", None),
            ("/etc/hosts", Some("")),
            ("/usr", None),
            ("/usr/lib", None),
            ("/usr/lib/libc.so", Some("")),
            ("/lib", Some("usr/lib")),
            ("/abs", Some("/usr")),
            ("/loop", Some("/loop")),
            ("/usr/lib/up", Some("../../etc")),
        ]))
    }

    #[test]
    fn follows_intermediate_links() {
        let got = resolve(&tree(), "/", "/lib/libc.so", false).expect("resolve");
        assert_eq!(got.node, "/usr/lib/libc.so");
        assert_eq!(got.path, "/usr/lib/libc.so");
    }

    #[test]
    fn final_link_followed_only_on_request() {
        let t = tree();
        assert_eq!(resolve(&t, "/", "abs", false).expect("lstat").node, "/abs");
        let followed = resolve(&t, "/", "abs", true).expect("stat");
        assert_eq!(followed.node, "/usr");
        let up = resolve(&t, "/", "/lib/up/hosts", false).expect("relative link");
        assert_eq!(up.path, "/etc/hosts");
    }

    #[test]
    fn relative_to_cwd_and_dotdot() {
        let got = resolve(&tree(), "/usr/lib", "../../etc/hosts", false).expect("resolve");
        assert_eq!(got.path, "/etc/hosts");
    }

    #[test]
    fn lookup_errors() {
        let t = tree();
        assert!(matches!(
            resolve(&t, "/", "/nope", false),
            Err(VmsError::NotFound(_))
        ));
        assert!(matches!(
            resolve(&t, "/", "/etc/hosts/x", false),
            Err(VmsError::NotDirectory(_))
        ));
        assert!(matches!(
            resolve(&t, "/", "/loop", true),
            Err(VmsError::SymlinkLoop(_))
        ));
    }
}
