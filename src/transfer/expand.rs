//! Local path expansion for uploads.
//!
//! A local source is a plain file, a directory (walked recursively) or a
//! wildcard pattern. Directories and patterns expand to an [`Expansion`]:
//! the matched files plus the root their remote paths are relative to.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use super::TransferError;

/// Characters that make a source path a wildcard pattern.
const WILDCARD_CHARS: [char; 3] = ['*', '?', '['];

/// Files selected by a directory or pattern source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    /// Root the relative remote paths are computed from.
    pub root: PathBuf,
    /// Matched files, sorted.
    pub files: Vec<PathBuf>,
    /// Paths that could not be read while expanding, with the reason.
    pub unreadable: Vec<(PathBuf, TransferError)>,
}

impl Expansion {
    /// Path of `file` relative to the root, with `/` separators.
    #[must_use]
    pub fn relative(&self, file: &Path) -> String {
        let relative = file.strip_prefix(&self.root).unwrap_or(file);
        relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Remote destination of `file` under `remote_root`.
    #[must_use]
    pub fn remote_path(&self, file: &Path, remote_root: &str) -> String {
        join_remote(remote_root, &self.relative(file))
    }
}

/// What a local source resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalSelection {
    /// One regular file.
    Single(PathBuf),
    /// A directory walk or pattern match.
    Many(Expansion),
}

/// Returns true if `source` contains wildcard characters.
#[must_use]
pub fn is_pattern(source: &str) -> bool {
    source.contains(WILDCARD_CHARS)
}

/// Resolves a local source.
///
/// Fails with `LocalNotFound` for a missing plain path and with
/// `NothingToTransfer` when a directory or pattern yields no files.
/// Symlinked files count as files. Unreadable entries are collected in
/// [`Expansion::unreadable`] instead of aborting the expansion.
pub fn expand_local(source: &str) -> Result<LocalSelection, TransferError> {
    if is_pattern(source) {
        return expand_pattern(source).map(LocalSelection::Many);
    }

    let path = PathBuf::from(source);
    if path.is_dir() {
        return expand_dir(&path).map(LocalSelection::Many);
    }
    if path.is_file() {
        return Ok(LocalSelection::Single(path));
    }
    Err(TransferError::LocalNotFound(path))
}

fn expand_pattern(pattern: &str) -> Result<Expansion, TransferError> {
    let paths = glob::glob(pattern).map_err(|e| TransferError::InvalidPattern(e.to_string()))?;

    let mut files = Vec::new();
    let mut unreadable = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) if path.is_file() => files.push(path),
            Ok(_) => {}
            Err(e) => {
                warn!("Skipping {}: {}", e.path().display(), e.error());
                unreadable.push((
                    e.path().to_path_buf(),
                    TransferError::LocalIo(e.error().to_string()),
                ));
            }
        }
    }
    files.sort();

    if files.is_empty() && unreadable.is_empty() {
        return Err(TransferError::NothingToTransfer(pattern.to_string()));
    }

    let root = pattern_root(pattern);
    debug!(
        "Pattern {} matched {} file(s) under {}",
        pattern,
        files.len(),
        root.display()
    );
    Ok(Expansion {
        root,
        files,
        unreadable,
    })
}

fn expand_dir(dir: &Path) -> Result<Expansion, TransferError> {
    let mut files = Vec::new();
    let mut unreadable = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        match entry {
            Ok(entry) if entry.path().is_file() => files.push(entry.into_path()),
            Ok(_) => {}
            Err(e) => {
                let path = e.path().unwrap_or(dir).to_path_buf();
                warn!("Skipping {}: {}", path.display(), e);
                unreadable.push((path, TransferError::LocalIo(e.to_string())));
            }
        }
    }

    if files.is_empty() && unreadable.is_empty() {
        return Err(TransferError::NothingToTransfer(dir.display().to_string()));
    }

    debug!("Directory {} holds {} file(s)", dir.display(), files.len());
    Ok(Expansion {
        root: dir.to_path_buf(),
        files,
        unreadable,
    })
}

/// Longest leading run of components without wildcards.
fn pattern_root(pattern: &str) -> PathBuf {
    let mut root = PathBuf::new();
    for component in Path::new(pattern).components() {
        if component.as_os_str().to_string_lossy().contains(WILDCARD_CHARS) {
            break;
        }
        root.push(component);
    }
    root
}

/// Joins a remote directory and a relative path with `/`.
#[must_use]
pub fn join_remote(remote_root: &str, relative: &str) -> String {
    if relative.is_empty() {
        return remote_root.to_string();
    }
    if remote_root.is_empty() {
        return relative.to_string();
    }
    format!("{}/{}", remote_root.trim_end_matches('/'), relative)
}

/// Parent directory of a remote path, if it has one worth creating.
#[must_use]
pub fn remote_parent(remote: &str) -> Option<&str> {
    let trimmed = remote.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&trimmed[..idx]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("b.log"), "b").unwrap();
        fs::write(dir.path().join("sub/c.txt"), "c").unwrap();
        fs::write(dir.path().join("sub/deeper/d.txt"), "d").unwrap();
        dir
    }

    #[test]
    fn test_is_pattern() {
        assert!(is_pattern("*.txt"));
        assert!(is_pattern("file?.log"));
        assert!(is_pattern("[ab].txt"));
        assert!(!is_pattern("/etc/hosts"));
    }

    #[test]
    fn test_directory_expansion_keeps_relative_paths() {
        let dir = tree();
        let LocalSelection::Many(expansion) = expand_local(dir.path().to_str().unwrap()).unwrap()
        else {
            panic!("directory must expand");
        };

        let relative: Vec<String> = expansion
            .files
            .iter()
            .map(|f| expansion.relative(f))
            .collect();
        assert_eq!(
            relative,
            vec!["a.txt", "b.log", "sub/c.txt", "sub/deeper/d.txt"]
        );
        assert_eq!(
            expansion.remote_path(&expansion.files[2], "/srv/app/"),
            "/srv/app/sub/c.txt"
        );
    }

    #[test]
    fn test_pattern_expansion() {
        let dir = tree();
        let pattern = format!("{}/*.txt", dir.path().display());
        let LocalSelection::Many(expansion) = expand_local(&pattern).unwrap() else {
            panic!("pattern must expand");
        };

        assert_eq!(expansion.root, dir.path());
        assert_eq!(expansion.files.len(), 1);
        assert_eq!(expansion.relative(&expansion.files[0]), "a.txt");
    }

    #[test]
    fn test_zero_matches() {
        let dir = tree();
        let pattern = format!("{}/*.nope", dir.path().display());
        assert!(matches!(
            expand_local(&pattern),
            Err(TransferError::NothingToTransfer(_))
        ));

        let empty = dir.path().join("empty");
        fs::create_dir(&empty).unwrap();
        assert!(matches!(
            expand_local(empty.to_str().unwrap()),
            Err(TransferError::NothingToTransfer(_))
        ));
    }

    #[test]
    fn test_missing_and_single() {
        let dir = tree();
        assert!(matches!(
            expand_local(dir.path().join("missing").to_str().unwrap()),
            Err(TransferError::LocalNotFound(_))
        ));
        assert_eq!(
            expand_local(dir.path().join("a.txt").to_str().unwrap()).unwrap(),
            LocalSelection::Single(dir.path().join("a.txt"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_directory_expansion_follows_file_links() {
        let dir = tree();
        std::os::unix::fs::symlink(dir.path().join("a.txt"), dir.path().join("link.txt")).unwrap();

        let LocalSelection::Many(expansion) = expand_local(dir.path().to_str().unwrap()).unwrap()
        else {
            panic!("directory must expand");
        };

        let relative: Vec<String> = expansion
            .files
            .iter()
            .map(|f| expansion.relative(f))
            .collect();
        assert!(relative.contains(&"link.txt".to_string()));
        assert_eq!(relative.len(), 5);
        assert!(expansion.unreadable.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_link_is_reported_not_fatal() {
        let dir = tree();
        std::os::unix::fs::symlink(dir.path().join("gone.txt"), dir.path().join("broken.txt"))
            .unwrap();

        let LocalSelection::Many(expansion) = expand_local(dir.path().to_str().unwrap()).unwrap()
        else {
            panic!("directory must expand");
        };

        assert_eq!(expansion.files.len(), 4);
        assert_eq!(expansion.unreadable.len(), 1);
        assert!(expansion.unreadable[0].0.ends_with("broken.txt"));
    }

    #[test]
    fn test_remote_helpers() {
        assert_eq!(join_remote("/srv", "x/y"), "/srv/x/y");
        assert_eq!(join_remote("/srv/", "x"), "/srv/x");
        assert_eq!(remote_parent("/srv/x/y.txt"), Some("/srv/x"));
        assert_eq!(remote_parent("/y.txt"), None);
        assert_eq!(remote_parent("y.txt"), None);
    }
}
