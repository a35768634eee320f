use std::io;
use std::path::{Component, Path, PathBuf};

/// Maps paths seen through the mount onto the backing working tree.
///
/// The working tree for a mount lives at `prefix` joined with the mount
/// point, so `/mnt/docs` under prefix `/vcfs` is backed by `/vcfs/mnt/docs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoPaths {
    root: PathBuf,
}

impl RepoPaths {
    pub fn new(prefix: impl AsRef<Path>, mount_point: impl AsRef<Path>) -> Self {
        let mount_point = mount_point.as_ref();
        let relative: PathBuf = mount_point
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        Self {
            root: prefix.as_ref().join(relative),
        }
    }

    /// Backing directory for the whole mount
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Backing path for `fs_path`, a path relative to the mount root.
    ///
    /// `..` components are rejected so callers cannot escape the tree.
    pub fn resolve(&self, fs_path: impl AsRef<Path>) -> io::Result<PathBuf> {
        let mut resolved = self.root.clone();
        for component in fs_path.as_ref().components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => resolved.push(part),
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("{} escapes the mount", fs_path.as_ref().display()),
                    ))
                }
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_point_is_nested_under_prefix() {
        let paths = RepoPaths::new("/vcfs", "/mnt/docs");
        assert_eq!(paths.root(), Path::new("/vcfs/mnt/docs"));
        assert_eq!(
            paths.resolve("/notes/todo.md").unwrap(),
            PathBuf::from("/vcfs/mnt/docs/notes/todo.md")
        );
        assert_eq!(paths.resolve("/").unwrap(), PathBuf::from("/vcfs/mnt/docs"));
    }

    #[test]
    fn parent_components_are_rejected() {
        let paths = RepoPaths::new("/vcfs", "docs");
        let err = paths.resolve("/../../etc/passwd").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }
}
