//! Glue between a pass-through filesystem and the relay.
//!
//! A filesystem implementation forwards each operation to the backing
//! working tree. [`MountSession`] supplies the three points where version
//! control has to be involved:
//!
//! - every operation starts with [`MountSession::before_op`], which pulls if
//!   the relay announced a change;
//! - releasing or flushing a written file commits and pushes;
//! - renaming a tracked file goes through `git mv`.

mod paths;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::client::{SyncClient, SyncOutcome};
use crate::vcs::SyncAction;

pub use paths::RepoPaths;

pub struct MountSession {
    paths: RepoPaths,
    sync: Option<SyncClient>,
    vcs: Arc<dyn SyncAction>,
}

impl MountSession {
    pub fn new(paths: RepoPaths, sync: SyncClient, vcs: Arc<dyn SyncAction>) -> Self {
        Self {
            paths,
            sync: Some(sync),
            vcs,
        }
    }

    /// A mount with no relay link; it never pulls on its own
    pub fn standalone(paths: RepoPaths, vcs: Arc<dyn SyncAction>) -> Self {
        Self {
            paths,
            sync: None,
            vcs,
        }
    }

    pub fn paths(&self) -> &RepoPaths {
        &self.paths
    }

    pub fn sync_client(&self) -> Option<&SyncClient> {
        self.sync.as_ref()
    }

    /// Pull-before-serve; call first in every filesystem operation
    pub fn before_op(&self) -> SyncOutcome {
        match &self.sync {
            Some(client) => client.check_and_sync(),
            None => SyncOutcome::Offline,
        }
    }

    /// Sync, then map a mount path to its backing path
    pub fn resolve(&self, fs_path: impl AsRef<Path>) -> io::Result<PathBuf> {
        self.before_op();
        self.paths.resolve(fs_path)
    }

    /// Publish local edits when a file handle closes.
    ///
    /// Commit/push failures surface as I/O errors on the close.
    pub fn release(&self, mutated: bool) -> io::Result<()> {
        if !mutated {
            return Ok(());
        }
        self.flush()
    }

    /// Commit and push whatever is pending in the working tree
    pub fn flush(&self) -> io::Result<()> {
        self.vcs.commit_and_push().map_err(|e| {
            warn!(error = %e, "publishing changes failed");
            io::Error::from(e)
        })
    }

    /// Rename within the mount, keeping version-control history for tracked files
    pub fn rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> io::Result<()> {
        let from = self.resolve(from)?;
        let to = self.paths.resolve(to)?;

        let tracked = self.vcs.is_tracked(&from).unwrap_or_else(|e| {
            debug!(path = %from.display(), error = %e, "tracking lookup failed, treating as untracked");
            false
        });

        if tracked {
            self.vcs.move_path(&from, &to).map_err(io::Error::from)
        } else {
            std::fs::rename(&from, &to)
        }
    }
}

impl std::fmt::Debug for MountSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountSession")
            .field("paths", &self.paths)
            .field("sync", &self.sync)
            .field("vcs", &"<dyn SyncAction>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RelayError, Result};
    use parking_lot::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingVcs {
        calls: Mutex<Vec<String>>,
        tracked: Vec<PathBuf>,
        fail_push: bool,
    }

    impl SyncAction for RecordingVcs {
        fn pull(&self) -> Result<()> {
            self.calls.lock().push("pull".into());
            Ok(())
        }

        fn commit_and_push(&self) -> Result<()> {
            self.calls.lock().push("commit".into());
            if self.fail_push {
                return Err(RelayError::SyncActionFailed {
                    action: "push",
                    detail: "rejected".into(),
                });
            }
            Ok(())
        }

        fn is_tracked(&self, path: &Path) -> Result<bool> {
            Ok(self.tracked.iter().any(|p| p == path))
        }

        fn move_path(&self, from: &Path, to: &Path) -> Result<()> {
            self.calls
                .lock()
                .push(format!("mv {} {}", from.display(), to.display()));
            Ok(())
        }
    }

    #[test]
    fn release_commits_only_mutated_files() {
        let vcs = Arc::new(RecordingVcs::default());
        let session = MountSession::standalone(RepoPaths::new("/vcfs", "m"), vcs.clone());

        session.release(false).unwrap();
        assert!(vcs.calls.lock().is_empty());

        session.release(true).unwrap();
        assert_eq!(*vcs.calls.lock(), vec!["commit".to_string()]);
    }

    #[test]
    fn push_failure_surfaces_as_io_error() {
        let vcs = Arc::new(RecordingVcs {
            fail_push: true,
            ..Default::default()
        });
        let session = MountSession::standalone(RepoPaths::new("/vcfs", "m"), vcs);

        let err = session.release(true).unwrap_err();
        assert!(err.to_string().contains("push failed"));
    }

    #[test]
    fn rename_moves_untracked_files_directly() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("m")).unwrap();
        std::fs::write(dir.path().join("m/draft.txt"), "x").unwrap();

        let vcs = Arc::new(RecordingVcs::default());
        let session = MountSession::standalone(RepoPaths::new(dir.path(), "m"), vcs.clone());
        session.rename("/draft.txt", "/final.txt").unwrap();

        assert!(dir.path().join("m/final.txt").exists());
        assert!(vcs.calls.lock().is_empty());
    }

    #[test]
    fn rename_uses_vcs_for_tracked_files() {
        let paths = RepoPaths::new("/vcfs", "m");
        let tracked = paths.resolve("/a.txt").unwrap();
        let vcs = Arc::new(RecordingVcs {
            tracked: vec![tracked],
            ..Default::default()
        });
        let session = MountSession::standalone(paths, vcs.clone());

        session.rename("/a.txt", "/b.txt").unwrap();
        assert_eq!(
            *vcs.calls.lock(),
            vec!["mv /vcfs/m/a.txt /vcfs/m/b.txt".to_string()]
        );
    }

    #[test]
    fn standalone_session_never_pulls() {
        let vcs = Arc::new(RecordingVcs::default());
        let session = MountSession::standalone(RepoPaths::new("/vcfs", "m"), vcs.clone());
        assert_eq!(session.before_op(), SyncOutcome::Offline);
        assert!(vcs.calls.lock().is_empty());
    }
}
