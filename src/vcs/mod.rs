pub mod git;

use std::path::Path;

use crate::error::{RelayError, Result};

pub use git::GitCli;

/// External version-control actions a replica relies on.
///
/// Implementations are synchronous: the filesystem operation that triggers
/// them waits for completion.
pub trait SyncAction: Send + Sync {
    /// Fetch and merge the latest changes into the working tree
    fn pull(&self) -> Result<()>;

    /// Stage tracked changes, commit and push. A no-op with nothing pending.
    fn commit_and_push(&self) -> Result<()>;

    /// Whether `path` is tracked by version control
    fn is_tracked(&self, _path: &Path) -> Result<bool> {
        Ok(false)
    }

    /// Move a tracked path, recording the move in version control
    fn move_path(&self, _from: &Path, _to: &Path) -> Result<()> {
        Err(RelayError::SyncActionFailed {
            action: "mv",
            detail: "moving tracked paths is not supported".to_string(),
        })
    }
}
