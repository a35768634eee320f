use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use git2::{Branch, Repository, StatusOptions};
use tracing::{debug, info};

use super::SyncAction;
use crate::error::{RelayError, Result};

const DEFAULT_COMMIT_MESSAGE: &str = "automated commit";

/// `git` command line driven in a working tree.
///
/// Pull, commit and push shell out to `git` so credentials, hooks and merge
/// configuration behave exactly as they do for a user. Read-only queries go
/// through libgit2.
#[derive(Debug, Clone)]
pub struct GitCli {
    work_tree: PathBuf,
    program: OsString,
    commit_message: String,

    /// Set between a successful commit and a successful push
    push_owed: Arc<AtomicBool>,
}

impl GitCli {
    pub fn new(work_tree: impl Into<PathBuf>) -> Self {
        Self {
            work_tree: work_tree.into(),
            program: OsString::from("git"),
            commit_message: DEFAULT_COMMIT_MESSAGE.to_string(),
            push_owed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Use a different `git` executable
    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_commit_message(mut self, message: impl Into<String>) -> Self {
        self.commit_message = message.into();
        self
    }

    pub fn work_tree(&self) -> &Path {
        &self.work_tree
    }

    /// Whether tracked files differ from HEAD (index or working tree)
    pub fn has_pending_changes(&self) -> Result<bool> {
        let repo = self.open("status")?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(false).include_ignored(false);

        let statuses = repo
            .statuses(Some(&mut opts))
            .map_err(|e| git_failure("status", e))?;
        Ok(statuses.iter().any(|entry| !entry.status().is_empty()))
    }

    /// Whether HEAD holds commits that have not reached its upstream.
    ///
    /// Without an upstream branch only a push that failed after its commit
    /// counts.
    pub fn has_unpushed_commits(&self) -> Result<bool> {
        let owed = self.push_owed.load(Ordering::Acquire);
        let repo = self.open("status")?;

        let head = match repo.head() {
            Ok(head) => head,
            Err(_) => return Ok(owed),
        };
        let Some(local) = head.target() else {
            return Ok(owed);
        };
        if !head.is_branch() {
            return Ok(owed);
        }

        let upstream = match Branch::wrap(head).upstream() {
            Ok(upstream) => upstream,
            Err(_) => return Ok(owed),
        };
        let Some(remote) = upstream.get().target() else {
            return Ok(owed);
        };

        let (ahead, _behind) = repo
            .graph_ahead_behind(local, remote)
            .map_err(|e| git_failure("status", e))?;
        Ok(ahead > 0)
    }

    fn open(&self, action: &'static str) -> Result<Repository> {
        Repository::open(&self.work_tree).map_err(|e| git_failure(action, e))
    }

    fn relative(&self, repo: &Repository, path: &Path) -> Result<PathBuf> {
        if path.is_relative() {
            return Ok(path.to_path_buf());
        }
        let workdir = repo.workdir().ok_or_else(|| RelayError::SyncActionFailed {
            action: "ls-files",
            detail: "repository has no working tree".to_string(),
        })?;
        // libgit2 reports the resolved workdir; the caller's path may run
        // through symlinks.
        let workdir = workdir.canonicalize().unwrap_or_else(|_| workdir.to_path_buf());
        let path = resolve_parent(path);
        path.strip_prefix(&workdir)
            .map(Path::to_path_buf)
            .map_err(|_| RelayError::SyncActionFailed {
                action: "ls-files",
                detail: format!("{} is outside {}", path.display(), workdir.display()),
            })
    }

    fn run<I, S>(&self, action: &'static str, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(&self.work_tree)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| RelayError::SyncActionFailed {
                action,
                detail: format!("could not run {}: {e}", self.program.to_string_lossy()),
            })?;

        if output.status.success() {
            debug!(action, work_tree = %self.work_tree.display(), "git succeeded");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(RelayError::SyncActionFailed {
                action,
                detail: format!("{}: {}", output.status, stderr.trim()),
            })
        }
    }
}

impl SyncAction for GitCli {
    fn pull(&self) -> Result<()> {
        self.run("pull", ["pull"])
    }

    fn commit_and_push(&self) -> Result<()> {
        if self.has_pending_changes()? {
            self.run("commit", ["commit", "-am", self.commit_message.as_str()])?;
            self.push_owed.store(true, Ordering::Release);
        } else if !self.has_unpushed_commits()? {
            debug!(work_tree = %self.work_tree.display(), "nothing to publish");
            return Ok(());
        }

        self.run("push", ["push"])?;
        self.push_owed.store(false, Ordering::Release);
        info!(work_tree = %self.work_tree.display(), "changes committed and pushed");
        Ok(())
    }

    fn is_tracked(&self, path: &Path) -> Result<bool> {
        let repo = self.open("ls-files")?;
        let relative = self.relative(&repo, path)?;
        let index = repo.index().map_err(|e| git_failure("ls-files", e))?;
        Ok(index.get_path(&relative, 0).is_some())
    }

    fn move_path(&self, from: &Path, to: &Path) -> Result<()> {
        self.run("mv", [OsStr::new("mv"), from.as_os_str(), to.as_os_str()])
    }
}

/// Resolve symlinks in the parent of `path`, keeping the final component
/// as given so a tracked symlink is looked up as itself.
fn resolve_parent(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|parent| parent.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

fn git_failure(action: &'static str, err: git2::Error) -> RelayError {
    RelayError::SyncActionFailed {
        action,
        detail: err.message().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{BranchType, Signature};
    use tempfile::TempDir;

    fn repo_with_commit() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("tracked.txt"), "v1").unwrap();

        {
            let mut index = repo.index().unwrap();
            index.add_path(Path::new("tracked.txt")).unwrap();
            index.write().unwrap();
            let tree_id = index.write_tree().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            let sig = Signature::now("vcfs", "vcfs@example.com").unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
                .unwrap();
        }

        (dir, repo)
    }

    fn commit_tracked(repo: &Repository, message: &str) {
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("tracked.txt")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let parent = repo.head().unwrap().peel_to_commit().unwrap();
        let sig = Signature::now("vcfs", "vcfs@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])
            .unwrap();
    }

    #[test]
    fn detects_pending_changes_to_tracked_files() {
        let (dir, _repo) = repo_with_commit();
        let git = GitCli::new(dir.path());
        assert!(!git.has_pending_changes().unwrap());

        std::fs::write(dir.path().join("untracked.txt"), "new").unwrap();
        assert!(!git.has_pending_changes().unwrap());

        std::fs::write(dir.path().join("tracked.txt"), "version two").unwrap();
        assert!(git.has_pending_changes().unwrap());
    }

    #[test]
    fn tracks_index_membership() {
        let (dir, _repo) = repo_with_commit();
        std::fs::write(dir.path().join("scratch.txt"), "tmp").unwrap();
        let git = GitCli::new(dir.path());

        assert!(git.is_tracked(Path::new("tracked.txt")).unwrap());
        assert!(git.is_tracked(&dir.path().join("tracked.txt")).unwrap());
        assert!(!git.is_tracked(Path::new("scratch.txt")).unwrap());
    }

    #[test]
    fn commit_is_skipped_without_changes() {
        let (dir, _repo) = repo_with_commit();
        let git = GitCli::new(dir.path()).with_program("/nonexistent/git");
        git.commit_and_push().unwrap();
    }

    #[test]
    fn missing_program_reports_sync_failure() {
        let dir = TempDir::new().unwrap();
        let git = GitCli::new(dir.path()).with_program("/nonexistent/git");
        match git.pull() {
            Err(RelayError::SyncActionFailed { action, .. }) => assert_eq!(action, "pull"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn tracked_lookup_follows_symlinked_work_tree() {
        let (dir, _repo) = repo_with_commit();
        let mounts = TempDir::new().unwrap();
        let link = mounts.path().join("docs");
        std::os::unix::fs::symlink(dir.path(), &link).unwrap();

        let git = GitCli::new(&link);
        assert!(git.is_tracked(&link.join("tracked.txt")).unwrap());
        assert!(!git.is_tracked(&link.join("not-yet-created.txt")).unwrap());
    }

    #[test]
    fn commits_ahead_of_upstream_are_pushed() {
        let (dir, repo) = repo_with_commit();
        let (branch_name, base) = {
            let head = repo.head().unwrap();
            (head.shorthand().unwrap().to_string(), head.target().unwrap())
        };

        repo.remote("origin", "/nonexistent/origin.git").unwrap();
        repo.reference(
            &format!("refs/remotes/origin/{branch_name}"),
            base,
            true,
            "seed upstream",
        )
        .unwrap();
        repo.find_branch(&branch_name, BranchType::Local)
            .unwrap()
            .set_upstream(Some(&format!("origin/{branch_name}")))
            .unwrap();

        let git = GitCli::new(dir.path()).with_program("/nonexistent/git");
        assert!(!git.has_unpushed_commits().unwrap());

        std::fs::write(dir.path().join("tracked.txt"), "version two").unwrap();
        commit_tracked(&repo, "local only");

        assert!(!git.has_pending_changes().unwrap());
        assert!(git.has_unpushed_commits().unwrap());
        match git.commit_and_push() {
            Err(RelayError::SyncActionFailed { action, .. }) => assert_eq!(action, "push"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn failed_push_is_retried_on_next_publish() {
        use std::os::unix::fs::PermissionsExt;

        let (dir, _repo) = repo_with_commit();
        let bin = TempDir::new().unwrap();
        let fake_git = bin.path().join("git");
        std::fs::write(&fake_git, "#!/bin/sh\n[ \"$1\" = push ] && exit 1\nexit 0\n").unwrap();
        std::fs::set_permissions(&fake_git, std::fs::Permissions::from_mode(0o755)).unwrap();

        let git = GitCli::new(dir.path()).with_program(fake_git.into_os_string());
        std::fs::write(dir.path().join("tracked.txt"), "version two").unwrap();

        match git.commit_and_push() {
            Err(RelayError::SyncActionFailed { action, .. }) => assert_eq!(action, "push"),
            other => panic!("unexpected result: {other:?}"),
        }

        // Tree is clean again, but the earlier commit never left this replica.
        std::fs::write(dir.path().join("tracked.txt"), "v1").unwrap();
        assert!(!git.has_pending_changes().unwrap());
        assert!(git.has_unpushed_commits().unwrap());
        match git.commit_and_push() {
            Err(RelayError::SyncActionFailed { action, .. }) => assert_eq!(action, "push"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
