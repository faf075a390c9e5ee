//! Patchsets: local work carried to every node's checkout.
//!
//! Each repository of the local tree yields two files: the commits ahead of
//! the tracked branch as a mail series (`git format-patch`) and a plain diff
//! of uncommitted changes. Applying copies the non-empty ones into the
//! remote checkout and runs `git am` and `patch -p1` there. Reverting resets
//! the remote checkout to the tracked branch and drops untracked files.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use cbench_core::ProcessExit;

use crate::cluster_build::concat_commands;
use crate::error::{SimError, SimResult};

/// Directories that mark the root of a source checkout.
pub const SOURCE_MARKERS: [&str; 3] = ["libcore", "liboh", "libspace"];

/// A git tree patched as a unit: the checkout itself or one of its submodules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub name: String,
    /// Path below the checkout root; empty for the root.
    pub subdir: String,
    pub is_submodule: bool,
}

impl Repository {
    pub fn new(name: &str, subdir: &str, is_submodule: bool) -> Self {
        Self {
            name: name.to_string(),
            subdir: subdir.to_string(),
            is_submodule,
        }
    }

    /// Repositories of a checkout, deepest first so submodules are cleaned
    /// before the tree that contains them.
    pub fn defaults() -> Vec<Repository> {
        vec![
            Repository::new("prox", "externals/prox", true),
            Repository::new("http-parser", "externals/http-parser", true),
            Repository::new("cbr", "", false),
        ]
    }

    pub fn commits_patch(&self) -> String {
        format!(".{}.commits.patch", self.name)
    }

    pub fn changes_patch(&self) -> String {
        format!(".{}.changes.patch", self.name)
    }

    pub fn remote_dir(&self, code_dir: &str) -> String {
        let root = code_dir.trim_end_matches('/');
        if self.subdir.is_empty() {
            root.to_string()
        } else {
            format!("{root}/{}", self.subdir)
        }
    }

    pub fn local_dir(&self, source_root: &Path) -> PathBuf {
        if self.subdir.is_empty() {
            source_root.to_path_buf()
        } else {
            source_root.join(&self.subdir)
        }
    }

    fn cd(&self, code_dir: &str) -> String {
        format!("cd {}", self.remote_dir(code_dir))
    }

    /// Apply whichever patch files were shipped.
    pub fn apply_line(&self, code_dir: &str, commits: bool, changes: bool) -> String {
        let am = if commits {
            format!("git am {}", self.commits_patch())
        } else {
            String::new()
        };
        let patch = if changes {
            format!("patch -p1 < {}", self.changes_patch())
        } else {
            String::new()
        };
        concat_commands(&[&self.cd(code_dir), &am, &patch])
    }

    pub fn reset_line(&self, code_dir: &str, branch: &str) -> String {
        concat_commands(&[
            &self.cd(code_dir),
            &format!("git reset --hard origin/{branch}"),
        ])
    }

    /// `.dotest` goes first so `git clean` does not trip over it.
    pub fn clean_line(&self, code_dir: &str) -> String {
        concat_commands(&[&self.cd(code_dir), "rm -rf .dotest", "git clean -f"])
    }

    pub fn update_line(&self, code_dir: &str, with_submodules: bool) -> String {
        let detach = if self.is_submodule {
            "git checkout origin/master"
        } else {
            ""
        };
        let (init, update) = if with_submodules {
            ("git submodule init", "git submodule update")
        } else {
            ("", "")
        };
        concat_commands(&[
            &self.cd(code_dir),
            "git pull origin master",
            detach,
            init,
            update,
        ])
    }

    /// Write both patch files into `out_dir`. Returns the first non-zero git
    /// exit code, or 0.
    pub async fn create(&self, source_root: &Path, branch: &str, out_dir: &Path) -> SimResult<i32> {
        let dir = self.local_dir(source_root);
        let upstream = format!("origin/{branch}");
        let code = git_to_file(
            &dir,
            &["format-patch", "--stdout", &upstream],
            &out_dir.join(self.commits_patch()),
        )
        .await?;
        if code != 0 {
            return Ok(code);
        }
        git_to_file(&dir, &["diff"], &out_dir.join(self.changes_patch())).await
    }
}

async fn git_to_file(dir: &Path, args: &[&str], out: &Path) -> SimResult<i32> {
    let file = std::fs::File::create(out).map_err(|source| SimError::Io {
        path: out.display().to_string(),
        source,
    })?;
    debug!(dir = %dir.display(), ?args, out = %out.display(), "git");

    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(file))
        .status()
        .await
        .map_err(|source| SimError::Io {
            path: dir.display().to_string(),
            source,
        })?;

    let exit = ProcessExit::from_status(status);
    if !exit.success() {
        warn!(dir = %dir.display(), ?args, status = %exit, "git failed");
    }
    Ok(exit.code())
}

/// Whether a created patch file has content. A missing file is an error:
/// the patchset was never created.
pub fn has_content(path: &Path) -> SimResult<bool> {
    std::fs::metadata(path)
        .map(|m| m.len() > 0)
        .map_err(|source| SimError::Io {
            path: path.display().to_string(),
            source,
        })
}

/// Walk up from `start` to the first directory holding every source marker.
pub fn find_source_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| SOURCE_MARKERS.iter().all(|m| dir.join(m).is_dir()))
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CODE: &str = "/home/meru/cbr/";

    #[test]
    fn apply_ships_only_present_files() {
        let [prox, _, main] = <[Repository; 3]>::try_from(Repository::defaults()).unwrap();
        assert_eq!(
            main.apply_line(CODE, true, true),
            "cd /home/meru/cbr && git am .cbr.commits.patch && patch -p1 < .cbr.changes.patch"
        );
        assert_eq!(
            prox.apply_line(CODE, false, true),
            "cd /home/meru/cbr/externals/prox && patch -p1 < .prox.changes.patch"
        );
    }

    #[test]
    fn revert_lines() {
        let prox = Repository::new("prox", "externals/prox", true);
        assert_eq!(
            prox.reset_line(CODE, "exp"),
            "cd /home/meru/cbr/externals/prox && git reset --hard origin/exp"
        );
        assert_eq!(
            prox.clean_line(CODE),
            "cd /home/meru/cbr/externals/prox && rm -rf .dotest && git clean -f"
        );
        assert_eq!(
            prox.update_line(CODE, false),
            "cd /home/meru/cbr/externals/prox && git pull origin master && git checkout origin/master"
        );

        let main = Repository::new("cbr", "", false);
        assert_eq!(
            main.update_line(CODE, true),
            "cd /home/meru/cbr && git pull origin master && git submodule init && git submodule update"
        );
    }

    #[test]
    fn source_root_is_found_from_a_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        for marker in SOURCE_MARKERS {
            std::fs::create_dir(dir.path().join(marker)).unwrap();
        }
        let scripts = dir.path().join("scripts/cluster");
        std::fs::create_dir_all(&scripts).unwrap();

        assert_eq!(find_source_root(&scripts).as_deref(), Some(dir.path()));
        assert_eq!(find_source_root(&dir.path().join("libcore")).as_deref(), Some(dir.path()));
    }

    #[test]
    fn source_root_needs_every_marker() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("libcore")).unwrap();
        assert_eq!(find_source_root(dir.path()), None);
    }

    #[test]
    fn missing_patch_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".cbr.changes.patch");
        assert!(matches!(has_content(&path), Err(SimError::Io { .. })));
        std::fs::write(&path, "").unwrap();
        assert!(!has_content(&path).unwrap());
        std::fs::write(&path, "diff").unwrap();
        assert!(has_content(&path).unwrap());
    }
}
