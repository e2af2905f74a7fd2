//! Code staging before launch
//!
//! Repositories listed in the configuration are cloned fresh and pinned to a
//! revision; the management UI's assets are copied into its code path.

use crate::config::RepoConfig;
use anyhow::{Context, Result};
use std::path::{Component, Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Thin wrapper over the `git` command line
#[derive(Debug, Clone)]
pub struct Git {
    program: String,
}

impl Default for Git {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
        }
    }
}

impl Git {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str], dir: Option<&Path>) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to run {} {}", self.program, args.join(" ")))?;

        if !output.status.success() {
            anyhow::bail!(
                "{} {} failed: {}",
                self.program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Clone `url` into `dir`
    pub async fn clone_repo(&self, url: &str, dir: &Path) -> Result<()> {
        let dir_str = dir.to_string_lossy();
        info!(url, dir = %dir.display(), "Cloning repository");
        self.run(&["clone", url, &dir_str], None).await
    }

    /// Check out `hash` in the working copy at `dir`
    pub async fn checkout(&self, dir: &Path, hash: &str) -> Result<()> {
        debug!(dir = %dir.display(), hash, "Checking out revision");
        self.run(&["checkout", "--force", hash], Some(dir)).await
    }

    /// Remove a working copy; a missing directory is not an error
    pub async fn remove_dir(&self, dir: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", dir.display())),
        }
    }
}

/// Directory a repository is staged into; absolute paths are re-rooted under `cwd`
pub fn resolve_target_dir(target_dir: &str, cwd: &Path) -> PathBuf {
    let path = Path::new(target_dir);
    if !path.is_absolute() {
        return cwd.join(path);
    }
    let relative: PathBuf = path
        .components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect();
    cwd.join(relative)
}

/// Clean, clone and pin every configured repository, in order
pub async fn stage_repos(git: &Git, repos: &[RepoConfig], cwd: &Path) -> Result<()> {
    for repo in repos {
        let dir = resolve_target_dir(&repo.target_dir, cwd);
        git.remove_dir(&dir).await?;
        git.clone_repo(&repo.url, &dir)
            .await
            .with_context(|| format!("Failed to stage {}", repo.url))?;
        git.checkout(&dir, &repo.hash)
            .await
            .with_context(|| format!("Failed to pin {} to {}", repo.url, repo.hash))?;
    }
    if !repos.is_empty() {
        info!(count = repos.len(), "Repositories staged");
    }
    Ok(())
}

/// Copy the files under `src` into `dest`, creating directories as needed
pub fn stage_ui(src: &Path, dest: &Path) -> Result<usize> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    let copied = copy_tree(src, dest)?;
    info!(src = %src.display(), dest = %dest.display(), files = copied, "UI assets staged");
    Ok(copied)
}

fn copy_tree(src: &Path, dest: &Path) -> Result<usize> {
    let mut copied = 0;
    let entries =
        std::fs::read_dir(src).with_context(|| format!("Failed to read {}", src.display()))?;

    for entry in entries {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            std::fs::create_dir_all(&target)?;
            copied += copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
            copied += 1;
        }
    }
    Ok(copied)
}
