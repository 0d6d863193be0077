use std::{
    fs,
    path::{Component, Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use hf_hub::{
    api::sync::{Api, ApiBuilder},
    Repo, RepoType,
};
use tracing::debug;

use super::{DownloadBackend, ModelSource};

/// Bulk snapshot of a hub repository.
///
/// Files go through the hub cache first, so an interrupted snapshot resumes
/// with whatever files already completed. The whole snapshot must finish
/// within `transfer_timeout`; the deadline is checked between files.
pub struct HubSnapshot {
    api: Api,
    transfer_timeout: Duration,
}

impl HubSnapshot {
    pub fn new(cache_dir: &Path, token: Option<String>, transfer_timeout: Duration) -> Result<Self> {
        Ok(Self {
            api: hub_api(cache_dir, token)?,
            transfer_timeout,
        })
    }
}

/// Sync hub client rooted at `cache_dir`, authenticated with `token`.
pub fn hub_api(cache_dir: &Path, token: Option<String>) -> Result<Api> {
    fs::create_dir_all(cache_dir)
        .with_context(|| format!("failed to create hub cache {cache_dir:?}"))?;
    ApiBuilder::new()
        .with_cache_dir(cache_dir.to_path_buf())
        .with_token(token)
        .with_progress(false)
        .build()
        .context("failed to create hf hub API")
}

impl DownloadBackend for HubSnapshot {
    fn name(&self) -> &str {
        "hub-snapshot"
    }

    fn supports(&self, source: &ModelSource) -> bool {
        matches!(source, ModelSource::Hub { .. })
    }

    fn fetch(&self, source: &ModelSource, staging: &Path) -> Result<()> {
        let ModelSource::Hub { repo_id, revision } = source else {
            bail!("hub snapshot cannot fetch {source:?}");
        };

        let repo = self.api.repo(match revision {
            Some(revision) => Repo::with_revision(repo_id.clone(), RepoType::Model, revision.clone()),
            None => Repo::model(repo_id.clone()),
        });
        let info = repo
            .info()
            .with_context(|| format!("failed to list files of {repo_id}"))?;

        let started = Instant::now();
        for sibling in info.siblings {
            check_deadline(started.elapsed(), self.transfer_timeout, repo_id)?;
            let relative = checked_relative_path(&sibling.rfilename)?;
            let cached = repo
                .get(&sibling.rfilename)
                .with_context(|| format!("failed to download {repo_id}/{}", sibling.rfilename))?;

            let dest = staging.join(&relative);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&cached, &dest)
                .with_context(|| format!("failed to copy {cached:?} to {dest:?}"))?;
            debug!("copied {} into {staging:?}", sibling.rfilename);
        }
        Ok(())
    }
}

fn check_deadline(elapsed: Duration, limit: Duration, repo_id: &str) -> Result<()> {
    if elapsed > limit {
        bail!(
            "snapshot of {repo_id} exceeded {}s (ran {}s)",
            limit.as_secs(),
            elapsed.as_secs()
        );
    }
    Ok(())
}

/// Rejects repository file names that would escape the staging directory.
fn checked_relative_path(name: &str) -> Result<PathBuf> {
    let path = PathBuf::from(name);
    if path
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
    {
        Ok(path)
    } else {
        bail!("refusing repository file name {name:?}")
    }
}
