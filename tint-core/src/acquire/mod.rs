//! Model acquisition.
//!
//! A model id resolves to a [`ModelSource`] and a deterministic local target.
//! A target that already holds files is used as-is. Anything else is
//! transferred by the first [`DownloadBackend`] that supports the source and
//! succeeds within the retry budget. Transfers land in a staging path next to
//! the target and are renamed into place only once complete, so a target
//! never looks present while partial.

mod hub;
mod marketplace;
mod shallow_clone;

use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use tracing::{info, warn};

pub use hub::{hub_api, HubSnapshot};
pub use marketplace::MarketplaceHttp;
pub use shallow_clone::ShallowClone;

use crate::config::{AcquireConfig, HubStrategy};

const MARKETPLACE_PREFIX: &str = "civitai:";

/// Files that a complete diffusers checkout carries.
const EXPECTED_FILES: &[&str] = &["model_index.json", "config.json"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelSource {
    /// A model hub repository, optionally pinned with `repo@revision`.
    Hub {
        repo_id: String,
        revision: Option<String>,
    },
    /// A single file on the model marketplace.
    Marketplace { version_id: String, filename: String },
    /// Files already on disk.
    Local(PathBuf),
}

impl ModelSource {
    pub fn parse(model_id: &str) -> Result<Self> {
        let model_id = model_id.trim();
        if model_id.is_empty() {
            bail!("model id is empty");
        }

        if let Some(reference) = model_id.strip_prefix(MARKETPLACE_PREFIX) {
            let (version_id, filename) = match reference.split_once('/') {
                Some((version, file)) => (version, file.to_string()),
                None => (reference, format!("{reference}.safetensors")),
            };
            if version_id.is_empty() || !version_id.chars().all(|c| c.is_ascii_digit()) {
                bail!("marketplace model version must be numeric, got {version_id:?}");
            }
            if filename.is_empty() || filename.contains(['/', '\\']) || filename == ".." {
                bail!("invalid marketplace file name {filename:?}");
            }
            return Ok(Self::Marketplace {
                version_id: version_id.to_string(),
                filename,
            });
        }

        let path = Path::new(model_id);
        if path.is_absolute()
            || model_id.starts_with("./")
            || model_id.starts_with("../")
            || path.exists()
        {
            return Ok(Self::Local(path.to_path_buf()));
        }

        let (repo_id, revision) = match model_id.split_once('@') {
            Some((repo, rev)) if !rev.is_empty() => (repo, Some(rev.to_string())),
            Some((repo, _)) => (repo, None),
            None => (model_id, None),
        };
        if repo_id.split('/').any(|segment| segment.is_empty() || segment == "..") {
            bail!("invalid hub repository id {repo_id:?}");
        }
        Ok(Self::Hub {
            repo_id: repo_id.to_string(),
            revision,
        })
    }
}

/// A way of transferring model files onto local disk.
pub trait DownloadBackend: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, source: &ModelSource) -> bool;

    /// Transfers `source` into `staging`.
    ///
    /// For hub sources `staging` is an empty directory; for marketplace
    /// sources it is a file path that may hold a previous partial transfer.
    fn fetch(&self, source: &ModelSource, staging: &Path) -> Result<()>;
}

pub struct Acquirer {
    root: PathBuf,
    backends: Vec<Box<dyn DownloadBackend>>,
    retries: usize,
    retry_backoff: Duration,
}

impl Acquirer {
    pub fn new(
        root: impl Into<PathBuf>,
        backends: Vec<Box<dyn DownloadBackend>>,
        retries: usize,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            root: root.into(),
            backends,
            retries: retries.max(1),
            retry_backoff,
        }
    }

    /// Builds the backend chain described by `config`.
    pub fn from_config(config: &AcquireConfig) -> Result<Self> {
        let snapshot = || -> Result<Box<dyn DownloadBackend>> {
            Ok(Box::new(HubSnapshot::new(
                &config.hub_cache,
                config.hub_token.clone(),
                config.transfer_timeout,
            )?))
        };
        let clone = || -> Box<dyn DownloadBackend> {
            Box::new(ShallowClone::new(
                config.hub_token.clone(),
                config.connect_timeout,
                config.transfer_timeout,
            ))
        };

        let mut backends = match config.hub_strategy {
            HubStrategy::Snapshot => vec![snapshot()?],
            HubStrategy::Clone => vec![clone()],
        };
        if config.hub_fallback {
            match config.hub_strategy {
                HubStrategy::Snapshot => backends.push(clone()),
                HubStrategy::Clone => backends.push(snapshot()?),
            }
        }
        backends.push(Box::new(MarketplaceHttp::new(
            config.marketplace_token.clone(),
            config.connect_timeout,
            config.transfer_timeout,
        )?));

        info!(
            "model acquisition: root {:?}, backends [{}]",
            config.model_root,
            backends.iter().map(|b| b.name()).collect::<Vec<_>>().join(", ")
        );
        Ok(Self::new(
            &config.model_root,
            backends,
            config.retries,
            config.retry_backoff,
        ))
    }

    /// Local path a source is stored at.
    pub fn target_path(&self, source: &ModelSource) -> PathBuf {
        match source {
            ModelSource::Hub { repo_id, .. } => {
                let name = repo_id.rsplit('/').next().unwrap_or(repo_id);
                self.root.join(name)
            }
            ModelSource::Marketplace { filename, .. } => self.root.join(filename),
            ModelSource::Local(path) => path.clone(),
        }
    }

    /// Ensures the model is on disk and returns its local path.
    pub fn acquire(&self, model_id: &str) -> Result<PathBuf> {
        let source = ModelSource::parse(model_id)?;
        let target = self.target_path(&source);

        if let ModelSource::Local(path) = &source {
            if !path.exists() {
                bail!("local model path {path:?} does not exist");
            }
            return Ok(target);
        }

        if is_populated(&target) {
            info!("model {model_id} already present at {target:?}");
            return Ok(target);
        }
        if target.exists() {
            warn!("{target:?} exists but looks incomplete, removing it before downloading");
            remove_path(&target)?;
        }

        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create model root {:?}", self.root))?;

        let is_hub = matches!(source, ModelSource::Hub { .. });
        if is_hub {
            log_disk_usage(&self.root, "before download");
        }
        let staging = staging_path(&source, &target);
        self.download(model_id, &source, &staging)?;

        fs::rename(&staging, &target)
            .with_context(|| format!("failed to move {staging:?} into place at {target:?}"))?;
        if is_hub {
            report_contents(&target);
            log_disk_usage(&self.root, "after download");
        }
        info!("model {model_id} ready at {target:?}");
        Ok(target)
    }

    fn download(&self, model_id: &str, source: &ModelSource, staging: &Path) -> Result<()> {
        let mut failures = Vec::new();

        for backend in self.backends.iter().filter(|b| b.supports(source)) {
            for attempt in 1..=self.retries {
                if let ModelSource::Hub { .. } = source {
                    reset_dir(staging)?;
                }
                info!(
                    "downloading {model_id} with {} (attempt {attempt}/{})",
                    backend.name(),
                    self.retries
                );

                let result = backend
                    .fetch(source, staging)
                    .and_then(|_| ensure_staged(staging));
                match result {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(
                            "{} failed to download {model_id} (attempt {attempt}/{}): {e:#}",
                            backend.name(),
                            self.retries
                        );
                        failures.push(format!("{}: {e:#}", backend.name()));
                        if attempt < self.retries {
                            thread::sleep(self.retry_backoff * attempt as u32);
                        }
                    }
                }
            }
        }

        // A partial marketplace file is kept so the next attempt can resume.
        if staging.is_dir() {
            if let Err(e) = fs::remove_dir_all(staging) {
                warn!("failed to clean up {staging:?}: {e}");
            }
        }

        if failures.is_empty() {
            Err(anyhow!("no download backend supports {model_id}"))
        } else {
            Err(anyhow!(
                "all download attempts failed: {}",
                failures.join(" | ")
            ))
        }
    }
}

fn staging_path(source: &ModelSource, target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    match source {
        ModelSource::Marketplace { .. } => name.push(".part"),
        _ => name.push(".partial"),
    }
    target.with_file_name(name)
}

/// Whether `path` holds something a download produced.
pub fn is_populated(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => fs::read_dir(path)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false),
        Ok(meta) => meta.len() > 0,
        Err(_) => false,
    }
}

fn ensure_staged(staging: &Path) -> Result<()> {
    if is_populated(staging) {
        Ok(())
    } else {
        bail!("download finished but {staging:?} is empty")
    }
}

fn reset_dir(path: &Path) -> Result<()> {
    if path.exists() {
        remove_path(path)?;
    }
    fs::create_dir_all(path).with_context(|| format!("failed to create {path:?}"))
}

fn remove_path(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.with_context(|| format!("failed to remove {path:?}"))
}

/// Space on the filesystem holding a path, in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

#[cfg(unix)]
pub fn disk_usage(path: &Path) -> Result<DiskUsage> {
    let stat = nix::sys::statvfs::statvfs(path)
        .with_context(|| format!("failed to stat filesystem of {path:?}"))?;
    let unit = stat.fragment_size() as u64;
    Ok(DiskUsage {
        total: stat.blocks() as u64 * unit,
        used: (stat.blocks() as u64).saturating_sub(stat.blocks_free() as u64) * unit,
        free: stat.blocks_available() as u64 * unit,
    })
}

#[cfg(not(unix))]
pub fn disk_usage(path: &Path) -> Result<DiskUsage> {
    bail!("disk usage of {path:?} is not available on this platform")
}

fn log_disk_usage(path: &Path, when: &str) {
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    match disk_usage(path) {
        Ok(usage) => info!(
            "disk usage {when} at {path:?}: total {:.1} GiB, used {:.1} GiB, free {:.1} GiB",
            usage.total as f64 / GIB,
            usage.used as f64 / GIB,
            usage.free as f64 / GIB
        ),
        Err(e) => warn!("could not read disk usage {when}: {e:#}"),
    }
}

/// Logs what a hub download produced.
fn report_contents(dir: &Path) {
    let mut count = 0usize;
    let mut bytes = 0u64;
    let mut names = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(entries) = fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                count += 1;
                bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_string());
                }
            }
        }
    }

    info!(
        "{dir:?}: {count} files, {:.1} MiB",
        bytes as f64 / (1024.0 * 1024.0)
    );
    if !EXPECTED_FILES.iter().any(|f| names.iter().any(|n| n == f)) {
        warn!("{dir:?} has none of {EXPECTED_FILES:?}, the model may not load");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    /// Writes a fixed file set, failing the first `fail_first` calls.
    struct StubBackend {
        name: &'static str,
        calls: Arc<AtomicUsize>,
        fail_first: usize,
    }

    impl StubBackend {
        fn new(name: &'static str, fail_first: usize) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let backend = Self {
                name,
                calls: calls.clone(),
                fail_first,
            };
            (backend, calls)
        }
    }

    impl DownloadBackend for StubBackend {
        fn name(&self) -> &str {
            self.name
        }

        fn supports(&self, source: &ModelSource) -> bool {
            !matches!(source, ModelSource::Local(_))
        }

        fn fetch(&self, source: &ModelSource, staging: &Path) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match source {
                ModelSource::Hub { .. } => {
                    fs::write(staging.join("model_index.json"), "{}")?;
                }
                _ => fs::write(staging, b"weights")?,
            }
            if call < self.fail_first {
                bail!("connection reset");
            }
            Ok(())
        }
    }

    fn acquirer(root: &Path, backends: Vec<Box<dyn DownloadBackend>>, retries: usize) -> Acquirer {
        Acquirer::new(root, backends, retries, Duration::ZERO)
    }

    #[test]
    fn parses_model_references() -> Result<()> {
        assert_eq!(
            ModelSource::parse("runwayml/stable-diffusion-v1-5")?,
            ModelSource::Hub {
                repo_id: "runwayml/stable-diffusion-v1-5".into(),
                revision: None
            }
        );
        assert_eq!(
            ModelSource::parse("stabilityai/stable-diffusion-2-1@fp16")?,
            ModelSource::Hub {
                repo_id: "stabilityai/stable-diffusion-2-1".into(),
                revision: Some("fp16".into())
            }
        );
        assert_eq!(
            ModelSource::parse("civitai:4384")?,
            ModelSource::Marketplace {
                version_id: "4384".into(),
                filename: "4384.safetensors".into()
            }
        );
        assert_eq!(
            ModelSource::parse("civitai:4384/dreamshaper.safetensors")?,
            ModelSource::Marketplace {
                version_id: "4384".into(),
                filename: "dreamshaper.safetensors".into()
            }
        );
        assert_eq!(
            ModelSource::parse("/models/sd15")?,
            ModelSource::Local(PathBuf::from("/models/sd15"))
        );
        assert!(ModelSource::parse("civitai:abc").is_err());
        assert!(ModelSource::parse("org//model").is_err());
        assert!(ModelSource::parse("").is_err());
        Ok(())
    }

    #[test]
    fn hub_target_uses_last_path_segment() {
        let acquirer = acquirer(Path::new("/models"), vec![], 1);
        let source = ModelSource::parse("runwayml/stable-diffusion-v1-5").unwrap();
        assert_eq!(
            acquirer.target_path(&source),
            PathBuf::from("/models/stable-diffusion-v1-5")
        );
    }

    #[test]
    fn second_acquire_performs_no_transfer() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let (backend, calls) = StubBackend::new("stub", 0);
        let acquirer = acquirer(temp.path(), vec![Box::new(backend)], 3);

        let first = acquirer.acquire("org/model")?;
        let second = acquirer.acquire("org/model")?;

        assert_eq!(first, temp.path().join("model"));
        assert_eq!(first, second);
        assert!(first.join("model_index.json").is_file());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!temp.path().join("model.partial").exists());
        Ok(())
    }

    #[test]
    fn empty_target_is_downloaded_again() -> Result<()> {
        let temp = tempfile::tempdir()?;
        fs::create_dir_all(temp.path().join("model"))?;
        let (backend, calls) = StubBackend::new("stub", 0);
        let acquirer = acquirer(temp.path(), vec![Box::new(backend)], 1);

        let target = acquirer.acquire("org/model")?;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(is_populated(&target));
        Ok(())
    }

    #[test]
    fn transient_failures_are_retried() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let (backend, calls) = StubBackend::new("flaky", 2);
        let acquirer = acquirer(temp.path(), vec![Box::new(backend)], 3);

        acquirer.acquire("org/model")?;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[test]
    fn exhausted_retries_fall_back_then_fail_cleanly() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let (primary, primary_calls) = StubBackend::new("primary", usize::MAX);
        let (fallback, fallback_calls) = StubBackend::new("fallback", usize::MAX);
        let acquirer = acquirer(temp.path(), vec![Box::new(primary), Box::new(fallback)], 2);

        let err = acquirer.acquire("org/model").unwrap_err();

        assert_eq!(primary_calls.load(Ordering::SeqCst), 2);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 2);
        let message = format!("{err:#}");
        assert!(message.contains("primary: connection reset"));
        assert!(message.contains("fallback: connection reset"));
        assert!(!temp.path().join("model").exists());
        assert!(!temp.path().join("model.partial").exists());
        Ok(())
    }

    #[test]
    fn fallback_backend_recovers() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let (primary, _) = StubBackend::new("primary", usize::MAX);
        let (fallback, fallback_calls) = StubBackend::new("fallback", 0);
        let acquirer = acquirer(temp.path(), vec![Box::new(primary), Box::new(fallback)], 1);

        let target = acquirer.acquire("org/model")?;

        assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
        assert!(target.join("model_index.json").is_file());
        Ok(())
    }

    #[test]
    fn marketplace_file_is_renamed_into_place() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let (backend, calls) = StubBackend::new("stub", 0);
        let acquirer = acquirer(temp.path(), vec![Box::new(backend)], 1);

        let target = acquirer.acquire("civitai:4384/dreamshaper.safetensors")?;
        acquirer.acquire("civitai:4384/dreamshaper.safetensors")?;

        assert_eq!(target, temp.path().join("dreamshaper.safetensors"));
        assert_eq!(fs::read(&target)?, b"weights");
        assert!(!temp.path().join("dreamshaper.safetensors.part").exists());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn local_models_are_never_downloaded() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let (backend, calls) = StubBackend::new("stub", 0);
        let acquirer = acquirer(temp.path(), vec![Box::new(backend)], 1);

        let local = temp.path().join("local-model");
        fs::create_dir_all(&local)?;
        let resolved = acquirer.acquire(local.to_str().unwrap())?;
        assert_eq!(resolved, local);

        assert!(acquirer
            .acquire(temp.path().join("missing").to_str().unwrap())
            .is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn disk_usage_reports_the_model_filesystem() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let usage = disk_usage(temp.path())?;
        assert!(usage.total > 0);
        assert!(usage.used <= usage.total);
        assert!(usage.free <= usage.total);
        assert!(disk_usage(&temp.path().join("missing")).is_err());
        Ok(())
    }

    #[test]
    fn unsupported_source_reports_missing_backend() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let acquirer = acquirer(temp.path(), vec![], 1);
        let err = acquirer.acquire("org/model").unwrap_err();
        assert!(err.to_string().contains("no download backend"));
        Ok(())
    }
}
