//! Download directory watching, archive flattening + HTTP fetch utilities for exportline.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_DISPOSITION, COOKIE};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use walkdir::WalkDir;

pub const CRATE_NAME: &str = "exportline-storage";

/// Extensions of files a finished download can produce.
pub const ACCEPTED_EXTENSIONS: &[&str] = &["zip", "csv"];

/// Suffixes browsers and this crate use for downloads that are still being written.
pub const IN_PROGRESS_SUFFIXES: &[&str] = &["crdownload", "part", "partial", "download"];

/// Suffix used by [`write_download_atomically`] while bytes are in flight.
pub const PARTIAL_SUFFIX: &str = "part";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn lowercase_extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    lowercase_extension(path)
        .map(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)))
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub accepted_extensions: Vec<String>,
    pub in_progress_suffixes: Vec<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1500),
            max_wait: Duration::from_secs(90),
            accepted_extensions: ACCEPTED_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            in_progress_suffixes: IN_PROGRESS_SUFFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// File names present in the download directory before a download was started.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadBaseline {
    names: BTreeSet<String>,
}

impl DownloadBaseline {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// The watcher gave up waiting and let the run proceed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "download in {} not confirmed complete after {:?} ({} in progress, {} completed)",
    .dir.display(),
    .waited,
    .in_progress.len(),
    .completed.len()
)]
pub struct DownloadTimeoutWarning {
    pub dir: PathBuf,
    pub waited: Duration,
    pub in_progress: Vec<String>,
    pub completed: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed { files: Vec<PathBuf> },
    TimedOutProceeding(DownloadTimeoutWarning),
}

impl DownloadOutcome {
    pub fn files(&self) -> &[PathBuf] {
        match self {
            DownloadOutcome::Completed { files } => files,
            DownloadOutcome::TimedOutProceeding(warning) => &warning.completed,
        }
    }

    pub fn warning(&self) -> Option<&DownloadTimeoutWarning> {
        match self {
            DownloadOutcome::Completed { .. } => None,
            DownloadOutcome::TimedOutProceeding(warning) => Some(warning),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, DownloadOutcome::Completed { .. })
    }
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("reading download directory {}: {source}", .dir.display())]
    Io {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Default)]
struct DirectoryScan {
    completed: Vec<PathBuf>,
    in_progress: Vec<String>,
}

/// Polls one directory until a download has landed.
#[derive(Debug, Clone)]
pub struct DownloadWatcher {
    dir: PathBuf,
    config: WatcherConfig,
}

impl DownloadWatcher {
    pub fn new(dir: impl Into<PathBuf>, config: WatcherConfig) -> Self {
        Self {
            dir: dir.into(),
            config,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub async fn prepare(&self) -> Result<(), WatchError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| WatchError::Io {
                dir: self.dir.clone(),
                source,
            })
    }

    pub async fn snapshot(&self) -> Result<DownloadBaseline, WatchError> {
        let mut names = BTreeSet::new();
        for path in self.list_files().await? {
            if let Some(name) = path.file_name() {
                names.insert(name.to_string_lossy().into_owned());
            }
        }
        Ok(DownloadBaseline { names })
    }

    /// Resolves once no in-progress file exists and at least one accepted file
    /// outside `baseline` exists, or after `max_wait` with a timeout warning.
    pub async fn wait_for_completion(
        &self,
        baseline: &DownloadBaseline,
    ) -> Result<DownloadOutcome, WatchError> {
        let span = info_span!("download_watch", dir = %self.dir.display());
        async move {
            let started = Instant::now();
            loop {
                let scan = self.scan(baseline).await?;
                if scan.in_progress.is_empty() && !scan.completed.is_empty() {
                    info!(files = scan.completed.len(), "download complete");
                    return Ok(DownloadOutcome::Completed {
                        files: scan.completed,
                    });
                }

                let waited = started.elapsed();
                if waited >= self.config.max_wait {
                    let warning = DownloadTimeoutWarning {
                        dir: self.dir.clone(),
                        waited,
                        in_progress: scan.in_progress,
                        completed: scan.completed,
                    };
                    warn!(%warning, "proceeding without a confirmed download");
                    return Ok(DownloadOutcome::TimedOutProceeding(warning));
                }

                debug!(
                    in_progress = scan.in_progress.len(),
                    completed = scan.completed.len(),
                    "download not settled yet"
                );
                let remaining = self.config.max_wait - waited;
                tokio::time::sleep(self.config.poll_interval.min(remaining)).await;
            }
        }
        .instrument(span)
        .await
    }

    async fn list_files(&self) -> Result<Vec<PathBuf>, WatchError> {
        let io_err = |source| WatchError::Io {
            dir: self.dir.clone(),
            source,
        };
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(err)),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let file_type = entry.file_type().await.map_err(io_err)?;
            if file_type.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    async fn scan(&self, baseline: &DownloadBaseline) -> Result<DirectoryScan, WatchError> {
        let mut scan = DirectoryScan::default();
        for path in self.list_files().await? {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if has_extension(&path, &self.config.in_progress_suffixes) {
                scan.in_progress.push(name);
            } else if has_extension(&path, &self.config.accepted_extensions)
                && !baseline.contains(&name)
            {
                scan.completed.push(path);
            }
        }
        Ok(scan)
    }
}

/// Returns `dir/file_name`, or `dir/<stem>-<n>.<ext>` when that name is taken.
pub fn disambiguated_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }
    let as_path = Path::new(file_name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    let ext = as_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let mut n = 1usize;
    loop {
        let candidate = dir.join(format!("{stem}-{n}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn sanitized_file_name(file_name: &str) -> String {
    Path::new(file_name.trim())
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "download.bin".to_string())
}

/// Writes a download under a `.part` name and renames it into place once flushed.
pub async fn write_download_atomically(
    dir: &Path,
    file_name: &str,
    bytes: &[u8],
) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating download directory {}", dir.display()))?;

    let final_path = disambiguated_path(dir, &sanitized_file_name(file_name));
    let final_name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let partial_path = dir.join(format!("{final_name}.{PARTIAL_SUFFIX}"));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&partial_path)
        .await
        .with_context(|| format!("opening partial download {}", partial_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing partial download {}", partial_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing partial download {}", partial_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&partial_path, &final_path).await {
        let _ = fs::remove_file(&partial_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming partial download {} -> {}",
                partial_path.display(),
                final_path.display()
            )
        });
    }
    Ok(final_path)
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reading archive {}: {source}", .path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("extraction task failed: {0}")]
    Task(String),
}

/// Unpacks one archive into a flat directory and returns the files it produced.
pub trait ArchiveExtractor: Send + Sync {
    fn extract_flat(&self, archive: &Path, dest: &Path) -> Result<Vec<PathBuf>, ExtractError>;
}

/// Zip extractor that keeps only members with the configured extensions and
/// discards their directory components.
#[derive(Debug, Clone)]
pub struct ZipExtractor {
    pub member_extensions: Vec<String>,
}

impl Default for ZipExtractor {
    fn default() -> Self {
        Self {
            member_extensions: vec!["csv".to_string()],
        }
    }
}

impl ArchiveExtractor for ZipExtractor {
    fn extract_flat(&self, archive: &Path, dest: &Path) -> Result<Vec<PathBuf>, ExtractError> {
        let file = File::open(archive).map_err(|source| ExtractError::Io {
            path: archive.to_path_buf(),
            source,
        })?;
        let mut zip = zip::ZipArchive::new(file).map_err(|source| ExtractError::Archive {
            path: archive.to_path_buf(),
            source,
        })?;

        let mut written = Vec::new();
        for index in 0..zip.len() {
            let mut member = zip.by_index(index).map_err(|source| ExtractError::Archive {
                path: archive.to_path_buf(),
                source,
            })?;
            if member.is_dir() {
                continue;
            }
            let Some(inner) = member.enclosed_name() else {
                warn!(archive = %archive.display(), member = member.name(), "skipping unsafe archive member");
                continue;
            };
            let Some(name) = inner.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if !has_extension(Path::new(&name), &self.member_extensions) {
                debug!(archive = %archive.display(), member = %name, "skipping archive member");
                continue;
            }

            let out_path = disambiguated_path(dest, &name);
            let mut out = File::create(&out_path).map_err(|source| ExtractError::Io {
                path: out_path.clone(),
                source,
            })?;
            std::io::copy(&mut member, &mut out).map_err(|source| ExtractError::Io {
                path: out_path.clone(),
                source,
            })?;
            written.push(out_path);
        }
        Ok(written)
    }
}

/// Deposits every `.csv` among `files` (loose or inside archives) into the flat
/// directory `dest`, in the order given. Other files are ignored.
pub fn flatten_files_blocking(
    files: &[PathBuf],
    dest: &Path,
    extractor: &dyn ArchiveExtractor,
) -> Result<Vec<PathBuf>, ExtractError> {
    std::fs::create_dir_all(dest).map_err(|source| ExtractError::Io {
        path: dest.to_path_buf(),
        source,
    })?;

    let archive_exts = vec!["zip".to_string()];
    let tabular_exts = vec!["csv".to_string()];
    let mut produced = Vec::new();

    for path in files {
        if has_extension(path, &archive_exts) {
            let extracted = extractor.extract_flat(path, dest)?;
            info!(archive = %path.display(), files = extracted.len(), "extracted archive");
            produced.extend(extracted);
        } else if has_extension(path, &tabular_exts) {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let out_path = disambiguated_path(dest, &name);
            std::fs::copy(path, &out_path).map_err(|source| ExtractError::Io {
                path: path.clone(),
                source,
            })?;
            produced.push(out_path);
        } else {
            debug!(file = %path.display(), "ignoring non-tabular download");
        }
    }
    Ok(produced)
}

/// Like [`flatten_files_blocking`] for every file under `source`, visited in
/// file-name order. Anything under `exclude` (typically the staging root that
/// holds `dest` and earlier runs' staged copies) is not visited.
pub fn flatten_downloads_blocking(
    source: &Path,
    dest: &Path,
    exclude: &Path,
    extractor: &dyn ArchiveExtractor,
) -> Result<Vec<PathBuf>, ExtractError> {
    let mut files = Vec::new();
    let walker = WalkDir::new(source)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let path = entry.path();
            !path.starts_with(exclude) && !path.starts_with(dest)
        });
    for entry in walker {
        let entry = entry.map_err(|err| {
            let path = err.path().unwrap_or(source).to_path_buf();
            ExtractError::Io {
                path,
                source: err.into(),
            }
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    flatten_files_blocking(&files, dest, extractor)
}

pub async fn flatten_files(
    files: Vec<PathBuf>,
    dest: PathBuf,
    extractor: Arc<dyn ArchiveExtractor>,
) -> Result<Vec<PathBuf>, ExtractError> {
    tokio::task::spawn_blocking(move || flatten_files_blocking(&files, &dest, extractor.as_ref()))
        .await
        .map_err(|err| ExtractError::Task(err.to_string()))?
}

pub async fn flatten_downloads(
    source: PathBuf,
    dest: PathBuf,
    exclude: PathBuf,
    extractor: Arc<dyn ArchiveExtractor>,
) -> Result<Vec<PathBuf>, ExtractError> {
    tokio::task::spawn_blocking(move || {
        flatten_downloads_blocking(&source, &dest, &exclude, extractor.as_ref())
    })
    .await
    .map_err(|err| ExtractError::Task(err.to_string()))?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Raw `Cookie` header for an already-authenticated portal session.
    pub cookie: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            cookie: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_disposition: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if let Some(cookie) = &config.cookie {
            let mut headers = HeaderMap::new();
            headers.insert(
                COOKIE,
                HeaderValue::from_str(cookie).context("portal cookie is not a valid header")?,
            );
            builder = builder.default_headers(headers);
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_get", url);
        self.send_with_retry(|| self.client.get(url))
            .instrument(span)
            .await
    }

    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_post", url);
        self.send_with_retry(|| self.client.post(url).form(form))
            .instrument(span)
            .await
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let content_disposition = resp
                            .headers()
                            .get(CONTENT_DISPOSITION)
                            .and_then(|v| v.to_str().ok())
                            .map(ToString::to_string);
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            content_disposition,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying portal request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
