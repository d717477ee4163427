//! Portal capability contract, HTML status-table client, and the export readiness poller.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use exportline_core::{DownloadHandle, ExportJob, ExportStatus, StatusRow};
use exportline_storage::{
    write_download_atomically, DownloadOutcome, DownloadWatcher, FetchError, HttpClientConfig,
    HttpFetcher, WatchError,
};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "exportline-portal";

/// Which on-page control to use for a refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshTarget {
    /// A button or link whose visible text contains this (case-insensitive).
    Text(String),
    /// Any element carrying this CSS class, typically an icon inside the control.
    IconClass(String),
}

impl std::fmt::Display for RefreshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshTarget::Text(text) => write!(f, "text:{text}"),
            RefreshTarget::IconClass(class) => write!(f, "icon:{class}"),
        }
    }
}

pub fn default_refresh_targets() -> Vec<RefreshTarget> {
    vec![
        RefreshTarget::Text("refresh".to_string()),
        RefreshTarget::IconClass("fa-refresh".to_string()),
    ]
}

#[derive(Debug, Error)]
pub enum PortalError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("download handle from page generation {handle} is stale (current {current})")]
    StaleHandle { handle: u64, current: u64 },
    #[error("no refresh control matched any of [{0}]")]
    ControlNotFound(String),
    #[error("row {row} has no download control")]
    MissingDownloadLink { row: usize },
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
    #[error("invalid portal url {0}")]
    Url(String),
    #[error("storing download: {0:#}")]
    Download(anyhow::Error),
    #[error("download {file_name} is a markup page, not an export")]
    UnexpectedBody { file_name: String },
}

/// The slice of the report portal the poller drives. Authentication and navigation
/// to the report page happen before a client is handed over.
#[async_trait]
pub trait PortalClient: Send + Sync {
    async fn trigger_export(&self, report_id: &str) -> Result<(), PortalError>;

    /// Reads the status table as it is right now. Handles in the result are only
    /// valid until the next page mutation.
    async fn read_status_rows(&self) -> Result<Vec<StatusRow>, PortalError>;

    /// Clicks the refresh control identified by `target`; `Ok(false)` when no such
    /// control exists on the page.
    async fn click_refresh(&self, target: &RefreshTarget) -> Result<bool, PortalError>;

    async fn click_download(&self, handle: &DownloadHandle) -> Result<(), PortalError>;
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error(
        "report {report:?} not found in status table{}",
        .suggestion.as_deref().map(|s| format!(" (closest: {s:?})")).unwrap_or_default()
    )]
    ReportNotFound {
        report: String,
        available: Vec<String>,
        suggestion: Option<String>,
    },
    #[error("report {report:?} has unrecognized status {status:?}")]
    UnknownStatus { report: String, status: String },
    #[error(
        "report {report:?} not ready after {attempts} polls over {elapsed:?} (last status: {last_status})"
    )]
    ReportTimeout {
        report: String,
        attempts: usize,
        elapsed: Duration,
        last_status: ExportStatus,
    },
    #[error("download for report {report:?} not confirmed: {warning}")]
    DownloadIncomplete {
        report: String,
        warning: exportline_storage::DownloadTimeoutWarning,
    },
    #[error("portal error while acquiring {report:?} (last status: {}): {source}", display_status(.last_status))]
    Portal {
        report: String,
        last_status: Option<ExportStatus>,
        #[source]
        source: PortalError,
    },
    #[error("watching downloads for {report:?}: {source}")]
    Watch {
        report: String,
        #[source]
        source: WatchError,
    },
}

fn display_status(status: &Option<ExportStatus>) -> String {
    status
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none observed".to_string())
}

impl AcquisitionError {
    /// Whether re-running the whole process later can be expected to help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AcquisitionError::ReportTimeout { .. }
                | AcquisitionError::DownloadIncomplete { .. }
                | AcquisitionError::Portal { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub settle_delay: Duration,
    pub max_attempts: usize,
    pub max_wait: Duration,
    pub refresh_targets: Vec<RefreshTarget>,
    /// Treat a download timeout warning as a failed acquisition.
    pub strict_downloads: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(3),
            max_attempts: 120,
            max_wait: Duration::from_secs(30 * 60),
            refresh_targets: default_refresh_targets(),
            strict_downloads: false,
        }
    }
}

/// Result of driving one report from requested to downloaded.
#[derive(Debug, Clone)]
pub struct Acquisition {
    pub display_name: String,
    pub attempts: usize,
    pub refreshes: usize,
    pub download: DownloadOutcome,
}

/// Drives a report's export job through pending -> finished -> downloaded.
#[derive(Debug, Clone)]
pub struct ExportReadinessPoller {
    config: PollerConfig,
    watcher: DownloadWatcher,
}

impl ExportReadinessPoller {
    pub fn new(config: PollerConfig, watcher: DownloadWatcher) -> Self {
        Self { config, watcher }
    }

    pub fn watcher(&self) -> &DownloadWatcher {
        &self.watcher
    }

    pub async fn trigger(
        &self,
        portal: &dyn PortalClient,
        report_id: &str,
        display_name: &str,
    ) -> Result<(), AcquisitionError> {
        portal
            .trigger_export(report_id)
            .await
            .map_err(|source| AcquisitionError::Portal {
                report: display_name.to_string(),
                last_status: None,
                source,
            })
    }

    pub async fn trigger_and_acquire(
        &self,
        portal: &dyn PortalClient,
        report_id: &str,
        display_name: &str,
    ) -> Result<Acquisition, AcquisitionError> {
        self.trigger(portal, report_id, display_name).await?;
        self.acquire(portal, display_name).await
    }

    pub async fn acquire(
        &self,
        portal: &dyn PortalClient,
        display_name: &str,
    ) -> Result<Acquisition, AcquisitionError> {
        let span = info_span!("acquire_report", report = display_name);
        self.acquire_inner(portal, display_name)
            .instrument(span)
            .await
    }

    async fn acquire_inner(
        &self,
        portal: &dyn PortalClient,
        display_name: &str,
    ) -> Result<Acquisition, AcquisitionError> {
        let started = Instant::now();
        let mut attempts = 0usize;
        let mut refreshes = 0usize;
        let mut last_status: Option<ExportStatus> = None;

        let portal_err = |source: PortalError, last_status: &Option<ExportStatus>| {
            AcquisitionError::Portal {
                report: display_name.to_string(),
                last_status: last_status.clone(),
                source,
            }
        };

        loop {
            attempts += 1;
            // Always re-read: a refresh rebuilds the table and invalidates prior handles.
            let rows = portal
                .read_status_rows()
                .await
                .map_err(|e| portal_err(e, &last_status))?;
            let job = locate_job(&rows, display_name)?;
            debug!(attempt = attempts, status = %job.status, "readiness poll");
            last_status = Some(job.status.clone());

            match &job.status {
                ExportStatus::Finished => {
                    let baseline = self.watcher.snapshot().await.map_err(|source| {
                        AcquisitionError::Watch {
                            report: display_name.to_string(),
                            source,
                        }
                    })?;
                    portal
                        .click_download(&job.row)
                        .await
                        .map_err(|e| portal_err(e, &last_status))?;
                    let download = self
                        .watcher
                        .wait_for_completion(&baseline)
                        .await
                        .map_err(|source| AcquisitionError::Watch {
                            report: display_name.to_string(),
                            source,
                        })?;

                    if let Some(warning) = download.warning() {
                        if self.config.strict_downloads {
                            return Err(AcquisitionError::DownloadIncomplete {
                                report: display_name.to_string(),
                                warning: warning.clone(),
                            });
                        }
                        warn!(%warning, "download unconfirmed; continuing");
                    }
                    info!(attempts, refreshes, files = download.files().len(), "report acquired");
                    return Ok(Acquisition {
                        display_name: job.display_name.clone(),
                        attempts,
                        refreshes,
                        download,
                    });
                }
                status if status.is_waiting() => {
                    let elapsed = started.elapsed();
                    if attempts >= self.config.max_attempts || elapsed >= self.config.max_wait {
                        return Err(AcquisitionError::ReportTimeout {
                            report: display_name.to_string(),
                            attempts,
                            elapsed,
                            last_status: job.status.clone(),
                        });
                    }
                    self.refresh(portal)
                        .await
                        .map_err(|e| portal_err(e, &last_status))?;
                    refreshes += 1;
                    tokio::time::sleep(self.config.settle_delay).await;
                }
                _ => {
                    return Err(AcquisitionError::UnknownStatus {
                        report: display_name.to_string(),
                        status: job_status_text(&rows, display_name),
                    });
                }
            }
        }
    }

    /// Tries each configured refresh target in order until one is found.
    async fn refresh(&self, portal: &dyn PortalClient) -> Result<(), PortalError> {
        for target in &self.config.refresh_targets {
            if portal.click_refresh(target).await? {
                debug!(%target, "refreshed status table");
                return Ok(());
            }
            debug!(%target, "refresh control not found; trying next");
        }
        Err(PortalError::ControlNotFound(
            self.config
                .refresh_targets
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        ))
    }
}

fn job_status_text(rows: &[StatusRow], display_name: &str) -> String {
    rows.iter()
        .find(|row| row.is_named(display_name))
        .map(|row| row.status_text.trim().to_string())
        .unwrap_or_default()
}

/// Finds the row for `display_name` in a freshly read table. Pure, so it can be
/// repeated after every refresh.
pub fn locate_job(rows: &[StatusRow], display_name: &str) -> Result<ExportJob, AcquisitionError> {
    if let Some(row) = rows.iter().find(|row| row.is_named(display_name)) {
        return Ok(ExportJob::from_row(row));
    }

    let available: Vec<String> = rows
        .iter()
        .map(|row| row.display_name.trim().to_string())
        .collect();
    let wanted = exportline_core::normalize_display_name(display_name);
    let suggestion = available
        .iter()
        .map(|name| (jaro_winkler(&wanted, &name.to_lowercase()), name))
        .filter(|(score, _)| *score >= 0.8)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, name)| name.clone());
    Err(AcquisitionError::ReportNotFound {
        report: display_name.to_string(),
        available,
        suggestion,
    })
}

/// Where the status table lives in the report page's markup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTableLayout {
    pub row_selector: String,
    pub cell_selector: String,
    pub name_column: usize,
    pub status_column: usize,
    pub download_selector: String,
}

impl Default for StatusTableLayout {
    fn default() -> Self {
        Self {
            row_selector: "table tbody tr".to_string(),
            cell_selector: "td".to_string(),
            name_column: 0,
            status_column: 1,
            download_selector: "a[href]".to_string(),
        }
    }
}

fn selector(raw: &str) -> Result<Selector, PortalError> {
    Selector::parse(raw).map_err(|e| PortalError::Selector {
        selector: raw.to_string(),
        message: e.to_string(),
    })
}

fn element_text(element: &ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses status rows out of a report page. Rows without data cells are skipped.
pub fn parse_status_table(
    html: &str,
    layout: &StatusTableLayout,
    generation: u64,
) -> Result<Vec<StatusRow>, PortalError> {
    let document = Html::parse_document(html);
    let row_sel = selector(&layout.row_selector)?;
    let cell_sel = selector(&layout.cell_selector)?;
    let download_sel = selector(&layout.download_selector)?;

    let mut rows = Vec::new();
    for row in document.select(&row_sel) {
        let cells: Vec<ElementRef<'_>> = row.select(&cell_sel).collect();
        let Some(name_cell) = cells.get(layout.name_column) else {
            continue;
        };
        let status_text = cells
            .get(layout.status_column)
            .map(element_text)
            .unwrap_or_default();
        let href = row
            .select(&download_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(|href| href.trim().to_string())
            .filter(|href| !href.is_empty() && href != "#");

        rows.push(StatusRow {
            display_name: element_text(name_cell),
            status_text,
            handle: DownloadHandle {
                generation,
                row_index: rows.len(),
                href,
            },
        });
    }
    Ok(rows)
}

/// Whether the page contains a control for `target`.
pub fn page_has_control(html: &str, target: &RefreshTarget) -> Result<bool, PortalError> {
    let document = Html::parse_document(html);
    match target {
        RefreshTarget::Text(text) => {
            let wanted = text.trim().to_lowercase();
            let controls = selector("button, a, input[type=button], input[type=submit]")?;
            Ok(document.select(&controls).any(|control| {
                let label = element_text(&control).to_lowercase();
                let value = control
                    .value()
                    .attr("value")
                    .unwrap_or_default()
                    .to_lowercase();
                label.contains(&wanted) || value.contains(&wanted)
            }))
        }
        RefreshTarget::IconClass(class) => {
            let wanted = class.trim();
            let any = selector("[class]")?;
            Ok(document
                .select(&any)
                .any(|el| el.value().classes().any(|c| c == wanted)))
        }
    }
}

/// Extracts `filename` from a `Content-Disposition` header value.
pub fn filename_from_content_disposition(header: &str) -> Option<String> {
    header
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))
        .map(|name| name.trim().trim_matches('"').to_string())
        .filter(|name| !name.is_empty())
}

/// Portals often serve downloads from extension-less URLs; sniff the body so the
/// watcher recognizes the stored file. Login and error pages come back as HTML
/// with a success status and are refused whatever the file is called.
pub fn with_download_extension(file_name: &str, body: &[u8]) -> Result<String, PortalError> {
    if looks_like_markup(body) {
        return Err(PortalError::UnexpectedBody {
            file_name: file_name.to_string(),
        });
    }
    if std::path::Path::new(file_name).extension().is_some() {
        return Ok(file_name.to_string());
    }
    if body.starts_with(b"PK\x03\x04") {
        Ok(format!("{file_name}.zip"))
    } else {
        Ok(format!("{file_name}.csv"))
    }
}

fn looks_like_markup(body: &[u8]) -> bool {
    let body = body.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(body);
    let start = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(body.len());
    let head: Vec<u8> = body[start..]
        .iter()
        .take(16)
        .map(u8::to_ascii_lowercase)
        .collect();
    [&b"<!doctype"[..], b"<html", b"<?xml", b"<head", b"<body"]
        .iter()
        .any(|prefix| head.starts_with(prefix))
}

#[derive(Debug, Clone)]
pub struct HttpPortalConfig {
    pub base_url: String,
    pub status_path: String,
    pub export_path: String,
    /// Form field carrying the report id when triggering an export.
    pub export_field: String,
    pub layout: StatusTableLayout,
    pub http: HttpClientConfig,
}

impl Default for HttpPortalConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            status_path: "/reports/exports".to_string(),
            export_path: "/reports/exports".to_string(),
            export_field: "report_id".to_string(),
            layout: StatusTableLayout::default(),
            http: HttpClientConfig::default(),
        }
    }
}

#[derive(Debug, Default)]
struct PageState {
    generation: u64,
    html: Option<String>,
}

/// Portal client for server-rendered report pages over an authenticated HTTP session.
/// Every fetch of the status page starts a new page generation.
#[derive(Debug)]
pub struct HttpPortalClient {
    fetcher: HttpFetcher,
    config: HttpPortalConfig,
    base: Url,
    download_dir: PathBuf,
    state: Mutex<PageState>,
}

impl HttpPortalClient {
    pub fn new(config: HttpPortalConfig, download_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| PortalError::Url(format!("{}: {e}", config.base_url)))?;
        let fetcher = HttpFetcher::new(config.http.clone())?;
        Ok(Self {
            fetcher,
            config,
            base,
            download_dir: download_dir.into(),
            state: Mutex::new(PageState::default()),
        })
    }

    fn resolve(&self, path_or_url: &str) -> Result<Url, PortalError> {
        self.base
            .join(path_or_url)
            .map_err(|e| PortalError::Url(format!("{path_or_url}: {e}")))
    }

    async fn fetch_status_page(&self, state: &mut PageState) -> Result<String, PortalError> {
        let url = self.resolve(&self.config.status_path)?;
        let resp = self.fetcher.get(url.as_str()).await?;
        let html = String::from_utf8_lossy(&resp.body).into_owned();
        state.generation += 1;
        state.html = Some(html.clone());
        Ok(html)
    }
}

#[async_trait]
impl PortalClient for HttpPortalClient {
    async fn trigger_export(&self, report_id: &str) -> Result<(), PortalError> {
        let url = self.resolve(&self.config.export_path)?;
        self.fetcher
            .post_form(url.as_str(), &[(self.config.export_field.as_str(), report_id)])
            .await?;
        let mut state = self.state.lock().await;
        state.html = None;
        state.generation += 1;
        info!(report_id, "export triggered");
        Ok(())
    }

    async fn read_status_rows(&self) -> Result<Vec<StatusRow>, PortalError> {
        let mut state = self.state.lock().await;
        let html = self.fetch_status_page(&mut state).await?;
        parse_status_table(&html, &self.config.layout, state.generation)
    }

    async fn click_refresh(&self, target: &RefreshTarget) -> Result<bool, PortalError> {
        let mut state = self.state.lock().await;
        let html = match state.html.clone() {
            Some(html) => html,
            None => self.fetch_status_page(&mut state).await?,
        };
        if !page_has_control(&html, target)? {
            return Ok(false);
        }
        self.fetch_status_page(&mut state).await?;
        Ok(true)
    }

    async fn click_download(&self, handle: &DownloadHandle) -> Result<(), PortalError> {
        let state = self.state.lock().await;
        if handle.generation != state.generation {
            return Err(PortalError::StaleHandle {
                handle: handle.generation,
                current: state.generation,
            });
        }
        let href = handle
            .href
            .as_deref()
            .ok_or(PortalError::MissingDownloadLink {
                row: handle.row_index,
            })?;
        let url = self.resolve(href)?;
        let resp = self.fetcher.get(url.as_str()).await?;

        let file_name = resp
            .content_disposition
            .as_deref()
            .and_then(filename_from_content_disposition)
            .or_else(|| {
                url.path_segments()
                    .and_then(|mut segments| segments.next_back())
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| format!("export-{}", handle.row_index));
        let file_name = with_download_extension(&file_name, &resp.body)?;
        let stored = write_download_atomically(&self.download_dir, &file_name, &resp.body)
            .await
            .map_err(PortalError::Download)?;
        info!(file = %stored.display(), bytes = resp.body.len(), "download stored");
        Ok(())
    }
}
