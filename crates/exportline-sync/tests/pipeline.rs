use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use exportline_core::{DownloadHandle, SchemaDefinition, StatusRow};
use exportline_portal::{AcquisitionError, PortalClient, PortalError, RefreshTarget};
use exportline_sync::{MemoryDatastore, ReportSpec, SyncConfig, SyncPipeline, Workload};
use tempfile::tempdir;

struct FakeReport {
    name: &'static str,
    refreshes_needed: usize,
    /// File name and body written on download; `None` simulates a download that never lands.
    download: Option<(String, Vec<u8>)>,
}

impl FakeReport {
    fn new(name: &'static str, refreshes_needed: usize, file: &str, body: &[u8]) -> Self {
        Self {
            name,
            refreshes_needed,
            download: Some((file.to_string(), body.to_vec())),
        }
    }
}

/// Portal whose reports finish after a fixed number of refreshes and whose
/// downloads land in the watched directory.
struct FakePortal {
    download_dir: PathBuf,
    reports: Vec<FakeReport>,
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    generation: u64,
    refreshes: usize,
    events: Vec<String>,
}

impl FakePortal {
    fn new(download_dir: &Path, reports: Vec<FakeReport>) -> Self {
        Self {
            download_dir: download_dir.to_path_buf(),
            reports,
            state: Mutex::new(FakeState::default()),
        }
    }

    fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }
}

#[async_trait]
impl PortalClient for FakePortal {
    async fn trigger_export(&self, report_id: &str) -> Result<(), PortalError> {
        self.state
            .lock()
            .unwrap()
            .events
            .push(format!("trigger:{report_id}"));
        Ok(())
    }

    async fn read_status_rows(&self) -> Result<Vec<StatusRow>, PortalError> {
        let state = self.state.lock().unwrap();
        Ok(self
            .reports
            .iter()
            .enumerate()
            .map(|(row_index, report)| {
                let finished = state.refreshes >= report.refreshes_needed;
                StatusRow {
                    display_name: report.name.to_string(),
                    status_text: if finished { "Finished" } else { "Pending" }.to_string(),
                    handle: DownloadHandle {
                        generation: state.generation,
                        row_index,
                        href: Some(format!("/exports/{row_index}/download")),
                    },
                }
            })
            .collect())
    }

    async fn click_refresh(&self, _target: &RefreshTarget) -> Result<bool, PortalError> {
        let mut state = self.state.lock().unwrap();
        state.refreshes += 1;
        state.generation += 1;
        Ok(true)
    }

    async fn click_download(&self, handle: &DownloadHandle) -> Result<(), PortalError> {
        let mut state = self.state.lock().unwrap();
        if handle.generation != state.generation {
            return Err(PortalError::StaleHandle {
                handle: handle.generation,
                current: state.generation,
            });
        }
        let report = &self.reports[handle.row_index];
        state.events.push(format!("download:{}", report.name));
        if let Some((file, body)) = &report.download {
            std::fs::write(self.download_dir.join(file), body)
                .map_err(|err| PortalError::Download(err.into()))?;
        }
        Ok(())
    }
}

fn zip_bytes(members: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, body) in members {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .expect("start member");
        writer.write_all(body.as_bytes()).expect("write member");
    }
    writer.finish().expect("finish zip").into_inner()
}

fn report_spec(report_id: &str, display_name: &str) -> ReportSpec {
    ReportSpec {
        report_id: report_id.into(),
        display_name: display_name.into(),
    }
}

fn schemas() -> Vec<SchemaDefinition> {
    vec![
        SchemaDefinition::new(
            "housing-record-details",
            "housing_record_details",
            ["record_id", "address", "status"],
        ),
        SchemaDefinition::new("inspection", "inspections", ["inspection_id", "result"]),
    ]
}

fn workload() -> Workload {
    Workload {
        reports: vec![
            report_spec("housing_record_details", "Housing Record Details"),
            report_spec("inspection_results", "Inspection Results"),
        ],
        schemas: schemas(),
    }
}

fn standard_reports() -> Vec<FakeReport> {
    vec![
        FakeReport::new(
            "Housing Record Details",
            0,
            "housing-record-details.csv",
            b"record_id,address,status\n1,1 Main St,open\n2,2 Elm St,closed\n",
        ),
        FakeReport::new(
            "Inspection Results",
            2,
            "inspection-results.csv",
            b"inspection_id,result\n9,pass\n",
        ),
    ]
}

fn fast_config(root: &Path) -> SyncConfig {
    SyncConfig {
        downloads_dir: root.join("downloads"),
        reports_dir: root.join("reports"),
        settle_delay_secs: 0,
        max_poll_attempts: 5,
        download_poll_ms: 10,
        download_wait_secs: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn run_once_triggers_all_then_acquires_and_loads_each_report() {
    let root = tempdir().expect("tempdir");
    let config = fast_config(root.path());
    std::fs::create_dir_all(&config.downloads_dir).expect("downloads");
    let portal = Arc::new(FakePortal::new(&config.downloads_dir, standard_reports()));
    let store = Arc::new(MemoryDatastore::new());
    let pipeline =
        SyncPipeline::new(config, workload(), store.clone()).with_portal(portal.clone());

    let summary = pipeline.run_once().await.expect("run");

    assert_eq!(
        portal.events(),
        vec![
            "trigger:housing_record_details",
            "trigger:inspection_results",
            "download:Housing Record Details",
            "download:Inspection Results",
        ]
    );
    assert_eq!(summary.reports_acquired, 2);
    assert_eq!(summary.files_loaded, 2);
    assert_eq!(summary.rows_inserted, 3);
    assert_eq!(store.truncate_count("housing_record_details").await, 1);
    assert_eq!(
        store.rows_in("inspections").await,
        vec![vec![Some("9".into()), Some("pass".into())]]
    );
    assert!(Path::new(&summary.report_dir).join("run_report.json").exists());
}

#[tokio::test]
async fn colliding_file_names_load_in_acquisition_order() {
    let root = tempdir().expect("tempdir");
    let config = fast_config(root.path());
    std::fs::create_dir_all(&config.downloads_dir).expect("downloads");
    // Both reports yield housing-record-details.csv; the second copy is renamed
    // with a -1 suffix when staged.
    let portal = Arc::new(FakePortal::new(
        &config.downloads_dir,
        vec![
            FakeReport::new(
                "Housing Record Details",
                0,
                "housing-bundle.zip",
                &zip_bytes(&[(
                    "housing-record-details.csv",
                    "record_id,address,status\n1,1 Main St,open\n",
                )]),
            ),
            FakeReport::new(
                "Housing Record Details Addendum",
                0,
                "housing-record-details.csv",
                b"record_id,address,status\n2,2 Elm St,closed\n",
            ),
        ],
    ));
    let workload = Workload {
        reports: vec![
            report_spec("housing_record_details", "Housing Record Details"),
            report_spec("housing_addendum", "Housing Record Details Addendum"),
        ],
        schemas: schemas(),
    };
    let store = Arc::new(MemoryDatastore::new());
    let pipeline = SyncPipeline::new(config, workload, store.clone()).with_portal(portal);

    let summary = pipeline.run_once().await.expect("run");

    assert_eq!(summary.files_loaded, 2);
    let ids: Vec<Option<String>> = store
        .rows_in("housing_record_details")
        .await
        .into_iter()
        .map(|row| row[0].clone())
        .collect();
    assert_eq!(ids, vec![Some("1".to_string()), Some("2".to_string())]);
}

#[tokio::test]
async fn missing_download_warns_and_the_run_loads_nothing() {
    let root = tempdir().expect("tempdir");
    let config = fast_config(root.path());
    let portal = Arc::new(FakePortal::new(
        &config.downloads_dir,
        vec![FakeReport {
            name: "Housing Record Details",
            refreshes_needed: 0,
            download: None,
        }],
    ));
    let workload = Workload {
        reports: vec![report_spec("housing_record_details", "Housing Record Details")],
        schemas: schemas(),
    };
    let store = Arc::new(MemoryDatastore::new());
    let pipeline = SyncPipeline::new(config, workload, store.clone()).with_portal(portal);

    let summary = pipeline.run_once().await.expect("run proceeds");

    assert_eq!(summary.files_discovered, 0);
    assert_eq!(summary.rows_inserted, 0);
    assert!(store.ops().await.is_empty());
    let report: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(Path::new(&summary.report_dir).join("run_report.json"))
            .expect("report"),
    )
    .expect("json");
    assert!(report["acquisitions"][0]["download_warning"].is_string());
}

#[tokio::test]
async fn missing_download_fails_the_run_in_strict_mode() {
    let root = tempdir().expect("tempdir");
    let config = SyncConfig {
        strict_downloads: true,
        ..fast_config(root.path())
    };
    let portal = Arc::new(FakePortal::new(
        &config.downloads_dir,
        vec![FakeReport {
            name: "Housing Record Details",
            refreshes_needed: 0,
            download: None,
        }],
    ));
    let workload = Workload {
        reports: vec![report_spec("housing_record_details", "Housing Record Details")],
        schemas: schemas(),
    };
    let store = Arc::new(MemoryDatastore::new());
    let pipeline = SyncPipeline::new(config, workload, store.clone()).with_portal(portal);

    let err = pipeline.run_once().await.expect_err("strict download");

    assert!(matches!(
        err.downcast_ref::<AcquisitionError>(),
        Some(AcquisitionError::DownloadIncomplete { report, .. }) if report == "Housing Record Details"
    ));
    assert!(store.ops().await.is_empty());
}

#[tokio::test]
async fn run_once_fails_when_a_report_never_finishes() {
    let root = tempdir().expect("tempdir");
    let config = fast_config(root.path());
    let mut reports = standard_reports();
    reports[1].refreshes_needed = 100;
    let portal = Arc::new(FakePortal::new(&config.downloads_dir, reports));
    let store = Arc::new(MemoryDatastore::new());
    let pipeline = SyncPipeline::new(config, workload(), store.clone()).with_portal(portal);

    let err = pipeline.run_once().await.expect_err("timeout");

    assert!(format!("{err:#}").contains("Inspection Results"));
    assert!(store.ops().await.is_empty());
}
