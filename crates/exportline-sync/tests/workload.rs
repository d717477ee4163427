use exportline_sync::{SchemaRouter, Workload};

const SAMPLE: &str = include_str!("../../../exportline.yaml");

#[test]
fn sample_workload_is_valid_and_unshadowed() {
    let workload = Workload::from_yaml_str(SAMPLE).expect("sample workload");
    assert_eq!(workload.reports.len(), 3);

    let router = SchemaRouter::new(workload.schemas);
    assert!(router.shadowed_schemas().is_empty());
    assert_eq!(
        router
            .route("Housing-Record-Details_2026-10-01.csv")
            .map(|s| s.table_name.as_str()),
        Some("staging.housing_record_details")
    );
    assert_eq!(
        router
            .route("housing-complaints.csv")
            .map(|s| s.table_name.as_str()),
        Some("staging.housing_misc")
    );
    assert!(router.route("payments.csv").is_none());
}
