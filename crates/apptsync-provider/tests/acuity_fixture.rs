use apptsync_provider::{FixtureProvider, ProviderClient};
use chrono::NaiveDate;

fn sample_path() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures/acuity/sample/appointments.json")
}

#[test]
fn acuity_sample_fixture_exists() {
    assert!(sample_path().exists());
}

#[tokio::test]
async fn acuity_sample_fixture_parses_into_provider_records() {
    let provider = FixtureProvider::from_path(sample_path()).unwrap();

    let day = NaiveDate::from_ymd_opt(2025, 4, 24).unwrap();
    let listing = provider.fetch_listing(Some(day), 100).await.unwrap();
    assert_eq!(listing.len(), 3);

    let canceled = provider.fetch_appointment(1451596600).await.unwrap();
    assert!(canceled.canceled);
    assert_eq!(canceled.duration_minutes, 45);
    assert_eq!(canceled.calendar_id, Some(1574840));

    let tomorrow = provider.fetch_appointment(1451596601).await.unwrap();
    assert_eq!(tomorrow.last_name, "Bailey");
}
