use std::path::PathBuf;

use dlh_adapters::{load_raw_leads_file, parse_search_response};
use dlh_core::{advance, LeadPolicy, LeadStatus};

fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures/serper/sample/response.json")
}

#[test]
fn fixture_response_parses_every_organic_hit() {
    let bytes = std::fs::read(fixture_path()).expect("fixture exists");
    let leads = parse_search_response(&bytes).expect("parse fixture");

    assert_eq!(leads.len(), 5);
    assert_eq!(leads[0].date.as_deref(), Some("5 hours ago"));
    assert_eq!(leads[1].date, None);
    assert_eq!(leads[4].link, None);
}

#[test]
fn fixture_response_advances_into_store_records() {
    let raw = load_raw_leads_file(fixture_path()).expect("load fixture");
    let now = chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
        .and_then(|d| d.and_hms_opt(9, 30, 0))
        .expect("timestamp");

    let out = advance(&LeadPolicy::default(), Vec::new(), &raw, now);

    let companies = out
        .leads
        .iter()
        .map(|l| l.company.as_str())
        .collect::<Vec<_>>();
    assert_eq!(companies, vec!["Acme Corp", "Globex", "US Company"]);
    assert!(out.leads.iter().all(|l| l.status == LeadStatus::New));
    assert_eq!(out.leads[1].posted_at, "Just now");
    assert_eq!(out.report.duplicates, 1);
    assert_eq!(out.report.skipped, 1);
}
