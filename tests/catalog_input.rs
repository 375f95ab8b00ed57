use gpa_dispatch::{
    catalog::{Catalog, CatalogError},
    engine::openai::read_key_file,
    input,
};
use std::path::Path;

#[test]
fn shipped_catalog_parses() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("jobs.toml");
    let catalog = Catalog::load(&path).expect("load jobs.toml");
    let job = catalog.job("GPA Review").expect("job");
    assert!(job.available_context() > 0);
    assert!(catalog.pricing_for(&job.model).is_some());
    assert_eq!(catalog.questions_for("GPA Review").count(), 3);
    assert!(matches!(
        catalog.job("missing"),
        Err(CatalogError::UnknownJob(_))
    ));
}

#[test]
fn duplicate_jobs_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.toml");
    let job = "[[jobs]]\nname = \"a\"\nmodel = \"m\"\ninput_context_limit = 10\nassistant_role = \"r\"\n";
    std::fs::write(&path, format!("{job}{job}")).unwrap();
    assert!(matches!(
        Catalog::load(&path),
        Err(CatalogError::DuplicateJob(name)) if name == "a"
    ));
}

#[test]
fn records_load_from_json_and_jsonl_in_name_order() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("b.jsonl"),
        "{\"n\": 3}\n\n{\"n\": 4}\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("a.json"), r#"[{"n": 1}, {"n": 2}]"#).unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let records = input::load_records(dir.path(), true).unwrap();
    let seen: Vec<(u64, &str, &str)> = records
        .iter()
        .map(|r| (r.id, r.source.as_str(), r.json.as_str()))
        .collect();
    assert_eq!(
        seen,
        vec![
            (0, "a.json", r#"{"n":1}"#),
            (1, "a.json", r#"{"n":2}"#),
            (2, "b.jsonl", r#"{"n":3}"#),
            (3, "b.jsonl", r#"{"n":4}"#),
        ]
    );
}

#[test]
fn csv_tables_keep_header_order_and_string_cells() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("grades.csv"),
        "\u{feff}student,gpa,note\nAda,3.9,\"honors, dean's list\"\nBo,2.5,\n",
    )
    .unwrap();

    let records = input::load_records(dir.path(), true).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].source, "grades.csv");
    assert_eq!(
        records[0].json,
        r#"{"student":"Ada","gpa":"3.9","note":"honors, dean's list"}"#
    );
    assert_eq!(records[1].json, r#"{"student":"Bo","gpa":"2.5","note":null}"#);
}

#[test]
fn csv_falls_back_to_latin1() {
    let dir = tempfile::tempdir().unwrap();
    // "Jos\xe9" is Latin-1, not valid UTF-8.
    std::fs::write(dir.path().join("labels.csv"), b"label\nJos\xe9\n").unwrap();

    let ctx = input::load_context(dir.path(), true).unwrap();
    assert_eq!(
        ctx.table("labels.csv").unwrap().first_column_values(),
        vec!["Jos\u{e9}".to_string()]
    );
}

#[test]
fn empty_records_dir_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(input::load_records(dir.path(), true).is_err());
}

#[test]
fn non_object_rows_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.json"), "[1, 2]").unwrap();
    assert!(input::load_records(dir.path(), false).is_err());
}

#[test]
fn strings_are_nfc_normalized() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.json"), "[{\"name\": \"Jose\u{0301}\"}]").unwrap();

    let records = input::load_records(dir.path(), true).unwrap();
    assert_eq!(records[0].fields["name"], "Jos\u{00e9}");

    let raw = input::load_records(dir.path(), false).unwrap();
    assert_eq!(raw[0].fields["name"], "Jose\u{0301}");
}

#[test]
fn context_skips_empty_tables_and_tolerates_missing_dir() {
    let dir = tempfile::tempdir().unwrap();
    assert!(input::load_context(&dir.path().join("absent"), true)
        .unwrap()
        .is_empty());

    std::fs::write(dir.path().join("empty.json"), "[]").unwrap();
    std::fs::write(
        dir.path().join("labels.json"),
        r#"[{"label": "A", "n": 1}, {"label": "B", "n": 2}]"#,
    )
    .unwrap();

    let ctx = input::load_context(dir.path(), true).unwrap();
    assert_eq!(ctx.tables().len(), 1);
    assert_eq!(ctx.row_count(), 2);
    assert_eq!(
        ctx.json(),
        r#"[{"label":"A","n":1},{"label":"B","n":2}]"#
    );
    assert_eq!(
        ctx.table("labels.json").unwrap().first_column_values(),
        vec!["A".to_string(), "B".to_string()]
    );
}

#[test]
fn key_file_skips_header_and_extra_columns() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("key.csv");
    std::fs::write(&path, "api_key\n\nsk-test-123, personal\n").unwrap();
    assert_eq!(read_key_file(&path).unwrap(), "sk-test-123");

    std::fs::write(&path, "api_key\n").unwrap();
    assert!(read_key_file(&path).is_err());
}
