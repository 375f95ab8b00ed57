mod common;

use common::*;
use gpa_dispatch::{
    budget::ValidatedRecord,
    input::{ContextTable, Record, SharedContext},
    request::{self, Role, CONTEXT_PREAMBLE, RECORD_PREAMBLE},
    schema::{self, NO_MATCH},
};
use serde_json::json;

fn mk_validated() -> ValidatedRecord {
    ValidatedRecord {
        record: Record::new(7, "records.json", mk_row(json!({"name": "Ada", "gpa": 3.9}))),
        token_cost: 42,
    }
}

fn mk_context() -> SharedContext {
    SharedContext::new(vec![ContextTable {
        source: "categories.json".into(),
        rows: vec![
            mk_row(json!({"category": "Honors", "min_gpa": 3.5})),
            mk_row(json!({"category": "Standard", "min_gpa": 2.0})),
        ],
    }])
}

#[test]
fn without_context_only_three_turns() {
    let job = mk_job(1000, 0);
    let d = request::build(&mk_validated(), &SharedContext::empty(), &job, &mk_schema());

    let roles: Vec<Role> = d.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::Developer, Role::User, Role::User]);
    assert_eq!(d.messages[0].content, job.assistant_role);
    assert_eq!(d.messages[1].content, RECORD_PREAMBLE);
    assert_eq!(d.messages[2].content, r#"[{"name":"Ada","gpa":3.9}]"#);
    assert_eq!(d.record_id, 7);
    assert_eq!(d.token_cost, 42);
    assert_eq!(d.max_completion_tokens, None);
}

#[test]
fn context_appended_after_record() {
    let mut job = mk_job(1000, 0);
    job.output_context_limit = 512;
    let ctx = mk_context();
    let d = request::build(&mk_validated(), &ctx, &job, &mk_schema());

    assert_eq!(d.messages.len(), 5);
    assert_eq!(d.messages[3].role, Role::Developer);
    assert_eq!(d.messages[3].content, CONTEXT_PREAMBLE);
    assert_eq!(d.messages[4].content, ctx.json());
    assert_eq!(d.max_completion_tokens, Some(512));
    assert_eq!(d.temperature, job.temperature);
}

#[test]
fn enum_values_come_from_context_with_no_match_last() {
    let ctx = mk_context();
    let questions = [mk_question("category", "enum", Some("categories.json"))];
    let s = schema::resolve(&mk_job(1000, 0), &questions, &ctx).expect("resolve");
    let d = request::build(&mk_validated(), &ctx, &mk_job(1000, 0), &s);

    let item = &d.response_format["json_schema"]["schema"]["properties"]["results"]["items"];
    assert_eq!(
        item["properties"]["category"]["enum"],
        json!(["Honors", "Standard", NO_MATCH])
    );
    assert_eq!(item["required"], json!(["category"]));
    assert_eq!(item["additionalProperties"], json!(false));
    assert_eq!(d.response_format["json_schema"]["strict"], json!(true));
    assert_eq!(d.response_format["json_schema"]["name"], "GPA_Review");
}

#[test]
fn build_is_pure() {
    let ctx = mk_context();
    let job = mk_job(1000, 0);
    let s = mk_schema();
    let a = request::build(&mk_validated(), &ctx, &job, &s);
    let b = request::build(&mk_validated(), &ctx, &job, &s);
    assert_eq!(a, b);
}

#[test]
fn build_all_keeps_submission_order() {
    let ds = mk_descriptors(4);
    let ids: Vec<u64> = ds.iter().map(|d| d.record_id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);
}
