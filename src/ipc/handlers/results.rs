use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    date_param, opt_date_param, require_conn, scoring_err, str_param, stream_param,
};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{self, MarkingScheme, ScoredResult};
use chrono::NaiveDate;
use serde_json::json;
use std::collections::BTreeSet;

struct InstanceParams {
    test_name: String,
    stream: scoring::Stream,
    date: NaiveDate,
    submissions_from: NaiveDate,
    submissions_to: NaiveDate,
}

fn instance_params(req: &Request) -> Result<InstanceParams, serde_json::Value> {
    let test_name = str_param(req, "testName")?;
    let stream = stream_param(req, "stream")?;
    let date = date_param(req, "date")?;
    // The console often pulls a month of raw report rows; scoring still
    // targets the one exact test instance identified by `date`.
    let submissions_from = opt_date_param(req, "submissionsFrom", date)?;
    let submissions_to = opt_date_param(req, "submissionsTo", date)?;
    if submissions_from > submissions_to {
        return Err(err(
            &req.id,
            "bad_params",
            "submissionsFrom must not be after submissionsTo",
            None,
        ));
    }
    Ok(InstanceParams {
        test_name,
        stream,
        date,
        submissions_from,
        submissions_to,
    })
}

fn scheme_override(req: &Request, stored: MarkingScheme) -> Result<MarkingScheme, serde_json::Value> {
    let Some(obj) = req.params.get("scheme") else {
        return Ok(stored);
    };
    if obj.is_null() {
        return Ok(stored);
    }
    let (Some(correct_mark), Some(wrong_mark)) = (
        obj.get("correctMark").and_then(|v| v.as_f64()),
        obj.get("wrongMark").and_then(|v| v.as_f64()),
    ) else {
        return Err(err(
            &req.id,
            "bad_params",
            "scheme override needs numeric correctMark and wrongMark",
            None,
        ));
    };
    Ok(MarkingScheme::new(correct_mark, wrong_mark))
}

fn result_rows(results: &[ScoredResult]) -> Vec<serde_json::Value> {
    results
        .iter()
        .map(|r| serde_json::to_value(r).unwrap_or_else(|_| json!({})))
        .collect()
}

fn handle_compute(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let params = match instance_params(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let (_key_id, key, stored_scheme) =
        match db::resolve_answer_key(conn, &params.test_name, params.stream, params.date) {
            Ok(v) => v,
            Err(e) => return scoring_err(&req.id, e),
        };
    let scheme = match scheme_override(req, stored_scheme) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let loaded = match db::load_submissions_range(
        conn,
        &params.test_name,
        params.stream,
        params.submissions_from,
        params.submissions_to,
    ) {
        Ok(v) => v,
        Err(e) => return scoring_err(&req.id, e),
    };
    let submissions =
        scoring::dedupe_submissions(loaded.into_iter().map(|(_, s)| s).collect());
    if submissions.is_empty() {
        return err(
            &req.id,
            "not_found",
            format!(
                "no submissions for {} / {} between {} and {}",
                params.test_name,
                params.stream.as_str(),
                params.submissions_from,
                params.submissions_to
            ),
            None,
        );
    }

    let results = match scoring::score_batch(&key, &submissions, &scheme) {
        Ok(v) => v,
        Err(e) => return scoring_err(&req.id, e),
    };
    if let Err(e) =
        db::persist_results(conn, &params.test_name, params.stream, params.date, &results)
    {
        return scoring_err(&req.id, e);
    }
    tracing::info!(
        test = %params.test_name,
        students = results.len(),
        "batch scored"
    );

    ok(
        &req.id,
        json!({
            "testName": params.test_name,
            "stream": params.stream.as_str(),
            "date": params.date.to_string(),
            "totalQuestions": key.total_questions(),
            "scheme": scheme,
            "results": result_rows(&results),
        }),
    )
}

fn handle_apply_grace(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let params = match instance_params(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(raw_numbers) = req.params.get("questionNumbers").and_then(|v| v.as_array()) else {
        return err(
            &req.id,
            "bad_params",
            "missing questionNumbers array",
            None,
        );
    };
    let mut question_numbers: BTreeSet<u32> = BTreeSet::new();
    for v in raw_numbers {
        let Some(q) = v.as_u64().and_then(|n| u32::try_from(n).ok()).filter(|q| *q > 0) else {
            return err(
                &req.id,
                "bad_params",
                "questionNumbers must be positive integers",
                None,
            );
        };
        question_numbers.insert(q);
    }
    if question_numbers.is_empty() {
        return err(&req.id, "bad_params", "questionNumbers is empty", None);
    }

    let (key_id, mut key, stored_scheme) =
        match db::resolve_answer_key(conn, &params.test_name, params.stream, params.date) {
            Ok(v) => v,
            Err(e) => return scoring_err(&req.id, e),
        };
    let scheme = match scheme_override(req, stored_scheme) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // Grace supersedes an existing generation; there must be one to grade.
    let prior = match db::load_results(conn, &params.test_name, params.stream, params.date) {
        Ok(v) => v,
        Err(e) => return scoring_err(&req.id, e),
    };
    if prior.is_empty() {
        return err(
            &req.id,
            "not_found",
            "no scored results for this test instance; run results.compute first",
            None,
        );
    }

    // Persist the grace flags so later recomputations see the updated key.
    let flipped = match db::set_questions_graced(conn, &key_id, &question_numbers) {
        Ok(n) => n,
        Err(e) => return scoring_err(&req.id, e),
    };

    let loaded = match db::load_submissions_range(
        conn,
        &params.test_name,
        params.stream,
        params.submissions_from,
        params.submissions_to,
    ) {
        Ok(v) => v,
        Err(e) => return scoring_err(&req.id, e),
    };
    let submissions =
        scoring::dedupe_submissions(loaded.into_iter().map(|(_, s)| s).collect());

    let results =
        match scoring::apply_grace(&question_numbers, &mut key, &submissions, &scheme) {
            Ok(v) => v,
            Err(e) => return scoring_err(&req.id, e),
        };
    if let Err(e) =
        db::persist_results(conn, &params.test_name, params.stream, params.date, &results)
    {
        return scoring_err(&req.id, e);
    }
    tracing::info!(
        test = %params.test_name,
        graced = ?question_numbers,
        students = results.len(),
        "grace applied"
    );

    ok(
        &req.id,
        json!({
            "testName": params.test_name,
            "stream": params.stream.as_str(),
            "date": params.date.to_string(),
            "gracedQuestions": question_numbers,
            "questionsFlipped": flipped,
            "results": result_rows(&results),
        }),
    )
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let test_name = match str_param(req, "testName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let stream = match stream_param(req, "stream") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let date = match date_param(req, "date") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let rows = match db::load_results(conn, &test_name, stream, date) {
        Ok(v) => v,
        Err(e) => return scoring_err(&req.id, e),
    };
    let results: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            let mut v = serde_json::to_value(&row.result).unwrap_or_else(|_| json!({}));
            v["lastName"] = json!(row.last_name);
            v["firstName"] = json!(row.first_name);
            v["campus"] = json!(row.campus);
            v["computedAt"] = json!(row.computed_at);
            v
        })
        .collect();
    ok(&req.id, json!({ "results": results }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.compute" => Some(handle_compute(state, req)),
        "results.applyGrace" => Some(handle_apply_grace(state, req)),
        "results.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
