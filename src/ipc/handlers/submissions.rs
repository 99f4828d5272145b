use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    date_param, require_conn, scoring_err, str_param, stream_param, valid_reg_number,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Marked options arrive as an object keyed by question number. Keys must be
/// positive integers; values must be strings. Null values mean the student
/// left the question blank and are dropped here, which downstream scoring
/// reads as unattempted.
fn parse_marked_param(req: &Request) -> Result<BTreeMap<u32, String>, serde_json::Value> {
    let Some(obj) = req.params.get("markedOptions").and_then(|v| v.as_object()) else {
        return Err(err(
            &req.id,
            "bad_params",
            "missing markedOptions object",
            None,
        ));
    };
    let mut marked: BTreeMap<u32, String> = BTreeMap::new();
    for (k, v) in obj {
        let Ok(q) = k.parse::<u32>() else {
            return Err(err(
                &req.id,
                "bad_params",
                format!("markedOptions key {} is not a question number", k),
                None,
            ));
        };
        if q == 0 {
            return Err(err(
                &req.id,
                "bad_params",
                "question numbers start at 1",
                None,
            ));
        }
        if v.is_null() {
            continue;
        }
        let Some(s) = v.as_str() else {
            return Err(err(
                &req.id,
                "bad_params",
                format!("markedOptions[{}] must be a string", k),
                None,
            ));
        };
        marked.insert(q, s.to_string());
    }
    Ok(marked)
}

fn handle_record(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let reg_number = match str_param(req, "regNumber") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if !valid_reg_number(&reg_number) {
        return err(
            &req.id,
            "bad_params",
            format!("malformed reg number: {}", reg_number),
            None,
        );
    }
    let marked = match parse_marked_param(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let marked_json: BTreeMap<String, String> = marked
        .iter()
        .map(|(q, v)| (q.to_string(), v.clone()))
        .collect();
    let marked_json = match serde_json::to_string(&marked_json) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // One submission per (regNumber, testName, stream, date); a re-record
    // replaces the previous answers for that student.
    let outcome = conn.execute(
        "INSERT INTO submissions(id, test_name, stream, date, reg_number, marked_options)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(test_name, stream, date, reg_number) DO UPDATE SET
            marked_options = excluded.marked_options",
        (
            Uuid::new_v4().to_string(),
            &test_name,
            stream.as_str(),
            date.to_string(),
            &reg_number,
            &marked_json,
        ),
    );
    match outcome {
        Ok(_) => ok(
            &req.id,
            json!({
                "regNumber": reg_number,
                "testName": test_name,
                "date": date.to_string(),
                "markedCount": marked.len(),
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
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
    let date_from = match date_param(req, "dateFrom") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let date_to = match date_param(req, "dateTo") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let rows = match db::load_submissions_range(conn, &test_name, stream, date_from, date_to) {
        Ok(v) => v,
        Err(e) => return scoring_err(&req.id, e),
    };
    // Raw rows: a student can appear once per date in the range. Scoring
    // consumers keep the first occurrence per reg number.
    let submissions: Vec<serde_json::Value> = rows
        .iter()
        .map(|(date, s)| {
            let marked: BTreeMap<String, &String> = s
                .marked_options
                .iter()
                .map(|(q, v)| (q.to_string(), v))
                .collect();
            json!({
                "date": date.to_string(),
                "regNumber": s.reg_number,
                "markedOptions": marked,
            })
        })
        .collect();
    ok(&req.id, json!({ "submissions": submissions }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "submissions.record" => Some(handle_record(state, req)),
        "submissions.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
