use crate::ipc::error::{err, ok};
use crate::ipc::helpers::require_conn;
use crate::ipc::types::{AppState, Request};
use crate::scoring::Stream;
use chrono::NaiveDate;
use serde_json::json;

/// The console's report view groups test instances by calendar month; the
/// operator then picks one exact date before asking for a recompute.
fn handle_monthly(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let stream_filter = match req.params.get("stream").and_then(|v| v.as_str()) {
        None => None,
        Some(raw) => match Stream::parse(raw) {
            Some(s) => Some(s.as_str().to_string()),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "stream must be longTerm or puc",
                    None,
                )
            }
        },
    };

    let sql = match &stream_filter {
        Some(_) => {
            "SELECT k.test_name, k.stream, k.date,
               (SELECT COUNT(*) FROM solutions so WHERE so.answer_key_id = k.id) AS question_count,
               (SELECT COUNT(*) FROM submissions su
                 WHERE su.test_name = k.test_name AND su.stream = k.stream AND su.date = k.date) AS submission_count,
               (SELECT COUNT(*) FROM results r
                 WHERE r.test_name = k.test_name AND r.stream = k.stream AND r.date = k.date) AS result_count
             FROM answer_keys k
             WHERE k.stream = ?
             ORDER BY k.date, k.test_name"
        }
        None => {
            "SELECT k.test_name, k.stream, k.date,
               (SELECT COUNT(*) FROM solutions so WHERE so.answer_key_id = k.id) AS question_count,
               (SELECT COUNT(*) FROM submissions su
                 WHERE su.test_name = k.test_name AND su.stream = k.stream AND su.date = k.date) AS submission_count,
               (SELECT COUNT(*) FROM results r
                 WHERE r.test_name = k.test_name AND r.stream = k.stream AND r.date = k.date) AS result_count
             FROM answer_keys k
             ORDER BY k.date, k.test_name"
        }
    };

    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<(String, String, String, i64, i64, i64)> {
        Ok((
            r.get(0)?,
            r.get(1)?,
            r.get(2)?,
            r.get(3)?,
            r.get(4)?,
            r.get(5)?,
        ))
    };
    let rows = match &stream_filter {
        Some(s) => stmt
            .query_map([s], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    };
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Group chronologically by YYYY-MM, preserving date order within a month.
    let mut months: Vec<(String, Vec<serde_json::Value>)> = Vec::new();
    for (test_name, stream, date_raw, question_count, submission_count, result_count) in rows {
        let month = match date_raw.parse::<NaiveDate>() {
            Ok(d) => d.format("%Y-%m").to_string(),
            Err(_) => continue,
        };
        let test = json!({
            "testName": test_name,
            "stream": stream,
            "date": date_raw,
            "questionCount": question_count,
            "submissionCount": submission_count,
            "resultCount": result_count,
        });
        match months.last_mut() {
            Some((m, tests)) if *m == month => tests.push(test),
            _ => months.push((month, vec![test])),
        }
    }
    let months: Vec<serde_json::Value> = months
        .into_iter()
        .map(|(month, tests)| json!({ "month": month, "tests": tests }))
        .collect();

    ok(&req.id, json!({ "months": months }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.monthly" => Some(handle_monthly(state, req)),
        _ => None,
    }
}
