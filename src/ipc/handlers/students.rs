use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{require_conn, str_param, valid_reg_number};
use crate::ipc::types::{AppState, Request};
use crate::scoring::Stream;
use serde_json::json;
use uuid::Uuid;

fn handle_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_conn(state, req) {
        Ok(c) => c,
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
    let last_name = match str_param(req, "lastName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let first_name = match str_param(req, "firstName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let campus = req
        .params
        .get("campus")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());
    let stream = match req.params.get("stream").and_then(|v| v.as_str()) {
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
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let sort_order = req
        .params
        .get("sortOrder")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    let outcome = conn.execute(
        "INSERT INTO students(id, reg_number, last_name, first_name, campus, stream, active, sort_order)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(reg_number) DO UPDATE SET
            last_name = excluded.last_name,
            first_name = excluded.first_name,
            campus = excluded.campus,
            stream = excluded.stream,
            active = excluded.active,
            sort_order = excluded.sort_order",
        (
            Uuid::new_v4().to_string(),
            &reg_number,
            &last_name,
            &first_name,
            &campus,
            &stream,
            active as i64,
            sort_order,
        ),
    );
    match outcome {
        Ok(_) => ok(&req.id, json!({ "regNumber": reg_number })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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
            "SELECT reg_number, last_name, first_name, COALESCE(campus, ''), stream, active, sort_order
             FROM students WHERE stream = ? ORDER BY sort_order, last_name, first_name"
        }
        None => {
            "SELECT reg_number, last_name, first_name, COALESCE(campus, ''), stream, active, sort_order
             FROM students ORDER BY sort_order, last_name, first_name"
        }
    };
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        Ok(json!({
            "regNumber": r.get::<_, String>(0)?,
            "lastName": r.get::<_, String>(1)?,
            "firstName": r.get::<_, String>(2)?,
            "campus": r.get::<_, String>(3)?,
            "stream": r.get::<_, Option<String>>(4)?,
            "active": r.get::<_, i64>(5)? != 0,
            "sortOrder": r.get::<_, i64>(6)?,
        }))
    };
    let rows = match &stream_filter {
        Some(s) => stmt
            .query_map([s], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    };
    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let reg_number = match str_param(req, "regNumber") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match conn.execute("DELETE FROM students WHERE reg_number = ?", [&reg_number]) {
        Ok(n) => ok(&req.id, json!({ "deleted": n > 0 })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.upsert" => Some(handle_upsert(state, req)),
        "students.list" => Some(handle_list(state, req)),
        "students.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
