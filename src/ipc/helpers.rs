use super::error::err;
use super::types::{AppState, Request};
use crate::scoring::{ScoringError, Stream};
use chrono::NaiveDate;
use rusqlite::Connection;

pub fn require_conn<'a>(
    state: &'a AppState,
    req: &Request,
) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn str_param(req: &Request, name: &str) -> Result<String, serde_json::Value> {
    match req.params.get(name).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(err(
            &req.id,
            "bad_params",
            format!("missing {}", name),
            None,
        )),
    }
}

pub fn stream_param(req: &Request, name: &str) -> Result<Stream, serde_json::Value> {
    let raw = str_param(req, name)?;
    Stream::parse(&raw).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            format!("{} must be longTerm or puc", name),
            None,
        )
    })
}

pub fn date_param(req: &Request, name: &str) -> Result<NaiveDate, serde_json::Value> {
    let raw = str_param(req, name)?;
    raw.parse::<NaiveDate>().map_err(|_| {
        err(
            &req.id,
            "bad_params",
            format!("{} must be an ISO date (YYYY-MM-DD)", name),
            None,
        )
    })
}

pub fn opt_date_param(
    req: &Request,
    name: &str,
    default: NaiveDate,
) -> Result<NaiveDate, serde_json::Value> {
    match req.params.get(name) {
        None => Ok(default),
        Some(v) if v.is_null() => Ok(default),
        Some(_) => date_param(req, name),
    }
}

/// Reg numbers are short opaque identifiers issued by the admissions office.
/// Anything else is malformed input, reported inline before it reaches data.
pub fn valid_reg_number(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= 32
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '/')
}

pub fn scoring_err(id: &str, e: ScoringError) -> serde_json::Value {
    err(id, &e.code, e.message, e.details)
}
