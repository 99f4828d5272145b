use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{date_param, scoring_err, str_param, stream_param};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{canonical_option, AnswerKey, QuestionSolution, QuestionType};
use serde_json::json;
use std::collections::BTreeSet;
use uuid::Uuid;

fn parse_solutions(
    req: &Request,
    question_type: QuestionType,
) -> Result<Vec<QuestionSolution>, serde_json::Value> {
    let Some(raw) = req.params.get("solutions").and_then(|v| v.as_array()) else {
        return Err(err(&req.id, "bad_params", "missing solutions array", None));
    };

    let mut entries = Vec::with_capacity(raw.len());
    for item in raw {
        let Some(question_number) = item
            .get("questionNumber")
            .and_then(|v| v.as_u64())
            .and_then(|n| u32::try_from(n).ok())
        else {
            return Err(err(
                &req.id,
                "bad_params",
                "every solution needs a positive questionNumber",
                None,
            ));
        };

        let solution_text = item
            .get("solutionText")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        // Accepted answers become one canonical set regardless of shape:
        // an options array, a single option letter, or free solution text.
        let mut correct_options: BTreeSet<String> = BTreeSet::new();
        if let Some(arr) = item.get("correctOptions").and_then(|v| v.as_array()) {
            for opt in arr {
                let Some(s) = opt.as_str() else {
                    return Err(err(
                        &req.id,
                        "bad_params",
                        format!("question {}: correctOptions must be strings", question_number),
                        None,
                    ));
                };
                if !s.trim().is_empty() {
                    correct_options.insert(canonical_option(s));
                }
            }
        }
        if let Some(s) = item.get("correctOption").and_then(|v| v.as_str()) {
            if !s.trim().is_empty() {
                correct_options.insert(canonical_option(s));
            }
        }
        if question_type != QuestionType::Mcq {
            if let Some(text) = &solution_text {
                correct_options.insert(canonical_option(text));
            }
        }

        entries.push(QuestionSolution {
            question_number,
            correct_options,
            solution_text,
            is_graced: item
                .get("isGraced")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        });
    }

    if let Err(e) = AnswerKey::validate_entries(&entries) {
        return Err(scoring_err(&req.id, e));
    }
    entries.sort_by_key(|e| e.question_number);
    Ok(entries)
}

fn handle_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let question_type_raw = match str_param(req, "questionType") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(question_type) = QuestionType::parse(&question_type_raw) else {
        return err(
            &req.id,
            "bad_params",
            "questionType must be mcq, fillInTheBlanks, or trueFalse",
            None,
        );
    };
    let correct_mark = req
        .params
        .get("correctMark")
        .and_then(|v| v.as_f64())
        .unwrap_or(4.0);
    let wrong_mark = req
        .params
        .get("wrongMark")
        .and_then(|v| v.as_f64())
        .unwrap_or(-1.0);

    let entries = match parse_solutions(req, question_type) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM answer_keys WHERE test_name = ? AND stream = ? AND date = ?",
            (&test_name, stream.as_str(), date.to_string()),
            |r| r.get(0),
        )
        .ok();
    let key_id = existing.unwrap_or_else(|| Uuid::new_v4().to_string());

    let upserted = tx
        .execute(
            "INSERT INTO answer_keys(id, test_name, stream, date, question_type, correct_mark, wrong_mark)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(test_name, stream, date) DO UPDATE SET
                question_type = excluded.question_type,
                correct_mark = excluded.correct_mark,
                wrong_mark = excluded.wrong_mark",
            (
                &key_id,
                &test_name,
                stream.as_str(),
                date.to_string(),
                question_type.as_str(),
                correct_mark,
                wrong_mark,
            ),
        )
        .and_then(|_| tx.execute("DELETE FROM solutions WHERE answer_key_id = ?", [&key_id]));
    if let Err(e) = upserted {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }

    for entry in &entries {
        let options_json = match serde_json::to_string(&entry.correct_options) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let inserted = tx.execute(
            "INSERT INTO solutions(id, answer_key_id, question_number, correct_options, solution_text, is_graced)
             VALUES (?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &key_id,
                entry.question_number as i64,
                options_json,
                &entry.solution_text,
                entry.is_graced as i64,
            ),
        );
        if let Err(e) = inserted {
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    tracing::info!(test = %test_name, questions = entries.len(), "answer key upserted");
    ok(
        &req.id,
        json!({ "answerKeyId": key_id, "totalQuestions": entries.len() }),
    )
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let (key_id, key, scheme) = match db::resolve_answer_key(conn, &test_name, stream, date) {
        Ok(v) => v,
        Err(e) => return scoring_err(&req.id, e),
    };
    let solutions: Vec<serde_json::Value> = key
        .entries
        .iter()
        .map(|e| {
            json!({
                "questionNumber": e.question_number,
                "correctOptions": e.correct_options,
                "solutionText": e.solution_text,
                "isGraced": e.is_graced,
            })
        })
        .collect();
    ok(
        &req.id,
        json!({
            "answerKeyId": key_id,
            "testName": key.test_name,
            "stream": key.stream.as_str(),
            "date": key.date.to_string(),
            "questionType": key.question_type.as_str(),
            "scheme": scheme,
            "totalQuestions": key.total_questions(),
            "solutions": solutions,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "answerkeys.upsert" => Some(handle_upsert(state, req)),
        "answerkeys.get" => Some(handle_get(state, req)),
        _ => None,
    }
}
