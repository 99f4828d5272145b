use crate::scoring::{
    AnswerKey, MarkingScheme, QuestionSolution, QuestionType, ResultState, ScoredResult,
    ScoringError, Stream, StudentSubmission,
};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("resultd.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            reg_number TEXT NOT NULL UNIQUE,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            stream TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    // Existing workspaces may predate the campus column. Add if needed.
    ensure_students_campus(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_reg ON students(reg_number)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS answer_keys(
            id TEXT PRIMARY KEY,
            test_name TEXT NOT NULL,
            stream TEXT NOT NULL,
            date TEXT NOT NULL,
            question_type TEXT NOT NULL,
            correct_mark REAL NOT NULL,
            wrong_mark REAL NOT NULL,
            UNIQUE(test_name, stream, date)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS solutions(
            id TEXT PRIMARY KEY,
            answer_key_id TEXT NOT NULL,
            question_number INTEGER NOT NULL,
            correct_options TEXT NOT NULL,
            solution_text TEXT,
            is_graced INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(answer_key_id) REFERENCES answer_keys(id),
            UNIQUE(answer_key_id, question_number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_solutions_key ON solutions(answer_key_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS submissions(
            id TEXT PRIMARY KEY,
            test_name TEXT NOT NULL,
            stream TEXT NOT NULL,
            date TEXT NOT NULL,
            reg_number TEXT NOT NULL,
            marked_options TEXT NOT NULL,
            UNIQUE(test_name, stream, date, reg_number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submissions_instance ON submissions(test_name, stream, date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS results(
            id TEXT PRIMARY KEY,
            test_name TEXT NOT NULL,
            stream TEXT NOT NULL,
            date TEXT NOT NULL,
            reg_number TEXT NOT NULL,
            correct_answers INTEGER NOT NULL,
            wrong_answers INTEGER NOT NULL,
            unattempted INTEGER NOT NULL,
            total_marks REAL NOT NULL,
            accuracy REAL NOT NULL,
            percentage REAL NOT NULL,
            percentile REAL NOT NULL,
            state TEXT NOT NULL,
            computed_at TEXT NOT NULL,
            UNIQUE(test_name, stream, date, reg_number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_instance ON results(test_name, stream, date)",
        [],
    )?;

    Ok(())
}

fn ensure_students_campus(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "campus")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN campus TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn db_err(e: impl std::fmt::Display) -> ScoringError {
    ScoringError::new("db_query_failed", e.to_string())
}

/// One exact (testName, stream, date) triple resolves to at most one key.
/// Month-level candidates are disambiguated by the caller before scoring.
pub fn resolve_answer_key(
    conn: &Connection,
    test_name: &str,
    stream: Stream,
    date: NaiveDate,
) -> Result<(String, AnswerKey, MarkingScheme), ScoringError> {
    let row: Option<(String, String, f64, f64)> = conn
        .query_row(
            "SELECT id, question_type, correct_mark, wrong_mark
             FROM answer_keys
             WHERE test_name = ? AND stream = ? AND date = ?",
            (test_name, stream.as_str(), date.to_string()),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(db_err)?;
    let Some((key_id, question_type_raw, correct_mark, wrong_mark)) = row else {
        return Err(ScoringError::new(
            "not_found",
            format!(
                "no answer key for {} / {} / {}",
                test_name,
                stream.as_str(),
                date
            ),
        ));
    };

    let question_type = QuestionType::parse(&question_type_raw).ok_or_else(|| {
        db_err(format!("unknown question type {}", question_type_raw))
    })?;

    let mut stmt = conn
        .prepare(
            "SELECT question_number, correct_options, solution_text, is_graced
             FROM solutions
             WHERE answer_key_id = ?
             ORDER BY question_number",
        )
        .map_err(db_err)?;
    let entries: Vec<QuestionSolution> = stmt
        .query_map([&key_id], |r| {
            let question_number: i64 = r.get(0)?;
            let options_json: String = r.get(1)?;
            let solution_text: Option<String> = r.get(2)?;
            let is_graced: i64 = r.get(3)?;
            Ok((question_number, options_json, solution_text, is_graced))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?
        .into_iter()
        .map(|(question_number, options_json, solution_text, is_graced)| {
            let correct_options: BTreeSet<String> =
                serde_json::from_str(&options_json).unwrap_or_default();
            QuestionSolution {
                question_number: question_number as u32,
                correct_options,
                solution_text,
                is_graced: is_graced != 0,
            }
        })
        .collect();

    if entries.is_empty() {
        return Err(ScoringError::new(
            "empty_key",
            format!("answer key for {} has no solutions", test_name),
        ));
    }

    let key = AnswerKey {
        test_name: test_name.to_string(),
        stream,
        date,
        question_type,
        entries,
    };
    let scheme = MarkingScheme::new(correct_mark, wrong_mark);
    Ok((key_id, key, scheme))
}

/// Raw rows ordered by (date, insertion order). Overlapping ranges can
/// repeat a reg number; consumers keep the first occurrence.
pub fn load_submissions_range(
    conn: &Connection,
    test_name: &str,
    stream: Stream,
    date_from: NaiveDate,
    date_to: NaiveDate,
) -> Result<Vec<(NaiveDate, StudentSubmission)>, ScoringError> {
    let mut stmt = conn
        .prepare(
            "SELECT date, reg_number, marked_options
             FROM submissions
             WHERE test_name = ? AND stream = ? AND date >= ? AND date <= ?
             ORDER BY date, rowid",
        )
        .map_err(db_err)?;
    let rows: Vec<(String, String, String)> = stmt
        .query_map(
            (
                test_name,
                stream.as_str(),
                date_from.to_string(),
                date_to.to_string(),
            ),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut out = Vec::with_capacity(rows.len());
    for (date_raw, reg_number, marked_json) in rows {
        let date = date_raw
            .parse::<NaiveDate>()
            .map_err(|e| db_err(format!("bad submission date {}: {}", date_raw, e)))?;
        out.push((
            date,
            StudentSubmission {
                reg_number,
                marked_options: parse_marked_options(&marked_json),
            },
        ));
    }
    Ok(out)
}

/// Stored shape is a JSON object keyed by question number. Non-numeric keys
/// and non-string values are malformed data and are dropped.
pub fn parse_marked_options(marked_json: &str) -> HashMap<u32, String> {
    let raw: HashMap<String, serde_json::Value> =
        serde_json::from_str(marked_json).unwrap_or_default();
    let mut marked_options: HashMap<u32, String> = HashMap::new();
    for (k, v) in raw {
        let Ok(q) = k.parse::<u32>() else {
            continue;
        };
        let Some(s) = v.as_str() else {
            continue;
        };
        marked_options.insert(q, s.to_string());
    }
    marked_options
}

pub fn set_questions_graced(
    conn: &Connection,
    answer_key_id: &str,
    question_numbers: &BTreeSet<u32>,
) -> Result<usize, ScoringError> {
    let mut flipped = 0;
    for q in question_numbers {
        flipped += conn
            .execute(
                "UPDATE solutions SET is_graced = 1
                 WHERE answer_key_id = ? AND question_number = ?",
                (answer_key_id, *q as i64),
            )
            .map_err(db_err)?;
    }
    Ok(flipped)
}

/// One write per student, no early abort. The batch is reported failed if
/// any row fails; the error lists every failed reg number so the caller can
/// re-trigger the recomputation, which is pure and safe to repeat.
pub fn persist_results(
    conn: &Connection,
    test_name: &str,
    stream: Stream,
    date: NaiveDate,
    results: &[ScoredResult],
) -> Result<(), ScoringError> {
    let computed_at = chrono::Utc::now().to_rfc3339();
    let mut failed: Vec<String> = Vec::new();
    for r in results {
        let outcome = conn.execute(
            "INSERT INTO results(
                id, test_name, stream, date, reg_number,
                correct_answers, wrong_answers, unattempted,
                total_marks, accuracy, percentage, percentile,
                state, computed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(test_name, stream, date, reg_number) DO UPDATE SET
                correct_answers = excluded.correct_answers,
                wrong_answers = excluded.wrong_answers,
                unattempted = excluded.unattempted,
                total_marks = excluded.total_marks,
                accuracy = excluded.accuracy,
                percentage = excluded.percentage,
                percentile = excluded.percentile,
                state = excluded.state,
                computed_at = excluded.computed_at",
            (
                uuid::Uuid::new_v4().to_string(),
                test_name,
                stream.as_str(),
                date.to_string(),
                &r.reg_number,
                r.correct_answers as i64,
                r.wrong_answers as i64,
                r.unattempted as i64,
                r.total_marks,
                r.accuracy,
                r.percentage,
                r.percentile,
                r.state.as_str(),
                &computed_at,
            ),
        );
        if outcome.is_err() {
            failed.push(r.reg_number.clone());
        }
    }

    if failed.is_empty() {
        return Ok(());
    }
    let first = failed[0].clone();
    Err(ScoringError::with_details(
        "partial_write",
        format!(
            "{} of {} result rows failed to persist (first: {})",
            failed.len(),
            results.len(),
            first
        ),
        json!({
            "failedCount": failed.len(),
            "failedRegNumbers": failed,
            "firstFailed": first,
        }),
    ))
}

#[derive(Debug, Clone)]
pub struct ResultRow {
    pub result: ScoredResult,
    pub last_name: String,
    pub first_name: String,
    pub campus: String,
    pub computed_at: String,
}

/// Cached generation joined with roster display metadata, in ranked order.
/// Percentile is strictly decreasing by rank position, so ordering by it
/// reproduces the stable ranked order without a separate position column.
pub fn load_results(
    conn: &Connection,
    test_name: &str,
    stream: Stream,
    date: NaiveDate,
) -> Result<Vec<ResultRow>, ScoringError> {
    let mut stmt = conn
        .prepare(
            "SELECT r.reg_number, r.correct_answers, r.wrong_answers, r.unattempted,
                    r.total_marks, r.accuracy, r.percentage, r.percentile,
                    r.state, r.computed_at,
                    COALESCE(s.last_name, ''), COALESCE(s.first_name, ''),
                    COALESCE(s.campus, '')
             FROM results r
             LEFT JOIN students s ON s.reg_number = r.reg_number
             WHERE r.test_name = ? AND r.stream = ? AND r.date = ?
             ORDER BY r.percentile DESC, r.reg_number",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map((test_name, stream.as_str(), date.to_string()), |r| {
            let state_raw: String = r.get(8)?;
            Ok(ResultRow {
                result: ScoredResult {
                    reg_number: r.get(0)?,
                    correct_answers: r.get::<_, i64>(1)? as u32,
                    wrong_answers: r.get::<_, i64>(2)? as u32,
                    unattempted: r.get::<_, i64>(3)? as u32,
                    total_marks: r.get(4)?,
                    accuracy: r.get(5)?,
                    percentage: r.get(6)?,
                    percentile: r.get(7)?,
                    state: ResultState::parse(&state_raw).unwrap_or(ResultState::Scored),
                },
                computed_at: r.get(9)?,
                last_name: r.get(10)?,
                first_name: r.get(11)?,
                campus: r.get(12)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        init_schema(&conn).expect("init schema");
        conn
    }

    fn seed_key(conn: &Connection, test_name: &str, date: &str, letters: &[&str]) -> String {
        let key_id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO answer_keys(id, test_name, stream, date, question_type, correct_mark, wrong_mark)
             VALUES (?, ?, 'longTerm', ?, 'mcq', 4.0, -1.0)",
            (&key_id, test_name, date),
        )
        .expect("insert key");
        for (i, l) in letters.iter().enumerate() {
            conn.execute(
                "INSERT INTO solutions(id, answer_key_id, question_number, correct_options, is_graced)
                 VALUES (?, ?, ?, ?, 0)",
                (
                    uuid::Uuid::new_v4().to_string(),
                    &key_id,
                    (i + 1) as i64,
                    serde_json::to_string(&vec![l.to_string()]).expect("options json"),
                ),
            )
            .expect("insert solution");
        }
        key_id
    }

    #[test]
    fn resolver_reports_missing_and_empty_keys() {
        let conn = mem_db();
        let date = NaiveDate::from_ymd_opt(2025, 3, 9).expect("date");
        let err = resolve_answer_key(&conn, "Weekly 1", Stream::LongTerm, date).unwrap_err();
        assert_eq!(err.code, "not_found");

        conn.execute(
            "INSERT INTO answer_keys(id, test_name, stream, date, question_type, correct_mark, wrong_mark)
             VALUES ('k1', 'Weekly 1', 'longTerm', '2025-03-09', 'mcq', 4.0, -1.0)",
            [],
        )
        .expect("insert key");
        let err = resolve_answer_key(&conn, "Weekly 1", Stream::LongTerm, date).unwrap_err();
        assert_eq!(err.code, "empty_key");
    }

    #[test]
    fn resolver_returns_ordered_entries_and_stored_scheme() {
        let conn = mem_db();
        seed_key(&conn, "Weekly 2", "2025-03-09", &["A", "B", "C"]);
        let date = NaiveDate::from_ymd_opt(2025, 3, 9).expect("date");
        let (_, key, scheme) =
            resolve_answer_key(&conn, "Weekly 2", Stream::LongTerm, date).expect("resolve");
        assert_eq!(key.total_questions(), 3);
        assert_eq!(
            key.entries
                .iter()
                .map(|e| e.question_number)
                .collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(scheme.correct_mark, 4.0);
        assert_eq!(scheme.wrong_mark, -1.0);
    }

    #[test]
    fn range_load_orders_by_date_then_insertion() {
        let conn = mem_db();
        for (date, reg, marked) in [
            ("2025-03-16", "R1", r#"{"1":"B"}"#),
            ("2025-03-09", "R1", r#"{"1":"A"}"#),
            ("2025-03-09", "R2", r#"{"1":"C"}"#),
        ] {
            conn.execute(
                "INSERT INTO submissions(id, test_name, stream, date, reg_number, marked_options)
                 VALUES (?, 'Weekly 3', 'longTerm', ?, ?, ?)",
                (uuid::Uuid::new_v4().to_string(), date, reg, marked),
            )
            .expect("insert submission");
        }
        let rows = load_submissions_range(
            &conn,
            "Weekly 3",
            Stream::LongTerm,
            NaiveDate::from_ymd_opt(2025, 3, 1).expect("date"),
            NaiveDate::from_ymd_opt(2025, 3, 31).expect("date"),
        )
        .expect("load range");
        let regs: Vec<&str> = rows.iter().map(|(_, s)| s.reg_number.as_str()).collect();
        assert_eq!(regs, vec!["R1", "R2", "R1"]);
        assert_eq!(
            rows[0].1.marked_options.get(&1).map(String::as_str),
            Some("A")
        );
    }

    #[test]
    fn malformed_marked_option_entries_are_dropped() {
        let parsed = parse_marked_options(r#"{"1":"A","two":"B","3":7,"4":"d"}"#);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get(&1).map(String::as_str), Some("A"));
        assert_eq!(parsed.get(&4).map(String::as_str), Some("d"));
    }

    #[test]
    fn persist_reports_every_failed_reg_number() {
        let conn = mem_db();
        conn.execute("DROP TABLE results", []).expect("drop results");
        let date = NaiveDate::from_ymd_opt(2025, 3, 9).expect("date");
        let results: Vec<ScoredResult> = ["R1", "R2"]
            .iter()
            .map(|reg| ScoredResult {
                reg_number: reg.to_string(),
                correct_answers: 1,
                wrong_answers: 0,
                unattempted: 3,
                total_marks: 4.0,
                accuracy: 100.0,
                percentage: 25.0,
                percentile: 0.0,
                state: ResultState::Scored,
            })
            .collect();
        let err =
            persist_results(&conn, "Weekly 4", Stream::LongTerm, date, &results).unwrap_err();
        assert_eq!(err.code, "partial_write");
        let details = err.details.expect("details");
        assert_eq!(details["failedCount"], 2);
        assert_eq!(details["firstFailed"], "R1");
        assert_eq!(details["failedRegNumbers"][1], "R2");
    }

    #[test]
    fn persist_then_load_round_trips_in_ranked_order() {
        let conn = mem_db();
        let date = NaiveDate::from_ymd_opt(2025, 3, 9).expect("date");
        let mk = |reg: &str, total: f64, pct: f64| ScoredResult {
            reg_number: reg.to_string(),
            correct_answers: 0,
            wrong_answers: 0,
            unattempted: 4,
            total_marks: total,
            accuracy: 0.0,
            percentage: 0.0,
            percentile: pct,
            state: ResultState::Scored,
        };
        let results = vec![mk("TOP", 12.0, 50.0), mk("LOW", 3.0, 0.0)];
        persist_results(&conn, "Weekly 5", Stream::LongTerm, date, &results).expect("persist");

        // A recompute supersedes the cached generation for the same students.
        let results = vec![mk("TOP", 16.0, 50.0), mk("LOW", 7.0, 0.0)];
        persist_results(&conn, "Weekly 5", Stream::LongTerm, date, &results).expect("repersist");

        let rows = load_results(&conn, "Weekly 5", Stream::LongTerm, date).expect("load");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].result.reg_number, "TOP");
        assert_eq!(rows[0].result.total_marks, 16.0);
        assert_eq!(rows[1].result.reg_number, "LOW");
        assert_eq!(rows[1].result.total_marks, 7.0);
    }
}
