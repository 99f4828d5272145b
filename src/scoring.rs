use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, Serialize)]
pub struct ScoringError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ScoringError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(code: &str, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: Some(details),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    LongTerm,
    Puc,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::LongTerm => "longTerm",
            Stream::Puc => "puc",
        }
    }

    pub fn parse(raw: &str) -> Option<Stream> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "longterm" | "long_term" => Some(Stream::LongTerm),
            "puc" => Some(Stream::Puc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionType {
    Mcq,
    FillInTheBlanks,
    TrueFalse,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::Mcq => "mcq",
            QuestionType::FillInTheBlanks => "fillInTheBlanks",
            QuestionType::TrueFalse => "trueFalse",
        }
    }

    pub fn parse(raw: &str) -> Option<QuestionType> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mcq" => Some(QuestionType::Mcq),
            "fillintheblanks" | "fill_in_the_blanks" => Some(QuestionType::FillInTheBlanks),
            "truefalse" | "true_false" => Some(QuestionType::TrueFalse),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkingScheme {
    pub correct_mark: f64,
    pub wrong_mark: f64,
    pub unattempted_mark: f64,
}

impl MarkingScheme {
    pub fn new(correct_mark: f64, wrong_mark: f64) -> Self {
        Self {
            correct_mark,
            wrong_mark,
            unattempted_mark: 0.0,
        }
    }

    pub fn plus_four_minus_one() -> Self {
        Self::new(4.0, -1.0)
    }

    pub fn plus_one_zero() -> Self {
        Self::new(1.0, 0.0)
    }
}

/// Canonical form for option letters and solution text: trimmed, uppercased.
/// Normalization happens at ingestion so comparisons are exact set lookups.
pub fn canonical_option(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

#[derive(Debug, Clone)]
pub struct QuestionSolution {
    pub question_number: u32,
    pub correct_options: BTreeSet<String>,
    pub solution_text: Option<String>,
    pub is_graced: bool,
}

#[derive(Debug, Clone)]
pub struct AnswerKey {
    pub test_name: String,
    pub stream: Stream,
    pub date: NaiveDate,
    pub question_type: QuestionType,
    pub entries: Vec<QuestionSolution>,
}

impl AnswerKey {
    pub fn total_questions(&self) -> usize {
        self.entries.len()
    }

    /// Question numbers must be unique and contiguous from 1..=N.
    pub fn validate_entries(entries: &[QuestionSolution]) -> Result<(), ScoringError> {
        let mut seen: HashSet<u32> = HashSet::new();
        for e in entries {
            if e.question_number == 0 {
                return Err(ScoringError::new(
                    "bad_params",
                    "question numbers start at 1",
                ));
            }
            if !seen.insert(e.question_number) {
                return Err(ScoringError::new(
                    "bad_params",
                    format!("duplicate question number {}", e.question_number),
                ));
            }
            if e.correct_options.is_empty() {
                return Err(ScoringError::new(
                    "bad_params",
                    format!("question {} has no accepted answer", e.question_number),
                ));
            }
        }
        let n = entries.len() as u32;
        for q in 1..=n {
            if !seen.contains(&q) {
                return Err(ScoringError::new(
                    "bad_params",
                    format!("question numbers must be contiguous 1..{}, missing {}", n, q),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StudentSubmission {
    pub reg_number: String,
    pub marked_options: HashMap<u32, String>,
}

/// Keep the first occurrence per reg number. Date-range loads can surface
/// the same student more than once across overlapping ranges.
pub fn dedupe_submissions(submissions: Vec<StudentSubmission>) -> Vec<StudentSubmission> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(submissions.len());
    for s in submissions {
        if seen.insert(s.reg_number.clone()) {
            out.push(s);
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Correct,
    Wrong,
    Unattempted,
}

/// One verdict per key entry, indexed by question number (slot 0 = question 1).
/// A graced question is Correct for everyone. Submitted question numbers
/// absent from the key are ignored and never change N.
pub fn normalize_submission(submission: &StudentSubmission, key: &AnswerKey) -> Vec<Verdict> {
    key.entries
        .iter()
        .map(|entry| {
            if entry.is_graced {
                return Verdict::Correct;
            }
            match submission.marked_options.get(&entry.question_number) {
                None => Verdict::Unattempted,
                Some(raw) if raw.trim().is_empty() => Verdict::Unattempted,
                Some(raw) => {
                    if entry.correct_options.contains(&canonical_option(raw)) {
                        Verdict::Correct
                    } else {
                        Verdict::Wrong
                    }
                }
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tally {
    pub correct: u32,
    pub wrong: u32,
    pub unattempted: u32,
    pub total_marks: f64,
}

pub fn score_verdicts(verdicts: &[Verdict], scheme: &MarkingScheme) -> Tally {
    let mut correct: u32 = 0;
    let mut wrong: u32 = 0;
    let mut unattempted: u32 = 0;
    for v in verdicts {
        match v {
            Verdict::Correct => correct += 1,
            Verdict::Wrong => wrong += 1,
            Verdict::Unattempted => unattempted += 1,
        }
    }
    let total_marks =
        f64::from(correct) * scheme.correct_mark + f64::from(wrong) * scheme.wrong_mark;
    Tally {
        correct,
        wrong,
        unattempted,
        total_marks,
    }
}

/// Quality among attempted questions only; unattempted are excluded from
/// the denominator.
pub fn accuracy(tally: &Tally) -> f64 {
    let attempted = tally.correct + tally.wrong;
    if attempted > 0 {
        f64::from(tally.correct) / f64::from(attempted) * 100.0
    } else {
        0.0
    }
}

/// Max achievable is N * correctMark; negative marking never raises the
/// denominator. Fixed product policy, not a rounding artifact.
pub fn percentage(tally: &Tally, total_questions: usize, scheme: &MarkingScheme) -> f64 {
    let max = total_questions as f64 * scheme.correct_mark;
    if max > 0.0 {
        tally.total_marks / max * 100.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultState {
    Scored,
    Graced,
}

impl ResultState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultState::Scored => "scored",
            ResultState::Graced => "graced",
        }
    }

    pub fn parse(raw: &str) -> Option<ResultState> {
        match raw {
            "scored" => Some(ResultState::Scored),
            "graced" => Some(ResultState::Graced),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredResult {
    pub reg_number: String,
    pub correct_answers: u32,
    pub wrong_answers: u32,
    pub unattempted: u32,
    pub total_marks: f64,
    pub accuracy: f64,
    pub percentage: f64,
    pub percentile: f64,
    #[serde(serialize_with = "serialize_state")]
    pub state: ResultState,
}

fn serialize_state<S: serde::Serializer>(state: &ResultState, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(state.as_str())
}

fn score_one(
    submission: &StudentSubmission,
    key: &AnswerKey,
    scheme: &MarkingScheme,
    state: ResultState,
) -> ScoredResult {
    let verdicts = normalize_submission(submission, key);
    let tally = score_verdicts(&verdicts, scheme);
    ScoredResult {
        reg_number: submission.reg_number.clone(),
        correct_answers: tally.correct,
        wrong_answers: tally.wrong,
        unattempted: tally.unattempted,
        total_marks: tally.total_marks,
        accuracy: accuracy(&tally),
        percentage: percentage(&tally, key.total_questions(), scheme),
        percentile: 0.0,
        state,
    }
}

/// Stable descending sort by total marks; equal marks keep input order.
/// Position i among M results gets percentile (M - i - 1) / M * 100.
pub fn rank_by_total_marks(results: &mut [ScoredResult]) {
    let m = results.len();
    if m == 0 {
        return;
    }
    results.sort_by(|a, b| {
        b.total_marks
            .partial_cmp(&a.total_marks)
            .unwrap_or(Ordering::Equal)
    });
    for (i, r) in results.iter_mut().enumerate() {
        r.percentile = (m - i - 1) as f64 / m as f64 * 100.0;
    }
}

/// Full batch: normalize, score, rank. The submission batch is assumed
/// de-duplicated (first occurrence per reg number) by the caller.
pub fn score_batch(
    key: &AnswerKey,
    submissions: &[StudentSubmission],
    scheme: &MarkingScheme,
) -> Result<Vec<ScoredResult>, ScoringError> {
    if key.entries.is_empty() {
        return Err(ScoringError::new(
            "empty_key",
            format!("answer key for {} has no solutions", key.test_name),
        ));
    }
    let mut results: Vec<ScoredResult> = submissions
        .iter()
        .map(|s| score_one(s, key, scheme, ResultState::Scored))
        .collect();
    rank_by_total_marks(&mut results);
    Ok(results)
}

/// Flip isGraced on the named questions and recompute the whole batch from
/// the submissions. Counters are never patched in place; every aggregate is
/// rebuilt and the batch re-ranked, since grace can change relative order.
/// Question numbers not present in the key are ignored.
pub fn apply_grace(
    question_numbers: &BTreeSet<u32>,
    key: &mut AnswerKey,
    submissions: &[StudentSubmission],
    scheme: &MarkingScheme,
) -> Result<Vec<ScoredResult>, ScoringError> {
    if key.entries.is_empty() {
        return Err(ScoringError::new(
            "empty_key",
            format!("answer key for {} has no solutions", key.test_name),
        ));
    }
    for entry in key.entries.iter_mut() {
        if question_numbers.contains(&entry.question_number) {
            entry.is_graced = true;
        }
    }
    let mut results: Vec<ScoredResult> = submissions
        .iter()
        .map(|s| score_one(s, key, scheme, ResultState::Graced))
        .collect();
    rank_by_total_marks(&mut results);
    Ok(results)
}
