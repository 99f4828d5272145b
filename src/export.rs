use crate::db::ResultRow;
use anyhow::Context;
use std::io::Write;
use std::path::Path;

pub const RESULTS_CSV_HEADER: &str = "reg_number,last_name,first_name,campus,correct_answers,wrong_answers,unattempted,total_marks,accuracy,percentage,percentile,state";

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Flat-table sink for scored results joined with roster metadata.
/// Marks and derived ratios are written with two decimals for the console.
pub fn write_results_csv(out_path: &Path, rows: &[ResultRow]) -> anyhow::Result<usize> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let mut file = std::fs::File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;

    writeln!(file, "{}", RESULTS_CSV_HEADER).context("failed to write csv header")?;
    for row in rows {
        let r = &row.result;
        writeln!(
            file,
            "{},{},{},{},{},{},{},{:.2},{:.2},{:.2},{:.2},{}",
            csv_escape(&r.reg_number),
            csv_escape(&row.last_name),
            csv_escape(&row.first_name),
            csv_escape(&row.campus),
            r.correct_answers,
            r.wrong_answers,
            r.unattempted,
            r.total_marks,
            r.accuracy,
            r.percentage,
            r.percentile,
            r.state.as_str(),
        )
        .with_context(|| format!("failed to write csv row for {}", r.reg_number))?;
    }
    file.flush().context("failed to flush csv output")?;
    Ok(rows.len())
}
