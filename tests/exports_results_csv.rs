mod test_support;

use serde_json::json;
use test_support::{request_ok, seed_abcd_key, spawn_sidecar, temp_dir};

#[test]
fn results_csv_writes_header_and_ranked_rows() {
    let workspace = temp_dir("resultd-csv-export");
    let out_dir = temp_dir("resultd-csv-export-out");
    let csv_path = out_dir.join("weekly-12-results.csv");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.upsert",
        json!({
            "regNumber": "LT001",
            "lastName": "Rao",
            "firstName": "Asha",
            "campus": "Main"
        }),
    );
    seed_abcd_key(&mut stdin, &mut reader, "Weekly Test 12");
    for (reg, marked) in [
        ("LT001", json!({ "1": "A", "2": "B", "3": "X" })),
        ("LT002", json!({ "1": "A", "2": "B", "3": "C", "4": "D" })),
    ] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            "rec",
            "submissions.record",
            json!({
                "testName": "Weekly Test 12",
                "stream": "longTerm",
                "date": "2025-03-09",
                "regNumber": reg,
                "markedOptions": marked
            }),
        );
    }
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "results.compute",
        json!({
            "testName": "Weekly Test 12",
            "stream": "longTerm",
            "date": "2025-03-09"
        }),
    );

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "exports.resultsCsv",
        json!({
            "testName": "Weekly Test 12",
            "stream": "longTerm",
            "date": "2025-03-09",
            "outPath": csv_path.to_string_lossy()
        }),
    );
    assert_eq!(exported["rowsExported"], 2);

    let text = std::fs::read_to_string(&csv_path).expect("read exported csv");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("reg_number,last_name,first_name,campus"));
    // Ranked order: the full-marks student leads.
    assert_eq!(
        lines[1],
        "LT002,,,,4,0,0,16.00,100.00,100.00,50.00,scored"
    );
    assert_eq!(
        lines[2],
        "LT001,Rao,Asha,Main,2,1,1,7.00,66.67,43.75,0.00,scored"
    );

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(out_dir);
}
