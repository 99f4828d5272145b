mod test_support;

use serde_json::json;
use test_support::{request, request_ok, spawn_sidecar, temp_dir};

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("resultd-router-smoke");
    let bundle_out = workspace.join("smoke-backup.rdbackup.zip");
    let csv_out = workspace.join("smoke-export.csv");

    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.upsert",
        json!({
            "regNumber": "SMOKE1",
            "lastName": "Smoke",
            "firstName": "Test",
            "campus": "Main",
            "stream": "longTerm"
        }),
    );
    let listed = request_ok(&mut stdin, &mut reader, "4", "students.list", json!({}));
    assert_eq!(
        listed["students"].as_array().map(|a| a.len()),
        Some(1),
        "roster after upsert"
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "answerkeys.upsert",
        json!({
            "testName": "Smoke Test",
            "stream": "longTerm",
            "date": "2025-03-09",
            "questionType": "mcq",
            "solutions": [
                { "questionNumber": 1, "correctOptions": ["A"] },
                { "questionNumber": 2, "correctOptions": ["B"] },
            ]
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "answerkeys.get",
        json!({ "testName": "Smoke Test", "stream": "longTerm", "date": "2025-03-09" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "submissions.record",
        json!({
            "testName": "Smoke Test",
            "stream": "longTerm",
            "date": "2025-03-09",
            "regNumber": "SMOKE1",
            "markedOptions": { "1": "A", "2": "C" }
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "submissions.list",
        json!({
            "testName": "Smoke Test",
            "stream": "longTerm",
            "dateFrom": "2025-03-09",
            "dateTo": "2025-03-09"
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "results.compute",
        json!({ "testName": "Smoke Test", "stream": "longTerm", "date": "2025-03-09" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "results.applyGrace",
        json!({
            "testName": "Smoke Test",
            "stream": "longTerm",
            "date": "2025-03-09",
            "questionNumbers": [2]
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "results.list",
        json!({ "testName": "Smoke Test", "stream": "longTerm", "date": "2025-03-09" }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "12", "reports.monthly", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "exports.resultsCsv",
        json!({
            "testName": "Smoke Test",
            "stream": "longTerm",
            "date": "2025-03-09",
            "outPath": csv_out.to_string_lossy()
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "backup.export",
        json!({ "outPath": bundle_out.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "backup.import",
        json!({ "inPath": bundle_out.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "students.delete",
        json!({ "regNumber": "SMOKE1" }),
    );

    // Unknown methods fall through the whole router.
    let resp = request(
        &mut stdin,
        &mut reader,
        "17",
        "hostel.allocate",
        json!({}),
    );
    assert_eq!(
        resp["error"]["code"].as_str(),
        Some("not_implemented"),
        "router fallback: {}",
        resp
    );

    let _ = std::fs::remove_dir_all(workspace);
}
