use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoolbookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoolbookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

struct Seeded {
    school_id: String,
    session_id: String,
    term_id: String,
    student_id: String,
}

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) -> Seeded {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = request_ok(
        stdin,
        reader,
        "s2",
        "schools.create",
        json!({ "name": "Unity College" }),
    );
    let school_id = school["schoolId"].as_str().expect("schoolId").to_string();

    let level = request_ok(
        stdin,
        reader,
        "s3",
        "classLevels.create",
        json!({ "schoolId": school_id, "name": "JSS1" }),
    );
    let class_level_id = level["classLevelId"].as_str().expect("classLevelId").to_string();

    let session = request_ok(
        stdin,
        reader,
        "s4",
        "sessions.start",
        json!({ "schoolId": school_id, "name": "2025/2026", "isCurrent": true }),
    );
    let session_id = session["sessionId"].as_str().expect("sessionId").to_string();

    let sessions = request_ok(
        stdin,
        reader,
        "s5",
        "sessions.list",
        json!({ "schoolId": school_id }),
    );
    let term_id = sessions["sessions"][0]["terms"][0]["id"]
        .as_str()
        .expect("term id")
        .to_string();
    let _ = request_ok(
        stdin,
        reader,
        "s6",
        "terms.setCurrent",
        json!({ "termId": term_id }),
    );

    for (i, name) in ["Mathematics", "English"].iter().enumerate() {
        let _ = request_ok(
            stdin,
            reader,
            &format!("s7-{i}"),
            "subjects.create",
            json!({ "schoolId": school_id, "name": name }),
        );
    }

    let student = request_ok(
        stdin,
        reader,
        "s8",
        "students.create",
        json!({
            "schoolId": school_id,
            "name": "Ada Obi",
            "classLevelId": class_level_id
        }),
    );
    let student_id = student["studentId"].as_str().expect("studentId").to_string();

    Seeded {
        school_id,
        session_id,
        term_id,
        student_id,
    }
}

fn assert_nothing_written(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    seeded: &Seeded,
) {
    let got = request_ok(
        stdin,
        reader,
        id,
        "results.get",
        json!({
            "studentId": seeded.student_id,
            "termId": seeded.term_id,
            "sessionId": seeded.session_id
        }),
    );
    assert_eq!(got["results"].as_array().expect("results").len(), 0);
    assert!(got["termTotal"].is_null());
}

#[test]
fn overflowing_row_rejects_the_whole_submission() {
    let workspace = temp_dir("schoolbook-overflow");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed(&mut stdin, &mut reader, &workspace);

    // First row is fine; the second totals 110. Nothing may be written.
    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "results.upsert",
        json!({
            "schoolId": seeded.school_id,
            "studentId": seeded.student_id,
            "rows": [
                { "subject": "English", "firstTest": 10, "secondTest": 10, "thirdTest": 10, "exam": 20 },
                { "subject": "Mathematics", "firstTest": 40, "secondTest": 40, "thirdTest": 20, "exam": 10 }
            ]
        }),
    );
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "score_overflow");
    assert_eq!(resp["error"]["details"]["subject"], "Mathematics");
    assert_eq!(resp["error"]["details"]["total"], 110);

    assert_nothing_written(&mut stdin, &mut reader, "2", &seeded);
}

#[test]
fn exactly_one_hundred_is_accepted() {
    let workspace = temp_dir("schoolbook-overflow-boundary");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed(&mut stdin, &mut reader, &workspace);

    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "results.upsert",
        json!({
            "schoolId": seeded.school_id,
            "studentId": seeded.student_id,
            "rows": [
                { "subject": "Mathematics", "firstTest": 20, "secondTest": 20, "thirdTest": 20, "exam": 40 }
            ]
        }),
    );
    assert_eq!(saved["saved"], 1);
}

#[test]
fn unknown_subject_is_rejected() {
    let workspace = temp_dir("schoolbook-invalid-subject");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed(&mut stdin, &mut reader, &workspace);

    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "results.upsert",
        json!({
            "schoolId": seeded.school_id,
            "studentId": seeded.student_id,
            "rows": [
                { "subject": "Alchemy", "firstTest": 10, "secondTest": 10, "thirdTest": 10, "exam": 20 }
            ]
        }),
    );
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "invalid_subject");

    assert_nothing_written(&mut stdin, &mut reader, "2", &seeded);
}

#[test]
fn absent_or_negative_scores_are_rejected() {
    let workspace = temp_dir("schoolbook-missing-score");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed(&mut stdin, &mut reader, &workspace);

    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "results.upsert",
        json!({
            "schoolId": seeded.school_id,
            "studentId": seeded.student_id,
            "rows": [
                { "subject": "Mathematics", "firstTest": 10, "secondTest": 10, "exam": 20 }
            ]
        }),
    );
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "missing_score");
    assert_eq!(resp["error"]["details"]["field"], "thirdTest");

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "results.upsert",
        json!({
            "schoolId": seeded.school_id,
            "studentId": seeded.student_id,
            "rows": [
                { "subject": "Mathematics", "firstTest": -5, "secondTest": 10, "thirdTest": 10, "exam": 20 }
            ]
        }),
    );
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "missing_score");

    assert_nothing_written(&mut stdin, &mut reader, "3", &seeded);
}

#[test]
fn results_need_a_current_session_and_term() {
    let workspace = temp_dir("schoolbook-no-current");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "schools.create",
        json!({ "name": "Unity College" }),
    );
    let school_id = school["schoolId"].as_str().expect("schoolId").to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "schoolId": school_id, "name": "Ada Obi" }),
    );
    let student_id = student["studentId"].as_str().expect("studentId").to_string();

    // No session at all yet.
    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "results.upsert",
        json!({
            "schoolId": school_id,
            "studentId": student_id,
            "rows": [{ "subject": "Mathematics", "firstTest": 1, "secondTest": 1, "thirdTest": 1, "exam": 1 }]
        }),
    );
    assert_eq!(resp["error"]["code"], "session_not_set");

    // Current session but no current term.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "sessions.start",
        json!({ "schoolId": school_id, "name": "2025/2026", "isCurrent": true }),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "6",
        "results.upsert",
        json!({
            "schoolId": school_id,
            "studentId": student_id,
            "rows": [{ "subject": "Mathematics", "firstTest": 1, "secondTest": 1, "thirdTest": 1, "exam": 1 }]
        }),
    );
    assert_eq!(resp["error"]["code"], "term_not_set");
}
