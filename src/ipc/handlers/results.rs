use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    fn db(e: rusqlite::Error) -> Self {
        HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }
    }
}

struct ScoreRow {
    subject: String,
    first_test: i64,
    second_test: i64,
    third_test: i64,
    exam: i64,
    totals: calc::SubjectTotals,
}

pub(super) fn current_session_and_term(
    conn: &Connection,
    school_id: &str,
) -> Result<(String, String), (&'static str, String)> {
    let session: Option<String> = conn
        .query_row(
            "SELECT id FROM sessions WHERE school_id = ? AND is_current = 1",
            [school_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| ("db_query_failed", e.to_string()))?;
    let Some(session_id) = session else {
        return Err((
            "session_not_set",
            "no current session for this school".to_string(),
        ));
    };

    let term: Option<String> = conn
        .query_row(
            "SELECT id FROM terms WHERE session_id = ? AND is_current = 1",
            [&session_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| ("db_query_failed", e.to_string()))?;
    let Some(term_id) = term else {
        return Err((
            "term_not_set",
            "no current term for this session".to_string(),
        ));
    };

    Ok((session_id, term_id))
}

fn require_score(row: &serde_json::Value, key: &str, subject: &str) -> Result<i64, HandlerErr> {
    match row.get(key).and_then(|v| v.as_i64()) {
        Some(v) if v >= 0 => Ok(v),
        _ => Err(HandlerErr {
            code: "missing_score",
            message: format!("'{}' is missing or invalid for subject '{}'", key, subject),
            details: Some(json!({ "subject": subject, "field": key })),
        }),
    }
}

/// Parse and validate every submitted row against the school's subject list
/// and the scoring rules. Runs before any write: a bad row rejects the
/// whole submission.
fn validate_rows(
    conn: &Connection,
    school_id: &str,
    rows: &[serde_json::Value],
) -> Result<Vec<ScoreRow>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT name FROM subjects WHERE school_id = ?")
        .map_err(HandlerErr::db)?;
    let known: HashSet<String> = stmt
        .query_map([school_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<HashSet<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let subject = row
            .get("subject")
            .and_then(|v| v.as_str())
            .map(|v| v.trim().to_string())
            .unwrap_or_default();
        if subject.is_empty() || !known.contains(&subject) {
            return Err(HandlerErr {
                code: "invalid_subject",
                message: format!("subject '{}' does not exist for this school", subject),
                details: Some(json!({ "subject": subject })),
            });
        }

        let first_test = require_score(row, "firstTest", &subject)?;
        let second_test = require_score(row, "secondTest", &subject)?;
        let third_test = require_score(row, "thirdTest", &subject)?;
        let exam = require_score(row, "exam", &subject)?;

        let totals = calc::subject_totals(
            Some(first_test),
            Some(second_test),
            Some(third_test),
            Some(exam),
        );
        calc::check_subject_totals(&subject, totals).map_err(|e| HandlerErr {
            code: "score_overflow",
            message: e.message,
            details: e.details,
        })?;

        out.push(ScoreRow {
            subject,
            first_test,
            second_test,
            third_test,
            exam,
            totals,
        });
    }
    Ok(out)
}

fn handle_results_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let school_id = match req.params.get("schoolId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing schoolId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let Some(rows) = req.params.get("rows").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing rows[]", None);
    };
    if rows.is_empty() {
        return err(&req.id, "bad_params", "rows[] must not be empty", None);
    }
    let teacher_comment = req
        .params
        .get("teacherComment")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());
    let principal_comment = req
        .params
        .get("principalComment")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());

    let student_ok: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? AND school_id = ?",
            (&student_id, &school_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if student_ok.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    let (session_id, term_id) = match current_session_and_term(conn, &school_id) {
        Ok(v) => v,
        Err((code, message)) => return err(&req.id, code, message, None),
    };

    // All validation happens against the pre-save values, before any write.
    let parsed = match validate_rows(conn, &school_id, rows) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let bands = match calc::load_grading_bands(conn, &school_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    // Subject writes and the aggregate recompute commit together; a
    // SubjectResult must never be visible with a stale or missing
    // TermTotal.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    for row in &parsed {
        let (grade, remark) = calc::resolve_grade(&bands, row.totals.total);
        let result_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO subject_results(
                id, school_id, student_id, term_id, session_id, subject,
                first_test, second_test, third_test, ca, exam, total_score, grade, remark
             )
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, term_id, session_id, subject) DO UPDATE SET
               first_test = excluded.first_test,
               second_test = excluded.second_test,
               third_test = excluded.third_test,
               ca = excluded.ca,
               exam = excluded.exam,
               total_score = excluded.total_score,
               grade = excluded.grade,
               remark = excluded.remark",
            (
                &result_id,
                &school_id,
                &student_id,
                &term_id,
                &session_id,
                &row.subject,
                row.first_test,
                row.second_test,
                row.third_test,
                row.totals.ca,
                row.exam,
                row.totals.total,
                &grade,
                &remark,
            ),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "subject_results" })),
            );
        }

        // Every subject write re-derives the owning term aggregate in full.
        if let Err(e) =
            calc::recompute_term_total(&tx, &school_id, &student_id, &term_id, &session_id, &bands)
        {
            let _ = tx.rollback();
            return err(&req.id, &e.code, e.message, e.details);
        }
    }

    if let Some(comment) = &teacher_comment {
        if let Err(e) = tx.execute(
            "UPDATE term_totals SET teacher_comment = ?
             WHERE student_id = ? AND term_id = ? AND session_id = ?",
            (comment, &student_id, &term_id, &session_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(comment) = &principal_comment {
        if let Err(e) = tx.execute(
            "UPDATE term_totals SET principal_comment = ?
             WHERE student_id = ? AND term_id = ? AND session_id = ?",
            (comment, &student_id, &term_id, &session_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "saved": parsed.len(),
            "sessionId": session_id,
            "termId": term_id
        }),
    )
}

fn handle_results_reset(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let school_id = match req.params.get("schoolId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing schoolId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let (session_id, term_id) = match current_session_and_term(conn, &school_id) {
        Ok(v) => v,
        Err((code, message)) => return err(&req.id, code, message, None),
    };

    let existing: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM subject_results
         WHERE student_id = ? AND term_id = ? AND session_id = ?",
        (&student_id, &term_id, &session_id),
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if existing == 0 {
        return err(
            &req.id,
            "not_found",
            "no results for this student in the current term and session",
            None,
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // The aggregate goes with its inputs; a term total without subject rows
    // is stale data, not history.
    for (table, sql) in [
        (
            "subject_results",
            "DELETE FROM subject_results WHERE student_id = ? AND term_id = ? AND session_id = ?",
        ),
        (
            "term_totals",
            "DELETE FROM term_totals WHERE student_id = ? AND term_id = ? AND session_id = ?",
        ),
    ] {
        if let Err(e) = tx.execute(sql, (&student_id, &term_id, &session_id)) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "deleted": existing }))
}

pub(super) fn subject_result_rows(
    conn: &Connection,
    student_id: &str,
    term_id: &str,
    session_id: &str,
) -> rusqlite::Result<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare(
        "SELECT subject, first_test, second_test, third_test, ca, exam, total_score, grade, remark
         FROM subject_results
         WHERE student_id = ? AND term_id = ? AND session_id = ?
         ORDER BY subject",
    )?;
    let rows = stmt
        .query_map((student_id, term_id, session_id), |r| {
            let subject: String = r.get(0)?;
            let first_test: i64 = r.get(1)?;
            let second_test: i64 = r.get(2)?;
            let third_test: i64 = r.get(3)?;
            let ca: i64 = r.get(4)?;
            let exam: i64 = r.get(5)?;
            let total_score: i64 = r.get(6)?;
            let grade: String = r.get(7)?;
            let remark: String = r.get(8)?;
            Ok(json!({
                "subject": subject,
                "firstTest": first_test,
                "secondTest": second_test,
                "thirdTest": third_test,
                "ca": ca,
                "exam": exam,
                "totalScore": total_score,
                "grade": grade,
                "remark": remark
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(super) fn term_total_row(
    conn: &Connection,
    student_id: &str,
    term_id: &str,
    session_id: &str,
) -> rusqlite::Result<Option<serde_json::Value>> {
    conn.query_row(
        "SELECT total_ca, total_exam, total_score, grade, remark, teacher_comment, principal_comment
         FROM term_totals
         WHERE student_id = ? AND term_id = ? AND session_id = ?",
        (student_id, term_id, session_id),
        |r| {
            let total_ca: i64 = r.get(0)?;
            let total_exam: i64 = r.get(1)?;
            let total_score: i64 = r.get(2)?;
            let grade: String = r.get(3)?;
            let remark: String = r.get(4)?;
            let teacher_comment: Option<String> = r.get(5)?;
            let principal_comment: Option<String> = r.get(6)?;
            Ok(json!({
                "totalCa": total_ca,
                "totalExam": total_exam,
                "totalScore": total_score,
                "grade": grade,
                "remark": remark,
                "teacherComment": teacher_comment,
                "principalComment": principal_comment
            }))
        },
    )
    .optional()
}

fn handle_results_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let term_id = match req.params.get("termId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing termId", None),
    };
    let session_id = match req.params.get("sessionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sessionId", None),
    };

    let results = match subject_result_rows(conn, &student_id, &term_id, &session_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let term_total = match term_total_row(conn, &student_id, &term_id, &session_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "results": results,
            "termTotal": term_total
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.upsert" => Some(handle_results_upsert(state, req)),
        "results.reset" => Some(handle_results_reset(state, req)),
        "results.get" => Some(handle_results_get(state, req)),
        _ => None,
    }
}
