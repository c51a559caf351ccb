use super::results::{current_session_and_term, subject_result_rows, term_total_row};
use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

/// One payload shape for both the school's own view and the parent view.
/// Ranking degrades to null (with a note) when the student has no
/// enrollment for the session; report viewing is never blocked by an
/// enrollment gap.
fn build_report(
    conn: &Connection,
    school_id: &str,
    student_id: &str,
    session_id: &str,
    term_id: &str,
) -> Result<serde_json::Value, (&'static str, String)> {
    let school: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT name, address FROM schools WHERE id = ?",
            [school_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| ("db_query_failed", e.to_string()))?;
    let Some((school_name, school_address)) = school else {
        return Err(("not_found", "school not found".to_string()));
    };

    let student: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT name, other_info FROM students WHERE id = ? AND school_id = ?",
            (student_id, school_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| ("db_query_failed", e.to_string()))?;
    let Some((student_name, other_info)) = student else {
        return Err(("not_found", "student not found".to_string()));
    };

    let session_name: String = conn
        .query_row("SELECT name FROM sessions WHERE id = ?", [session_id], |r| {
            r.get(0)
        })
        .map_err(|e| ("db_query_failed", e.to_string()))?;
    let term_name: String = conn
        .query_row("SELECT name FROM terms WHERE id = ?", [term_id], |r| {
            r.get(0)
        })
        .map_err(|e| ("db_query_failed", e.to_string()))?;

    let results = subject_result_rows(conn, student_id, term_id, session_id)
        .map_err(|e| ("db_query_failed", e.to_string()))?;
    if results.is_empty() {
        return Err((
            "not_found",
            "no results for this student in this term and session".to_string(),
        ));
    }

    let term_total = term_total_row(conn, student_id, term_id, session_id)
        .map_err(|e| ("db_query_failed", e.to_string()))?;

    let class_level_name: Option<String> = conn
        .query_row(
            "SELECT cl.name
             FROM enrollments e
             JOIN class_levels cl ON cl.id = e.class_level_id
             WHERE e.student_id = ? AND e.session_id = ? AND e.school_id = ?",
            (student_id, session_id, school_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| ("db_query_failed", e.to_string()))?;

    let ranking = calc::rank_student(conn, school_id, student_id, session_id, term_id)
        .map_err(|e| ("db_query_failed", e.message.clone()))?;

    let (performance_summary, ranking_note) = match ranking {
        Some(r) => (
            json!({
                "totalScore": r.total_score,
                "outOf": r.out_of,
                "averageScore": r.average_score,
                "classAverage": r.class_average,
                "position": r.position_ordinal,
                "outOfStudents": r.out_of_students
            }),
            serde_json::Value::Null,
        ),
        None => (
            serde_json::Value::Null,
            json!("class data unavailable: student has no enrollment for this session"),
        ),
    };

    let (teacher_comment, principal_comment) = term_total
        .as_ref()
        .map(|t| (t["teacherComment"].clone(), t["principalComment"].clone()))
        .unwrap_or((serde_json::Value::Null, serde_json::Value::Null));

    Ok(json!({
        "schoolInfo": {
            "name": school_name,
            "address": school_address
        },
        "academicSession": {
            "session": session_name,
            "term": term_name
        },
        "student": {
            "name": student_name,
            "otherInfo": other_info,
            "classLevel": class_level_name
        },
        "results": results,
        "termTotal": term_total,
        "performanceSummary": performance_summary,
        "rankingNote": ranking_note,
        "comments": {
            "teacherComment": teacher_comment,
            "principalComment": principal_comment
        }
    }))
}

fn handle_reports_student(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    match build_report(conn, &school_id, &student_id, &session_id, &term_id) {
        Ok(payload) => ok(&req.id, payload),
        Err((code, message)) => err(&req.id, code, message, None),
    }
}

fn handle_reports_parent(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let session_id = match req.params.get("sessionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sessionId", None),
    };
    let term_id = match req.params.get("termId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing termId", None),
    };

    let session: Option<i64> = match conn
        .query_row(
            "SELECT show_results FROM sessions WHERE id = ? AND school_id = ?",
            (&session_id, &school_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(show_results) = session else {
        return err(&req.id, "not_found", "session not found", None);
    };
    if show_results == 0 {
        return err(
            &req.id,
            "results_hidden",
            "results for this session are not yet published",
            None,
        );
    }

    let term_ok: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM terms WHERE id = ? AND session_id = ?",
            (&term_id, &session_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if term_ok.is_none() {
        return err(&req.id, "not_found", "term not found for this session", None);
    }

    match build_report(conn, &school_id, &student_id, &session_id, &term_id) {
        Ok(payload) => ok(&req.id, payload),
        Err((code, message)) => err(&req.id, code, message, None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.student" => Some(handle_reports_student(state, req)),
        "reports.parent" => Some(handle_reports_parent(state, req)),
        _ => None,
    }
}
