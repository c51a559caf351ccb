use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
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

fn current_session_id(conn: &Connection, school_id: &str) -> Result<String, HandlerErr> {
    let session: Option<String> = conn
        .query_row(
            "SELECT id FROM sessions WHERE school_id = ? AND is_current = 1",
            [school_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    session.ok_or(HandlerErr {
        code: "session_not_set",
        message: "no current session for this school".to_string(),
        details: None,
    })
}

/// Enroll unless an enrollment for (student, session) already exists. The
/// UNIQUE constraint backs this up; the lookup keeps the response friendly.
fn enroll_if_absent(
    conn: &Connection,
    school_id: &str,
    session_id: &str,
    class_level_id: &str,
    student_id: &str,
) -> Result<bool, HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM enrollments WHERE student_id = ? AND session_id = ?",
            (student_id, session_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    if existing.is_some() {
        return Ok(false);
    }

    let enrollment_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO enrollments(id, school_id, session_id, class_level_id, student_id)
         VALUES(?, ?, ?, ?, ?)",
        (
            &enrollment_id,
            school_id,
            session_id,
            class_level_id,
            student_id,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "enrollments" })),
    })?;
    Ok(true)
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let school_id = match req.params.get("schoolId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing schoolId", None),
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let other_info = req
        .params
        .get("otherInfo")
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let class_level_id = req
        .params
        .get("classLevelId")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());

    let school_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM schools WHERE id = ?", [&school_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if school_exists.is_none() {
        return err(&req.id, "not_found", "school not found", None);
    }

    if let Some(level) = &class_level_id {
        let level_ok: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM class_levels WHERE id = ? AND school_id = ?",
                (level, &school_id),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if level_ok.is_none() {
            return err(&req.id, "not_found", "class level not found", None);
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let student_id = Uuid::new_v4().to_string();
    let created_at = chrono::Utc::now().to_rfc3339();
    if let Err(e) = tx.execute(
        "INSERT INTO students(id, school_id, name, other_info, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (&student_id, &school_id, &name, &other_info, &created_at),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    let mut enrolled = false;
    if let Some(level) = &class_level_id {
        let session_id = match current_session_id(&tx, &school_id) {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback();
                return e.response(&req.id);
            }
        };
        enrolled = match enroll_if_absent(&tx, &school_id, &session_id, level, &student_id) {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback();
                return e.response(&req.id);
            }
        };
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "name": name,
            "enrolled": enrolled
        }),
    )
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let name = req
        .params
        .get("name")
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string());
    if let Some(n) = &name {
        if n.is_empty() {
            return err(&req.id, "bad_params", "name must not be empty", None);
        }
    }
    let other_info = req
        .params
        .get("otherInfo")
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string());

    if name.is_none() && other_info.is_none() {
        return err(&req.id, "bad_params", "nothing to update", None);
    }

    let existing: Option<String> = match conn
        .query_row(
            "SELECT id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if existing.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    if let Some(n) = &name {
        if let Err(e) = conn.execute(
            "UPDATE students SET name = ? WHERE id = ?",
            (n, &student_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(info) = &other_info {
        if let Err(e) = conn.execute(
            "UPDATE students SET other_info = ? WHERE id = ?",
            (info, &student_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    for (table, sql) in [
        (
            "term_totals",
            "DELETE FROM term_totals WHERE student_id = ?",
        ),
        (
            "subject_results",
            "DELETE FROM subject_results WHERE student_id = ?",
        ),
        (
            "enrollments",
            "DELETE FROM enrollments WHERE student_id = ?",
        ),
        ("students", "DELETE FROM students WHERE id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&student_id]) {
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

    ok(&req.id, json!({ "ok": true }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };

    let school_id = match req.params.get("schoolId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing schoolId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, other_info FROM students
         WHERE school_id = ?
         ORDER BY name, rowid",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&school_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let other_info: Option<String> = row.get(2)?;
            Ok(json!({
                "id": id,
                "name": name,
                "otherInfo": other_info
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_enrollments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let school_id = match req.params.get("schoolId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing schoolId", None),
    };
    let session_id = match req.params.get("sessionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sessionId", None),
    };
    let class_level_id = match req.params.get("classLevelId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classLevelId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    // Every referenced row must belong to the same school; enrollment is the
    // multi-tenant seam the ranking cohort is built from.
    for (label, sql, key) in [
        (
            "session",
            "SELECT 1 FROM sessions WHERE id = ? AND school_id = ?",
            &session_id,
        ),
        (
            "class level",
            "SELECT 1 FROM class_levels WHERE id = ? AND school_id = ?",
            &class_level_id,
        ),
        (
            "student",
            "SELECT 1 FROM students WHERE id = ? AND school_id = ?",
            &student_id,
        ),
    ] {
        let found: Option<i64> = match conn
            .query_row(sql, (key, &school_id), |r| r.get(0))
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if found.is_none() {
            return err(
                &req.id,
                "not_found",
                format!("{} not found for this school", label),
                None,
            );
        }
    }

    match enroll_if_absent(conn, &school_id, &session_id, &class_level_id, &student_id) {
        Ok(created) => ok(&req.id, json!({ "ok": true, "created": created })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_enrollments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "enrollments": [] }));
    };

    let school_id = match req.params.get("schoolId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing schoolId", None),
    };
    let session_id = match req.params.get("sessionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sessionId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT e.id, e.student_id, st.name, e.class_level_id, cl.name
         FROM enrollments e
         JOIN students st ON st.id = e.student_id
         JOIN class_levels cl ON cl.id = e.class_level_id
         WHERE e.school_id = ? AND e.session_id = ?
         ORDER BY cl.sort_order, e.rowid",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map((&school_id, &session_id), |row| {
            let id: String = row.get(0)?;
            let student_id: String = row.get(1)?;
            let student_name: String = row.get(2)?;
            let class_level_id: String = row.get(3)?;
            let class_level_name: String = row.get(4)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "studentName": student_name,
                "classLevelId": class_level_id,
                "classLevelName": class_level_name
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(enrollments) => ok(&req.id, json!({ "enrollments": enrollments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "enrollments.create" => Some(handle_enrollments_create(state, req)),
        "enrollments.list" => Some(handle_enrollments_list(state, req)),
        _ => None,
    }
}
