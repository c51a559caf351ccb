use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::rollover;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

const TERM_NAMES: [&str; 3] = ["First Term", "Second Term", "Third Term"];

fn handle_sessions_start(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let is_current = req
        .params
        .get("isCurrent")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

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

    let duplicate: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM sessions WHERE school_id = ? AND name = ?",
            (&school_id, &name),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if duplicate.is_some() {
        return err(
            &req.id,
            "duplicate_session",
            format!("session '{}' already exists for this school", name),
            None,
        );
    }

    // Session creation, term creation, current-flag toggling and the
    // promotion rollover commit or roll back together.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if is_current {
        if let Err(e) = tx.execute(
            "UPDATE sessions SET is_current = 0 WHERE school_id = ? AND is_current = 1",
            [&school_id],
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        if let Err(e) = tx.execute(
            "UPDATE terms SET is_current = 0
             WHERE is_current = 1
               AND session_id IN (SELECT id FROM sessions WHERE school_id = ?)",
            [&school_id],
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    let session_id = Uuid::new_v4().to_string();
    let created_at = chrono::Utc::now().to_rfc3339();
    if let Err(e) = tx.execute(
        "INSERT INTO sessions(id, school_id, name, is_current, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            &session_id,
            &school_id,
            &name,
            if is_current { 1 } else { 0 },
            &created_at,
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "sessions" })),
        );
    }

    for term_name in TERM_NAMES {
        let term_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO terms(id, session_id, name) VALUES(?, ?, ?)",
            (&term_id, &session_id, term_name),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "terms" })),
            );
        }
    }

    let outcome = match rollover::promote_from_previous_session(&tx, &school_id, &session_id) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return err(&req.id, "db_tx_failed", e.to_string(), None);
        }
    };

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "sessionId": session_id,
            "name": name,
            "termsCreated": TERM_NAMES.len(),
            "promoted": outcome.promoted,
            "graduated": outcome.graduated
        }),
    )
}

fn handle_sessions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "sessions": [] }));
    };

    let school_id = match req.params.get("schoolId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing schoolId", None),
    };

    let mut session_stmt = match conn.prepare(
        "SELECT id, name, is_current, show_results FROM sessions
         WHERE school_id = ?
         ORDER BY created_at DESC, rowid DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let sessions: Vec<(String, String, i64, i64)> = match session_stmt
        .query_map([&school_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut term_stmt = match conn
        .prepare("SELECT id, name, is_current FROM terms WHERE session_id = ? ORDER BY rowid")
    {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut out = Vec::with_capacity(sessions.len());
    for (id, name, is_current, show_results) in sessions {
        let terms = match term_stmt
            .query_map([&id], |r| {
                let term_id: String = r.get(0)?;
                let term_name: String = r.get(1)?;
                let current: i64 = r.get(2)?;
                Ok(json!({
                    "id": term_id,
                    "name": term_name,
                    "isCurrent": current != 0
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        out.push(json!({
            "id": id,
            "name": name,
            "isCurrent": is_current != 0,
            "showResults": show_results != 0,
            "terms": terms
        }));
    }

    ok(&req.id, json!({ "sessions": out }))
}

fn handle_sessions_set_current(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let session_id = match req.params.get("sessionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sessionId", None),
    };

    let school_id: Option<String> = match conn
        .query_row(
            "SELECT school_id FROM sessions WHERE id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(school_id) = school_id else {
        return err(&req.id, "not_found", "session not found", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Deactivate every sibling session and all their terms before
    // activating one; at most one current session per school.
    if let Err(e) = tx.execute(
        "UPDATE sessions SET is_current = 0 WHERE school_id = ?",
        [&school_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute(
        "UPDATE terms SET is_current = 0
         WHERE session_id IN (SELECT id FROM sessions WHERE school_id = ?)",
        [&school_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute(
        "UPDATE sessions SET is_current = 1 WHERE id = ?",
        [&session_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_sessions_set_results_visible(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let session_id = match req.params.get("sessionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sessionId", None),
    };
    let visible = match req.params.get("visible").and_then(|v| v.as_bool()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing visible", None),
    };

    let changed = match conn.execute(
        "UPDATE sessions SET show_results = ? WHERE id = ?",
        (if visible { 1 } else { 0 }, &session_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "session not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_terms_set_current(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let term_id = match req.params.get("termId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing termId", None),
    };

    let row: Option<(String, i64)> = match conn
        .query_row(
            "SELECT t.session_id, s.is_current
             FROM terms t
             JOIN sessions s ON s.id = t.session_id
             WHERE t.id = ?",
            [&term_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((session_id, session_current)) = row else {
        return err(&req.id, "not_found", "term not found", None);
    };
    if session_current == 0 {
        return err(
            &req.id,
            "bad_params",
            "cannot activate term: its session is not current",
            None,
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "UPDATE terms SET is_current = 0 WHERE session_id = ?",
        [&session_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("UPDATE terms SET is_current = 1 WHERE id = ?", [&term_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sessions.start" => Some(handle_sessions_start(state, req)),
        "sessions.list" => Some(handle_sessions_list(state, req)),
        "sessions.setCurrent" => Some(handle_sessions_set_current(state, req)),
        "sessions.setResultsVisible" => Some(handle_sessions_set_results_visible(state, req)),
        "terms.setCurrent" => Some(handle_terms_set_current(state, req)),
        _ => None,
    }
}
