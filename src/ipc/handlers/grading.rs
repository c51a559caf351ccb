use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct BandInput {
    min_score: i64,
    max_score: i64,
    grade: String,
    remark: String,
}

fn parse_band(params: &serde_json::Value) -> Result<BandInput, String> {
    let min_score = params
        .get("minScore")
        .and_then(|v| v.as_i64())
        .ok_or("missing/invalid minScore")?;
    let max_score = params
        .get("maxScore")
        .and_then(|v| v.as_i64())
        .ok_or("missing/invalid maxScore")?;
    let grade = params
        .get("grade")
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or("missing grade")?;
    let remark = params
        .get("remark")
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or("missing remark")?;

    if min_score < 0 || max_score > 100 || min_score > max_score {
        return Err("band bounds must satisfy 0 <= minScore <= maxScore <= 100".to_string());
    }

    Ok(BandInput {
        min_score,
        max_score,
        grade,
        remark,
    })
}

/// Bands must partition scores without overlap; a new band touching an
/// existing range is a configuration error, rejected here rather than
/// resolved arbitrarily at lookup time. Gaps are allowed and fall through
/// to the N/A sentinel.
fn find_overlap(
    conn: &Connection,
    school_id: &str,
    band: &BandInput,
    exclude_id: Option<&str>,
) -> rusqlite::Result<Option<(String, i64, i64)>> {
    conn.query_row(
        "SELECT grade, min_score, max_score FROM grading_bands
         WHERE school_id = ?1
           AND min_score <= ?2
           AND max_score >= ?3
           AND (?4 IS NULL OR id <> ?4)
         LIMIT 1",
        rusqlite::params![school_id, band.max_score, band.min_score, exclude_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )
    .optional()
}

fn handle_grading_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let school_id = match req.params.get("schoolId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing schoolId", None),
    };
    let band = match parse_band(&req.params) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

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

    match find_overlap(conn, &school_id, &band, None) {
        Ok(Some((grade, min, max))) => {
            return err(
                &req.id,
                "band_overlap",
                format!(
                    "range {}-{} overlaps existing band '{}' ({}-{})",
                    band.min_score, band.max_score, grade, min, max
                ),
                Some(json!({ "conflictGrade": grade, "minScore": min, "maxScore": max })),
            )
        }
        Ok(None) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let band_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO grading_bands(id, school_id, min_score, max_score, grade, remark)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &band_id,
            &school_id,
            band.min_score,
            band.max_score,
            &band.grade,
            &band.remark,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "grading_bands" })),
        );
    }

    ok(&req.id, json!({ "bandId": band_id }))
}

fn handle_grading_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "bands": [] }));
    };

    let school_id = match req.params.get("schoolId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing schoolId", None),
    };

    // Descending min_score: the resolver's search order.
    let mut stmt = match conn.prepare(
        "SELECT id, min_score, max_score, grade, remark FROM grading_bands
         WHERE school_id = ?
         ORDER BY min_score DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&school_id], |row| {
            let id: String = row.get(0)?;
            let min_score: i64 = row.get(1)?;
            let max_score: i64 = row.get(2)?;
            let grade: String = row.get(3)?;
            let remark: String = row.get(4)?;
            Ok(json!({
                "id": id,
                "minScore": min_score,
                "maxScore": max_score,
                "grade": grade,
                "remark": remark
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(bands) => ok(&req.id, json!({ "bands": bands })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_grading_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let band_id = match req.params.get("bandId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing bandId", None),
    };
    let band = match parse_band(&req.params) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    let school_id: Option<String> = match conn
        .query_row(
            "SELECT school_id FROM grading_bands WHERE id = ?",
            [&band_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(school_id) = school_id else {
        return err(&req.id, "not_found", "grading band not found", None);
    };

    match find_overlap(conn, &school_id, &band, Some(&band_id)) {
        Ok(Some((grade, min, max))) => {
            return err(
                &req.id,
                "band_overlap",
                format!(
                    "range {}-{} overlaps existing band '{}' ({}-{})",
                    band.min_score, band.max_score, grade, min, max
                ),
                Some(json!({ "conflictGrade": grade, "minScore": min, "maxScore": max })),
            )
        }
        Ok(None) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    if let Err(e) = conn.execute(
        "UPDATE grading_bands SET min_score = ?, max_score = ?, grade = ?, remark = ?
         WHERE id = ?",
        (
            band.min_score,
            band.max_score,
            &band.grade,
            &band.remark,
            &band_id,
        ),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_grading_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let band_id = match req.params.get("bandId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing bandId", None),
    };

    let changed = match conn.execute("DELETE FROM grading_bands WHERE id = ?", [&band_id]) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "grading band not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grading.create" => Some(handle_grading_create(state, req)),
        "grading.list" => Some(handle_grading_list(state, req)),
        "grading.update" => Some(handle_grading_update(state, req)),
        "grading.delete" => Some(handle_grading_delete(state, req)),
        _ => None,
    }
}
