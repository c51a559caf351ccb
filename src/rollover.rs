use std::collections::HashMap;

use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromotionOutcome {
    pub promoted: usize,
    pub graduated: usize,
}

/// Promote the previous session's enrollments one rung up the school's
/// class-level ladder, enrolling them into `new_session_id`.
///
/// Called by the session-creation use case inside its transaction; partial
/// promotion is never visible because the caller commits or rolls back the
/// whole session creation. No-op when the school has no other session
/// (nothing to promote from). Students already at the final rung get no new
/// enrollment.
pub fn promote_from_previous_session(
    conn: &Connection,
    school_id: &str,
    new_session_id: &str,
) -> rusqlite::Result<PromotionOutcome> {
    let previous_session: Option<String> = conn
        .query_row(
            "SELECT id FROM sessions
             WHERE school_id = ? AND id <> ?
             ORDER BY created_at DESC, rowid DESC
             LIMIT 1",
            (school_id, new_session_id),
            |r| r.get(0),
        )
        .optional()?;
    let Some(previous_session) = previous_session else {
        return Ok(PromotionOutcome::default());
    };

    // The ladder: class levels in creation order.
    let mut ladder_stmt = conn.prepare(
        "SELECT id FROM class_levels WHERE school_id = ? ORDER BY sort_order, rowid",
    )?;
    let ladder: Vec<String> = ladder_stmt
        .query_map([school_id], |r| r.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let rung_by_level: HashMap<&str, usize> = ladder
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    let mut enroll_stmt = conn.prepare(
        "SELECT student_id, class_level_id FROM enrollments
         WHERE school_id = ? AND session_id = ?
         ORDER BY rowid",
    )?;
    let prior: Vec<(String, String)> = enroll_stmt
        .query_map((school_id, &previous_session), |r| {
            Ok((r.get(0)?, r.get(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut outcome = PromotionOutcome::default();
    for (student_id, class_level_id) in prior {
        // Levels deleted since the enrollment was made have no rung; skip.
        let Some(&rung) = rung_by_level.get(class_level_id.as_str()) else {
            continue;
        };
        let Some(next_level) = ladder.get(rung + 1) else {
            outcome.graduated += 1;
            continue;
        };

        let enrollment_id = Uuid::new_v4().to_string();
        let inserted = conn.execute(
            "INSERT INTO enrollments(id, school_id, session_id, class_level_id, student_id)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(student_id, session_id) DO NOTHING",
            (
                &enrollment_id,
                school_id,
                new_session_id,
                next_level,
                &student_id,
            ),
        )?;
        outcome.promoted += inserted;
    }

    tracing::info!(
        school = school_id,
        session = new_session_id,
        promoted = outcome.promoted,
        graduated = outcome.graduated,
        "session rollover complete"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

    fn seed(conn: &Connection) {
        db::init_schema(conn).expect("schema");
        conn.execute(
            "INSERT INTO schools(id, name, created_at) VALUES('sch', 'Test College', '2025-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        for (i, (id, name)) in [("l1", "JSS1"), ("l2", "JSS2"), ("l3", "JSS3")]
            .iter()
            .enumerate()
        {
            conn.execute(
                "INSERT INTO class_levels(id, school_id, name, sort_order) VALUES(?, 'sch', ?, ?)",
                (id, name, i as i64),
            )
            .unwrap();
        }
    }

    fn seed_session(conn: &Connection, id: &str, created_at: &str) {
        conn.execute(
            "INSERT INTO sessions(id, school_id, name, created_at) VALUES(?, 'sch', ?, ?)",
            (id, id, created_at),
        )
        .unwrap();
    }

    fn seed_enrollment(conn: &Connection, student: &str, session: &str, level: &str) {
        conn.execute(
            "INSERT INTO students(id, school_id, name, created_at)
             VALUES(?, 'sch', ?, '2025-01-01T00:00:00Z')
             ON CONFLICT(id) DO NOTHING",
            (student, student),
        )
        .unwrap();
        conn.execute(
            "INSERT INTO enrollments(id, school_id, session_id, class_level_id, student_id)
             VALUES(?, 'sch', ?, ?, ?)",
            (format!("enr-{student}-{session}"), session, level, student),
        )
        .unwrap();
    }

    fn enrollment_level(conn: &Connection, student: &str, session: &str) -> Option<String> {
        use rusqlite::OptionalExtension;
        conn.query_row(
            "SELECT class_level_id FROM enrollments WHERE student_id = ? AND session_id = ?",
            (student, session),
            |r| r.get(0),
        )
        .optional()
        .unwrap()
    }

    #[test]
    fn first_session_promotes_nothing() {
        let conn = Connection::open_in_memory().unwrap();
        seed(&conn);
        seed_session(&conn, "s1", "2025-09-01T00:00:00Z");

        let outcome = promote_from_previous_session(&conn, "sch", "s1").unwrap();
        assert_eq!(outcome, PromotionOutcome::default());
    }

    #[test]
    fn students_move_one_rung_and_final_rung_graduates() {
        let conn = Connection::open_in_memory().unwrap();
        seed(&conn);
        seed_session(&conn, "s1", "2025-09-01T00:00:00Z");
        seed_enrollment(&conn, "ada", "s1", "l1");
        seed_enrollment(&conn, "bayo", "s1", "l3");
        seed_session(&conn, "s2", "2026-09-01T00:00:00Z");

        let outcome = promote_from_previous_session(&conn, "sch", "s2").unwrap();
        assert_eq!(outcome.promoted, 1);
        assert_eq!(outcome.graduated, 1);
        assert_eq!(enrollment_level(&conn, "ada", "s2").as_deref(), Some("l2"));
        assert_eq!(enrollment_level(&conn, "bayo", "s2"), None);
    }

    #[test]
    fn promotion_reads_the_latest_prior_session() {
        let conn = Connection::open_in_memory().unwrap();
        seed(&conn);
        seed_session(&conn, "s1", "2024-09-01T00:00:00Z");
        seed_session(&conn, "s2", "2025-09-01T00:00:00Z");
        seed_enrollment(&conn, "ada", "s1", "l1");
        seed_enrollment(&conn, "ada", "s2", "l2");
        seed_session(&conn, "s3", "2026-09-01T00:00:00Z");

        let outcome = promote_from_previous_session(&conn, "sch", "s3").unwrap();
        assert_eq!(outcome.promoted, 1);
        // Promotion comes from s2 (the latest), so ada lands in l3, not l2.
        assert_eq!(enrollment_level(&conn, "ada", "s3").as_deref(), Some("l3"));
    }
}
