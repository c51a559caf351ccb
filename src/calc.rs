use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

/// Grade and remark used when no band covers a score. Resolution never
/// fails; misconfigured scales degrade to this sentinel.
pub const UNRESOLVED_GRADE: &str = "N/A";

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(code: &str, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: Some(details),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GradingBand {
    pub min_score: i64,
    pub max_score: i64,
    pub grade: String,
    pub remark: String,
}

/// Load a school's bands ordered by descending min_score, the search order
/// [`resolve_grade`] expects.
pub fn load_grading_bands(conn: &Connection, school_id: &str) -> Result<Vec<GradingBand>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT min_score, max_score, grade, remark
             FROM grading_bands
             WHERE school_id = ?
             ORDER BY min_score DESC",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    stmt.query_map([school_id], |r| {
        Ok(GradingBand {
            min_score: r.get(0)?,
            max_score: r.get(1)?,
            grade: r.get(2)?,
            remark: r.get(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| CalcError::new("db_query_failed", e.to_string()))
}

/// First band (in descending min_score order) whose inclusive range covers
/// the score wins. No match resolves to the `N/A` sentinel.
pub fn resolve_grade(bands: &[GradingBand], score: i64) -> (String, String) {
    for b in bands {
        if b.min_score <= score && score <= b.max_score {
            return (b.grade.clone(), b.remark.clone());
        }
    }
    (UNRESOLVED_GRADE.to_string(), UNRESOLVED_GRADE.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubjectTotals {
    pub ca: i64,
    pub total: i64,
}

/// Continuous assessment is the sum of the three test components; the
/// subject total adds the exam. Absent components count as 0.
pub fn subject_totals(
    first_test: Option<i64>,
    second_test: Option<i64>,
    third_test: Option<i64>,
    exam: Option<i64>,
) -> SubjectTotals {
    let ca = first_test.unwrap_or(0) + second_test.unwrap_or(0) + third_test.unwrap_or(0);
    SubjectTotals {
        ca,
        total: ca + exam.unwrap_or(0),
    }
}

/// Business rule checked against the pre-save values: CA plus exam must fit
/// in 100. Violations are reported, never clamped.
pub fn check_subject_totals(subject: &str, totals: SubjectTotals) -> Result<(), CalcError> {
    if totals.total > 100 {
        return Err(CalcError::with_details(
            "score_overflow",
            format!(
                "scores for '{}' total {}, which exceeds 100",
                subject, totals.total
            ),
            serde_json::json!({ "subject": subject, "total": totals.total }),
        ));
    }
    Ok(())
}

/// Full recompute of a student's term aggregate from the current
/// subject_results rows for (student, term, session). Not incremental:
/// correctness depends only on the committed row set at call time, so the
/// upsert is idempotent. The two staff comment columns are not touched.
pub fn recompute_term_total(
    conn: &Connection,
    school_id: &str,
    student_id: &str,
    term_id: &str,
    session_id: &str,
    bands: &[GradingBand],
) -> Result<(), CalcError> {
    let (total_ca, total_exam, total_score): (i64, i64, i64) = conn
        .query_row(
            "SELECT COALESCE(SUM(ca), 0), COALESCE(SUM(exam), 0), COALESCE(SUM(total_score), 0)
             FROM subject_results
             WHERE student_id = ? AND term_id = ? AND session_id = ?",
            (student_id, term_id, session_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let (grade, remark) = resolve_grade(bands, total_score);

    let row_id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO term_totals(
            id, school_id, student_id, term_id, session_id,
            total_ca, total_exam, total_score, grade, remark
         )
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, term_id, session_id) DO UPDATE SET
           total_ca = excluded.total_ca,
           total_exam = excluded.total_exam,
           total_score = excluded.total_score,
           grade = excluded.grade,
           remark = excluded.remark",
        (
            &row_id,
            school_id,
            student_id,
            term_id,
            session_id,
            total_ca,
            total_exam,
            total_score,
            &grade,
            &remark,
        ),
    )
    .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;

    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankSummary {
    pub position: usize,
    pub position_ordinal: String,
    pub total_score: i64,
    pub out_of: i64,
    pub average_score: f64,
    pub class_average: f64,
    pub out_of_students: usize,
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// English ordinal suffix; 11th/12th/13th are the exceptions to the
/// last-digit pattern.
pub fn ordinal(n: usize) -> String {
    let suffix = match n % 100 {
        11 | 12 | 13 => "th",
        _ => match n % 10 {
            1 => "st",
            2 => "nd",
            3 => "rd",
            _ => "th",
        },
    };
    format!("{}{}", n, suffix)
}

/// Rank a student against the cohort sharing their class level for the
/// session. The cohort is resolved through enrollments (session-correct
/// under promotion), iterated in enrollment creation order; the descending
/// sort is stable, so among equal totals the first-enrolled student ranks
/// ahead.
///
/// Returns `Ok(None)` when the student has no enrollment for the session:
/// ranking is unavailable, not an error, and never degrades to a cohort of
/// one.
pub fn rank_student(
    conn: &Connection,
    school_id: &str,
    student_id: &str,
    session_id: &str,
    term_id: &str,
) -> Result<Option<RankSummary>, CalcError> {
    let class_level_id: Option<String> = conn
        .query_row(
            "SELECT class_level_id FROM enrollments
             WHERE student_id = ? AND session_id = ? AND school_id = ?",
            (student_id, session_id, school_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let Some(class_level_id) = class_level_id else {
        return Ok(None);
    };

    let mut cohort_stmt = conn
        .prepare(
            "SELECT e.student_id,
                    COALESCE((SELECT SUM(sr.total_score)
                              FROM subject_results sr
                              WHERE sr.student_id = e.student_id
                                AND sr.term_id = ?
                                AND sr.session_id = ?), 0)
             FROM enrollments e
             WHERE e.class_level_id = ? AND e.session_id = ? AND e.school_id = ?
             ORDER BY e.rowid",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let mut cohort: Vec<(String, i64)> = cohort_stmt
        .query_map(
            (term_id, session_id, &class_level_id, session_id, school_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    cohort.sort_by(|a, b| b.1.cmp(&a.1));

    let out_of_students = cohort.len();
    let class_total: i64 = cohort.iter().map(|(_, t)| t).sum();
    let (position, total_score) = cohort
        .iter()
        .enumerate()
        .find(|(_, (id, _))| id == student_id)
        .map(|(i, (_, t))| (i + 1, *t))
        .unwrap_or((1, 0));

    let subjects_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM subject_results
             WHERE student_id = ? AND term_id = ? AND session_id = ?",
            (student_id, term_id, session_id),
            |r| r.get(0),
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let out_of = subjects_count * 100;
    let average_score = if out_of > 0 {
        round2(total_score as f64 / out_of as f64 * 100.0)
    } else {
        0.0
    };
    let class_average = if out_of_students > 0 && subjects_count > 0 {
        round2(
            class_total as f64 / (out_of_students as f64 * 100.0 * subjects_count as f64) * 100.0,
        )
    } else {
        0.0
    };

    Ok(Some(RankSummary {
        position,
        position_ordinal: ordinal(position),
        total_score,
        out_of,
        average_score,
        class_average,
        out_of_students,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

    fn band(min: i64, max: i64, grade: &str, remark: &str) -> GradingBand {
        GradingBand {
            min_score: min,
            max_score: max,
            grade: grade.to_string(),
            remark: remark.to_string(),
        }
    }

    #[test]
    fn resolve_grade_first_descending_match_wins() {
        let bands = vec![
            band(90, 100, "A", "Excellent"),
            band(70, 89, "B", "Very good"),
            band(0, 69, "C", "Good"),
        ];
        assert_eq!(resolve_grade(&bands, 95).0, "A");
        assert_eq!(resolve_grade(&bands, 70).0, "B");
        assert_eq!(resolve_grade(&bands, 0).0, "C");
    }

    #[test]
    fn resolve_grade_without_matching_band_degrades_to_sentinel() {
        let bands = vec![band(90, 100, "A", "Excellent")];
        let (grade, remark) = resolve_grade(&bands, 150);
        assert_eq!(grade, UNRESOLVED_GRADE);
        assert_eq!(remark, UNRESOLVED_GRADE);
        assert_eq!(resolve_grade(&[], 50).0, UNRESOLVED_GRADE);
    }

    #[test]
    fn subject_totals_treat_absent_components_as_zero() {
        let t = subject_totals(Some(10), None, Some(5), None);
        assert_eq!(t.ca, 15);
        assert_eq!(t.total, 15);

        let t = subject_totals(Some(20), Some(20), Some(20), Some(40));
        assert_eq!(t.ca, 60);
        assert_eq!(t.total, 100);
    }

    #[test]
    fn overflowing_totals_are_rejected_with_subject_and_total() {
        let t = subject_totals(Some(40), Some(40), Some(20), Some(10));
        let err = check_subject_totals("Mathematics", t).expect_err("110 must be rejected");
        assert_eq!(err.code, "score_overflow");
        let details = err.details.expect("details");
        assert_eq!(details["subject"], "Mathematics");
        assert_eq!(details["total"], 110);

        let ok = subject_totals(Some(30), Some(30), Some(20), Some(20));
        assert!(check_subject_totals("Mathematics", ok).is_ok());
    }

    #[test]
    fn ordinal_suffixes_follow_english_rules() {
        assert_eq!(ordinal(1), "1st");
        assert_eq!(ordinal(2), "2nd");
        assert_eq!(ordinal(3), "3rd");
        assert_eq!(ordinal(4), "4th");
        assert_eq!(ordinal(11), "11th");
        assert_eq!(ordinal(12), "12th");
        assert_eq!(ordinal(13), "13th");
        assert_eq!(ordinal(21), "21st");
        assert_eq!(ordinal(102), "102nd");
        assert_eq!(ordinal(111), "111th");
    }

    fn seed_workspace(conn: &Connection) -> (String, String, String, String) {
        db::init_schema(conn).expect("schema");
        conn.execute(
            "INSERT INTO schools(id, name, created_at) VALUES('sch', 'Test College', '2025-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO class_levels(id, school_id, name, sort_order) VALUES('lvl', 'sch', 'JSS1', 0)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO sessions(id, school_id, name, is_current, created_at)
             VALUES('ses', 'sch', '2025/2026', 1, '2025-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO terms(id, session_id, name, is_current) VALUES('trm', 'ses', 'First Term', 1)",
            [],
        )
        .unwrap();
        (
            "sch".to_string(),
            "lvl".to_string(),
            "ses".to_string(),
            "trm".to_string(),
        )
    }

    fn seed_student(conn: &Connection, id: &str, level: &str, session: &str) {
        conn.execute(
            "INSERT INTO students(id, school_id, name, created_at)
             VALUES(?, 'sch', ?, '2025-01-01T00:00:00Z')",
            (id, id),
        )
        .unwrap();
        conn.execute(
            "INSERT INTO enrollments(id, school_id, session_id, class_level_id, student_id)
             VALUES(?, 'sch', ?, ?, ?)",
            (format!("enr-{id}"), session, level, id),
        )
        .unwrap();
    }

    fn seed_result(conn: &Connection, student: &str, subject: &str, total: i64) {
        conn.execute(
            "INSERT INTO subject_results(
                id, school_id, student_id, term_id, session_id, subject,
                first_test, second_test, third_test, ca, exam, total_score, grade, remark
             )
             VALUES(?, 'sch', ?, 'trm', 'ses', ?, 0, 0, 0, 0, ?, ?, 'A', 'ok')",
            (
                format!("res-{student}-{subject}"),
                student,
                subject,
                total,
                total,
            ),
        )
        .unwrap();
    }

    #[test]
    fn rank_student_ties_keep_enrollment_order() {
        let conn = Connection::open_in_memory().unwrap();
        let (school, level, session, term) = seed_workspace(&conn);
        for id in ["s1", "s2", "s3"] {
            seed_student(&conn, id, &level, &session);
        }
        seed_result(&conn, "s1", "Mathematics", 80);
        seed_result(&conn, "s2", "Mathematics", 90);
        seed_result(&conn, "s3", "Mathematics", 80);

        let top = rank_student(&conn, &school, "s2", &session, &term)
            .unwrap()
            .expect("enrolled");
        assert_eq!(top.position, 1);
        assert_eq!(top.position_ordinal, "1st");
        assert_eq!(top.total_score, 90);

        // s1 and s3 tie at 80; s1 enrolled first and keeps the better rank.
        let first_tied = rank_student(&conn, &school, "s1", &session, &term)
            .unwrap()
            .expect("enrolled");
        assert_eq!(first_tied.position, 2);
        let second_tied = rank_student(&conn, &school, "s3", &session, &term)
            .unwrap()
            .expect("enrolled");
        assert_eq!(second_tied.position, 3);
        assert_eq!(second_tied.out_of_students, 3);
    }

    #[test]
    fn rank_student_averages_and_out_of() {
        let conn = Connection::open_in_memory().unwrap();
        let (school, level, session, term) = seed_workspace(&conn);
        seed_student(&conn, "s1", &level, &session);
        seed_student(&conn, "s2", &level, &session);
        seed_result(&conn, "s1", "Mathematics", 80);
        seed_result(&conn, "s1", "English", 60);
        seed_result(&conn, "s2", "Mathematics", 40);

        let r = rank_student(&conn, &school, "s1", &session, &term)
            .unwrap()
            .expect("enrolled");
        assert_eq!(r.out_of, 200);
        assert_eq!(r.average_score, 70.0);
        // class total 180 over 2 students x 2 subjects x 100.
        assert_eq!(r.class_average, 45.0);
    }

    #[test]
    fn rank_student_without_enrollment_is_unavailable() {
        let conn = Connection::open_in_memory().unwrap();
        let (school, _level, session, term) = seed_workspace(&conn);
        conn.execute(
            "INSERT INTO students(id, school_id, name, created_at)
             VALUES('ghost', 'sch', 'Ghost', '2025-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        let r = rank_student(&conn, &school, "ghost", &session, &term).unwrap();
        assert!(r.is_none());
    }

    #[test]
    fn recompute_term_total_is_idempotent_and_preserves_comments() {
        let conn = Connection::open_in_memory().unwrap();
        let (school, level, session, term) = seed_workspace(&conn);
        seed_student(&conn, "s1", &level, &session);
        seed_result(&conn, "s1", "Mathematics", 80);

        let bands = vec![band(70, 100, "A", "Excellent"), band(0, 69, "B", "Good")];
        recompute_term_total(&conn, &school, "s1", &term, &session, &bands).unwrap();
        conn.execute(
            "UPDATE term_totals SET teacher_comment = 'Keep it up'
             WHERE student_id = 's1' AND term_id = 'trm' AND session_id = 'ses'",
            [],
        )
        .unwrap();

        // Unchanged inputs: same aggregate, comment intact, still one row.
        recompute_term_total(&conn, &school, "s1", &term, &session, &bands).unwrap();

        let (total, grade, comment, rows): (i64, String, Option<String>, i64) = conn
            .query_row(
                "SELECT total_score, grade, teacher_comment,
                        (SELECT COUNT(*) FROM term_totals)
                 FROM term_totals
                 WHERE student_id = 's1' AND term_id = 'trm' AND session_id = 'ses'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .unwrap();
        assert_eq!(total, 80);
        assert_eq!(grade, "A");
        assert_eq!(comment.as_deref(), Some("Keep it up"));
        assert_eq!(rows, 1);

        // A second subject pushes the aggregate past every band; the term
        // grade degrades to the sentinel rather than failing.
        seed_result(&conn, "s1", "English", 65);
        recompute_term_total(&conn, &school, "s1", &term, &session, &bands).unwrap();
        let (total, grade, comment): (i64, String, Option<String>) = conn
            .query_row(
                "SELECT total_score, grade, teacher_comment FROM term_totals
                 WHERE student_id = 's1' AND term_id = 'trm' AND session_id = 'ses'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(total, 145);
        assert_eq!(grade, UNRESOLVED_GRADE);
        assert_eq!(comment.as_deref(), Some("Keep it up"));
    }
}
