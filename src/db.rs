use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("schoolbook.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Schema setup on an already-open connection. Split out of [`open_db`] so
/// tests can run against `Connection::open_in_memory()`.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schools(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            address TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_levels(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    // Existing workspaces may have class_levels without sort_order. Add and
    // backfill from insert order; the promotion ladder depends on it.
    ensure_class_levels_sort_order(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_levels_school ON class_levels(school_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            other_info TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_school ON students(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            is_current INTEGER NOT NULL DEFAULT 0,
            show_results INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            UNIQUE(school_id, name)
        )",
        [],
    )?;
    ensure_sessions_show_results(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_school ON sessions(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS terms(
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            name TEXT NOT NULL,
            is_current INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(session_id) REFERENCES sessions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_terms_session ON terms(session_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            UNIQUE(school_id, name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grading_bands(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            min_score INTEGER NOT NULL,
            max_score INTEGER NOT NULL,
            grade TEXT NOT NULL,
            remark TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grading_bands_school ON grading_bands(school_id, min_score)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            class_level_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(session_id) REFERENCES sessions(id),
            FOREIGN KEY(class_level_id) REFERENCES class_levels(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, session_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_session ON enrollments(session_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_cohort ON enrollments(class_level_id, session_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_results(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            first_test INTEGER NOT NULL,
            second_test INTEGER NOT NULL,
            third_test INTEGER NOT NULL,
            ca INTEGER NOT NULL,
            exam INTEGER NOT NULL,
            total_score INTEGER NOT NULL,
            grade TEXT NOT NULL,
            remark TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(term_id) REFERENCES terms(id),
            FOREIGN KEY(session_id) REFERENCES sessions(id),
            UNIQUE(student_id, term_id, session_id, subject)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_results_tuple
         ON subject_results(student_id, term_id, session_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_results_term ON subject_results(term_id, session_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS term_totals(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            total_ca INTEGER NOT NULL DEFAULT 0,
            total_exam INTEGER NOT NULL DEFAULT 0,
            total_score INTEGER NOT NULL DEFAULT 0,
            grade TEXT NOT NULL,
            remark TEXT NOT NULL,
            teacher_comment TEXT,
            principal_comment TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(term_id) REFERENCES terms(id),
            FOREIGN KEY(session_id) REFERENCES sessions(id),
            UNIQUE(student_id, term_id, session_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_term_totals_tuple
         ON term_totals(student_id, term_id, session_id)",
        [],
    )?;

    Ok(())
}

fn ensure_class_levels_sort_order(conn: &Connection) -> anyhow::Result<()> {
    // If the column already exists, we're done.
    if table_has_column(conn, "class_levels", "sort_order")? {
        return Ok(());
    }

    conn.execute(
        "ALTER TABLE class_levels ADD COLUMN sort_order INTEGER NOT NULL DEFAULT 0",
        [],
    )?;

    // Backfill per school using existing insert order as a best-effort.
    let mut school_stmt = conn.prepare("SELECT id FROM schools ORDER BY rowid")?;
    let school_ids = school_stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut level_stmt =
        conn.prepare("SELECT id FROM class_levels WHERE school_id = ? ORDER BY rowid")?;

    for sid in school_ids {
        let level_ids = level_stmt
            .query_map([&sid], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for (i, lid) in level_ids.iter().enumerate() {
            conn.execute(
                "UPDATE class_levels SET sort_order = ? WHERE id = ?",
                (i as i64, lid),
            )?;
        }
    }

    Ok(())
}

fn ensure_sessions_show_results(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "sessions", "show_results")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE sessions ADD COLUMN show_results INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
