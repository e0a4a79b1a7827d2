use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

pub const DB_FILE: &str = "coursed.sqlite3";

pub fn open_db(workspace: &Path, busy_timeout: Duration) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let conn = Connection::open(workspace.join(DB_FILE))?;
    conn.busy_timeout(busy_timeout)?;
    init_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Starts a write transaction that takes the database write lock up front,
/// so two requests never both read a state and then race to upgrade.
pub fn begin_write(conn: &Connection) -> rusqlite::Result<Transaction<'_>> {
    Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
}

pub fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            email TEXT,
            role TEXT NOT NULL,
            supervisor_id TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_supervisor ON users(supervisor_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            category TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            lesson_count INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_courses_category_sort ON courses(category, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS lessons(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            title TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(course_id, sort_order)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS questions(
            id TEXT PRIMARY KEY,
            lesson_id TEXT NOT NULL,
            prompt TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            requires_image INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(lesson_id) REFERENCES lessons(id),
            UNIQUE(lesson_id, sort_order)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES users(id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(student_id, course_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS submissions(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            lesson_id TEXT NOT NULL,
            status TEXT NOT NULL,
            grade INTEGER,
            is_backentered INTEGER NOT NULL DEFAULT 0,
            graded_by TEXT,
            graded_at TEXT,
            submitted_at TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES users(id),
            FOREIGN KEY(lesson_id) REFERENCES lessons(id),
            UNIQUE(student_id, lesson_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submissions_status ON submissions(status, submitted_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS answers(
            id TEXT PRIMARY KEY,
            submission_id TEXT NOT NULL,
            question_id TEXT NOT NULL,
            answer_text TEXT NOT NULL DEFAULT '',
            needs_correction INTEGER,
            supervisor_feedback TEXT,
            updated_at TEXT,
            FOREIGN KEY(submission_id) REFERENCES submissions(id),
            FOREIGN KEY(question_id) REFERENCES questions(id),
            UNIQUE(submission_id, question_id)
        )",
        [],
    )?;
    // Older workspaces predate image attachments.
    ensure_answers_image_path(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_answers_submission ON answers(submission_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS certificates(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            status TEXT NOT NULL,
            certificate_number TEXT,
            is_backentered INTEGER NOT NULL DEFAULT 0,
            attested_by TEXT,
            attested_at TEXT,
            sealed_by TEXT,
            sealed_at TEXT,
            issued_at TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES users(id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(student_id, course_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_certificates_status ON certificates(status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            link TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS emails(
            id TEXT PRIMARY KEY,
            recipient TEXT NOT NULL,
            subject TEXT NOT NULL,
            body TEXT NOT NULL,
            link TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

fn ensure_answers_image_path(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "answers", "image_path")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE answers ADD COLUMN image_path TEXT", [])?;
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
