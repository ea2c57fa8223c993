use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "campus.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            role TEXT NOT NULL CHECK(role IN ('student', 'faculty', 'admin')),
            password_salt TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            email TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS departments(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            has_sections INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_details(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            usn TEXT NOT NULL UNIQUE,
            dept_id TEXT NOT NULL,
            semester INTEGER NOT NULL,
            section TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(dept_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_details_class
         ON student_details(dept_id, semester, section)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS faculty_details(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            dept_id TEXT,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(dept_id) REFERENCES departments(id)
        )",
        [],
    )?;
    ensure_faculty_designation(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_offerings(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            dept_id TEXT NOT NULL,
            semester INTEGER NOT NULL,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(dept_id) REFERENCES departments(id),
            UNIQUE(subject_id, dept_id, semester)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_offerings_dept_sem
         ON subject_offerings(dept_id, semester)",
        [],
    )?;

    // section is '' for departments without sections.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS faculty_assignments(
            id TEXT PRIMARY KEY,
            offering_id TEXT NOT NULL,
            faculty_id TEXT NOT NULL,
            section TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(offering_id) REFERENCES subject_offerings(id),
            FOREIGN KEY(faculty_id) REFERENCES faculty_details(id),
            UNIQUE(offering_id, faculty_id, section)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_faculty_assignments_offering
         ON faculty_assignments(offering_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable_slots(
            id TEXT PRIMARY KEY,
            dept_id TEXT NOT NULL,
            semester INTEGER NOT NULL,
            section TEXT NOT NULL DEFAULT '',
            day_of_week TEXT NOT NULL,
            period_number INTEGER NOT NULL,
            assignment_id TEXT NOT NULL,
            FOREIGN KEY(dept_id) REFERENCES departments(id),
            FOREIGN KEY(assignment_id) REFERENCES faculty_assignments(id),
            UNIQUE(dept_id, semester, section, day_of_week, period_number)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_sessions(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            session_date TEXT NOT NULL,
            day_of_week TEXT NOT NULL,
            period_number INTEGER NOT NULL,
            FOREIGN KEY(assignment_id) REFERENCES faculty_assignments(id),
            UNIQUE(assignment_id, session_date, period_number)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('present', 'absent')),
            updated_at TEXT,
            FOREIGN KEY(session_id) REFERENCES class_sessions(id),
            FOREIGN KEY(student_id) REFERENCES student_details(id),
            UNIQUE(session_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks(
            id TEXT PRIMARY KEY,
            offering_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            assessment TEXT NOT NULL,
            score REAL NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(offering_id) REFERENCES subject_offerings(id),
            FOREIGN KEY(student_id) REFERENCES student_details(id),
            UNIQUE(offering_id, student_id, assessment)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_student ON marks(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS circulars(
            id TEXT PRIMARY KEY,
            author_user_id TEXT NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            audience TEXT NOT NULL
                CHECK(audience IN ('all', 'students', 'faculty', 'specific_dept')),
            dept_id TEXT,
            attachment_url TEXT,
            posted_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(author_user_id) REFERENCES users(id),
            FOREIGN KEY(dept_id) REFERENCES departments(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notes(
            id TEXT PRIMARY KEY,
            offering_id TEXT NOT NULL,
            author_user_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            file_url TEXT NOT NULL,
            uploaded_at TEXT NOT NULL,
            FOREIGN KEY(offering_id) REFERENCES subject_offerings(id),
            FOREIGN KEY(author_user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notes_offering ON notes(offering_id)",
        [],
    )?;

    // read_at stays NULL until the recipient marks the row read.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at TEXT NOT NULL,
            read_at TEXT,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_user
         ON notifications(user_id, created_at)",
        [],
    )?;

    Ok(conn)
}

// Workspaces created before profiles carried a designation.
fn ensure_faculty_designation(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "faculty_details", "designation")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE faculty_details ADD COLUMN designation TEXT", [])?;
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

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn user_count(conn: &Connection) -> anyhow::Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?)
}
