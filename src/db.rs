use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("edusmart.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS institutions(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            address TEXT,
            phone TEXT,
            director TEXT,
            email TEXT,
            logo_ref TEXT,
            kind TEXT NOT NULL DEFAULT 'classique',
            active INTEGER NOT NULL DEFAULT 1,
            pass_minimum REAL NOT NULL DEFAULT 60.0,
            session_weights TEXT
        )",
        [],
    )?;

    // Older workspaces predate the contact and grading-policy columns.
    ensure_institutions_contact_columns(&conn)?;
    ensure_institutions_policy_columns(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subscriptions(
            id TEXT PRIMARY KEY,
            institution_id TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            FOREIGN KEY(institution_id) REFERENCES institutions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subscriptions_institution ON subscriptions(institution_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_groups(
            id TEXT PRIMARY KEY,
            institution_id TEXT NOT NULL,
            name TEXT NOT NULL,
            level TEXT,
            year_id TEXT,
            FOREIGN KEY(institution_id) REFERENCES institutions(id),
            FOREIGN KEY(year_id) REFERENCES academic_years(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_groups_institution ON class_groups(institution_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            class_group_id TEXT NOT NULL,
            name TEXT NOT NULL,
            coefficient REAL NOT NULL DEFAULT 1.0,
            pass_mark REAL NOT NULL DEFAULT 65.0,
            intra_weight REAL NOT NULL DEFAULT 0.3,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_group_id) REFERENCES class_groups(id)
        )",
        [],
    )?;
    ensure_subjects_grading_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_class_group ON subjects(class_group_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_class_group_sort ON subjects(class_group_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            institution_id TEXT NOT NULL,
            class_group_id TEXT,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            registration_no TEXT,
            birth_date TEXT,
            birth_place TEXT,
            address TEXT,
            phone TEXT,
            email TEXT,
            photo_ref TEXT,
            document_ref TEXT,
            sort_order INTEGER NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(institution_id) REFERENCES institutions(id),
            FOREIGN KEY(class_group_id) REFERENCES class_groups(id)
        )",
        [],
    )?;
    ensure_students_registration_no(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_institution ON students(institution_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_group ON students(class_group_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_group_sort ON students(class_group_id, sort_order)",
        [],
    )?;

    // Append-only: corrections are new rows, recency decides the effective
    // entry. Never UPDATE or UPSERT this table.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS score_entries(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            session INTEGER NOT NULL,
            kind TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            value REAL NOT NULL,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_score_entries_student_subject
           ON score_entries(student_id, subject_id, session)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_score_entries_subject ON score_entries(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payment_plans(
            id TEXT PRIMARY KEY,
            institution_id TEXT NOT NULL,
            name TEXT NOT NULL,
            amount REAL NOT NULL,
            frequency TEXT,
            FOREIGN KEY(institution_id) REFERENCES institutions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payment_plans_institution ON payment_plans(institution_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            plan_id TEXT NOT NULL,
            paid_on TEXT NOT NULL,
            amount_paid REAL NOT NULL,
            method TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(plan_id) REFERENCES payment_plans(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_student ON payments(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_plan ON payments(plan_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL,
            reason TEXT,
            UNIQUE(student_id, date),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_student ON attendance_records(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_date ON attendance_records(date)",
        [],
    )?;

    Ok(conn)
}

fn ensure_institutions_contact_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "institutions", "email")? {
        conn.execute("ALTER TABLE institutions ADD COLUMN email TEXT", [])?;
    }
    if !table_has_column(conn, "institutions", "logo_ref")? {
        conn.execute("ALTER TABLE institutions ADD COLUMN logo_ref TEXT", [])?;
    }
    Ok(())
}

fn ensure_institutions_policy_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "institutions", "pass_minimum")? {
        conn.execute(
            "ALTER TABLE institutions ADD COLUMN pass_minimum REAL NOT NULL DEFAULT 60.0",
            [],
        )?;
    }
    if !table_has_column(conn, "institutions", "session_weights")? {
        conn.execute("ALTER TABLE institutions ADD COLUMN session_weights TEXT", [])?;
    }
    Ok(())
}

fn ensure_subjects_grading_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "subjects", "pass_mark")? {
        conn.execute(
            "ALTER TABLE subjects ADD COLUMN pass_mark REAL NOT NULL DEFAULT 65.0",
            [],
        )?;
    }
    if !table_has_column(conn, "subjects", "intra_weight")? {
        conn.execute(
            "ALTER TABLE subjects ADD COLUMN intra_weight REAL NOT NULL DEFAULT 0.3",
            [],
        )?;
    }
    Ok(())
}

fn ensure_students_registration_no(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "registration_no")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN registration_no TEXT", [])?;
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
