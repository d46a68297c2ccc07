pub const SCHEMA: &str = r#"
-- notices table (keyed by content address over site_id + url)
CREATE TABLE IF NOT EXISTS notices (
    id TEXT PRIMARY KEY,
    site_id TEXT NOT NULL,
    title TEXT NOT NULL,
    url TEXT NOT NULL,
    publish_date TEXT NOT NULL,
    first_seen TEXT NOT NULL DEFAULT (datetime('now')),
    notified INTEGER NOT NULL DEFAULT 0,
    notified_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_notices_site_id ON notices(site_id);
CREATE INDEX IF NOT EXISTS idx_notices_publish_date ON notices(publish_date DESC);
CREATE INDEX IF NOT EXISTS idx_notices_notified ON notices(notified);

-- course_records table (one row per occupied timetable slot)
CREATE TABLE IF NOT EXISTS course_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subject_id TEXT NOT NULL,
    academic_year TEXT NOT NULL,
    week INTEGER NOT NULL,
    day_of_week INTEGER NOT NULL,
    section_code TEXT NOT NULL,
    section_name TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    course_name TEXT NOT NULL,
    short_name TEXT NOT NULL,
    teacher TEXT NOT NULL,
    room TEXT NOT NULL,
    hours INTEGER NOT NULL DEFAULT 0,
    is_practice INTEGER NOT NULL DEFAULT 0,
    content_hash TEXT NOT NULL,
    UNIQUE(subject_id, academic_year, week, day_of_week, section_code)
);

CREATE INDEX IF NOT EXISTS idx_course_records_snapshot
    ON course_records(subject_id, academic_year, week);

-- change_events table
CREATE TABLE IF NOT EXISTS change_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subject_id TEXT NOT NULL,
    academic_year TEXT NOT NULL,
    week INTEGER NOT NULL,
    day_of_week INTEGER NOT NULL,
    section_code TEXT NOT NULL,
    change_type TEXT NOT NULL,
    old_value TEXT,
    new_value TEXT,
    change_date TEXT NOT NULL,
    detected_at TEXT NOT NULL DEFAULT (datetime('now')),
    notified INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_change_events_subject ON change_events(subject_id);
CREATE INDEX IF NOT EXISTS idx_change_events_notified ON change_events(notified);

-- sessions table (cached portal cookie sets, one per subject)
CREATE TABLE IF NOT EXISTS sessions (
    subject_id TEXT PRIMARY KEY,
    cookies TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    status TEXT NOT NULL
);
"#;
