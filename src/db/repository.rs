use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tokio_rusqlite::Connection;

use crate::error::Result;
use crate::models::{
    diff_week, ChangeEvent, ChangeType, CourseRecord, NewNotice, Notice, Session, SessionStatus,
};

use super::schema::SCHEMA;

pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub async fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    // Notice operations

    /// Atomic insert-if-not-exists keyed by the content address. Returns true
    /// only when the notice was newly inserted, so repeated or concurrent
    /// extractions of the same page never double-insert and the stored
    /// title/publish_date always reflect the first observation.
    pub async fn insert_notice_if_new(&self, candidate: NewNotice) -> Result<bool> {
        let inserted = self
            .conn
            .call(move |conn| {
                let id = candidate.id();
                let n = conn.execute(
                    "INSERT OR IGNORE INTO notices (id, site_id, title, url, publish_date)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        id,
                        candidate.site_id,
                        candidate.title,
                        candidate.url,
                        candidate.publish_date
                    ],
                )?;
                Ok(n > 0)
            })
            .await?;
        Ok(inserted)
    }

    /// Idempotent: flipping the flag twice has the effect of once, and the
    /// original notified_at is preserved.
    pub async fn mark_notice_notified(&self, id: String) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE notices
                     SET notified = 1,
                         notified_at = COALESCE(notified_at, datetime('now'))
                     WHERE id = ?1",
                    params![id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn unnotified_notices(&self) -> Result<Vec<Notice>> {
        let notices = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, site_id, title, url, publish_date, first_seen, notified, notified_at
                     FROM notices WHERE notified = 0
                     ORDER BY first_seen",
                )?;
                let notices = stmt
                    .query_map([], |row| Ok(notice_from_row(row)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(notices)
            })
            .await?;
        Ok(notices)
    }

    pub async fn recent_notices(&self, limit: u32) -> Result<Vec<Notice>> {
        let notices = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, site_id, title, url, publish_date, first_seen, notified, notified_at
                     FROM notices
                     ORDER BY publish_date DESC, first_seen DESC
                     LIMIT ?1",
                )?;
                let notices = stmt
                    .query_map(params![limit], |row| Ok(notice_from_row(row)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(notices)
            })
            .await?;
        Ok(notices)
    }

    /// Notices with publish_date on or after the cutoff (YYYY-MM-DD).
    pub async fn notices_since(&self, cutoff: String) -> Result<Vec<Notice>> {
        let notices = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, site_id, title, url, publish_date, first_seen, notified, notified_at
                     FROM notices
                     WHERE publish_date >= ?1
                     ORDER BY publish_date DESC, first_seen DESC",
                )?;
                let notices = stmt
                    .query_map(params![cutoff], |row| Ok(notice_from_row(row)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(notices)
            })
            .await?;
        Ok(notices)
    }

    /// Total stored notices plus per-site counts.
    pub async fn notice_counts(&self) -> Result<(i64, Vec<(String, i64)>)> {
        let counts = self
            .conn
            .call(|conn| {
                let total: i64 =
                    conn.query_row("SELECT COUNT(*) FROM notices", [], |row| row.get(0))?;
                let mut stmt = conn.prepare(
                    "SELECT site_id, COUNT(*) FROM notices GROUP BY site_id ORDER BY site_id",
                )?;
                let per_site = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok((total, per_site))
            })
            .await?;
        Ok(counts)
    }

    /// Explicit bulk purge; the only way stored notices are ever deleted.
    pub async fn purge_notices(&self) -> Result<usize> {
        let purged = self
            .conn
            .call(|conn| {
                let n = conn.execute("DELETE FROM notices", [])?;
                Ok(n)
            })
            .await?;
        Ok(purged)
    }

    // Course record operations

    /// Reconciles a freshly fetched snapshot against the stored one for the
    /// exact (subject, academic_year, week) key: reads the previous snapshot,
    /// diffs, replaces the stored records and persists the resulting change
    /// events, all inside one transaction. Two overlapping invocations
    /// serialize on the transaction, so the second one diffs against the
    /// already-updated snapshot and records nothing. Returns the number of
    /// change events produced.
    pub async fn reconcile_week(
        &self,
        subject_id: String,
        academic_year: String,
        week: u32,
        records: Vec<CourseRecord>,
    ) -> Result<usize> {
        let count = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let previous = {
                    let mut stmt = tx.prepare(
                        "SELECT subject_id, academic_year, week, day_of_week, section_code,
                                section_name, start_time, end_time, course_name, short_name,
                                teacher, room, hours, is_practice, content_hash
                         FROM course_records
                         WHERE subject_id = ?1 AND academic_year = ?2 AND week = ?3",
                    )?;
                    let rows = stmt
                        .query_map(params![subject_id, academic_year, week], |row| {
                            Ok(course_from_row(row))
                        })?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                };
                let events = diff_week(&subject_id, &academic_year, week, &previous, &records);

                // Delete-then-insert, so slots dropped by a shrunk timetable
                // never linger.
                tx.execute(
                    "DELETE FROM course_records
                     WHERE subject_id = ?1 AND academic_year = ?2 AND week = ?3",
                    params![subject_id, academic_year, week],
                )?;
                for r in &records {
                    tx.execute(
                        "INSERT INTO course_records
                         (subject_id, academic_year, week, day_of_week, section_code,
                          section_name, start_time, end_time, course_name, short_name,
                          teacher, room, hours, is_practice, content_hash)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                        params![
                            r.subject_id,
                            r.academic_year,
                            r.week,
                            r.day_of_week,
                            r.section_code,
                            r.section_name,
                            r.start_time,
                            r.end_time,
                            r.course_name,
                            r.short_name,
                            r.teacher,
                            r.room,
                            r.hours,
                            r.is_practice,
                            r.content_hash,
                        ],
                    )?;
                }
                for e in &events {
                    tx.execute(
                        "INSERT INTO change_events
                         (subject_id, academic_year, week, day_of_week, section_code,
                          change_type, old_value, new_value, change_date)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        params![
                            e.subject_id,
                            e.academic_year,
                            e.week,
                            e.day_of_week,
                            e.section_code,
                            e.change_type.to_string(),
                            e.old_value,
                            e.new_value,
                            e.change_date,
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(events.len())
            })
            .await?;
        Ok(count)
    }

    pub async fn week_snapshot(
        &self,
        subject_id: String,
        academic_year: String,
        week: u32,
    ) -> Result<Vec<CourseRecord>> {
        let records = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT subject_id, academic_year, week, day_of_week, section_code,
                            section_name, start_time, end_time, course_name, short_name,
                            teacher, room, hours, is_practice, content_hash
                     FROM course_records
                     WHERE subject_id = ?1 AND academic_year = ?2 AND week = ?3
                     ORDER BY day_of_week, section_code",
                )?;
                let records = stmt
                    .query_map(params![subject_id, academic_year, week], |row| {
                        Ok(course_from_row(row))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await?;
        Ok(records)
    }

    // Change event operations

    pub async fn unnotified_change_events(&self) -> Result<Vec<ChangeEvent>> {
        let events = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, subject_id, academic_year, week, day_of_week, section_code,
                            change_type, old_value, new_value, change_date, detected_at, notified
                     FROM change_events WHERE notified = 0
                     ORDER BY detected_at",
                )?;
                let events = stmt
                    .query_map([], |row| Ok(change_from_row(row)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(events)
            })
            .await?;
        Ok(events)
    }

    pub async fn mark_change_notified(&self, id: i64) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE change_events SET notified = 1 WHERE id = ?1",
                    params![id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // Session cache

    pub async fn save_session(&self, session: Session) -> Result<()> {
        let cookies = serde_json::to_string(&session.cookies)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO sessions
                     (subject_id, cookies, acquired_at, expires_at, status)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        session.subject_id,
                        cookies,
                        session.acquired_at.to_rfc3339(),
                        session.expires_at.to_rfc3339(),
                        status_str(session.status),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn load_session(&self, subject_id: String) -> Result<Option<Session>> {
        let session = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT subject_id, cookies, acquired_at, expires_at, status
                     FROM sessions WHERE subject_id = ?1",
                )?;
                let session = stmt
                    .query_row(params![subject_id], |row| Ok(session_from_row(row)))
                    .optional()?;
                Ok(session)
            })
            .await?;
        Ok(session.flatten())
    }

    pub async fn delete_session(&self, subject_id: String) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM sessions WHERE subject_id = ?1",
                    params![subject_id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    // Try RFC3339 first (e.g., "2026-01-11T12:34:56+00:00")
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Try SQLite datetime format (e.g., "2026-01-11 12:34:56")
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

fn status_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Active => "active",
        SessionStatus::Expired => "expired",
        SessionStatus::Invalid => "invalid",
    }
}

fn notice_from_row(row: &Row) -> Notice {
    Notice {
        id: row.get(0).unwrap(),
        site_id: row.get(1).unwrap(),
        title: row.get(2).unwrap(),
        url: row.get(3).unwrap(),
        publish_date: row.get(4).unwrap(),
        first_seen: row
            .get::<_, String>(5)
            .ok()
            .and_then(|s| parse_datetime(&s))
            .unwrap_or_else(Utc::now),
        notified: row.get::<_, i64>(6).unwrap() != 0,
        notified_at: row
            .get::<_, Option<String>>(7)
            .unwrap()
            .and_then(|s| parse_datetime(&s)),
    }
}

fn course_from_row(row: &Row) -> CourseRecord {
    CourseRecord {
        subject_id: row.get(0).unwrap(),
        academic_year: row.get(1).unwrap(),
        week: row.get(2).unwrap(),
        day_of_week: row.get(3).unwrap(),
        section_code: row.get(4).unwrap(),
        section_name: row.get(5).unwrap(),
        start_time: row.get(6).unwrap(),
        end_time: row.get(7).unwrap(),
        course_name: row.get(8).unwrap(),
        short_name: row.get(9).unwrap(),
        teacher: row.get(10).unwrap(),
        room: row.get(11).unwrap(),
        hours: row.get(12).unwrap(),
        is_practice: row.get::<_, i64>(13).unwrap() != 0,
        content_hash: row.get(14).unwrap(),
    }
}

fn change_from_row(row: &Row) -> ChangeEvent {
    let change_type = match row.get::<_, String>(6).unwrap().as_str() {
        "added" => ChangeType::Added,
        "removed" => ChangeType::Removed,
        _ => ChangeType::Modified,
    };
    ChangeEvent {
        id: row.get(0).unwrap(),
        subject_id: row.get(1).unwrap(),
        academic_year: row.get(2).unwrap(),
        week: row.get(3).unwrap(),
        day_of_week: row.get(4).unwrap(),
        section_code: row.get(5).unwrap(),
        change_type,
        old_value: row.get(7).unwrap(),
        new_value: row.get(8).unwrap(),
        change_date: row.get(9).unwrap(),
        detected_at: row
            .get::<_, String>(10)
            .ok()
            .and_then(|s| parse_datetime(&s))
            .unwrap_or_else(Utc::now),
        notified: row.get::<_, i64>(11).unwrap() != 0,
    }
}

fn session_from_row(row: &Row) -> Option<Session> {
    let cookies: String = row.get(1).unwrap();
    let cookies = serde_json::from_str(&cookies).ok()?;
    let status = match row.get::<_, String>(4).unwrap().as_str() {
        "active" => SessionStatus::Active,
        "expired" => SessionStatus::Expired,
        _ => SessionStatus::Invalid,
    };
    Some(Session {
        subject_id: row.get(0).unwrap(),
        cookies,
        acquired_at: row
            .get::<_, String>(2)
            .ok()
            .and_then(|s| parse_datetime(&s))
            .unwrap_or_else(Utc::now),
        expires_at: row
            .get::<_, String>(3)
            .ok()
            .and_then(|s| parse_datetime(&s))
            .unwrap_or_else(Utc::now),
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::course_content_hash;
    use std::collections::HashMap;

    async fn test_repo() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let repo = Repository::new(path.to_str().unwrap()).await.unwrap();
        (dir, repo)
    }

    fn candidate(site: &str, url: &str) -> NewNotice {
        NewNotice {
            site_id: site.to_string(),
            title: "关于2024年端午节放假安排的通知".to_string(),
            url: url.to_string(),
            publish_date: "2024-06-05".to_string(),
        }
    }

    fn record(day: u8, section: &str, course: &str, teacher: &str) -> CourseRecord {
        let hash = course_content_hash("2024-2025", 7, day, section, course, teacher, "信息楼301");
        CourseRecord {
            subject_id: "2023001".to_string(),
            academic_year: "2024-2025".to_string(),
            week: 7,
            day_of_week: day,
            section_code: section.to_string(),
            section_name: format!("第{}节", section),
            start_time: "08:00".to_string(),
            end_time: "08:45".to_string(),
            course_name: course.to_string(),
            short_name: course.to_string(),
            teacher: teacher.to_string(),
            room: "信息楼301".to_string(),
            hours: 64,
            is_practice: false,
            content_hash: hash,
        }
    }

    #[tokio::test]
    async fn insert_notice_dedups_on_content_address() {
        let (_dir, repo) = test_repo().await;
        let c = candidate("main", "https://www.nimt.edu.cn/739/1.htm");

        assert!(repo.insert_notice_if_new(c.clone()).await.unwrap());
        assert!(!repo.insert_notice_if_new(c.clone()).await.unwrap());

        // A re-render with a different title is still the same notice.
        let mut redrawn = c;
        redrawn.title = "【转发】关于2024年端午节放假安排的通知".to_string();
        assert!(!repo.insert_notice_if_new(redrawn).await.unwrap());

        let (total, per_site) = repo.notice_counts().await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(per_site, vec![("main".to_string(), 1)]);
    }

    #[tokio::test]
    async fn first_observation_wins() {
        let (_dir, repo) = test_repo().await;
        let c = candidate("main", "https://www.nimt.edu.cn/739/1.htm");
        repo.insert_notice_if_new(c.clone()).await.unwrap();

        let mut later = c.clone();
        later.title = "retitled".to_string();
        later.publish_date = "2024-06-06".to_string();
        repo.insert_notice_if_new(later).await.unwrap();

        let stored = repo.recent_notices(10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].title, c.title);
        assert_eq!(stored[0].publish_date, "2024-06-05");
    }

    #[tokio::test]
    async fn mark_notified_is_idempotent() {
        let (_dir, repo) = test_repo().await;
        let c = candidate("main", "https://www.nimt.edu.cn/739/2.htm");
        repo.insert_notice_if_new(c.clone()).await.unwrap();
        let id = c.id();

        repo.mark_notice_notified(id.clone()).await.unwrap();
        let first = repo.recent_notices(1).await.unwrap()[0].clone();
        assert!(first.notified);

        repo.mark_notice_notified(id).await.unwrap();
        let second = repo.recent_notices(1).await.unwrap()[0].clone();
        assert!(second.notified);
        assert_eq!(first.notified_at, second.notified_at);
        assert!(repo.unnotified_notices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconcile_never_duplicates_slots() {
        let (_dir, repo) = test_repo().await;
        let subject = "2023001".to_string();
        let year = "2024-2025".to_string();

        let first = vec![record(1, "01", "高等数学", "王老师")];
        let events = repo
            .reconcile_week(subject.clone(), year.clone(), 7, first)
            .await
            .unwrap();
        assert_eq!(events, 1);

        // Same slot again, different content: the stored record is replaced
        // and a single modification event recorded.
        let second = vec![record(1, "01", "高等数学", "李老师"), record(2, "03", "大学英语", "张老师")];
        let events = repo
            .reconcile_week(subject.clone(), year.clone(), 7, second)
            .await
            .unwrap();
        assert_eq!(events, 2);

        let stored = repo.week_snapshot(subject, year, 7).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].teacher, "李老师");
    }

    #[tokio::test]
    async fn shrunk_snapshot_drops_stale_slots() {
        let (_dir, repo) = test_repo().await;
        let subject = "2023001".to_string();
        let year = "2024-2025".to_string();

        repo.reconcile_week(
            subject.clone(),
            year.clone(),
            7,
            vec![record(1, "01", "高等数学", "王老师"), record(3, "05", "体育", "刘老师")],
        )
        .await
        .unwrap();
        repo.reconcile_week(
            subject.clone(),
            year.clone(),
            7,
            vec![record(1, "01", "高等数学", "王老师")],
        )
        .await
        .unwrap();

        let stored = repo.week_snapshot(subject, year, 7).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].day_of_week, 1);
    }

    #[tokio::test]
    async fn overlapping_reconciles_record_each_change_once() {
        let (_dir, repo) = test_repo().await;
        let subject = "2023001".to_string();
        let year = "2024-2025".to_string();
        let snapshot = vec![record(1, "01", "高等数学", "王老师")];

        // Two runs racing over the same fetched snapshot: whichever commits
        // second diffs against the already-updated store and records nothing.
        let (a, b) = tokio::join!(
            repo.reconcile_week(subject.clone(), year.clone(), 7, snapshot.clone()),
            repo.reconcile_week(subject.clone(), year.clone(), 7, snapshot.clone()),
        );
        assert_eq!(a.unwrap() + b.unwrap(), 1);

        let pending = repo.unnotified_change_events().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].change_type, ChangeType::Added);
    }

    #[tokio::test]
    async fn notices_since_filters_on_publish_date() {
        let (_dir, repo) = test_repo().await;
        let old = candidate("main", "https://www.nimt.edu.cn/739/1.htm");
        let mut new = candidate("main", "https://www.nimt.edu.cn/739/2.htm");
        new.publish_date = "2024-06-10".to_string();
        repo.insert_notice_if_new(old).await.unwrap();
        repo.insert_notice_if_new(new).await.unwrap();

        let since = repo.notices_since("2024-06-06".to_string()).await.unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].publish_date, "2024-06-10");

        // The cutoff itself is included.
        let since = repo.notices_since("2024-06-05".to_string()).await.unwrap();
        assert_eq!(since.len(), 2);
    }

    #[tokio::test]
    async fn session_round_trips_through_cache() {
        let (_dir, repo) = test_repo().await;
        let mut cookies = HashMap::new();
        cookies.insert("JSESSIONID".to_string(), "abc".to_string());
        let session = Session::new("2023001".to_string(), cookies, 3600);

        repo.save_session(session.clone()).await.unwrap();
        let loaded = repo
            .load_session("2023001".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.cookies, session.cookies);
        assert_eq!(loaded.status, SessionStatus::Active);

        repo.delete_session("2023001".to_string()).await.unwrap();
        assert!(repo
            .load_session("2023001".to_string())
            .await
            .unwrap()
            .is_none());
    }
}
