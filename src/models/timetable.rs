use std::collections::HashMap;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::notice::hex_digest;

/// One occupied slot of a weekly timetable, flattened from the portal's
/// nested payload. At most one record per
/// (subject_id, academic_year, week, day_of_week, section_code).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseRecord {
    pub subject_id: String,
    pub academic_year: String,
    pub week: u32,
    /// 1 = Monday .. 7 = Sunday.
    pub day_of_week: u8,
    pub section_code: String,
    pub section_name: String,
    pub start_time: String,
    pub end_time: String,
    pub course_name: String,
    pub short_name: String,
    pub teacher: String,
    pub room: String,
    pub hours: u32,
    pub is_practice: bool,
    pub content_hash: String,
}

impl CourseRecord {
    /// The change-detection key within one (subject, year, week) snapshot.
    pub fn slot(&self) -> (u8, &str) {
        (self.day_of_week, self.section_code.as_str())
    }
}

/// Row fingerprint over the semantically-identifying fields. Two independent
/// fetches of an unchanged slot hash identically.
pub fn course_content_hash(
    academic_year: &str,
    week: u32,
    day_of_week: u8,
    section_code: &str,
    course_name: &str,
    teacher: &str,
    room: &str,
) -> String {
    let mut hasher = Sha256::new();
    for field in [
        academic_year,
        &week.to_string(),
        &day_of_week.to_string(),
        section_code,
        course_name,
        teacher,
        room,
    ] {
        hasher.update(field.as_bytes());
        hasher.update(b"|");
    }
    hex_digest(&hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeType::Added => write!(f, "added"),
            ChangeType::Removed => write!(f, "removed"),
            ChangeType::Modified => write!(f, "modified"),
        }
    }
}

/// A freshly-detected difference, before it has been persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChangeEvent {
    pub subject_id: String,
    pub academic_year: String,
    pub week: u32,
    pub day_of_week: u8,
    pub section_code: String,
    pub change_type: ChangeType,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub change_date: String,
}

/// A detected difference between two timetable snapshots for the same
/// subject and week. Produced only by the change detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: i64,
    pub subject_id: String,
    pub academic_year: String,
    pub week: u32,
    pub day_of_week: u8,
    pub section_code: String,
    pub change_type: ChangeType,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub change_date: String,
    pub detected_at: DateTime<Utc>,
    pub notified: bool,
}

fn describe(record: &CourseRecord) -> String {
    let mut parts = vec![record.course_name.clone()];
    if !record.teacher.is_empty() {
        parts.push(record.teacher.clone());
    }
    if !record.room.is_empty() {
        parts.push(record.room.clone());
    }
    parts.join(" ")
}

/// Slot-by-slot set difference between the previously stored snapshot and a
/// freshly fetched one for the same (subject, year, week) key. Unchanged
/// slots produce no events.
pub fn diff_week(
    subject_id: &str,
    academic_year: &str,
    week: u32,
    old: &[CourseRecord],
    new: &[CourseRecord],
) -> Vec<NewChangeEvent> {
    let old_by_slot: HashMap<(u8, &str), &CourseRecord> =
        old.iter().map(|r| (r.slot(), r)).collect();
    let new_by_slot: HashMap<(u8, &str), &CourseRecord> =
        new.iter().map(|r| (r.slot(), r)).collect();
    let today = Local::now().format("%Y-%m-%d").to_string();

    let event = |day: u8, section: &str, change_type, old_value, new_value| NewChangeEvent {
        subject_id: subject_id.to_string(),
        academic_year: academic_year.to_string(),
        week,
        day_of_week: day,
        section_code: section.to_string(),
        change_type,
        old_value,
        new_value,
        change_date: today.clone(),
    };

    let mut events = Vec::new();
    for (&(day, section), &old_record) in &old_by_slot {
        match new_by_slot.get(&(day, section)) {
            None => events.push(event(
                day,
                section,
                ChangeType::Removed,
                Some(describe(old_record)),
                None,
            )),
            Some(new_record) if new_record.content_hash != old_record.content_hash => {
                events.push(event(
                    day,
                    section,
                    ChangeType::Modified,
                    Some(describe(old_record)),
                    Some(describe(new_record)),
                ));
            }
            Some(_) => {}
        }
    }
    for (&(day, section), &new_record) in &new_by_slot {
        if !old_by_slot.contains_key(&(day, section)) {
            events.push(event(
                day,
                section,
                ChangeType::Added,
                None,
                Some(describe(new_record)),
            ));
        }
    }

    events.sort_by(|a, b| {
        (a.day_of_week, a.section_code.clone()).cmp(&(b.day_of_week, b.section_code.clone()))
    });
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(day: u8, section: &str, course: &str, teacher: &str, room: &str) -> CourseRecord {
        let hash = course_content_hash("2024-2025", 7, day, section, course, teacher, room);
        CourseRecord {
            subject_id: "2023001".to_string(),
            academic_year: "2024-2025".to_string(),
            week: 7,
            day_of_week: day,
            section_code: section.to_string(),
            section_name: String::new(),
            start_time: String::new(),
            end_time: String::new(),
            course_name: course.to_string(),
            short_name: course.to_string(),
            teacher: teacher.to_string(),
            room: room.to_string(),
            hours: 0,
            is_practice: false,
            content_hash: hash,
        }
    }

    #[test]
    fn diff_detects_modified_and_added() {
        let old = vec![
            record(1, "01", "高等数学", "王老师", "信息楼301"),
            record(2, "03", "大学英语", "张老师", "外语楼102"),
        ];
        let new = vec![
            record(1, "01", "高等数学", "王老师", "信息楼301"),
            record(2, "03", "大学英语", "李老师", "外语楼102"),
            record(3, "05", "体育", "刘老师", "操场"),
        ];

        let events = diff_week("2023001", "2024-2025", 7, &old, &new);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].change_type, ChangeType::Modified);
        assert_eq!(events[0].day_of_week, 2);
        assert!(events[0].old_value.as_ref().unwrap().contains("张老师"));
        assert!(events[0].new_value.as_ref().unwrap().contains("李老师"));
        assert_eq!(events[1].change_type, ChangeType::Added);
        assert_eq!(events[1].day_of_week, 3);
    }

    #[test]
    fn diff_detects_removed() {
        let old = vec![record(1, "01", "高等数学", "王老师", "信息楼301")];
        let events = diff_week("2023001", "2024-2025", 7, &old, &[]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change_type, ChangeType::Removed);
    }

    #[test]
    fn identical_snapshots_produce_no_events() {
        let old = vec![
            record(1, "01", "高等数学", "王老师", "信息楼301"),
            record(2, "03", "大学英语", "张老师", "外语楼102"),
        ];
        let new = old.clone();
        assert!(diff_week("2023001", "2024-2025", 7, &old, &new).is_empty());
    }

    #[test]
    fn hash_is_stable_across_calls() {
        let a = course_content_hash("2024-2025", 7, 1, "01", "高等数学", "王老师", "信息楼301");
        let b = course_content_hash("2024-2025", 7, 1, "01", "高等数学", "王老师", "信息楼301");
        assert_eq!(a, b);
    }

    #[test]
    fn hash_tracks_every_identifying_field() {
        let base = course_content_hash("2024-2025", 7, 1, "01", "高等数学", "王老师", "信息楼301");
        assert_ne!(
            base,
            course_content_hash("2024-2025", 8, 1, "01", "高等数学", "王老师", "信息楼301")
        );
        assert_ne!(
            base,
            course_content_hash("2024-2025", 7, 1, "01", "高等数学", "李老师", "信息楼301")
        );
        assert_ne!(
            base,
            course_content_hash("2024-2025", 7, 1, "01", "高等数学", "王老师", "信息楼302")
        );
    }
}
