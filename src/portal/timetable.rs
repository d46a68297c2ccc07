use std::time::Duration;

use regex::Regex;
use reqwest::Client;
use serde::Deserialize;

use crate::config::PortalConfig;
use crate::error::FetchError;
use crate::models::{course_content_hash, CourseRecord, Session};

/// Campus section codes with their display times. Unknown codes yield empty
/// times, never an error.
const SECTION_TIMES: &[(&str, &str, &str)] = &[
    ("01", "08:00", "08:45"),
    ("02", "08:55", "09:40"),
    ("03", "10:00", "10:45"),
    ("04", "10:55", "11:40"),
    ("05", "13:30", "14:15"),
    ("06", "14:25", "15:10"),
    ("07", "15:30", "16:15"),
    ("08", "16:25", "17:10"),
    ("09", "18:30", "19:15"),
    ("10", "19:25", "20:10"),
    ("11", "20:20", "21:05"),
];

/// JSON envelope returned by the timetable endpoint; ret == 0 is success.
#[derive(Debug, Deserialize)]
struct Envelope {
    ret: i64,
    #[serde(default)]
    msg: String,
    data: Option<TimetablePayload>,
}

#[derive(Debug, Deserialize)]
struct TimetablePayload {
    #[serde(default)]
    sections: Vec<RawSection>,
}

/// One section row: a per-day-of-week list of zero or more course entries.
#[derive(Debug, Deserialize)]
struct RawSection {
    #[serde(rename = "sectionCode")]
    code: String,
    #[serde(rename = "sectionName", default)]
    name: String,
    #[serde(default)]
    days: Vec<Vec<RawSlot>>,
}

/// Empty slots arrive either as the placeholder string "-" or as entries
/// with an empty name.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawSlot {
    Course(RawCourse),
    Placeholder(String),
}

#[derive(Debug, Deserialize)]
struct RawCourse {
    #[serde(rename = "courseName", default)]
    name: String,
    #[serde(default)]
    teacher: String,
    #[serde(default)]
    room: String,
    #[serde(rename = "isPractice", default)]
    practice: bool,
}

/// Fetches one week's timetable and flattens it into course records.
pub struct TimetableClient {
    client: Client,
    config: PortalConfig,
}

impl TimetableClient {
    pub fn new(config: PortalConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, config })
    }

    /// Authenticated POST for the given week; requires an active session.
    pub async fn fetch_week(
        &self,
        session: &Session,
        week: u32,
    ) -> Result<Vec<CourseRecord>, FetchError> {
        let url = format!("{}{}", self.config.base_url, self.config.timetable_path);
        let week_param = week.to_string();
        let response = self
            .client
            .post(&url)
            .header("Cookie", session.cookie_header())
            .form(&[("type", "student"), ("week", week_param.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status()));
        }

        let body = response.text().await?;
        let envelope: Envelope =
            serde_json::from_str(&body).map_err(|e| FetchError::Malformed(e.to_string()))?;

        if envelope.ret != 0 {
            return Err(FetchError::Portal {
                ret: envelope.ret,
                msg: envelope.msg,
            });
        }
        let payload = envelope
            .data
            .ok_or_else(|| FetchError::Malformed("success envelope without data".to_string()))?;

        Ok(normalize(
            &session.subject_id,
            &self.config.academic_year,
            week,
            payload,
        ))
    }
}

/// Flattens the nested payload into per-slot records. Placeholder slots are
/// dropped, never stored.
fn normalize(
    subject_id: &str,
    academic_year: &str,
    week: u32,
    payload: TimetablePayload,
) -> Vec<CourseRecord> {
    let hours_re = Regex::new(r"[（(]\s*(\d+)\s*(?:h|H|学时)\s*[）)]\s*$").expect("valid pattern");

    let mut records = Vec::new();
    for section in payload.sections {
        let (start_time, end_time) = section_times(&section.code);
        for (i, day) in section.days.iter().enumerate() {
            let day_of_week = (i + 1) as u8;
            if day_of_week > 7 {
                break;
            }
            for slot in day {
                let RawSlot::Course(course) = slot else {
                    continue;
                };
                let name = course.name.trim();
                if name.is_empty() || name == "-" {
                    continue;
                }
                let (short_name, hours) = split_hours(name, &hours_re);
                let content_hash = course_content_hash(
                    academic_year,
                    week,
                    day_of_week,
                    &section.code,
                    name,
                    &course.teacher,
                    &course.room,
                );
                records.push(CourseRecord {
                    subject_id: subject_id.to_string(),
                    academic_year: academic_year.to_string(),
                    week,
                    day_of_week,
                    section_code: section.code.clone(),
                    section_name: section.name.clone(),
                    start_time: start_time.to_string(),
                    end_time: end_time.to_string(),
                    course_name: name.to_string(),
                    short_name,
                    teacher: course.teacher.trim().to_string(),
                    room: course.room.trim().to_string(),
                    hours,
                    is_practice: course.practice,
                    content_hash,
                });
            }
        }
    }
    records
}

fn section_times(code: &str) -> (&'static str, &'static str) {
    SECTION_TIMES
        .iter()
        .find(|(c, _, _)| *c == code)
        .map(|(_, start, end)| (*start, *end))
        .unwrap_or(("", ""))
}

/// Extracts a parenthesized hour-count suffix like "(64h)" or "（64学时）",
/// returning the stripped short name and the hours (0 if absent).
fn split_hours(course_name: &str, hours_re: &Regex) -> (String, u32) {
    if let Some(caps) = hours_re.captures(course_name) {
        let hours = caps
            .get(1)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        let short = hours_re.replace(course_name, "").trim().to_string();
        return (short, hours);
    }
    (course_name.to_string(), 0)
}

/// Splits a room string into a building token (a CJK run ending in the 楼
/// marker) and the remaining room number. Unparsable rooms pass through
/// unchanged as the building.
pub fn split_room(room: &str) -> (String, String) {
    let re = Regex::new(r"^([\p{Han}]*楼)\s*(.*)$").expect("valid pattern");
    match re.captures(room) {
        Some(caps) => (
            caps.get(1).map(|m| m.as_str()).unwrap_or("").to_string(),
            caps.get(2).map(|m| m.as_str()).unwrap_or("").to_string(),
        ),
        None => (room.to_string(), String::new()),
    }
}
