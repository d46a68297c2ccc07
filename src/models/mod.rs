mod notice;
mod session;
mod timetable;

pub use notice::{notice_id, NewNotice, Notice};
pub use session::{Session, SessionStatus};
pub use timetable::{
    course_content_hash, diff_week, ChangeEvent, ChangeType, CourseRecord, NewChangeEvent,
};

/// A delivery target resolved from the push-target configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    User(String),
    Group(String),
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recipient::User(id) => write!(f, "user:{}", id),
            Recipient::Group(id) => write!(f, "group:{}", id),
        }
    }
}
