mod session;
mod timetable;

pub use session::{obfuscate_secret, reveal_secret, SessionManager};
pub use timetable::{split_room, TimetableClient};
