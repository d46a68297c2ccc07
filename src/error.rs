use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<toml::de::Error> for AppError {
    fn from(e: toml::de::Error) -> Self {
        AppError::Config(e.to_string())
    }
}

/// Portal login failures. These gate whether downstream fetches can run,
/// so they are always surfaced to the caller rather than swallowed.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("network error during login: {0}")]
    Network(#[from] reqwest::Error),

    #[error("portal rejected the credentials")]
    InvalidCredentials,

    #[error("portal requires a captcha; cannot log in unattended")]
    CaptchaRequired,

    #[error("login redirect carried no session cookies")]
    NoSession,

    #[error("credential encryption unavailable: {0}")]
    Encryption(String),

    #[error("login failed: {0}")]
    Unknown(String),
}

/// Timetable endpoint failures.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error fetching timetable: {0}")]
    Network(#[from] reqwest::Error),

    #[error("timetable request returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("portal returned ret={ret}: {msg}")]
    Portal { ret: i64, msg: String },

    #[error("malformed timetable payload: {0}")]
    Malformed(String),
}
