use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{AppError, Result};

/// Immutable application configuration, constructed once at startup and
/// passed into each component. Never re-read mid-cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    #[serde(default = "default_timetable_interval")]
    pub timetable_check_interval_secs: u64,

    /// Courtesy delay between consecutive site fetches, not a correctness
    /// requirement.
    #[serde(default = "default_fetch_delay")]
    pub fetch_delay_ms: u64,

    #[serde(default)]
    pub sites: Vec<SiteConfig>,

    #[serde(default)]
    pub push: PushTargets,

    #[serde(default)]
    pub portal: PortalConfig,

    /// Bound portal identities. Secrets here are base64-obfuscated, not
    /// encrypted at rest; see the README before treating this as secure.
    #[serde(default)]
    pub subjects: Vec<SubjectBinding>,
}

/// Everything the extractor needs to know about one monitored listing page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub id: String,
    pub name: String,
    pub url: String,
    /// Base for resolving relative links; defaults to the listing URL's origin.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Class-name hint for the listing container.
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub remark: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushTargets {
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    #[serde(default = "default_portal_base")]
    pub base_url: String,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_timetable_path")]
    pub timetable_path: String,
    /// Authenticated endpoint probed when cookie presence alone is ambiguous.
    #[serde(default = "default_probe_path")]
    pub probe_path: String,
    /// PEM-encoded RSA public key published by the portal for login.
    #[serde(default)]
    pub public_key_pem: Option<String>,
    /// Plaintext login is only ever attempted when this is set and no usable
    /// public key exists.
    #[serde(default)]
    pub allow_plaintext_login: bool,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: i64,
    #[serde(default = "default_academic_year")]
    pub academic_year: String,
    /// First Monday of the semester (YYYY-MM-DD); used to derive the
    /// current teaching week.
    #[serde(default = "default_semester_start")]
    pub semester_start: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectBinding {
    pub subject_id: String,
    /// base64-obfuscated portal secret.
    pub secret: String,
}

fn default_db_path() -> String {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("campus-watch");
    std::fs::create_dir_all(&data_dir).ok();
    data_dir.join("campus.db").to_string_lossy().to_string()
}

fn default_check_interval() -> u64 {
    300
}

fn default_timetable_interval() -> u64 {
    3600
}

fn default_fetch_delay() -> u64 {
    1500
}

fn default_true() -> bool {
    true
}

fn default_portal_base() -> String {
    "https://jwc.nimt.edu.cn".to_string()
}

fn default_login_path() -> String {
    "/login".to_string()
}

fn default_timetable_path() -> String {
    "/student/curriculum/callback".to_string()
}

fn default_probe_path() -> String {
    "/student/index".to_string()
}

fn default_timeout() -> u64 {
    15
}

fn default_session_ttl() -> i64 {
    3600
}

fn default_academic_year() -> String {
    "2024-2025".to_string()
}

fn default_semester_start() -> String {
    "2025-02-24".to_string()
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: default_portal_base(),
            login_path: default_login_path(),
            timetable_path: default_timetable_path(),
            probe_path: default_probe_path(),
            public_key_pem: None,
            allow_plaintext_login: false,
            timeout_secs: default_timeout(),
            session_ttl_secs: default_session_ttl(),
            academic_year: default_academic_year(),
            semester_start: default_semester_start(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            check_interval_secs: default_check_interval(),
            timetable_check_interval_secs: default_timetable_interval(),
            fetch_delay_ms: default_fetch_delay(),
            sites: vec![
                SiteConfig {
                    id: "main".to_string(),
                    name: "学校官网通知公告".to_string(),
                    url: "https://www.nimt.edu.cn/739/list.htm".to_string(),
                    base_url: Some("https://www.nimt.edu.cn".to_string()),
                    selector: None,
                    enabled: true,
                    remark: String::new(),
                },
                SiteConfig {
                    id: "jiaowu".to_string(),
                    name: "教务处通知".to_string(),
                    url: "https://www.nimt.edu.cn/jiaowu/396/list.htm".to_string(),
                    base_url: Some("https://www.nimt.edu.cn".to_string()),
                    selector: None,
                    enabled: true,
                    remark: String::new(),
                },
            ],
            push: PushTargets::default(),
            portal: PortalConfig::default(),
            subjects: Vec::new(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("campus-watch")
            .join("config.toml")
    }
}

impl SiteConfig {
    /// Base URL for relative-link resolution, falling back to the listing
    /// URL's origin.
    pub fn link_base(&self) -> String {
        if let Some(base) = &self.base_url {
            return base.trim_end_matches('/').to_string();
        }
        match url::Url::parse(&self.url) {
            Ok(u) => format!("{}://{}", u.scheme(), u.host_str().unwrap_or_default()),
            Err(_) => self.url.clone(),
        }
    }
}
