use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use reqwest::header::SET_COOKIE;
use reqwest::{redirect, Client, StatusCode};
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use tokio::sync::Mutex;

use crate::config::{PortalConfig, SubjectBinding};
use crate::db::Repository;
use crate::error::AuthError;
use crate::models::{Session, SessionStatus};

/// Response-body markers the portal uses on failed logins.
const CREDENTIAL_ERROR_MARKERS: &[&str] = &["用户名或密码错误", "密码错误", "账号不存在"];
const CAPTCHA_MARKERS: &[&str] = &["验证码", "captcha"];

/// Owns the per-subject login state machine and the cached cookie sets.
/// No other component writes sessions.
pub struct SessionManager {
    client: Client,
    config: PortalConfig,
    subjects: Vec<SubjectBinding>,
    repo: Arc<Repository>,
    public_key: Option<RsaPublicKey>,
    cache: Mutex<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new(
        config: PortalConfig,
        subjects: Vec<SubjectBinding>,
        repo: Arc<Repository>,
    ) -> Result<Self, AuthError> {
        // Redirects stay unfollowed: a 302 on the login endpoint is the
        // success signal and must be observed directly.
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .redirect(redirect::Policy::none())
            .build()?;

        let public_key = match &config.public_key_pem {
            Some(pem) => match RsaPublicKey::from_public_key_pem(pem) {
                Ok(key) => Some(key),
                Err(e) => {
                    tracing::warn!("portal public key is unusable: {}", e);
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            client,
            config,
            subjects,
            repo,
            public_key,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Returns a session inside the freshness window, logging in again with
    /// the stored secret when the cached one has aged out. Re-login failures
    /// propagate; a stale session is never silently returned.
    pub async fn ensure_active(&self, subject_id: &str) -> Result<Session, AuthError> {
        let now = Utc::now();

        {
            let mut cache = self.cache.lock().await;
            if let Some(session) = cache.get_mut(subject_id) {
                session.refresh_status(now);
                if session.is_fresh(now) {
                    return Ok(session.clone());
                }
            }
        }

        // A session persisted by an earlier run is ambiguous: cookies may
        // have been invalidated server-side, so probe before trusting it.
        if let Ok(Some(mut session)) = self.repo.load_session(subject_id.to_string()).await {
            session.refresh_status(now);
            if session.is_fresh(now) && self.probe(&session).await.unwrap_or(false) {
                self.cache
                    .lock()
                    .await
                    .insert(subject_id.to_string(), session.clone());
                return Ok(session);
            }
            if let Err(e) = self.repo.delete_session(subject_id.to_string()).await {
                tracing::warn!("failed to drop stale session for {}: {}", subject_id, e);
            }
        }

        let secret = self
            .subjects
            .iter()
            .find(|s| s.subject_id == subject_id)
            .and_then(|s| reveal_secret(&s.secret))
            .ok_or_else(|| {
                AuthError::Unknown(format!("no usable credential bound for {}", subject_id))
            })?;

        self.login(subject_id, &secret).await
    }

    /// Encrypted-credential login. Success is an HTTP redirect carrying at
    /// least one session cookie; a redirect without cookies is NoSession,
    /// never success.
    pub async fn login(&self, subject_id: &str, secret: &str) -> Result<Session, AuthError> {
        let password = self.transform_secret(secret)?;
        let url = format!("{}{}", self.config.base_url, self.config.login_path);

        let response = self
            .client
            .post(&url)
            .form(&[
                ("username", subject_id),
                ("password", password.as_str()),
                ("vcode", ""),
                ("captcha", ""),
                ("rememberMe", "on"),
            ])
            .send()
            .await?;

        if response.status().is_redirection() {
            let cookies = collect_cookies(response.headers().get_all(SET_COOKIE).iter());
            if cookies.is_empty() {
                return Err(AuthError::NoSession);
            }
            let session = Session::new(
                subject_id.to_string(),
                cookies,
                self.config.session_ttl_secs,
            );
            if let Err(e) = self.repo.save_session(session.clone()).await {
                tracing::warn!("failed to persist session for {}: {}", subject_id, e);
            }
            self.cache
                .lock()
                .await
                .insert(subject_id.to_string(), session.clone());
            tracing::info!("logged in subject {}", subject_id);
            return Ok(session);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, &body))
    }

    /// Drops a subject's session from cache and disk after a rejected probe
    /// or authenticated request.
    pub async fn invalidate(&self, subject_id: &str) {
        let mut cache = self.cache.lock().await;
        if let Some(session) = cache.get_mut(subject_id) {
            session.status = SessionStatus::Invalid;
        }
        cache.remove(subject_id);
        drop(cache);
        if let Err(e) = self.repo.delete_session(subject_id.to_string()).await {
            tracing::warn!("failed to delete session for {}: {}", subject_id, e);
        }
    }

    /// GET against a known authenticated endpoint; anything but 200 means
    /// the cookie set is dead.
    async fn probe(&self, session: &Session) -> Result<bool, AuthError> {
        let url = format!("{}{}", self.config.base_url, self.config.probe_path);
        let response = self
            .client
            .get(&url)
            .header("Cookie", session.cookie_header())
            .send()
            .await?;
        Ok(response.status() == StatusCode::OK)
    }

    /// RSA-encrypts the secret with the portal's published public key. The
    /// plaintext path exists only as an explicit, configured fallback and is
    /// logged loudly when taken.
    fn transform_secret(&self, secret: &str) -> Result<String, AuthError> {
        if let Some(key) = &self.public_key {
            let mut rng = rand::thread_rng();
            let ciphertext = key
                .encrypt(&mut rng, Pkcs1v15Encrypt, secret.as_bytes())
                .map_err(|e| AuthError::Encryption(e.to_string()))?;
            return Ok(BASE64.encode(ciphertext));
        }
        if self.config.allow_plaintext_login {
            tracing::warn!("no usable portal public key; sending plaintext credentials");
            return Ok(secret.to_string());
        }
        Err(AuthError::Encryption(
            "no usable public key and plaintext fallback is disabled".to_string(),
        ))
    }
}

/// Classifies a non-redirect login response by its body markers.
fn classify_failure(status: StatusCode, body: &str) -> AuthError {
    if CREDENTIAL_ERROR_MARKERS.iter().any(|m| body.contains(m)) {
        return AuthError::InvalidCredentials;
    }
    if CAPTCHA_MARKERS.iter().any(|m| body.contains(m)) {
        return AuthError::CaptchaRequired;
    }
    AuthError::Unknown(format!("login returned HTTP {}", status))
}

fn collect_cookies<'a>(
    headers: impl Iterator<Item = &'a reqwest::header::HeaderValue>,
) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for value in headers {
        let Ok(raw) = value.to_str() else { continue };
        let pair = raw.split(';').next().unwrap_or_default();
        if let Some((name, value)) = pair.split_once('=') {
            let name = name.trim();
            if !name.is_empty() {
                cookies.insert(name.to_string(), value.trim().to_string());
            }
        }
    }
    cookies
}

/// Reversible at-rest encoding for stored secrets. Obfuscation only, not
/// encryption; documented as such in the config.
pub fn obfuscate_secret(secret: &str) -> String {
    BASE64.encode(secret.as_bytes())
}

pub fn reveal_secret(obfuscated: &str) -> Option<String> {
    let bytes = BASE64.decode(obfuscated).ok()?;
    String::from_utf8(bytes).ok()
}
