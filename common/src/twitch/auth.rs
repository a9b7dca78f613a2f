//! Twitch authentication: cookie persistence, the login resolution chain
//! (cached cookies, refresh token, config/env token, password, device code)
//! and integrity-token management.

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use eyre::{eyre, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{
    generate_device_id, generate_hex, CLIENT_ID, DEVICE_CODE_SCOPES, DEVICE_CODE_URL,
    INTEGRITY_URL, LOGIN_URL, TOKEN_URL, USER_AGENT, VALIDATE_URL,
};

/// Browser client id, required by the passport login endpoint.
const CLIENT_ID_BROWSER: &str = "kimne78kx3ncx6brgo4mv6wki5h1ko";

/// Credentials supplied by config or environment.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub auth_token: Option<String>,
    pub password: Option<String>,
}

/// A single persisted cookie.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

/// JSON-backed cookie store with atomic writes.
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: Vec<Cookie>,
}

impl CookieJar {
    pub fn load(path: &Path) -> Result<CookieJar> {
        let data = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Reading cookie file {}", path.display()))?;
        let cookies: Vec<Cookie> = serde_json::from_str(&data)
            .wrap_err_with(|| format!("Parsing cookie file {}", path.display()))?;
        Ok(CookieJar { cookies })
    }

    /// Writes the jar to disk via temp file + rename so a crash mid-write
    /// never corrupts the cookie file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .wrap_err_with(|| format!("Creating cookie directory {}", dir.display()))?;
        }

        let data = serde_json::to_string_pretty(&self.cookies)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)
            .wrap_err_with(|| format!("Writing temp cookie file {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .wrap_err_with(|| format!("Renaming {} into place", tmp.display()))?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|c| c.name == name && !c.value.is_empty())
            .map(|c| c.value.as_str())
    }

    pub fn set(&mut self, name: &str, value: &str) {
        if let Some(c) = self.cookies.iter_mut().find(|c| c.name == name) {
            c.value = value.to_owned();
            return;
        }
        self.cookies.push(Cookie {
            name: name.to_owned(),
            value: value.to_owned(),
            domain: ".twitch.tv".to_owned(),
            path: "/".to_owned(),
            expires: None,
        });
    }
}

#[derive(Debug, Default)]
struct AuthState {
    auth_token: String,
    refresh_token: String,
    user_id: String,
    integrity_token: String,
    integrity_expire_ms: i64,
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    expires_in: i64,
    interval: i64,
    user_code: String,
    verification_uri: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: String,
}

#[derive(Debug, Default, Deserialize)]
struct PassportResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    error_code: i64,
    #[serde(default, rename = "error")]
    error_msg: String,
}

/// Holds the OAuth token and session identifiers for one account and mints
/// short-lived integrity tokens on demand. Safe for concurrent use.
pub struct Authenticator {
    username: String,
    device_id: String,
    client_session: String,
    cookie_file: PathBuf,
    cfg: AuthConfig,
    http: reqwest::Client,
    state: RwLock<AuthState>,
}

impl Authenticator {
    pub fn new(username: &str, cfg: AuthConfig, data_dir: Option<&Path>) -> Authenticator {
        let username = username.to_lowercase();
        let cookies_dir = match data_dir {
            Some(dir) => dir.join("cookies"),
            None => PathBuf::from("cookies"),
        };
        let cookie_file = cookies_dir.join(format!("{username}.json"));

        Authenticator {
            username,
            device_id: generate_device_id(),
            client_session: generate_hex(8),
            cookie_file,
            cfg,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("Building auth HTTP client"),
            state: RwLock::new(AuthState::default()),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn auth_token(&self) -> String {
        self.state.read().unwrap().auth_token.clone()
    }

    pub fn user_id(&self) -> String {
        self.state.read().unwrap().user_id.clone()
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The header bundle every API request carries.
    pub fn auth_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Authorization", format!("OAuth {}", self.auth_token())),
            ("Client-Id", CLIENT_ID.to_owned()),
            ("Client-Session-Id", self.client_session.clone()),
            ("X-Device-Id", self.device_id.clone()),
            ("User-Agent", USER_AGENT.to_owned()),
        ]
    }

    /// Resolves a token, first success wins: cookie file, refresh exchange,
    /// config token, env token, password flow, device code flow. Every path
    /// ends in [`Self::validate`]; a login mismatch is fatal for the account.
    pub async fn login(&self) -> Result<()> {
        if self.cookie_file.exists() {
            info!(file = %self.cookie_file.display(), "Loading existing cookies");
            match CookieJar::load(&self.cookie_file) {
                Ok(jar) => {
                    let token = jar.get("auth-token").unwrap_or_default().to_owned();
                    let refresh = jar.get("refresh-token").unwrap_or_default().to_owned();
                    {
                        let mut state = self.state.write().unwrap();
                        state.auth_token = token.clone();
                        state.refresh_token = refresh;
                    }
                    if !token.is_empty() {
                        if self.validate().await.is_ok() {
                            info!(username = %self.username, "Authenticated from cookies");
                            return Ok(());
                        }
                        warn!("Cached token is invalid, trying refresh");
                        self.state.write().unwrap().auth_token.clear();

                        if self.refresh_access_token().await.is_ok() {
                            info!(username = %self.username, "Authenticated via token refresh");
                            self.save_cookies();
                            return Ok(());
                        }
                        warn!("Token refresh failed, trying other methods");
                    }
                }
                Err(err) => warn!("Failed to load cookies: {err:#}"),
            }
        }

        let env_key = format!(
            "TWITCH_AUTH_TOKEN_{}",
            self.username.to_uppercase().replace('-', "_")
        );
        let candidates = [
            self.cfg.auth_token.clone(),
            std::env::var(&env_key).ok(),
        ];
        for token in candidates.into_iter().flatten() {
            if token.is_empty() {
                continue;
            }
            self.state.write().unwrap().auth_token = token;
            match self.validate().await {
                Ok(()) => {
                    info!(username = %self.username, "Authenticated with supplied token");
                    self.save_cookies();
                    return Ok(());
                }
                Err(err) => {
                    warn!("Supplied auth token is invalid: {err:#}");
                    self.state.write().unwrap().auth_token.clear();
                }
            }
        }

        let password = self.cfg.password.clone().or_else(|| {
            std::env::var(format!(
                "TWITCH_PASSWORD_{}",
                self.username.to_uppercase().replace('-', "_")
            ))
            .ok()
        });
        if let Some(password) = password.filter(|p| !p.is_empty()) {
            match self.login_with_password(&password).await {
                Ok(()) => return Ok(()),
                Err(err) => warn!("Password login failed: {err:#}"),
            }
        }

        info!(username = %self.username, "No valid credentials, starting device code login");
        self.login_with_device_code()
            .await
            .context("Device code login")
    }

    /// Calls the OAuth2 validate endpoint; the returned login must match the
    /// configured account name case-insensitively.
    async fn validate(&self) -> Result<()> {
        #[derive(Deserialize)]
        struct ValidateResponse {
            login: String,
            user_id: String,
        }

        let token = self.auth_token();
        let res = self
            .http
            .get(VALIDATE_URL)
            .header("Authorization", format!("OAuth {token}"))
            .send()
            .await
            .context("Validating token")?;

        if !res.status().is_success() {
            return Err(eyre!("Token validation failed with status {}", res.status()));
        }

        let body: ValidateResponse = res.json().await.context("Decoding validate response")?;
        if !body.login.eq_ignore_ascii_case(&self.username) {
            return Err(eyre!(
                "Authenticated as {:?} but config expects {:?}",
                body.login,
                self.username
            ));
        }

        self.state.write().unwrap().user_id = body.user_id;
        Ok(())
    }

    async fn refresh_access_token(&self) -> Result<()> {
        let refresh_token = self.state.read().unwrap().refresh_token.clone();
        if refresh_token.is_empty() {
            return Err(eyre!("No refresh token available"));
        }

        let res: TokenResponse = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("client_id", CLIENT_ID),
                ("grant_type", "refresh_token"),
                ("refresh_token", &refresh_token),
            ])
            .send()
            .await
            .context("Refresh token request")?
            .error_for_status()
            .context("Refresh token exchange")?
            .json()
            .await
            .context("Decoding refresh response")?;

        {
            let mut state = self.state.write().unwrap();
            state.auth_token = res.access_token;
            if !res.refresh_token.is_empty() {
                state.refresh_token = res.refresh_token;
            }
        }
        self.validate().await
    }

    async fn login_with_password(&self, password: &str) -> Result<()> {
        info!(username = %self.username, "Attempting password login");

        let base = json!({
            "username": self.username,
            "password": password,
            "client_id": CLIENT_ID_BROWSER,
            "undelete_user": false,
            "remember_me": true,
        });

        let res = self.send_passport_request(&base).await?;

        let res = match res.error_code {
            0 => res,
            3011 | 3012 | 3022 | 3023 => {
                // 2FA challenges are non-interactive here; the code comes
                // from the environment or the login fails.
                let key = if res.error_code < 3020 {
                    "authy_token"
                } else {
                    "twitchguard_code"
                };
                let code = std::env::var(format!(
                    "TWITCH_2FA_{}",
                    self.username.to_uppercase().replace('-', "_")
                ))
                .map_err(|_| {
                    eyre!("Two-factor code required (error {})", res.error_code)
                })?;

                let mut payload = base.clone();
                payload[key] = json!(code);
                self.send_passport_request(&payload).await?
            }
            code => {
                return Err(eyre!(
                    "Twitch login failed (code {code}): {}",
                    login_error_description(code, &res.error_msg)
                ))
            }
        };

        if res.access_token.is_empty() {
            return Err(eyre!(
                "Twitch login failed (code {}): {}",
                res.error_code,
                login_error_description(res.error_code, &res.error_msg)
            ));
        }

        self.state.write().unwrap().auth_token = res.access_token;
        self.validate()
            .await
            .context("Password login succeeded but validation failed")?;
        self.save_cookies();
        info!(username = %self.username, "Authenticated via password login");
        Ok(())
    }

    async fn send_passport_request(&self, payload: &serde_json::Value) -> Result<PassportResponse> {
        let res = self
            .http
            .post(LOGIN_URL)
            .header("Client-Id", CLIENT_ID_BROWSER)
            .header("X-Device-Id", &self.device_id)
            .header("User-Agent", USER_AGENT)
            .json(payload)
            .send()
            .await
            .context("Sending passport login request")?;

        res.json().await.context("Parsing passport response")
    }

    async fn login_with_device_code(&self) -> Result<()> {
        let flow: DeviceCodeResponse = self
            .http
            .post(DEVICE_CODE_URL)
            .form(&[("client_id", CLIENT_ID), ("scopes", DEVICE_CODE_SCOPES)])
            .send()
            .await
            .context("Requesting device code")?
            .error_for_status()?
            .json()
            .await
            .context("Parsing device code response")?;

        info!(
            username = %self.username,
            "Open {} and enter code {}",
            flow.verification_uri,
            flow.user_code
        );

        let token = self
            .poll_for_token(&flow.device_code, flow.interval, flow.expires_in)
            .await?;

        {
            let mut state = self.state.write().unwrap();
            state.auth_token = token.access_token;
            state.refresh_token = token.refresh_token;
        }

        self.validate()
            .await
            .context("Device code login succeeded but validation failed")?;
        self.save_cookies();
        info!(username = %self.username, "Authenticated via device code flow");
        Ok(())
    }

    /// Polls the token endpoint every `interval` seconds until `expires_in`
    /// runs out, honoring `authorization_pending` and `slow_down`.
    async fn poll_for_token(
        &self,
        device_code: &str,
        interval: i64,
        expires_in: i64,
    ) -> Result<TokenResponse> {
        let mut interval = interval.max(1) as u64;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(expires_in.max(0) as u64);

        loop {
            sleep(Duration::from_secs(interval)).await;
            if tokio::time::Instant::now() > deadline {
                return Err(eyre!("Device code expired, please try again"));
            }

            let res = self
                .http
                .post(TOKEN_URL)
                .form(&[
                    ("client_id", CLIENT_ID),
                    ("device_code", device_code),
                    ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                ])
                .send()
                .await
                .context("Polling token endpoint")?;

            if res.status().is_success() {
                let token: TokenResponse =
                    res.json().await.context("Parsing token response")?;
                if token.access_token.is_empty() {
                    return Err(eyre!("Token response missing access_token"));
                }
                return Ok(token);
            }

            #[derive(Deserialize)]
            struct TokenError {
                #[serde(default)]
                message: String,
            }
            let err: TokenError = res.json().await.unwrap_or(TokenError {
                message: String::new(),
            });
            match err.message.as_str() {
                "authorization_pending" => {}
                "slow_down" => {
                    interval += 5;
                    debug!(interval, "Token endpoint asked to slow down");
                }
                other => return Err(eyre!("Device code login failed: {other}")),
            }
        }
    }

    /// Returns a valid integrity token, re-fetching when fewer than five
    /// minutes of validity remain.
    pub async fn fetch_integrity_token(&self) -> Result<String> {
        {
            let state = self.state.read().unwrap();
            let now_ms = Utc::now().timestamp_millis();
            if !state.integrity_token.is_empty()
                && state.integrity_expire_ms - now_ms > 5 * 60 * 1000
            {
                return Ok(state.integrity_token.clone());
            }
        }

        #[derive(Deserialize)]
        struct IntegrityResponse {
            token: String,
            expiration: i64,
        }

        let mut req = self.http.post(INTEGRITY_URL).body("{}");
        req = req.header("Content-Type", "application/json");
        for (k, v) in self.auth_headers() {
            req = req.header(k, v);
        }

        let res: IntegrityResponse = req
            .send()
            .await
            .context("Fetching integrity token")?
            .json()
            .await
            .context("Parsing integrity response")?;

        let mut state = self.state.write().unwrap();
        state.integrity_token = res.token.clone();
        state.integrity_expire_ms = res.expiration;
        debug!("Refreshed integrity token");
        Ok(res.token)
    }

    fn save_cookies(&self) {
        let mut jar = CookieJar::load(&self.cookie_file).unwrap_or_default();
        let state = self.state.read().unwrap();
        jar.set("auth-token", &state.auth_token);
        if !state.refresh_token.is_empty() {
            jar.set("refresh-token", &state.refresh_token);
        }
        if !state.user_id.is_empty() {
            jar.set("persistent", &state.user_id);
        }
        drop(state);

        match jar.save(&self.cookie_file) {
            Ok(()) => info!(file = %self.cookie_file.display(), "Cookies saved"),
            Err(err) => warn!("Failed to save cookies: {err:#}"),
        }
    }

    #[cfg(test)]
    pub fn with_token_for_tests(username: &str, token: &str, user_id: &str) -> Authenticator {
        let auth = Authenticator::new(username, AuthConfig::default(), None);
        {
            let mut state = auth.state.write().unwrap();
            state.auth_token = token.to_owned();
            state.user_id = user_id.to_owned();
        }
        auth
    }
}

fn login_error_description(code: i64, fallback: &str) -> String {
    match code {
        1000 => "captcha required (try again or use auth token)".to_owned(),
        3001 | 3003 => "invalid login credentials".to_owned(),
        3011 | 3012 => "two-factor authentication required (Authy)".to_owned(),
        3022 | 3023 => "two-factor authentication required (email/SMS)".to_owned(),
        5023 => "too many login attempts".to_owned(),
        5027 => "integrity check failed".to_owned(),
        10001 => "account locked".to_owned(),
        _ if !fallback.is_empty() => fallback.to_owned(),
        _ => "unknown error".to_owned(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{name}-{}", generate_hex(8)))
    }

    #[test]
    fn cookie_jar_roundtrip() {
        let path = temp_path("cookies").join("user.json");

        let mut jar = CookieJar::default();
        jar.set("auth-token", "tok123");
        jar.set("persistent", "42");
        jar.set("auth-token", "tok456");
        jar.save(&path).unwrap();

        let loaded = CookieJar::load(&path).unwrap();
        assert_eq!(loaded.get("auth-token"), Some("tok456"));
        assert_eq!(loaded.get("persistent"), Some("42"));
        assert_eq!(loaded.get("missing"), None);

        // A partial write must never be visible at the target path.
        assert!(!path.with_extension("json.tmp").exists());

        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn auth_headers_bundle() {
        let auth = Authenticator::with_token_for_tests("someuser", "abc", "1");
        let headers = auth.auth_headers();

        let get = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(get("Authorization"), "OAuth abc");
        assert_eq!(get("Client-Id"), CLIENT_ID);
        assert_eq!(get("X-Device-Id").len(), 32);
        assert_eq!(get("Client-Session-Id").len(), 16);
    }

    #[test]
    fn login_error_descriptions() {
        assert!(login_error_description(3001, "").contains("invalid login"));
        assert_eq!(login_error_description(9999, "weird"), "weird");
        assert_eq!(login_error_description(9999, ""), "unknown error");
    }
}
