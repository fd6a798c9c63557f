//! Authorization-code sign-in and token refresh for the Spotify accounts service.
//!
//! The supplier keeps the current access token in memory and the refresh token
//! in the OS keyring. A background loop renews the access token before it
//! expires; the sync core only ever sees `access_token()`.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde_json::Value;

use crate::credential_keyring;
use crate::credentials::{CredentialError, CredentialSupplier};

pub const DEFAULT_ACCOUNTS_URL: &str = "https://accounts.spotify.com";
pub const DEFAULT_SCOPES: [&str; 4] = [
    "user-read-playback-state",
    "user-modify-playback-state",
    "user-read-currently-playing",
    "user-read-recently-played",
];

const EXPIRY_MARGIN: Duration = Duration::from_secs(60);
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);
const EARLY_REFRESH_COOLDOWN: Duration = Duration::from_secs(30);

/// Static OAuth client settings.
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub client_id: String,
    pub client_secret: String,
    pub accounts_url: String,
    pub redirect_port: u16,
    pub scopes: Vec<String>,
    pub refresh_interval: Duration,
    pub request_timeout: Duration,
}

impl OAuthSettings {
    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}/callback", self.redirect_port)
    }
}

/// Token endpoint response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Duration,
}

/// Query parameters delivered to the redirect URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

#[derive(Debug, Default)]
struct TokenState {
    access_token: Option<String>,
    expires_at: Option<Instant>,
    refresh_token: Option<String>,
    stale: bool,
}

/// Credential supplier backed by the authorization-code flow.
pub struct OAuthCredentialSupplier {
    settings: OAuthSettings,
    http_client: ureq::Agent,
    state: Mutex<TokenState>,
}

/// Builds the browser URL that starts the sign-in flow.
pub fn authorize_url(settings: &OAuthSettings, state: &str) -> String {
    let scopes = settings.scopes.join(" ");
    format!(
        "{}/authorize?client_id={}&response_type=code&redirect_uri={}&scope={}&state={}",
        settings.accounts_url.trim_end_matches('/'),
        urlencoding::encode(&settings.client_id),
        urlencoding::encode(&settings.redirect_uri()),
        urlencoding::encode(&scopes),
        urlencoding::encode(state)
    )
}

pub fn parse_token_response(value: &Value) -> Result<TokenGrant, String> {
    if let Some(error) = value.get("error").and_then(Value::as_str) {
        let description = value
            .get("error_description")
            .and_then(Value::as_str)
            .unwrap_or_default();
        return Err(format!("token endpoint returned {error}: {description}"));
    }
    let access_token = value
        .get("access_token")
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| "token response has no access_token".to_string())?
        .to_string();
    Ok(TokenGrant {
        access_token,
        refresh_token: value
            .get("refresh_token")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .map(ToOwned::to_owned),
        expires_in: Duration::from_secs(
            value
                .get("expires_in")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_EXPIRES_IN_SECS),
        ),
    })
}

/// Parses a request target such as `/callback?code=..&state=..`.
pub fn parse_callback_target(target: &str) -> Result<CallbackParams, String> {
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    if path != "/callback" {
        return Err(format!("unexpected callback path '{path}'"));
    }
    let mut code = None;
    let mut state = None;
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = urlencoding::decode(raw_value)
            .map_err(|err| format!("invalid callback parameter '{key}': {err}"))?
            .into_owned();
        match key {
            "code" => code = Some(value),
            "state" => state = Some(value),
            "error" => return Err(format!("authorization denied: {value}")),
            _ => {}
        }
    }
    Ok(CallbackParams {
        code: code
            .filter(|code| !code.is_empty())
            .ok_or_else(|| "callback is missing the authorization code".to_string())?,
        state: state.unwrap_or_default(),
    })
}

fn random_state() -> Result<String, String> {
    let mut bytes = [0u8; 16];
    getrandom::fill(&mut bytes).map_err(|err| format!("failed to generate OAuth state: {err}"))?;
    Ok(bytes.iter().map(|value| format!("{value:02x}")).collect())
}

fn read_request_target(reader: &mut BufReader<TcpStream>) -> Result<String, String> {
    let mut request_line = String::new();
    reader
        .read_line(&mut request_line)
        .map_err(|err| format!("failed to read request line: {err}"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| "missing request method".to_string())?;
    if method != "GET" {
        return Err(format!("unexpected callback method {method}"));
    }
    let target = parts
        .next()
        .ok_or_else(|| "missing request path".to_string())?
        .to_string();

    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .map_err(|err| format!("failed to read header line: {err}"))?;
        if read == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }
    Ok(target)
}

fn write_plain_response(stream: &mut TcpStream, status_line: &str, body: &str) {
    let response = format!(
        "{status_line}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    if let Err(err) = stream.write_all(response.as_bytes()) {
        debug!("OAuth: failed to answer callback request: {}", err);
    }
}

fn handle_callback_connection(
    stream: TcpStream,
    expected_state: &str,
) -> Result<Option<String>, String> {
    stream
        .set_nonblocking(false)
        .map_err(|err| format!("failed to configure callback stream: {err}"))?;
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .map_err(|err| format!("failed to configure callback stream: {err}"))?;
    let mut reader = BufReader::new(
        stream
            .try_clone()
            .map_err(|err| format!("failed to clone callback stream: {err}"))?,
    );
    let target = read_request_target(&mut reader)?;
    let mut stream = stream;

    if !target.starts_with("/callback") {
        write_plain_response(&mut stream, "HTTP/1.1 404 Not Found", "Not found");
        return Ok(None);
    }
    match parse_callback_target(&target) {
        Ok(params) if params.state == expected_state => {
            write_plain_response(
                &mut stream,
                "HTTP/1.1 200 OK",
                "Sign-in complete. You can close this window.",
            );
            Ok(Some(params.code))
        }
        Ok(_) => {
            write_plain_response(&mut stream, "HTTP/1.1 400 Bad Request", "State mismatch");
            Err("sign-in callback state mismatch".to_string())
        }
        Err(err) => {
            write_plain_response(&mut stream, "HTTP/1.1 400 Bad Request", &err);
            Err(err)
        }
    }
}

/// Accepts connections until the redirect carrying `code` arrives.
pub fn wait_for_authorization_code(
    listener: &TcpListener,
    expected_state: &str,
    timeout: Duration,
) -> Result<String, String> {
    listener
        .set_nonblocking(true)
        .map_err(|err| format!("failed to set callback listener non-blocking: {err}"))?;
    let deadline = Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok((stream, _peer)) => {
                if let Some(code) = handle_callback_connection(stream, expected_state)? {
                    return Ok(code);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err("timed out waiting for the sign-in callback".to_string());
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => return Err(format!("sign-in callback listener failed: {err}")),
        }
    }
}

impl OAuthCredentialSupplier {
    pub fn new(settings: OAuthSettings, refresh_token: Option<String>) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(settings.request_timeout)
            .timeout_write(settings.request_timeout)
            .build();
        Self {
            settings,
            http_client,
            state: Mutex::new(TokenState {
                refresh_token,
                ..TokenState::default()
            }),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TokenState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn has_refresh_token(&self) -> bool {
        self.lock_state().refresh_token.is_some()
    }

    /// Obtains the first token pair: refresh when a refresh token is stored,
    /// otherwise run the browser sign-in.
    pub fn bootstrap(&self) -> Result<(), String> {
        if self.has_refresh_token() {
            match self.refresh() {
                Ok(()) => return Ok(()),
                Err(err) => warn!(
                    "OAuth: stored refresh token was rejected ({}); signing in again",
                    err
                ),
            }
        }
        self.sign_in_interactive()
    }

    /// Opens the authorize URL and waits for the local redirect.
    pub fn sign_in_interactive(&self) -> Result<(), String> {
        let state = random_state()?;
        let listener = TcpListener::bind(("127.0.0.1", self.settings.redirect_port))
            .map_err(|err| {
                format!(
                    "failed to listen on port {} for the sign-in callback: {err}",
                    self.settings.redirect_port
                )
            })?;
        let url = authorize_url(&self.settings, &state);
        info!("OAuth: opening browser for Spotify sign-in");
        if let Err(err) = webbrowser::open(&url) {
            warn!(
                "OAuth: failed to open browser ({}); open this URL manually: {}",
                err, url
            );
        }

        let code = wait_for_authorization_code(&listener, &state, CALLBACK_TIMEOUT)?;
        let redirect_uri = self.settings.redirect_uri();
        let grant = self.request_token(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
        ])?;
        if grant.refresh_token.is_none() {
            return Err("sign-in response did not include a refresh token".to_string());
        }
        self.install_grant(grant, Instant::now());
        self.persist_refresh_token()?;
        info!("OAuth: sign-in complete");
        Ok(())
    }

    /// Exchanges the refresh token for a new access token.
    pub fn refresh(&self) -> Result<(), String> {
        let refresh_token = self
            .lock_state()
            .refresh_token
            .clone()
            .ok_or_else(|| "no refresh token stored".to_string())?;
        let grant = self.request_token(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ])?;
        let rotated = grant
            .refresh_token
            .as_deref()
            .is_some_and(|token| token != refresh_token);
        self.install_grant(grant, Instant::now());
        if rotated {
            self.persist_refresh_token()?;
        }
        debug!("OAuth: access token refreshed");
        Ok(())
    }

    fn request_token(&self, form: &[(&str, &str)]) -> Result<TokenGrant, String> {
        let url = format!(
            "{}/api/token",
            self.settings.accounts_url.trim_end_matches('/')
        );
        let mut fields = form.to_vec();
        fields.push(("client_id", self.settings.client_id.as_str()));
        fields.push(("client_secret", self.settings.client_secret.as_str()));

        let payload: Value = match self.http_client.post(&url).send_form(&fields) {
            Ok(response) => response
                .into_json()
                .map_err(|err| format!("token response parse failed: {err}"))?,
            Err(ureq::Error::Status(code, response)) => {
                let body: Option<Value> = response.into_json().ok();
                return Err(match body.as_ref().map(parse_token_response) {
                    Some(Err(message)) => format!("token request failed ({code}): {message}"),
                    _ => format!("token request failed with status {code}"),
                });
            }
            Err(err) => return Err(format!("token request failed: {err}")),
        };
        parse_token_response(&payload)
    }

    pub(crate) fn install_grant(&self, grant: TokenGrant, now: Instant) {
        let mut state = self.lock_state();
        let lifetime = grant.expires_in.saturating_sub(EXPIRY_MARGIN);
        state.access_token = Some(grant.access_token);
        state.expires_at = Some(now + lifetime);
        state.stale = false;
        if let Some(refresh_token) = grant.refresh_token {
            state.refresh_token = Some(refresh_token);
        }
    }

    fn persist_refresh_token(&self) -> Result<(), String> {
        let Some(refresh_token) = self.lock_state().refresh_token.clone() else {
            return Ok(());
        };
        credential_keyring::set_refresh_token(&self.settings.client_id, &refresh_token)
    }

    fn token_at(&self, now: Instant) -> Result<String, CredentialError> {
        let state = self.lock_state();
        if state.stale {
            return Err(CredentialError::Expired);
        }
        match (&state.access_token, state.expires_at) {
            (Some(token), Some(expires_at)) if now < expires_at => Ok(token.clone()),
            (Some(_), _) => Err(CredentialError::Expired),
            (None, _) if state.refresh_token.is_some() => Err(CredentialError::Expired),
            (None, _) => Err(CredentialError::Missing),
        }
    }

    fn needs_early_refresh(&self, now: Instant) -> bool {
        let state = self.lock_state();
        state.stale
            || state
                .expires_at
                .map_or(state.refresh_token.is_some(), |expires_at| now >= expires_at)
    }

    /// Renews the access token every `refresh_interval`, or sooner when the
    /// remote rejected the current one.
    pub fn spawn_refresh_loop(self: &Arc<Self>, stop: Arc<AtomicBool>) -> JoinHandle<()> {
        let supplier = Arc::clone(self);
        thread::spawn(move || {
            let interval = supplier.settings.refresh_interval;
            let mut last_refresh = Instant::now();
            let mut last_attempt = Instant::now();
            info!(
                "OAuth: refresh loop started (every {}s)",
                interval.as_secs()
            );
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_secs(1));
                let now = Instant::now();
                let scheduled = now.duration_since(last_refresh) >= interval;
                let early = supplier.needs_early_refresh(now)
                    && now.duration_since(last_attempt) >= EARLY_REFRESH_COOLDOWN;
                if !scheduled && !early {
                    continue;
                }
                last_attempt = now;
                match supplier.refresh() {
                    Ok(()) => last_refresh = now,
                    Err(err) => warn!("OAuth: token refresh failed: {}", err),
                }
            }
            info!("OAuth: refresh loop stopped");
        })
    }
}

impl CredentialSupplier for OAuthCredentialSupplier {
    fn access_token(&self) -> Result<String, CredentialError> {
        self.token_at(Instant::now())
    }

    fn report_unauthorized(&self) {
        let mut state = self.lock_state();
        if !state.stale {
            debug!("OAuth: access token marked stale after remote rejection");
        }
        state.stale = true;
    }
}
