//! Persistent application configuration model and defaults.

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Remote API endpoints and request limits.
    pub api: ApiConfig,
    #[serde(default)]
    /// OAuth client registration.
    pub auth: AuthConfig,
    #[serde(default)]
    /// Poll cadence and reconciliation timing.
    pub sync: SyncConfig,
    #[serde(default)]
    /// Mini-player presentation preferences.
    pub ui: UiConfig,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default = "default_accounts_url")]
    pub accounts_url: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

/// OAuth client settings. The client secret never lives here; it is read
/// from the keyring or `TUNEBAR_CLIENT_SECRET`.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "default_redirect_port")]
    pub redirect_port: u16,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_token_refresh_interval_secs")]
    pub token_refresh_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SyncConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u32,
    #[serde(default = "default_skip_window_ms")]
    pub skip_window_ms: u64,
    #[serde(default = "default_skip_call_delay_ms")]
    pub skip_call_delay_ms: u64,
    #[serde(default = "default_track_change_suppress_ms")]
    pub track_change_suppress_ms: u64,
    /// Elapsed time above which "previous" restarts the current track.
    #[serde(default = "default_restart_threshold_ms")]
    pub restart_threshold_ms: u64,
    #[serde(default = "default_previous_settle_ms")]
    pub previous_settle_ms: u64,
    #[serde(default = "default_recovery_volume_percent")]
    pub recovery_volume_percent: u8,
    #[serde(default = "default_volume_debounce_ms")]
    pub volume_debounce_ms: u64,
}

/// Screen corner the mini-player window is anchored to.
#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UiPosition {
    #[default]
    BottomStart,
    BottomEnd,
    TopStart,
    TopEnd,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct UiConfig {
    #[serde(default = "default_program_title")]
    pub program_title: String,
    #[serde(default = "default_opacity")]
    pub opacity: f32,
    #[serde(default = "default_background_color")]
    pub background_color: String,
    #[serde(default)]
    pub position: UiPosition,
    #[serde(default = "default_padding")]
    pub padding: u32,
    #[serde(default = "default_title_max_chars")]
    pub title_max_chars: usize,
    #[serde(default = "default_cover_art_edge_px")]
    pub cover_art_edge_px: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            accounts_url: default_accounts_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            requests_per_second: default_requests_per_second(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            redirect_port: default_redirect_port(),
            scopes: default_scopes(),
            token_refresh_interval_secs: default_token_refresh_interval_secs(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            resync_interval_secs: default_resync_interval_secs(),
            skip_window_ms: default_skip_window_ms(),
            skip_call_delay_ms: default_skip_call_delay_ms(),
            track_change_suppress_ms: default_track_change_suppress_ms(),
            restart_threshold_ms: default_restart_threshold_ms(),
            previous_settle_ms: default_previous_settle_ms(),
            recovery_volume_percent: default_recovery_volume_percent(),
            volume_debounce_ms: default_volume_debounce_ms(),
        }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            program_title: default_program_title(),
            opacity: default_opacity(),
            background_color: default_background_color(),
            position: UiPosition::default(),
            padding: default_padding(),
            title_max_chars: default_title_max_chars(),
            cover_art_edge_px: default_cover_art_edge_px(),
        }
    }
}

fn default_api_base_url() -> String {
    crate::backends::spotify::DEFAULT_API_BASE_URL.to_string()
}

fn default_accounts_url() -> String {
    crate::oauth::DEFAULT_ACCOUNTS_URL.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

fn default_requests_per_second() -> u32 {
    5
}

fn default_redirect_port() -> u16 {
    5000
}

fn default_scopes() -> Vec<String> {
    crate::oauth::DEFAULT_SCOPES
        .iter()
        .map(|scope| scope.to_string())
        .collect()
}

fn default_token_refresh_interval_secs() -> u64 {
    3_500
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_resync_interval_secs() -> u32 {
    20
}

fn default_skip_window_ms() -> u64 {
    1_000
}

fn default_skip_call_delay_ms() -> u64 {
    100
}

fn default_track_change_suppress_ms() -> u64 {
    10_000
}

fn default_restart_threshold_ms() -> u64 {
    5_000
}

fn default_previous_settle_ms() -> u64 {
    1_000
}

fn default_recovery_volume_percent() -> u8 {
    5
}

fn default_volume_debounce_ms() -> u64 {
    200
}

fn default_program_title() -> String {
    "tunebar".to_string()
}

fn default_opacity() -> f32 {
    1.0
}

fn default_background_color() -> String {
    "lightgray".to_string()
}

fn default_padding() -> u32 {
    10
}

fn default_title_max_chars() -> usize {
    28
}

fn default_cover_art_edge_px() -> u32 {
    83
}

/// Clamps user-edited values into ranges the runtime can honor.
pub fn sanitize_config(config: Config) -> Config {
    let api = ApiConfig {
        base_url: non_blank_or(config.api.base_url, default_api_base_url),
        accounts_url: non_blank_or(config.api.accounts_url, default_accounts_url),
        connect_timeout_ms: config.api.connect_timeout_ms.clamp(500, 60_000),
        request_timeout_ms: config.api.request_timeout_ms.clamp(1_000, 120_000),
        requests_per_second: config.api.requests_per_second.clamp(1, 50),
    };
    let scopes: Vec<String> = config
        .auth
        .scopes
        .into_iter()
        .map(|scope| scope.trim().to_string())
        .filter(|scope| !scope.is_empty())
        .collect();
    let auth = AuthConfig {
        client_id: config.auth.client_id.trim().to_string(),
        redirect_port: config.auth.redirect_port.max(1024),
        scopes: if scopes.is_empty() {
            default_scopes()
        } else {
            scopes
        },
        token_refresh_interval_secs: config.auth.token_refresh_interval_secs.clamp(60, 3_500),
    };
    let sync = SyncConfig {
        poll_interval_ms: config.sync.poll_interval_ms.clamp(250, 10_000),
        resync_interval_secs: config.sync.resync_interval_secs.clamp(1, 300),
        skip_window_ms: config.sync.skip_window_ms.clamp(100, 5_000),
        skip_call_delay_ms: config.sync.skip_call_delay_ms.min(2_000),
        track_change_suppress_ms: config.sync.track_change_suppress_ms.min(60_000),
        restart_threshold_ms: config.sync.restart_threshold_ms.min(60_000),
        previous_settle_ms: config.sync.previous_settle_ms.min(10_000),
        recovery_volume_percent: config.sync.recovery_volume_percent.min(100),
        volume_debounce_ms: config.sync.volume_debounce_ms.min(5_000),
    };
    let opacity = if config.ui.opacity.is_finite() {
        config.ui.opacity.clamp(0.1, 1.0)
    } else {
        default_opacity()
    };
    let ui = UiConfig {
        program_title: non_blank_or(config.ui.program_title, default_program_title),
        opacity,
        background_color: non_blank_or(config.ui.background_color, default_background_color),
        position: config.ui.position,
        padding: config.ui.padding.min(200),
        title_max_chars: config.ui.title_max_chars.clamp(4, 200),
        cover_art_edge_px: config.ui.cover_art_edge_px.clamp(16, 640),
    };

    Config {
        api,
        auth,
        sync,
        ui,
    }
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}
