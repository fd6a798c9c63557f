//! Application runtime bootstrap and top-level orchestration.

use std::{
    io::BufRead,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{info, warn};
use tokio::sync::broadcast;

use crate::{
    app_bootstrap::services::{
        spawn_background_services, BackgroundServices, BackgroundServicesConfig,
    },
    backends::{spotify::SpotifyPlayerApi, PlayerApi},
    config::Config,
    config_persistence::{apply_environment_overrides, config_root, load_or_create_config},
    cover_art::CoverArtCache,
    credential_keyring,
    credentials::{CredentialSupplier, StaticCredentialSupplier},
    device_cache::DeviceCache,
    now_playing_presenter::NowPlayingPresenter,
    oauth::{OAuthCredentialSupplier, OAuthSettings},
    playback_state::{PlaybackState, RepeatMode},
    protocol::{ControlMessage, Message, UserAction},
    sync_controller::{PollHandle, SyncController, SyncSettings},
    transport_client::{RemoteTransportClient, TransportSettings},
    volume_debounce::VolumeDebouncer,
};

pub const ACCESS_TOKEN_ENV: &str = "TUNEBAR_ACCESS_TOKEN";
pub const CLIENT_SECRET_ENV: &str = "TUNEBAR_CLIENT_SECRET";
const BUS_CAPACITY: usize = 1024;

/// Console command parsed from one stdin line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Control(ControlMessage),
    Volume(i32),
}

/// Maps `play`, `pause`, `next`, `vol 40` and similar lines to bus commands.
pub fn parse_console_command(line: &str) -> Option<ConsoleCommand> {
    let mut words = line.split_whitespace();
    let command = words.next()?.to_ascii_lowercase();
    let argument = words.next();
    let action = match (command.as_str(), argument) {
        ("q" | "quit" | "exit", None) => {
            return Some(ConsoleCommand::Control(ControlMessage::Quit));
        }
        ("vol" | "volume", Some(value)) => return value.parse().ok().map(ConsoleCommand::Volume),
        ("play", None) => UserAction::Play,
        ("pause", None) => UserAction::Pause,
        ("p" | "toggle", None) => UserAction::TogglePlayback,
        ("n" | "next", None) => UserAction::SkipNext,
        ("b" | "prev" | "previous", None) => UserAction::SkipPrevious,
        ("seek", Some(seconds)) => {
            UserAction::Seek(seconds.parse::<u64>().ok()?.saturating_mul(1000))
        }
        ("shuffle", None) => UserAction::ToggleShuffle,
        ("shuffle", Some(value)) => UserAction::SetShuffle(parse_switch(value)?),
        ("repeat", None) => UserAction::CycleRepeat,
        ("repeat", Some(value)) => UserAction::SetRepeat(value.parse::<RepeatMode>().ok()?),
        ("artist", None) => UserAction::OpenArtist,
        ("album", None) => UserAction::OpenAlbum,
        ("r" | "refresh", None) => UserAction::Refresh,
        _ => return None,
    };
    Some(ConsoleCommand::Control(ControlMessage::Action(action)))
}

fn parse_switch(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Some(true),
        "off" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// Credentials chosen at startup, plus the refresh loop that keeps them alive.
struct CredentialRuntime {
    supplier: Arc<dyn CredentialSupplier>,
    refresh_stop: Option<Arc<AtomicBool>>,
}

fn duration_ms(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

fn resolve_client_secret(client_id: &str) -> Result<String, String> {
    if let Ok(secret) = std::env::var(CLIENT_SECRET_ENV) {
        let secret = secret.trim().to_string();
        if !secret.is_empty() {
            if let Err(err) = credential_keyring::set_client_secret(client_id, &secret) {
                warn!("Could not store client secret in keyring: {}", err);
            }
            return Ok(secret);
        }
    }
    credential_keyring::get_client_secret(client_id)?.ok_or_else(|| {
        format!(
            "no client secret available: set {} or store one in the system keyring",
            CLIENT_SECRET_ENV
        )
    })
}

fn build_credentials(config: &Config) -> Result<CredentialRuntime, String> {
    if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV) {
        if !token.trim().is_empty() {
            info!("Using static access token from {}", ACCESS_TOKEN_ENV);
            return Ok(CredentialRuntime {
                supplier: Arc::new(StaticCredentialSupplier::new(token.trim())),
                refresh_stop: None,
            });
        }
    }

    let client_id = config.auth.client_id.clone();
    if client_id.is_empty() {
        return Err(format!(
            "no client id configured: set [auth].client_id or {}",
            crate::config_persistence::CLIENT_ID_ENV
        ));
    }
    let settings = OAuthSettings {
        client_secret: resolve_client_secret(&client_id)?,
        client_id: client_id.clone(),
        accounts_url: config.api.accounts_url.clone(),
        redirect_port: config.auth.redirect_port,
        scopes: config.auth.scopes.clone(),
        refresh_interval: Duration::from_secs(config.auth.token_refresh_interval_secs),
        request_timeout: duration_ms(config.api.request_timeout_ms),
    };
    let refresh_token = match credential_keyring::get_refresh_token(&client_id) {
        Ok(token) => token,
        Err(err) => {
            warn!("Could not read refresh token from keyring: {}", err);
            None
        }
    };

    let supplier = Arc::new(OAuthCredentialSupplier::new(settings, refresh_token));
    supplier.bootstrap()?;
    let refresh_stop = Arc::new(AtomicBool::new(false));
    let _refresh_thread = supplier.spawn_refresh_loop(Arc::clone(&refresh_stop));
    Ok(CredentialRuntime {
        supplier,
        refresh_stop: Some(refresh_stop),
    })
}

fn spawn_console_reader(
    bus_sender: broadcast::Sender<Message>,
    volume_debounce: Duration,
) -> Option<JoinHandle<()>> {
    let spawned = thread::Builder::new()
        .name("console-input".to_string())
        .spawn(move || {
            let debouncer = VolumeDebouncer::new(volume_debounce, bus_sender.clone());
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_console_command(&line) {
                    Some(ConsoleCommand::Volume(volume)) => debouncer.submit(volume),
                    Some(ConsoleCommand::Control(message)) => {
                        let quit = matches!(message, ControlMessage::Quit);
                        let _ = bus_sender.send(Message::Control(message));
                        if quit {
                            break;
                        }
                    }
                    None => warn!("Unrecognized command: {}", line.trim()),
                }
            }
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!("Console input unavailable: {}", err);
            None
        }
    }
}

const RECENT_TRACKS_SHOWN: u8 = 5;

/// Startup summary: the active device, plus recent history when nothing plays.
fn session_overview(transport: &RemoteTransportClient, state: &PlaybackState) -> Vec<String> {
    let mut lines = Vec::new();
    match transport.active_device() {
        Ok(Some(device)) => lines.push(format!("Active device: {}", device.name)),
        Ok(None) => lines.push("No active playback device".to_string()),
        Err(err) => warn!("Device lookup failed: {}", err),
    }
    if !state.track.is_unavailable() {
        return lines;
    }
    match transport.recently_played(RECENT_TRACKS_SHOWN) {
        Ok(recent) if !recent.is_empty() => {
            lines.push("Nothing playing. Recently played:".to_string());
            lines.extend(
                recent
                    .iter()
                    .map(|entry| format!("  {} - {}", entry.track.title, entry.track.artist)),
            );
        }
        Ok(_) => lines.push("Nothing playing".to_string()),
        Err(err) => warn!("Recently played lookup failed: {}", err),
    }
    lines
}

/// Owns startup wiring and the headless presenter loop.
pub struct AppRuntime {
    config_file: PathBuf,
    controller: SyncController,
    presenter: NowPlayingPresenter,
    poll_handle: PollHandle,
    services: BackgroundServices,
    refresh_stop: Option<Arc<AtomicBool>>,
}

impl AppRuntime {
    /// Loads config from `<config_dir>/tunebar/config.toml`.
    pub fn load_config() -> Result<(Config, PathBuf), String> {
        let config_root = config_root().ok_or("could not resolve user config directory")?;
        let config_file = config_root.join(crate::config_persistence::CONFIG_FILE_NAME);
        let config = load_or_create_config(&config_file)?;
        let config = apply_environment_overrides(config, |key| std::env::var(key).ok());
        Ok((config, config_file))
    }

    /// Removes the stored refresh token so the next start signs in again.
    pub fn logout() -> Result<(), String> {
        let (config, _) = Self::load_config()?;
        if config.auth.client_id.is_empty() {
            return Err("no client id configured".to_string());
        }
        credential_keyring::delete_refresh_token(&config.auth.client_id)?;
        info!("Signed out; stored refresh token removed");
        Ok(())
    }

    /// Builds the runtime by loading config and credentials and wiring all services.
    pub fn build() -> Result<Self, String> {
        let (config, config_file) = Self::load_config()?;
        info!("Loaded config from {}", config_file.display());

        let credentials = build_credentials(&config)?;
        let api: Arc<dyn PlayerApi> = Arc::new(SpotifyPlayerApi::new(
            &config.api.base_url,
            duration_ms(config.api.connect_timeout_ms),
            duration_ms(config.api.request_timeout_ms),
        ));
        let device_cache = DeviceCache::default_path()
            .map(DeviceCache::load)
            .unwrap_or_else(DeviceCache::in_memory);
        let transport = Arc::new(RemoteTransportClient::new(
            api,
            credentials.supplier,
            device_cache,
            TransportSettings {
                requests_per_second: config.api.requests_per_second,
                ..TransportSettings::default()
            },
        ));

        let (bus_sender, _) = broadcast::channel::<Message>(BUS_CAPACITY);
        let controller = SyncController::new(
            Arc::clone(&transport),
            bus_sender.clone(),
            SyncSettings::from_config(&config),
        );
        let presenter_bus_receiver = controller.subscribe();
        if let Err(err) = controller.load_current_track() {
            warn!("Initial playback load failed: {}", err);
        }
        for line in session_overview(&transport, &controller.playback_state()) {
            info!("{}", line);
        }
        let cover_art = CoverArtCache::default_root(config.ui.cover_art_edge_px).map(|root| {
            CoverArtCache::new(
                root,
                config.ui.cover_art_edge_px,
                duration_ms(config.api.request_timeout_ms),
            )
        });
        let presenter = NowPlayingPresenter::new(
            presenter_bus_receiver,
            controller.playback_state(),
            config.ui.title_max_chars,
            cover_art,
        );

        let poll_handle = controller.spawn_poll_loops();
        let services = spawn_background_services(BackgroundServicesConfig {
            bus_sender: bus_sender.clone(),
            controller: controller.clone(),
            media_controls_enabled: true,
        });
        let _console_thread = spawn_console_reader(
            bus_sender,
            duration_ms(config.sync.volume_debounce_ms),
        );

        Ok(Self {
            config_file,
            controller,
            presenter,
            poll_handle,
            services,
            refresh_stop: credentials.refresh_stop,
        })
    }

    /// Runs the presenter until quit, then stops background work.
    pub fn run(mut self) -> Result<(), String> {
        info!(
            "tunebar running (config: {}). Commands: play, pause, next, prev, seek <s>, vol <n>, quit",
            self.config_file.display()
        );
        self.presenter.run();

        self.poll_handle.stop();
        self.controller.shutdown();
        if let Some(stop) = self.refresh_stop.take() {
            stop.store(true, Ordering::Relaxed);
        }
        for handle in [
            self.services.controller_thread.take(),
            self.services.media_controls_thread.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = handle.join();
        }

        info!("Application exiting");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_console_command, session_overview, ConsoleCommand};
    use crate::backends::{RecentlyPlayedTrack, RemoteDevice, RemotePlayback};
    use crate::credentials::StaticCredentialSupplier;
    use crate::device_cache::DeviceCache;
    use crate::playback_state::PlaybackState;
    use crate::transport_client::test_support::{track, FakePlayerApi};
    use crate::transport_client::{RemoteTransportClient, TransportSettings};
    use std::sync::Arc;
    use std::time::Duration;
    use crate::playback_state::RepeatMode;
    use crate::protocol::{ControlMessage, UserAction};

    fn action(line: &str) -> Option<UserAction> {
        match parse_console_command(line) {
            Some(ConsoleCommand::Control(ControlMessage::Action(action))) => Some(action),
            _ => None,
        }
    }

    #[test]
    fn test_console_commands_map_to_actions() {
        assert_eq!(action("next"), Some(UserAction::SkipNext));
        assert_eq!(action("  PREV "), Some(UserAction::SkipPrevious));
        assert_eq!(action("seek 90"), Some(UserAction::Seek(90_000)));
        assert_eq!(action("shuffle on"), Some(UserAction::SetShuffle(true)));
        assert_eq!(
            action("repeat track"),
            Some(UserAction::SetRepeat(RepeatMode::Track))
        );
        assert_eq!(action("repeat"), Some(UserAction::CycleRepeat));
    }

    #[test]
    fn test_console_volume_and_quit() {
        assert_eq!(parse_console_command("vol 40"), Some(ConsoleCommand::Volume(40)));
        assert_eq!(
            parse_console_command("quit"),
            Some(ConsoleCommand::Control(ControlMessage::Quit))
        );
    }

    #[test]
    fn test_console_rejects_malformed_input() {
        assert_eq!(parse_console_command("vol loud"), None);
        assert_eq!(parse_console_command("seek -5"), None);
        assert_eq!(parse_console_command("repeat forever"), None);
        assert_eq!(parse_console_command("dance"), None);
        assert_eq!(parse_console_command(""), None);
    }

    fn transport_for(api: Arc<FakePlayerApi>) -> RemoteTransportClient {
        RemoteTransportClient::new(
            api,
            Arc::new(StaticCredentialSupplier::new("token")),
            DeviceCache::in_memory(),
            TransportSettings {
                requests_per_second: 1000,
                limiter_wait: Duration::from_millis(50),
            },
        )
    }

    #[test]
    fn test_overview_lists_history_when_nothing_plays() {
        let api = Arc::new(FakePlayerApi::with_playback(RemotePlayback::NoSession));
        *api.devices.lock().expect("fake lock") = vec![RemoteDevice {
            id: "desk".to_string(),
            name: "Desk Speaker".to_string(),
            is_active: true,
            volume_percent: Some(40),
        }];
        *api.recent.lock().expect("fake lock") = vec![RecentlyPlayedTrack {
            track: track("r1", "Old Favourite", 200_000),
            played_at: "2026-10-17T20:00:00Z".to_string(),
        }];
        let transport = transport_for(Arc::clone(&api));

        let lines = session_overview(&transport, &PlaybackState::default());

        assert_eq!(lines[0], "Active device: Desk Speaker");
        assert_eq!(lines[1], "Nothing playing. Recently played:");
        assert!(lines[2].contains("Old Favourite"));
        assert_eq!(api.count("recently_played"), 1);
        assert_eq!(transport.cached_device_id(), Some("desk".to_string()));
    }

    #[test]
    fn test_overview_skips_history_while_a_track_is_loaded() {
        let api = Arc::new(FakePlayerApi::default());
        let transport = transport_for(Arc::clone(&api));
        let mut state = PlaybackState::default();
        state.track = track("t1", "Current", 180_000);

        let lines = session_overview(&transport, &state);

        assert_eq!(lines, vec!["No active playback device".to_string()]);
        assert_eq!(api.count("recently_played"), 0);
    }
}
