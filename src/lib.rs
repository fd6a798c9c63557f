//! Playback-state sync core for a desktop mini-player driving a remote
//! streaming player.

pub mod app_bootstrap;
pub mod app_runtime;
pub mod backends;
pub mod config;
pub mod config_persistence;
pub mod cover_art;
pub mod credential_keyring;
pub mod credentials;
pub mod device_cache;
pub mod display_text;
pub mod media_controls_manager;
pub mod now_playing_presenter;
pub mod oauth;
pub mod playback_clock;
pub mod playback_state;
pub mod protocol;
pub mod skip_coalescer;
pub mod sync_controller;
pub mod transport_client;
pub mod volume_debounce;
