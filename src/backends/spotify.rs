//! Spotify Web API player adapter backed by `ureq`.

use std::time::Duration;

use log::debug;
use serde_json::{json, Value};

use crate::backends::{
    PlaybackSnapshot, PlayerApi, RecentlyPlayedTrack, RemoteDevice, RemoteError, RemotePlayback,
};
use crate::playback_state::{FieldState, RepeatMode, TrackDetails, UNAVAILABLE_TITLE};

pub const DEFAULT_API_BASE_URL: &str = "https://api.spotify.com/v1";

/// Player adapter for the Spotify Web API.
pub struct SpotifyPlayerApi {
    http_client: ureq::Agent,
    base_url: String,
}

impl SpotifyPlayerApi {
    /// Creates an adapter with bounded connect and request timeouts.
    pub fn new(base_url: &str, connect_timeout: Duration, request_timeout: Duration) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .timeout_read(request_timeout)
            .timeout_write(request_timeout)
            .build();
        Self {
            http_client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
        }
    }

    fn player_url(&self, path: &str, query: &[(&str, String)]) -> String {
        let mut url = format!("{}/me/player{}", self.base_url, path);
        for (index, (key, value)) in query.iter().enumerate() {
            url.push(if index == 0 { '?' } else { '&' });
            url.push_str(key);
            url.push('=');
            url.push_str(urlencoding::encode(value).as_ref());
        }
        url
    }

    fn send(
        &self,
        method: &str,
        path: &str,
        query: &[(&str, String)],
        token: &str,
        body: Option<Value>,
    ) -> Result<String, RemoteError> {
        let url = self.player_url(path, query);
        let label = format!("{method} /me/player{path}");
        debug!("SpotifyPlayerApi: {}", label);
        let request = self
            .http_client
            .request(method, &url)
            .set("Authorization", &format!("Bearer {token}"));
        let result = match body {
            Some(body) => request.send_json(body),
            None if method == "GET" => request.call(),
            None => request.send_string(""),
        };
        let response = result.map_err(|err| classify_ureq_failure(&label, err))?;
        response
            .into_string()
            .map_err(|err| RemoteError::Network(format!("{label} body read failed: {err}")))
    }

    fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
        token: &str,
    ) -> Result<Option<Value>, RemoteError> {
        let text = self.send("GET", path, query, token, None)?;
        parse_body(path, &text)
    }

    fn command(
        &self,
        method: &str,
        path: &str,
        mut query: Vec<(&str, String)>,
        device_id: Option<&str>,
        token: &str,
    ) -> Result<(), RemoteError> {
        if let Some(device_id) = device_id {
            query.push(("device_id", device_id.to_string()));
        }
        self.send(method, path, &query, token, None).map(|_| ())
    }
}

impl Default for SpotifyPlayerApi {
    fn default() -> Self {
        Self::new(
            DEFAULT_API_BASE_URL,
            Duration::from_secs(5),
            Duration::from_secs(15),
        )
    }
}

/// Maps `ureq` failures onto the remote error taxonomy.
pub(crate) fn classify_ureq_failure(label: &str, error: ureq::Error) -> RemoteError {
    match error {
        ureq::Error::Status(401, _) => RemoteError::Unauthorized,
        ureq::Error::Status(404, _) => RemoteError::NoActiveDevice,
        ureq::Error::Status(429, response) => RemoteError::RateLimited {
            retry_after: response
                .header("Retry-After")
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        },
        ureq::Error::Status(code, _) => {
            RemoteError::Network(format!("{label} failed with status {code}"))
        }
        ureq::Error::Transport(transport) => {
            RemoteError::Network(format!("{label} failed: {transport}"))
        }
    }
}

/// Parses a response body; blank bodies mean "no data".
pub(crate) fn parse_body(label: &str, text: &str) -> Result<Option<Value>, RemoteError> {
    if text.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text)
        .map(Some)
        .map_err(|err| RemoteError::MalformedResponse(format!("{label}: {err}")))
}

fn text_or_unknown(value: Option<&Value>) -> String {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .unwrap_or(UNAVAILABLE_TITLE)
        .to_string()
}

fn spotify_url(value: Option<&Value>) -> Option<String> {
    value
        .and_then(|value| value.get("external_urls"))
        .and_then(|urls| urls.get("spotify"))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}

pub(crate) fn parse_track(item: &Value) -> Option<TrackDetails> {
    if !item.is_object() {
        return None;
    }
    let first_artist = item
        .get("artists")
        .and_then(Value::as_array)
        .and_then(|artists| artists.first());
    let album = item.get("album");
    let cover_url = album
        .and_then(|album| album.get("images"))
        .and_then(Value::as_array)
        .and_then(|images| images.first())
        .and_then(|image| image.get("url"))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);
    Some(TrackDetails {
        track_id: item.get("id").and_then(Value::as_str).map(ToOwned::to_owned),
        title: text_or_unknown(item.get("name")),
        artist: text_or_unknown(first_artist.and_then(|artist| artist.get("name"))),
        album: text_or_unknown(album.and_then(|album| album.get("name"))),
        cover_url,
        duration_ms: item
            .get("duration_ms")
            .and_then(Value::as_u64)
            .unwrap_or_default(),
        artist_url: spotify_url(first_artist),
        album_url: spotify_url(album),
    })
}

pub(crate) fn parse_device(value: &Value) -> Option<RemoteDevice> {
    let id = value.get("id")?.as_str()?.to_string();
    Some(RemoteDevice {
        id,
        name: value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        is_active: value
            .get("is_active")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        volume_percent: value
            .get("volume_percent")
            .and_then(Value::as_u64)
            .map(|volume| volume.min(100) as u8),
    })
}

pub(crate) fn parse_playback(value: &Value) -> Result<PlaybackSnapshot, RemoteError> {
    if !value.is_object() {
        return Err(RemoteError::MalformedResponse(
            "playback payload is not an object".to_string(),
        ));
    }
    let repeat_mode = match value.get("repeat_state").and_then(Value::as_str) {
        Some(raw) => raw
            .parse::<RepeatMode>()
            .map(FieldState::Known)
            .unwrap_or(FieldState::Unknown),
        None => FieldState::Unknown,
    };
    Ok(PlaybackSnapshot {
        is_playing: FieldState::from_option(value.get("is_playing").and_then(Value::as_bool)),
        shuffle: FieldState::from_option(value.get("shuffle_state").and_then(Value::as_bool)),
        repeat_mode,
        progress_ms: FieldState::from_option(value.get("progress_ms").and_then(Value::as_u64)),
        device: value.get("device").and_then(parse_device),
        track: value.get("item").and_then(parse_track),
    })
}

fn playback_from_body(body: Option<Value>) -> Result<RemotePlayback, RemoteError> {
    match body {
        None => Ok(RemotePlayback::NoSession),
        Some(value) => parse_playback(&value).map(RemotePlayback::Active),
    }
}

impl PlayerApi for SpotifyPlayerApi {
    fn playback_state(&self, token: &str) -> Result<RemotePlayback, RemoteError> {
        playback_from_body(self.get_json("", &[], token)?)
    }

    fn currently_playing(&self, token: &str) -> Result<RemotePlayback, RemoteError> {
        playback_from_body(self.get_json("/currently-playing", &[], token)?)
    }

    fn devices(&self, token: &str) -> Result<Vec<RemoteDevice>, RemoteError> {
        let Some(payload) = self.get_json("/devices", &[], token)? else {
            return Ok(Vec::new());
        };
        Ok(payload
            .get("devices")
            .and_then(Value::as_array)
            .map(|devices| devices.iter().filter_map(parse_device).collect())
            .unwrap_or_default())
    }

    fn queue(&self, token: &str) -> Result<Vec<TrackDetails>, RemoteError> {
        let Some(payload) = self.get_json("/queue", &[], token)? else {
            return Ok(Vec::new());
        };
        Ok(payload
            .get("queue")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(parse_track).collect())
            .unwrap_or_default())
    }

    fn recently_played(
        &self,
        token: &str,
        limit: u8,
    ) -> Result<Vec<RecentlyPlayedTrack>, RemoteError> {
        let Some(payload) =
            self.get_json("/recently-played", &[("limit", limit.to_string())], token)?
        else {
            return Ok(Vec::new());
        };
        Ok(payload
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|entry| {
                        Some(RecentlyPlayedTrack {
                            track: parse_track(entry.get("track")?)?,
                            played_at: entry
                                .get("played_at")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn play(&self, token: &str, device_id: Option<&str>) -> Result<(), RemoteError> {
        self.command("PUT", "/play", Vec::new(), device_id, token)
    }

    fn pause(&self, token: &str, device_id: Option<&str>) -> Result<(), RemoteError> {
        self.command("PUT", "/pause", Vec::new(), device_id, token)
    }

    fn skip_next(&self, token: &str, device_id: Option<&str>) -> Result<(), RemoteError> {
        self.command("POST", "/next", Vec::new(), device_id, token)
    }

    fn skip_previous(&self, token: &str, device_id: Option<&str>) -> Result<(), RemoteError> {
        self.command("POST", "/previous", Vec::new(), device_id, token)
    }

    fn seek(
        &self,
        token: &str,
        position_ms: u64,
        device_id: Option<&str>,
    ) -> Result<(), RemoteError> {
        self.command(
            "PUT",
            "/seek",
            vec![("position_ms", position_ms.to_string())],
            device_id,
            token,
        )
    }

    fn set_volume(
        &self,
        token: &str,
        volume_percent: u8,
        device_id: Option<&str>,
    ) -> Result<(), RemoteError> {
        self.command(
            "PUT",
            "/volume",
            vec![("volume_percent", volume_percent.to_string())],
            device_id,
            token,
        )
    }

    fn set_shuffle(
        &self,
        token: &str,
        enabled: bool,
        device_id: Option<&str>,
    ) -> Result<(), RemoteError> {
        self.command(
            "PUT",
            "/shuffle",
            vec![("state", enabled.to_string())],
            device_id,
            token,
        )
    }

    fn set_repeat(
        &self,
        token: &str,
        mode: RepeatMode,
        device_id: Option<&str>,
    ) -> Result<(), RemoteError> {
        self.command(
            "PUT",
            "/repeat",
            vec![("state", mode.as_api_str().to_string())],
            device_id,
            token,
        )
    }

    fn transfer_playback(
        &self,
        token: &str,
        device_id: &str,
        play: bool,
    ) -> Result<(), RemoteError> {
        self.send(
            "PUT",
            "",
            &[],
            token,
            Some(json!({ "device_ids": [device_id], "play": play })),
        )
        .map(|_| ())
    }
}
