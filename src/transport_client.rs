//! Authenticated remote player client used by the sync controller.
//!
//! Wraps a [`PlayerApi`] with credential lookup, input validation, request
//! throttling, and the no-active-device fallback.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use log::{debug, info, warn};

use crate::backends::{
    PlaybackSnapshot, PlayerApi, RecentlyPlayedTrack, RemoteDevice, RemoteError, RemotePlayback,
};
use crate::credentials::CredentialSupplier;
use crate::device_cache::DeviceCache;
use crate::playback_state::{RepeatMode, TrackDetails, TrackPosition};

const REQUEST_COUNT_LOG_EVERY: u64 = 100;
const RECENTLY_PLAYED_MAX: u8 = 50;

/// Client-side throttling settings.
#[derive(Debug, Clone, Copy)]
pub struct TransportSettings {
    pub requests_per_second: u32,
    pub limiter_wait: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            requests_per_second: 5,
            limiter_wait: Duration::from_millis(500),
        }
    }
}

/// Remote player client shared by every sync loop.
pub struct RemoteTransportClient {
    api: Arc<dyn PlayerApi>,
    credentials: Arc<dyn CredentialSupplier>,
    device_cache: DeviceCache,
    limiter: DefaultDirectRateLimiter,
    limiter_wait: Duration,
    blocked_until: Mutex<Option<Instant>>,
    request_count: AtomicU64,
}

impl RemoteTransportClient {
    pub fn new(
        api: Arc<dyn PlayerApi>,
        credentials: Arc<dyn CredentialSupplier>,
        device_cache: DeviceCache,
        settings: TransportSettings,
    ) -> Self {
        let per_second = NonZeroU32::new(settings.requests_per_second.max(1))
            .unwrap_or(NonZeroU32::MIN);
        Self {
            api,
            credentials,
            device_cache,
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
            limiter_wait: settings.limiter_wait,
            blocked_until: Mutex::new(None),
            request_count: AtomicU64::new(0),
        }
    }

    /// Total remote requests issued by this client.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn cached_device_id(&self) -> Option<String> {
        self.device_cache.device_id()
    }

    fn count_request(&self, label: &str) {
        let total = self.request_count.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("RemoteTransportClient: {} sent a request", label);
        if total % REQUEST_COUNT_LOG_EVERY == 0 {
            info!("RemoteTransportClient: total requests made: {}", total);
        }
    }

    fn wait_for_request_slot(&self) -> Result<(), RemoteError> {
        {
            let mut blocked_until = match self.blocked_until.lock() {
                Ok(blocked_until) => blocked_until,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(until) = *blocked_until {
                let now = Instant::now();
                if now < until {
                    return Err(RemoteError::RateLimited {
                        retry_after: Some(until - now),
                    });
                }
                *blocked_until = None;
            }
        }

        if self.limiter.check().is_ok() {
            return Ok(());
        }
        let deadline = Instant::now() + self.limiter_wait;
        while Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
            if self.limiter.check().is_ok() {
                return Ok(());
            }
        }
        Err(RemoteError::RateLimited { retry_after: None })
    }

    fn execute<T, F>(&self, label: &str, operation: F) -> Result<T, RemoteError>
    where
        F: FnOnce(&dyn PlayerApi, &str) -> Result<T, RemoteError>,
    {
        self.wait_for_request_slot()?;
        let token = self.credentials.access_token().map_err(|err| {
            warn!("RemoteTransportClient: {} skipped, no usable token ({})", label, err);
            RemoteError::Unauthorized
        })?;
        self.count_request(label);
        let result = operation(self.api.as_ref(), &token);
        match &result {
            Err(RemoteError::Unauthorized) => {
                warn!("RemoteTransportClient: {} rejected the access token", label);
                self.credentials.report_unauthorized();
            }
            Err(RemoteError::RateLimited {
                retry_after: Some(retry_after),
            }) => {
                warn!(
                    "RemoteTransportClient: {} rate limited for {}s",
                    label,
                    retry_after.as_secs()
                );
                let mut blocked_until = match self.blocked_until.lock() {
                    Ok(blocked_until) => blocked_until,
                    Err(poisoned) => poisoned.into_inner(),
                };
                *blocked_until = Some(Instant::now() + *retry_after);
            }
            Err(err) => debug!("RemoteTransportClient: {} failed: {}", label, err),
            Ok(_) => {}
        }
        result
    }

    /// Runs a state-changing call; on `NoActiveDevice` transfers playback to
    /// the last known device and retries once against it.
    fn execute_with_device_fallback<F>(&self, label: &str, operation: F) -> Result<(), RemoteError>
    where
        F: Fn(&dyn PlayerApi, &str, Option<&str>) -> Result<(), RemoteError>,
    {
        match self.execute(label, |api, token| operation(api, token, None)) {
            Err(RemoteError::NoActiveDevice) => {}
            other => return other,
        }

        let Some(device_id) = self.fallback_device_id() else {
            warn!(
                "RemoteTransportClient: {} failed, no device available for transfer",
                label
            );
            return Err(RemoteError::NoActiveDevice);
        };
        info!(
            "RemoteTransportClient: {} found no active device; transferring to {}",
            label, device_id
        );
        self.execute("transfer_playback", |api, token| {
            api.transfer_playback(token, &device_id, false)
        })?;
        self.execute(label, |api, token| {
            operation(api, token, Some(device_id.as_str()))
        })
    }

    fn fallback_device_id(&self) -> Option<String> {
        if let Some(device_id) = self.device_cache.device_id() {
            return Some(device_id);
        }
        match self.devices() {
            Ok(devices) => devices.into_iter().next().map(|device| device.id),
            Err(err) => {
                debug!("RemoteTransportClient: device discovery failed: {}", err);
                None
            }
        }
    }

    fn remember_active_device(&self, device: Option<&RemoteDevice>) {
        let Some(device) = device.filter(|device| device.is_active) else {
            return;
        };
        if let Err(err) = self.device_cache.remember(&device.id) {
            warn!("RemoteTransportClient: {}", err);
        }
    }

    /// Full playback snapshot. Caches the active device as a side effect.
    pub fn playback(&self) -> Result<RemotePlayback, RemoteError> {
        let playback = self.execute("playback_state", |api, token| api.playback_state(token))?;
        if let RemotePlayback::Active(snapshot) = &playback {
            self.remember_active_device(snapshot.device.as_ref());
        }
        Ok(playback)
    }

    pub fn currently_playing(&self) -> Result<RemotePlayback, RemoteError> {
        self.execute("currently_playing", |api, token| api.currently_playing(token))
    }

    /// Title of the current track, or the unavailable sentinel when nothing
    /// is playing.
    pub fn track_title(&self) -> Result<String, RemoteError> {
        let playback = self.currently_playing()?;
        Ok(playback
            .snapshot()
            .and_then(|snapshot| snapshot.track.as_ref())
            .map(|track| track.title.clone())
            .unwrap_or_else(|| TrackDetails::unavailable().title))
    }

    /// Elapsed/total of the current track, `None` when there is no session.
    pub fn playback_position(&self) -> Result<Option<TrackPosition>, RemoteError> {
        Ok(self.playback()?.snapshot().and_then(position_from_snapshot))
    }

    /// Lists devices and caches the active one.
    pub fn devices(&self) -> Result<Vec<RemoteDevice>, RemoteError> {
        let devices = self.execute("devices", |api, token| api.devices(token))?;
        self.remember_active_device(devices.iter().find(|device| device.is_active));
        Ok(devices)
    }

    pub fn active_device(&self) -> Result<Option<RemoteDevice>, RemoteError> {
        Ok(self
            .devices()?
            .into_iter()
            .find(|device| device.is_active))
    }

    pub fn queue(&self) -> Result<Vec<TrackDetails>, RemoteError> {
        self.execute("queue", |api, token| api.queue(token))
    }

    pub fn recently_played(&self, limit: u8) -> Result<Vec<RecentlyPlayedTrack>, RemoteError> {
        let limit = limit.clamp(1, RECENTLY_PLAYED_MAX);
        self.execute("recently_played", |api, token| {
            api.recently_played(token, limit)
        })
    }

    pub fn play(&self) -> Result<(), RemoteError> {
        self.execute_with_device_fallback("play", |api, token, device| api.play(token, device))
    }

    pub fn pause(&self) -> Result<(), RemoteError> {
        self.execute_with_device_fallback("pause", |api, token, device| api.pause(token, device))
    }

    pub fn skip_next(&self) -> Result<(), RemoteError> {
        self.execute_with_device_fallback("skip_next", |api, token, device| {
            api.skip_next(token, device)
        })
    }

    pub fn skip_previous(&self) -> Result<(), RemoteError> {
        self.execute_with_device_fallback("skip_previous", |api, token, device| {
            api.skip_previous(token, device)
        })
    }

    pub fn seek(&self, position_ms: u64) -> Result<(), RemoteError> {
        self.execute_with_device_fallback("seek", |api, token, device| {
            api.seek(token, position_ms, device)
        })
    }

    /// Sets the volume; values outside 0..=100 never reach the network.
    pub fn set_volume(&self, volume_percent: i32) -> Result<(), RemoteError> {
        let volume = validate_volume(volume_percent)?;
        self.execute_with_device_fallback("set_volume", |api, token, device| {
            api.set_volume(token, volume, device)
        })
    }

    pub fn set_shuffle(&self, enabled: bool) -> Result<(), RemoteError> {
        self.execute_with_device_fallback("set_shuffle", |api, token, device| {
            api.set_shuffle(token, enabled, device)
        })
    }

    pub fn set_repeat(&self, mode: RepeatMode) -> Result<(), RemoteError> {
        self.execute_with_device_fallback("set_repeat", |api, token, device| {
            api.set_repeat(token, mode, device)
        })
    }

    /// Parses a raw repeat mode before any network activity.
    pub fn set_repeat_str(&self, mode: &str) -> Result<(), RemoteError> {
        self.set_repeat(mode.parse::<RepeatMode>()?)
    }

    pub fn transfer_playback(&self, device_id: &str, play: bool) -> Result<(), RemoteError> {
        if device_id.trim().is_empty() {
            return Err(RemoteError::InvalidInput("empty device id".to_string()));
        }
        self.execute("transfer_playback", |api, token| {
            api.transfer_playback(token, device_id, play)
        })
    }
}

pub fn validate_volume(volume_percent: i32) -> Result<u8, RemoteError> {
    u8::try_from(volume_percent)
        .ok()
        .filter(|volume| *volume <= 100)
        .ok_or_else(|| {
            RemoteError::InvalidInput(format!("volume {volume_percent} is outside 0..=100"))
        })
}

pub fn position_from_snapshot(snapshot: &PlaybackSnapshot) -> Option<TrackPosition> {
    let track = snapshot.track.as_ref()?;
    let elapsed_ms = snapshot.progress_ms.known_copied().unwrap_or(0);
    Some(TrackPosition::new(elapsed_ms, track.duration_ms))
}


#[cfg(test)]
mod tests {
    use super::test_support::{active_snapshot, track, FakePlayerApi};
    use super::{validate_volume, RemoteTransportClient, TransportSettings};
    use crate::backends::{RemoteDevice, RemoteError, RemotePlayback};
    use crate::credentials::StaticCredentialSupplier;
    use crate::device_cache::DeviceCache;
    use crate::playback_state::UNAVAILABLE_TITLE;
    use std::sync::Arc;
    use std::time::Duration;

    fn client_with(api: Arc<FakePlayerApi>) -> RemoteTransportClient {
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
    fn test_empty_session_yields_unavailable_title() {
        let api = Arc::new(FakePlayerApi::with_playback(RemotePlayback::NoSession));
        let client = client_with(Arc::clone(&api));

        assert_eq!(client.track_title(), Ok(UNAVAILABLE_TITLE.to_string()));
        assert_eq!(client.playback(), Ok(RemotePlayback::NoSession));
        assert_eq!(client.playback_position(), Ok(None));
    }

    #[test]
    fn test_invalid_volume_is_rejected_before_network() {
        let api = Arc::new(FakePlayerApi::default());
        let client = client_with(Arc::clone(&api));

        for volume in [-1, 101, 1000] {
            assert!(matches!(
                client.set_volume(volume),
                Err(RemoteError::InvalidInput(_))
            ));
        }
        assert!(matches!(
            client.set_repeat_str("sometimes"),
            Err(RemoteError::InvalidInput(_))
        ));
        assert!(api.calls().is_empty());
        assert_eq!(client.request_count(), 0);
        assert_eq!(validate_volume(0), Ok(0));
        assert_eq!(validate_volume(100), Ok(100));
    }

    #[test]
    fn test_playback_caches_active_device() {
        let api = Arc::new(FakePlayerApi::with_playback(RemotePlayback::Active(
            active_snapshot(track("t1", "Song", 180_000), 1_000, true),
        )));
        let client = client_with(Arc::clone(&api));

        client.playback().expect("playback");
        assert_eq!(client.cached_device_id().as_deref(), Some("desk"));
    }

    #[test]
    fn test_no_active_device_transfers_to_cached_device_and_retries_once() {
        let api = Arc::new(FakePlayerApi::default());
        let client = client_with(Arc::clone(&api));
        client.device_cache.remember("phone").expect("memory");
        api.fail_next("play", RemoteError::NoActiveDevice);

        assert_eq!(client.play(), Ok(()));
        assert_eq!(
            api.calls(),
            vec![
                "play:".to_string(),
                "transfer_playback:phone:false".to_string(),
                "play:@phone".to_string(),
            ]
        );
    }

    #[test]
    fn test_device_fallback_reports_failure_when_retry_fails() {
        let api = Arc::new(FakePlayerApi::default());
        let client = client_with(Arc::clone(&api));
        client.device_cache.remember("phone").expect("memory");
        api.fail_next("set_volume", RemoteError::NoActiveDevice);
        api.fail_next("set_volume", RemoteError::NoActiveDevice);

        assert_eq!(client.set_volume(30), Err(RemoteError::NoActiveDevice));
        assert_eq!(api.count("set_volume"), 2);
        assert_eq!(api.count("transfer_playback"), 1);
    }

    #[test]
    fn test_fallback_discovers_a_device_when_cache_is_empty() {
        let api = Arc::new(FakePlayerApi::default());
        *api.devices.lock().expect("fake lock") = vec![RemoteDevice {
            id: "laptop".to_string(),
            name: "Laptop".to_string(),
            is_active: false,
            volume_percent: None,
        }];
        let client = client_with(Arc::clone(&api));
        api.fail_next("pause", RemoteError::NoActiveDevice);

        assert_eq!(client.pause(), Ok(()));
        assert!(api.calls().contains(&"transfer_playback:laptop:false".to_string()));
        assert_eq!(api.calls().last().map(String::as_str), Some("pause:@laptop"));
    }

    #[test]
    fn test_unauthorized_is_surfaced_without_retry() {
        let api = Arc::new(FakePlayerApi::default());
        let credentials = Arc::new(StaticCredentialSupplier::new("token"));
        let client = RemoteTransportClient::new(
            Arc::clone(&api) as Arc<dyn crate::backends::PlayerApi>,
            Arc::clone(&credentials) as Arc<dyn crate::credentials::CredentialSupplier>,
            DeviceCache::in_memory(),
            TransportSettings::default(),
        );
        api.fail_next("pause", RemoteError::Unauthorized);

        assert_eq!(client.pause(), Err(RemoteError::Unauthorized));
        assert_eq!(api.count("pause"), 1);
        // A single rejection does not disable a fixed token for later calls.
        assert_eq!(client.pause(), Ok(()));
        assert_eq!(api.count("pause"), 2);
    }

    #[test]
    fn test_retry_after_blocks_requests_locally() {
        let api = Arc::new(FakePlayerApi::default());
        let client = client_with(Arc::clone(&api));
        api.fail_next(
            "queue",
            RemoteError::RateLimited {
                retry_after: Some(Duration::from_secs(30)),
            },
        );

        assert!(client.queue().is_err());
        assert!(matches!(
            client.queue(),
            Err(RemoteError::RateLimited {
                retry_after: Some(_)
            })
        ));
        assert_eq!(api.count("queue"), 1);
    }

    #[test]
    fn test_recently_played_limit_is_clamped() {
        let api = Arc::new(FakePlayerApi::default());
        let client = client_with(Arc::clone(&api));
        client.recently_played(0).expect("history");
        client.recently_played(200).expect("history");
        assert_eq!(
            api.calls(),
            vec!["recently_played:1".to_string(), "recently_played:50".to_string()]
        );
    }
}
