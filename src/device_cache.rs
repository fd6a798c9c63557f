//! Last-known playback device id, persisted as a `key=value` side file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, warn};

const DEVICE_ID_KEY: &str = "device_id";
const CACHE_FILE_NAME: &str = "device.ini";

/// Shared device-id cache. Writes are last-writer-wins.
pub struct DeviceCache {
    path: Option<PathBuf>,
    device_id: Mutex<Option<String>>,
}

impl DeviceCache {
    /// Cache that lives only for this process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            device_id: Mutex::new(None),
        }
    }

    /// Loads the cache file; a missing or unreadable file is an empty cache.
    pub fn load(path: PathBuf) -> Self {
        let device_id = match std::fs::read_to_string(&path) {
            Ok(text) => lookup_entry(&parse_entries(&text), DEVICE_ID_KEY),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(
                    "DeviceCache: failed to read {} ({}); starting empty",
                    path.display(),
                    err
                );
                None
            }
        };
        Self {
            path: Some(path),
            device_id: Mutex::new(device_id),
        }
    }

    /// Default cache location under the user's cache directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::cache_dir().map(|path| path.join("tunebar").join(CACHE_FILE_NAME))
    }

    pub fn device_id(&self) -> Option<String> {
        match self.device_id.lock() {
            Ok(cached) => cached.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Records `device_id` and persists it when it changed.
    pub fn remember(&self, device_id: &str) -> Result<(), String> {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Ok(());
        }
        {
            let mut cached = match self.device_id.lock() {
                Ok(cached) => cached,
                Err(poisoned) => poisoned.into_inner(),
            };
            if cached.as_deref() == Some(device_id) {
                return Ok(());
            }
            *cached = Some(device_id.to_string());
        }
        debug!("DeviceCache: remembered device {}", device_id);
        match self.path.as_deref() {
            Some(path) => persist_entry(path, DEVICE_ID_KEY, device_id),
            None => Ok(()),
        }
    }
}

fn parse_entries(text: &str) -> Vec<(String, String)> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

fn lookup_entry(entries: &[(String, String)], key: &str) -> Option<String> {
    entries
        .iter()
        .rev()
        .find(|(entry_key, value)| entry_key == key && !value.is_empty())
        .map(|(_, value)| value.clone())
}

fn persist_entry(path: &Path, key: &str, value: &str) -> Result<(), String> {
    let mut entries = std::fs::read_to_string(path)
        .map(|text| parse_entries(&text))
        .unwrap_or_default();
    entries.retain(|(entry_key, _)| entry_key != key);
    entries.push((key.to_string(), value.to_string()));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| {
            format!(
                "failed to create device cache directory {}: {err}",
                parent.display()
            )
        })?;
    }
    let text: String = entries
        .iter()
        .map(|(entry_key, entry_value)| format!("{entry_key}={entry_value}\n"))
        .collect();
    std::fs::write(path, text)
        .map_err(|err| format!("failed to write device cache {}: {err}", path.display()))
}
