//! Keyring helpers for Spotify account secrets.

use keyring::Entry;

const SPOTIFY_SERVICE_NAME: &str = "tunebar.spotify";

fn spotify_entry(kind: &str, client_id: &str) -> Result<Entry, String> {
    Entry::new(SPOTIFY_SERVICE_NAME, &format!("{kind}:{client_id}"))
        .map_err(|err| format!("failed to create keyring entry: {err}"))
}

fn read_secret(kind: &str, client_id: &str) -> Result<Option<String>, String> {
    let entry = spotify_entry(kind, client_id)?;
    match entry.get_password() {
        Ok(secret) => Ok(Some(secret)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(format!("failed to read {kind} from keyring: {err}")),
    }
}

/// Saves the OAuth refresh token for an app client id.
pub fn set_refresh_token(client_id: &str, refresh_token: &str) -> Result<(), String> {
    spotify_entry("refresh_token", client_id)?
        .set_password(refresh_token)
        .map_err(|err| format!("failed to store refresh token in keyring: {err}"))
}

/// Loads the OAuth refresh token for an app client id.
pub fn get_refresh_token(client_id: &str) -> Result<Option<String>, String> {
    read_secret("refresh_token", client_id)
}

/// Forgets the refresh token, forcing a browser sign-in on next start.
pub fn delete_refresh_token(client_id: &str) -> Result<(), String> {
    let entry = spotify_entry("refresh_token", client_id)?;
    match entry.delete_password() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(err) => Err(format!("failed to delete refresh token from keyring: {err}")),
    }
}

/// Loads the app client secret, if it was stored.
pub fn get_client_secret(client_id: &str) -> Result<Option<String>, String> {
    read_secret("client_secret", client_id)
}

pub fn set_client_secret(client_id: &str, client_secret: &str) -> Result<(), String> {
    spotify_entry("client_secret", client_id)?
        .set_password(client_secret)
        .map_err(|err| format!("failed to store client secret in keyring: {err}"))
}
