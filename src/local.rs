use crate::discovery::DiscoveryService;
use crate::error::{FireplaceError, Result};
use crate::types::{parse_state, Device, FireplaceState};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// LAN transport for fireplaces discovered on the local network
///
/// State polls are unauthenticated; commands are signed per request with a
/// challenge-response scheme bound to the device's API key. No cloud
/// session is involved, so this transport keeps working when the relay
/// service is down.
pub struct LocalTransport {
    http: reqwest::Client,
    discovery: Arc<DiscoveryService>,
    user_id: String,
}

impl LocalTransport {
    /// Create a local transport reading addresses from a discovery service
    ///
    /// `user_id` is the cloud account id included in signed commands; the
    /// firmware rejects posts without it.
    pub fn new(discovery: Arc<DiscoveryService>, user_id: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            discovery,
            user_id: user_id.into(),
        })
    }

    /// Fetch the current state snapshot for a device
    pub async fn status(&self, serial: &str) -> Result<FireplaceState> {
        self.poll(serial).await
    }

    /// Poll a device for its current state
    ///
    /// Unlike the cloud long-poll this returns immediately, so callers
    /// schedule their own delay between calls.
    pub async fn poll(&self, serial: &str) -> Result<FireplaceState> {
        let url = self.device_url(serial, "poll")?;
        tracing::debug!("Local poll for status on {} at {}", serial, url);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| FireplaceError::LocalUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(FireplaceError::LocalUnavailable(format!(
                "poll returned {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FireplaceError::LocalUnavailable(e.to_string()))?;
        let body: serde_json::Value = serde_json::from_str(&body)?;
        parse_state(&body)
    }

    /// Apply one setting to a device over the LAN
    ///
    /// Fetches a fresh challenge nonce, signs the command payload with the
    /// device's API key, and posts the signed form.
    pub async fn post(&self, device: &Device, command: &str, value: &str) -> Result<()> {
        let apikey = device.apikey.as_deref().ok_or_else(|| {
            FireplaceError::Auth(format!("no local api key for {}", device.serial))
        })?;

        let challenge_url = self.device_url(&device.serial, "get_challenge")?;
        let response = self
            .http
            .get(&challenge_url)
            .send()
            .await
            .map_err(|e| FireplaceError::LocalUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(FireplaceError::LocalUnavailable(format!(
                "challenge returned {}",
                response.status()
            )));
        }
        let challenge = response
            .text()
            .await
            .map_err(|e| FireplaceError::LocalUnavailable(e.to_string()))?;

        let signed = sign_command(apikey, &challenge, command, value)?;

        tracing::info!("Sending {}={} to fireplace {} over LAN", command, value, device.name);
        let post_url = self.device_url(&device.serial, "post")?;
        let response = self
            .http
            .post(&post_url)
            .form(&[
                ("command", command),
                ("value", value),
                ("user", self.user_id.as_str()),
                ("response", signed.as_str()),
            ])
            .send()
            .await
            .map_err(|e| FireplaceError::LocalUnavailable(e.to_string()))?;

        tracing::info!("Fireplace {} update response: {}", device.name, response.status());
        if response.status().is_success() {
            Ok(())
        } else {
            Err(FireplaceError::LocalUnavailable(format!(
                "post returned {}",
                response.status()
            )))
        }
    }

    fn device_url(&self, serial: &str, action: &str) -> Result<String> {
        let ip = self.discovery.ip(serial).ok_or_else(|| {
            FireplaceError::LocalUnavailable(format!("no known address for {serial}"))
        })?;
        Ok(format!("http://{ip}/{action}"))
    }
}

/// Compute the response field for a signed local command.
///
/// The firmware hashes its API key, the decoded challenge nonce, and the
/// literal payload string, then hashes the key with that digest again and
/// compares hex. The payload keeps the `post:` prefix and exact
/// `command=..&value=..` formatting; any deviation in byte layout is
/// rejected by the device.
pub fn sign_command(apikey: &str, challenge: &str, command: &str, value: &str) -> Result<String> {
    let key = hex::decode(apikey.trim())
        .map_err(|e| FireplaceError::Auth(format!("invalid api key: {e}")))?;
    let nonce = hex::decode(challenge.trim())
        .map_err(|e| FireplaceError::InvalidResponse(format!("invalid challenge: {e}")))?;
    let payload = format!("post:command={command}&value={value}");

    let mut hasher = Sha256::new();
    hasher.update(&key);
    hasher.update(&nonce);
    hasher.update(payload.as_bytes());
    let sig = hasher.finalize();

    let mut outer = Sha256::new();
    outer.update(&key);
    outer.update(sig);
    Ok(hex::encode(outer.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const APIKEY: &str = "8824ff0cd66e87c28eb8f16e4e4f3a81";
    const CHALLENGE: &str = "1f7a9d00c8b4e2a6";

    #[test]
    fn signing_is_deterministic() {
        let first = sign_command(APIKEY, CHALLENGE, "height", "3").unwrap();
        let second = sign_command(APIKEY, CHALLENGE, "height", "3").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signing_matches_manual_concatenation() {
        let key = hex::decode(APIKEY).unwrap();
        let nonce = hex::decode(CHALLENGE).unwrap();

        let mut inner = Vec::new();
        inner.extend_from_slice(&key);
        inner.extend_from_slice(&nonce);
        inner.extend_from_slice(b"post:command=power&value=1");
        let sig = Sha256::digest(&inner);

        let mut outer = Vec::new();
        outer.extend_from_slice(&key);
        outer.extend_from_slice(&sig);
        let expected = hex::encode(Sha256::digest(&outer));

        assert_eq!(sign_command(APIKEY, CHALLENGE, "power", "1").unwrap(), expected);
    }

    #[test]
    fn signature_depends_on_every_input() {
        let base = sign_command(APIKEY, CHALLENGE, "power", "1").unwrap();
        assert_ne!(base, sign_command(APIKEY, CHALLENGE, "power", "0").unwrap());
        assert_ne!(base, sign_command(APIKEY, CHALLENGE, "light", "1").unwrap());
        assert_ne!(base, sign_command(APIKEY, "aabbccdd", "power", "1").unwrap());
    }

    #[test]
    fn whitespace_around_challenge_is_trimmed() {
        let bare = sign_command(APIKEY, CHALLENGE, "power", "1").unwrap();
        let padded = sign_command(APIKEY, &format!("{CHALLENGE}\n"), "power", "1").unwrap();
        assert_eq!(bare, padded);
    }

    #[test]
    fn invalid_api_key_is_an_auth_error() {
        let result = sign_command("not-hex", CHALLENGE, "power", "1");
        assert!(matches!(result, Err(FireplaceError::Auth(_))));
    }

    #[test]
    fn invalid_challenge_is_a_protocol_error() {
        let result = sign_command(APIKEY, "zzzz", "power", "1");
        assert!(matches!(result, Err(FireplaceError::InvalidResponse(_))));
    }
}
