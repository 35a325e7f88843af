//! Shared access signature tokens for the hub and provisioning REST APIs.

use super::connection_string::ConnectionString;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SasError {
    #[error("shared access key is not valid base64: {0}")]
    InvalidKey(#[from] base64::DecodeError),

    #[error("shared access key has an unusable length")]
    KeyLength,

    #[error("failed to encode token: {0}")]
    Encoding(#[from] serde_urlencoded::ser::Error),
}

/// Builds `SharedAccessSignature` authorization values from a connection string.
#[derive(Debug, Clone)]
pub struct SasTokenProvider {
    credentials: ConnectionString,
    ttl: Duration,
}

impl SasTokenProvider {
    pub fn new(credentials: ConnectionString, ttl: Duration) -> Self {
        Self { credentials, ttl }
    }

    pub fn host_name(&self) -> &str {
        &self.credentials.host_name
    }

    /// Token valid for the configured lifetime starting now.
    pub fn token(&self) -> Result<String, SasError> {
        self.token_at(Utc::now() + self.ttl)
    }

    pub fn token_at(&self, expiry: DateTime<Utc>) -> Result<String, SasError> {
        let key = STANDARD.decode(self.credentials.key())?;
        let expiry = expiry.timestamp().to_string();
        let resource = serde_urlencoded::to_string([("sr", self.credentials.host_name.as_str())])?;
        let resource = resource.trim_start_matches("sr=");

        let string_to_sign = format!("{}\n{}", resource, expiry);
        let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| SasError::KeyLength)?;
        mac.update(string_to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        let query = serde_urlencoded::to_string([
            ("sr", self.credentials.host_name.as_str()),
            ("sig", signature.as_str()),
            ("se", expiry.as_str()),
            ("skn", self.credentials.key_name.as_str()),
        ])?;
        Ok(format!("SharedAccessSignature {}", query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn provider() -> SasTokenProvider {
        let credentials = ConnectionString::parse(
            "HostName=myhub.azure-devices.net;SharedAccessKeyName=iothubowner;SharedAccessKey=c2VjcmV0LWtleQ==",
        )
        .unwrap();
        SasTokenProvider::new(credentials, Duration::hours(1))
    }

    #[test]
    fn test_token_layout() {
        let expiry = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let token = provider().token_at(expiry).unwrap();

        assert!(token.starts_with("SharedAccessSignature sr=myhub.azure-devices.net&sig="));
        assert!(token.ends_with(&format!("&se={}&skn=iothubowner", expiry.timestamp())));
    }

    #[test]
    fn test_signature_matches_hmac_of_resource_and_expiry() {
        let expiry = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let token = provider().token_at(expiry).unwrap();

        let mut mac = HmacSha256::new_from_slice(b"secret-key").unwrap();
        mac.update(format!("myhub.azure-devices.net\n{}", expiry.timestamp()).as_bytes());
        let expected = STANDARD.encode(mac.finalize().into_bytes());
        let encoded: String = serde_urlencoded::to_string([("sig", expected.as_str())]).unwrap();

        assert!(token.contains(&encoded));
    }

    #[test]
    fn test_invalid_key_is_rejected() {
        let credentials =
            ConnectionString::parse("HostName=h.net;SharedAccessKeyName=o;SharedAccessKey=!!!")
                .unwrap();
        let provider = SasTokenProvider::new(credentials, Duration::hours(1));
        assert!(matches!(provider.token(), Err(SasError::InvalidKey(_))));
    }
}
