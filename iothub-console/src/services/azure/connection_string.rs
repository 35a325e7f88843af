//! Service connection strings, e.g.
//! `HostName=myhub.azure-devices.net;SharedAccessKeyName=iothubowner;SharedAccessKey=...`.

use secrecy::{ExposeSecret, Secret};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionStringError {
    #[error("connection string is missing '{0}'")]
    Missing(&'static str),

    #[error("malformed connection string segment '{0}'")]
    Malformed(String),
}

/// Parsed shared-access connection string for IoT Hub or DPS.
#[derive(Clone)]
pub struct ConnectionString {
    pub host_name: String,
    pub key_name: String,
    key: Secret<String>,
}

impl ConnectionString {
    pub fn parse(raw: &str) -> Result<Self, ConnectionStringError> {
        let mut host_name = None;
        let mut key_name = None;
        let mut key = None;

        for segment in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            // Keys are base64 and may end in '=', so only split on the first one.
            let (name, value) = segment
                .split_once('=')
                .ok_or_else(|| ConnectionStringError::Malformed(segment.to_string()))?;
            match name {
                "HostName" => host_name = Some(value.to_string()),
                "SharedAccessKeyName" => key_name = Some(value.to_string()),
                "SharedAccessKey" => key = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(Self {
            host_name: host_name
                .filter(|v| !v.is_empty())
                .ok_or(ConnectionStringError::Missing("HostName"))?,
            key_name: key_name
                .filter(|v| !v.is_empty())
                .ok_or(ConnectionStringError::Missing("SharedAccessKeyName"))?,
            key: Secret::new(
                key.filter(|v| !v.is_empty())
                    .ok_or(ConnectionStringError::Missing("SharedAccessKey"))?,
            ),
        })
    }

    pub fn key(&self) -> &str {
        self.key.expose_secret()
    }

    pub fn resource_name(&self) -> &str {
        resource_name(&self.host_name)
    }
}

/// First label of a hub or provisioning host name.
pub fn resource_name(host_name: &str) -> &str {
    host_name.split('.').next().unwrap_or(host_name)
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("host_name", &self.host_name)
            .field("key_name", &self.key_name)
            .finish_non_exhaustive()
    }
}
