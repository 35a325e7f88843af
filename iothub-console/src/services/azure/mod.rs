//! REST clients for IoT Hub and the Device Provisioning Service.

pub mod connection_string;
pub mod dps;
pub mod iothub;
pub mod sas;

pub use connection_string::{resource_name, ConnectionString, ConnectionStringError};
pub use dps::DpsClient;
pub use iothub::IotHubClient;
pub use sas::{SasError, SasTokenProvider};

use super::registry::RegistryError;
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use thiserror::Error;

pub(crate) const CONTINUATION_HEADER: &str = "x-ms-continuation";
pub(crate) const MAX_ITEM_COUNT_HEADER: &str = "x-ms-max-item-count";

#[derive(Debug, Error)]
pub enum ClientBuildError {
    #[error("invalid service host '{host}': {message}")]
    Endpoint { host: String, message: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Service base address. Path pieces are pushed as single segments, so
/// characters such as `?`, `%` or `/` inside an id are percent-encoded.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    base: Url,
    api_version: &'static str,
}

impl Endpoint {
    pub fn new(host_name: &str, api_version: &'static str) -> Result<Self, ClientBuildError> {
        let base = Url::parse(&format!("https://{}/", host_name)).map_err(|e| {
            ClientBuildError::Endpoint {
                host: host_name.to_string(),
                message: e.to_string(),
            }
        })?;
        if base.cannot_be_a_base() || base.path() != "/" {
            return Err(ClientBuildError::Endpoint {
                host: host_name.to_string(),
                message: "host name must not carry a path".to_string(),
            });
        }
        Ok(Self { base, api_version })
    }

    pub fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url.query_pairs_mut()
            .append_pair("api-version", self.api_version);
        url
    }
}

/// Where a failed call was going, for error mapping.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Target<'a> {
    pub operation: &'static str,
    pub resource: &'static str,
    pub id: &'a str,
}

impl Target<'_> {
    fn transient(&self, message: impl Into<String>) -> RegistryError {
        RegistryError::Transient {
            operation: self.operation,
            id: self.id.to_string(),
            message: message.into(),
        }
    }

    fn upstream(&self, message: impl Into<String>) -> RegistryError {
        RegistryError::Upstream {
            operation: self.operation,
            id: self.id.to_string(),
            message: message.into(),
        }
    }

    pub fn status_error(&self, status: StatusCode, body: &str) -> RegistryError {
        match status {
            StatusCode::NOT_FOUND => RegistryError::not_found(self.resource, self.id),
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                RegistryError::already_exists(self.resource, self.id)
            }
            StatusCode::TOO_MANY_REQUESTS => self.transient(format!("{}: {}", status, body)),
            s if s.is_server_error() => self.transient(format!("{}: {}", status, body)),
            _ => self.upstream(format!("{}: {}", status, body)),
        }
    }

    pub fn transport_error(&self, err: reqwest::Error) -> RegistryError {
        if err.is_timeout() || err.is_connect() {
            self.transient(err.to_string())
        } else {
            self.upstream(err.to_string())
        }
    }

    pub fn decode_error(&self, err: impl std::fmt::Display) -> RegistryError {
        self.upstream(format!("unreadable response: {}", err))
    }

    pub fn auth_error(&self, err: SasError) -> RegistryError {
        self.upstream(format!("cannot sign request: {}", err))
    }
}

/// Send a signed request and turn non-success statuses into registry errors.
pub(crate) async fn send(
    sas: &SasTokenProvider,
    request: RequestBuilder,
    target: Target<'_>,
) -> Result<Response, RegistryError> {
    let token = sas.token().map_err(|e| target.auth_error(e))?;
    let response = request
        .header(reqwest::header::AUTHORIZATION, token)
        .send()
        .await
        .map_err(|e| target.transport_error(e))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::debug!(
        operation = target.operation,
        id = %target.id,
        status = %status,
        body = %body,
        "Registry call failed"
    );
    Err(target.status_error(status, &body))
}

pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    response: Response,
    target: Target<'_>,
) -> Result<T, RegistryError> {
    response.json::<T>().await.map_err(|e| target.decode_error(e))
}

pub(crate) fn continuation_of(response: &Response) -> Option<String> {
    response
        .headers()
        .get(CONTINUATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: Target<'static> = Target {
        operation: "get_device",
        resource: "device",
        id: "dev-1",
    };

    #[test]
    fn test_ids_stay_one_path_segment() {
        let endpoint = Endpoint::new("hub.azure-devices.net", "2021-04-12").unwrap();

        let url = endpoint.url(&["devices", "sensor?1"]);
        assert_eq!(url.path(), "/devices/sensor%3F1");
        assert_eq!(url.query(), Some("api-version=2021-04-12"));

        let url = endpoint.url(&["devices", "a%2Fb", "modules"]);
        assert_eq!(url.path(), "/devices/a%252Fb/modules");
        let segments: Vec<_> = url.path_segments().unwrap().collect();
        assert_eq!(segments, vec!["devices", "a%252Fb", "modules"]);

        let url = endpoint.url(&["twins", "edge:gw(1)@site", "modules", "$edgeAgent"]);
        assert_eq!(url.path_segments().unwrap().count(), 4);
        assert_eq!(
            url.as_str(),
            "https://hub.azure-devices.net/twins/edge:gw(1)@site/modules/$edgeAgent?api-version=2021-04-12"
        );
    }

    #[test]
    fn test_endpoint_rejects_host_with_path() {
        assert!(matches!(
            Endpoint::new("hub.azure-devices.net/evil", "2021-04-12"),
            Err(ClientBuildError::Endpoint { .. })
        ));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            TARGET.status_error(StatusCode::NOT_FOUND, ""),
            RegistryError::not_found("device", "dev-1")
        );
        assert_eq!(
            TARGET.status_error(StatusCode::CONFLICT, ""),
            RegistryError::already_exists("device", "dev-1")
        );
        assert!(TARGET
            .status_error(StatusCode::TOO_MANY_REQUESTS, "throttled")
            .is_transient());
        assert!(TARGET
            .status_error(StatusCode::SERVICE_UNAVAILABLE, "")
            .is_transient());
        assert!(matches!(
            TARGET.status_error(StatusCode::UNAUTHORIZED, "bad token"),
            RegistryError::Upstream { .. }
        ));
    }
}
