//! IoT Hub registry REST client.

use super::{
    continuation_of, read_json, send, ClientBuildError, Endpoint, SasTokenProvider, Target,
    CONTINUATION_HEADER, MAX_ITEM_COUNT_HEADER,
};
use crate::models::{Device, Module, Twin};
use crate::services::registry::{DeviceQuery, Page, RegistryClient, RegistryError};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

const API_VERSION: &str = "2021-04-12";

#[derive(Clone)]
pub struct IotHubClient {
    client: Client,
    sas: SasTokenProvider,
    endpoint: Endpoint,
    page_size: u32,
}

impl IotHubClient {
    pub fn new(
        sas: SasTokenProvider,
        timeout: Duration,
        page_size: u32,
    ) -> Result<Self, ClientBuildError> {
        let client = Client::builder().timeout(timeout).build()?;
        let endpoint = Endpoint::new(sas.host_name(), API_VERSION)?;
        Ok(Self {
            client,
            sas,
            endpoint,
            page_size,
        })
    }
}

#[async_trait]
impl RegistryClient for IotHubClient {
    fn host_name(&self) -> &str {
        self.sas.host_name()
    }

    async fn create_device(&self, device: &Device) -> Result<Device, RegistryError> {
        let target = Target {
            operation: "create_device",
            resource: "device",
            id: &device.device_id,
        };
        let request = self
            .client
            .put(self.endpoint.url(&["devices", device.device_id.as_str()]))
            .json(device);
        let response = send(&self.sas, request, target).await?;
        read_json(response, target).await
    }

    async fn get_device(&self, device_id: &str) -> Result<Device, RegistryError> {
        let target = Target {
            operation: "get_device",
            resource: "device",
            id: device_id,
        };
        let request = self
            .client
            .get(self.endpoint.url(&["devices", device_id]));
        let response = send(&self.sas, request, target).await?;
        read_json(response, target).await
    }

    async fn delete_device(&self, device_id: &str) -> Result<(), RegistryError> {
        let target = Target {
            operation: "delete_device",
            resource: "device",
            id: device_id,
        };
        let request = self
            .client
            .delete(self.endpoint.url(&["devices", device_id]))
            .header(reqwest::header::IF_MATCH, "*");
        send(&self.sas, request, target).await?;
        Ok(())
    }

    async fn query_devices(
        &self,
        query: &DeviceQuery,
        continuation: Option<String>,
    ) -> Result<Page<Twin>, RegistryError> {
        let id = match query {
            DeviceQuery::All => "*",
            DeviceQuery::ById(id) => id.as_str(),
        };
        let target = Target {
            operation: "query_devices",
            resource: "device",
            id,
        };
        let mut request = self
            .client
            .post(self.endpoint.url(&["devices", "query"]))
            .header(MAX_ITEM_COUNT_HEADER, self.page_size)
            .json(&json!({ "query": query.to_sql() }));
        if let Some(token) = continuation {
            request = request.header(CONTINUATION_HEADER, token);
        }

        let response = send(&self.sas, request, target).await?;
        let continuation = continuation_of(&response);
        let items: Vec<Twin> = read_json(response, target).await?;
        Ok(Page {
            items,
            continuation,
        })
    }

    async fn get_twin(
        &self,
        device_id: &str,
        module_id: Option<&str>,
    ) -> Result<Twin, RegistryError> {
        let target = Target {
            operation: "get_twin",
            resource: "twin",
            id: device_id,
        };
        let url = match module_id {
            Some(module_id) => self
                .endpoint
                .url(&["twins", device_id, "modules", module_id]),
            None => self.endpoint.url(&["twins", device_id]),
        };
        let response = send(&self.sas, self.client.get(url), target).await?;
        read_json(response, target).await
    }

    async fn list_modules(&self, device_id: &str) -> Result<Vec<Module>, RegistryError> {
        let target = Target {
            operation: "list_modules",
            resource: "device",
            id: device_id,
        };
        let request = self
            .client
            .get(self.endpoint.url(&["devices", device_id, "modules"]));
        let response = send(&self.sas, request, target).await?;
        read_json(response, target).await
    }

    async fn health_check(&self) -> Result<(), RegistryError> {
        let target = Target {
            operation: "health_check",
            resource: "hub",
            id: self.sas.host_name(),
        };
        let request = self
            .client
            .post(self.endpoint.url(&["devices", "query"]))
            .header(MAX_ITEM_COUNT_HEADER, 1)
            .json(&json!({ "query": DeviceQuery::All.to_sql() }));
        send(&self.sas, request, target).await?;
        Ok(())
    }
}
