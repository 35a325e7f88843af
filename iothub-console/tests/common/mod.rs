#![allow(dead_code)]

use iothub_console::config::{ConsoleConfig, PollConfig, RegistryBackend, RegistryConfig};
use iothub_console::models::{Device, Twin, TwinProperties};
use iothub_console::services::{InMemoryProvisioning, InMemoryRegistry};
use iothub_console::startup::Application;
use service_core::config::Config as CoreConfig;
use std::sync::Arc;

pub const HOST_NAME: &str = "test-hub.azure-devices.net";

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub client: reqwest::Client,
    pub registry: Arc<InMemoryRegistry>,
    pub provisioning: Arc<InMemoryProvisioning>,
}

pub fn test_config(index_lag: u32, poll: PollConfig) -> ConsoleConfig {
    ConsoleConfig {
        common: CoreConfig {
            port: 0, // Random port for testing
            ..CoreConfig::default()
        },
        registry: RegistryConfig {
            backend: RegistryBackend::Memory,
            iothub_connection_string: None,
            dps_connection_string: None,
            request_timeout_ms: 1_000,
            page_size: 2,
            sas_ttl_secs: 3600,
            memory_host_name: HOST_NAME.to_string(),
            memory_index_lag: index_lag,
        },
        poll,
    }
}

pub fn fast_poll(max_attempts: u32) -> PollConfig {
    PollConfig {
        delay_ms: 2,
        backoff_multiplier: 1.0,
        max_delay_ms: 2,
        max_attempts,
        deadline_ms: 5_000,
        transient_retries: 0,
    }
}

impl TestApp {
    /// Query index lagging three reads behind every write.
    pub async fn spawn() -> Self {
        Self::spawn_with(3, fast_poll(50)).await
    }

    pub async fn spawn_with(index_lag: u32, poll: PollConfig) -> Self {
        let config = test_config(index_lag, poll);
        // Small pages so list endpoints exercise continuation tokens.
        let registry = Arc::new(InMemoryRegistry::new(HOST_NAME, index_lag).with_page_size(2));
        let provisioning = Arc::new(InMemoryProvisioning::new(index_lag).with_page_size(2));

        let app = Application::build_with_clients(config, registry.clone(), provisioning.clone())
            .await
            .expect("Failed to build test application");
        let port = app.http_port();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped(std::future::pending()).await.ok();
        });

        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        }

        TestApp {
            address,
            port,
            client,
            registry,
            provisioning,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn delete(&self, path: &str) -> reqwest::Response {
        self.client
            .delete(self.url(path))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn post_json(&self, path: &str, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Seed a device that is already visible everywhere.
    pub fn seed_device(&self, device: Device, with_twin: bool) {
        let twin = with_twin.then(|| Twin {
            device_id: device.device_id.clone(),
            module_id: None,
            etag: None,
            model_id: None,
            status: Some(device.status),
            connection_state: Some(device.connection_state),
            authentication_type: Some(device.authentication.kind),
            capabilities: Some(device.capabilities),
            tags: None,
            properties: TwinProperties::default(),
            version: Some(1),
        });
        self.registry.insert_device(device, twin);
    }
}
