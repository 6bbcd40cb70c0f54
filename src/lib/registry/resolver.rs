use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use super::client::{DockerHubClient, HarborClient, OciClient, normalize_url};
use super::types::{DOCKER_HUB, ImageRef, RegistryClient, RegistryKind, RegistryResult};
use crate::lib::config::RegistryEndpoint;

/// Picks the client for an image's registry, creating it on first use.
pub struct RegistryResolver {
    endpoints: HashMap<String, RegistryEndpoint>,
    clients: Mutex<HashMap<String, Arc<dyn RegistryClient>>>,
    timeout: Duration,
}

fn host_of(url: &str) -> String {
    let url = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    url.split('/').next().unwrap_or(url).to_string()
}

impl RegistryResolver {
    pub fn new(endpoints: Vec<RegistryEndpoint>, timeout: Duration) -> Self {
        let endpoints = endpoints
            .into_iter()
            .map(|e| (e.host.clone(), e))
            .collect();
        RegistryResolver {
            endpoints,
            clients: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Installs a ready-made client for `host`, replacing any cached one.
    pub fn register(&self, host: &str, client: Arc<dyn RegistryClient>) {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(host.to_string(), client);
    }

    /// `registry_url` overrides the host named in the image reference.
    pub fn resolve(
        &self,
        image: &ImageRef,
        registry_url: Option<&str>,
    ) -> RegistryResult<Arc<dyn RegistryClient>> {
        let host = registry_url
            .map(host_of)
            .unwrap_or_else(|| image.registry.clone());

        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(&host) {
            return Ok(client.clone());
        }

        let client = self.build(&host, registry_url)?;
        info!("Registry client for {} ({:?}) created", host, client.kind());
        clients.insert(host, client.clone());
        Ok(client)
    }

    fn build(&self, host: &str, registry_url: Option<&str>) -> RegistryResult<Arc<dyn RegistryClient>> {
        if let Some(endpoint) = self.endpoints.get(host) {
            let auth = endpoint.credentials();
            let client: Arc<dyn RegistryClient> = match endpoint.kind {
                RegistryKind::DockerHub => Arc::new(DockerHubClient::new(
                    endpoint.url.as_deref(),
                    auth,
                    self.timeout,
                )?),
                RegistryKind::Harbor => Arc::new(HarborClient::new(
                    endpoint.url.as_deref().unwrap_or(host),
                    auth,
                    self.timeout,
                )?),
                RegistryKind::Generic => Arc::new(OciClient::new(
                    endpoint.url.as_deref().unwrap_or(host),
                    auth,
                    self.timeout,
                )?),
            };
            return Ok(client);
        }

        if host == DOCKER_HUB {
            return Ok(Arc::new(DockerHubClient::new(None, None, self.timeout)?));
        }

        let url = registry_url.map(normalize_url).unwrap_or_else(|| normalize_url(host));
        Ok(Arc::new(OciClient::new(&url, None, self.timeout)?))
    }
}
