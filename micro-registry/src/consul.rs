//! Consul-backed registry.
//!
//! Each node registration becomes an agent service entry keyed
//! `{service}-{node.id}`. The version travels in a `version=<v>` tag and
//! extra metadata as `micro-<k>=<v>` tags as well as the `Meta` map. Health
//! is delegated to Consul: a TTL check the client renews, or an HTTP check
//! against the node's health endpoint. Watchers long-poll
//! `/v1/health/service/{name}` tracking `X-Consul-Index` and diff node-id
//! sets into Create/Delete events.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    EventKind, Node, RegisterOptions, Registry, RegistryError, RegistryEvent, Service, Watcher,
};

const EVENT_DEPTH: usize = 128;
const LONG_POLL_WAIT: &str = "5m";
const CATALOG_POLL_INTERVAL: Duration = Duration::from_secs(10);
const BACKOFF_FLOOR: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(4);

#[derive(Deserialize)]
struct HealthEntry {
    #[serde(rename = "Service")]
    service: AgentService,
}

#[derive(Deserialize)]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service")]
    name: String,
    #[serde(rename = "Tags", default)]
    tags: Vec<String>,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Meta", default)]
    meta: HashMap<String, String>,
}

impl AgentService {
    fn version(&self) -> String {
        self.tags
            .iter()
            .find_map(|t| t.strip_prefix("version="))
            .unwrap_or("latest")
            .to_string()
    }

    fn metadata(&self) -> HashMap<String, String> {
        let mut metadata = self.meta.clone();
        for tag in &self.tags {
            if let Some(rest) = tag.strip_prefix("micro-") {
                if let Some((k, v)) = rest.split_once('=') {
                    metadata.insert(k.to_string(), v.to_string());
                }
            }
        }
        metadata
    }

    fn node(&self) -> Node {
        // Directory keys are `{service}-{node.id}`.
        let id = self
            .id
            .strip_prefix(&format!("{}-", self.name))
            .unwrap_or(&self.id)
            .to_string();
        Node {
            id,
            address: self.address.clone(),
            port: self.port,
            metadata: self.meta.clone(),
        }
    }
}

/// Registry speaking the Consul agent HTTP API.
pub struct ConsulRegistry {
    client: reqwest::Client,
    base: String,
    datacenter: Option<String>,
    renewals: Mutex<HashMap<String, CancellationToken>>,
}

impl ConsulRegistry {
    pub fn new(addr: impl Into<String>) -> Self {
        let mut base = addr.into();
        if !base.starts_with("http://") && !base.starts_with("https://") {
            base = format!("http://{base}");
        }
        ConsulRegistry {
            client: reqwest::Client::new(),
            base,
            datacenter: None,
            renewals: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_datacenter(mut self, dc: impl Into<String>) -> Self {
        self.datacenter = Some(dc.into());
        self
    }

    fn dc_query(&self) -> String {
        match &self.datacenter {
            Some(dc) => format!("&dc={dc}"),
            None => String::new(),
        }
    }

    fn start_renewal(&self, service_id: String, ttl: Duration) {
        let stop = CancellationToken::new();
        let previous = self
            .renewals
            .lock()
            .unwrap()
            .insert(service_id.clone(), stop.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        let client = self.client.clone();
        let url = format!("{}/v1/agent/check/pass/service:{service_id}", self.base);
        let interval = (ttl / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = client.put(&url).send().await {
                    warn!(error = %e, "consul ttl renewal failed");
                }
            }
        });
    }

    fn stop_renewal(&self, service_id: &str) {
        if let Some(token) = self.renewals.lock().unwrap().remove(service_id) {
            token.cancel();
        }
    }

    async fn fetch_health(
        &self,
        name: &str,
    ) -> Result<Vec<HealthEntry>, RegistryError> {
        let url = format!(
            "{}/v1/health/service/{name}?passing=true{}",
            self.base,
            self.dc_query()
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(connection)?
            .error_for_status()
            .map_err(connection)?;
        response.json().await.map_err(connection)
    }
}

impl Drop for ConsulRegistry {
    fn drop(&mut self) {
        for (_, token) in self.renewals.lock().unwrap().drain() {
            token.cancel();
        }
    }
}

fn connection(err: reqwest::Error) -> RegistryError {
    RegistryError::Connection(err.to_string())
}

fn group_entries(name: &str, entries: Vec<HealthEntry>) -> Vec<Service> {
    let mut by_version: HashMap<String, Service> = HashMap::new();
    for entry in entries {
        let version = entry.service.version();
        let service = by_version.entry(version.clone()).or_insert_with(|| Service {
            name: name.to_string(),
            version,
            metadata: entry.service.metadata(),
            nodes: Vec::new(),
        });
        service.nodes.push(entry.service.node());
    }
    by_version.into_values().collect()
}

#[async_trait]
impl Registry for ConsulRegistry {
    fn name(&self) -> &'static str {
        "consul"
    }

    async fn register(
        &self,
        service: &Service,
        opts: RegisterOptions,
    ) -> Result<(), RegistryError> {
        for node in &service.nodes {
            let id = format!("{}-{}", service.name, node.id);
            let mut tags = vec![format!("version={}", service.version)];
            tags.extend(
                service
                    .metadata
                    .iter()
                    .map(|(k, v)| format!("micro-{k}={v}")),
            );

            let mut payload = serde_json::json!({
                "ID": id,
                "Name": service.name,
                "Tags": tags,
                "Address": node.address,
                "Port": node.port,
                "Meta": service.metadata,
            });
            if let Some(ttl) = opts.ttl {
                payload["Check"] = serde_json::json!({
                    "TTL": format!("{}s", (ttl * 3).as_secs().max(1)),
                    "DeregisterCriticalServiceAfter": "1m",
                });
            } else if let Some(endpoint) = &opts.health_endpoint {
                payload["Check"] = serde_json::json!({
                    "HTTP": format!("http://{}:{}{endpoint}", node.address, node.port),
                    "Interval": "10s",
                    "Timeout": "5s",
                });
            }

            let url = format!("{}/v1/agent/service/register", self.base);
            self.client
                .put(&url)
                .json(&payload)
                .send()
                .await
                .map_err(connection)?
                .error_for_status()
                .map_err(connection)?;
            debug!(service = %service.name, node = %node.id, "registered with consul");

            if let Some(ttl) = opts.ttl {
                self.start_renewal(id, ttl);
            }
        }
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<(), RegistryError> {
        for node in &service.nodes {
            let id = format!("{}-{}", service.name, node.id);
            self.stop_renewal(&id);
            let url = format!("{}/v1/agent/service/deregister/{id}", self.base);
            self.client
                .put(&url)
                .send()
                .await
                .map_err(connection)?
                .error_for_status()
                .map_err(connection)?;
        }
        Ok(())
    }

    async fn get_service(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Vec<Service>, RegistryError> {
        let entries = self.fetch_health(name).await?;
        let mut services = group_entries(name, entries);
        if version != "*" {
            services.retain(|s| s.version == version);
        }
        Ok(services)
    }

    async fn list_services(&self) -> Result<Vec<Service>, RegistryError> {
        let mut url = format!("{}/v1/catalog/services", self.base);
        if let Some(dc) = &self.datacenter {
            url.push_str(&format!("?dc={dc}"));
        }
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(connection)?
            .error_for_status()
            .map_err(connection)?;
        let catalog: HashMap<String, Vec<String>> =
            response.json().await.map_err(connection)?;
        Ok(catalog
            .into_iter()
            .map(|(name, tags)| {
                let version = tags
                    .iter()
                    .find_map(|t| t.strip_prefix("version="))
                    .unwrap_or("latest")
                    .to_string();
                Service {
                    name,
                    version,
                    metadata: HashMap::new(),
                    nodes: Vec::new(),
                }
            })
            .collect())
    }

    async fn watch(&self, service: Option<&str>) -> Result<Watcher, RegistryError> {
        let (tx, rx) = mpsc::channel(EVENT_DEPTH);
        let stop = CancellationToken::new();
        let task = match service {
            Some(name) => tokio::spawn(watch_service(
                self.client.clone(),
                self.base.clone(),
                name.to_string(),
                tx,
                stop.clone(),
            )),
            None => tokio::spawn(watch_catalog(
                self.client.clone(),
                self.base.clone(),
                tx,
                stop.clone(),
            )),
        };
        Ok(Watcher::new(rx, stop, Some(task)))
    }
}

/// Long-poll one service, diffing node-id sets into Create/Delete events.
/// Transient failures back off (capped) and resume; they are never surfaced.
async fn watch_service(
    client: reqwest::Client,
    base: String,
    name: String,
    tx: mpsc::Sender<RegistryEvent>,
    stop: CancellationToken,
) {
    let mut index: Option<u64> = None;
    let mut known: HashMap<String, (String, Node)> = HashMap::new();
    let mut backoff = BACKOFF_FLOOR;
    loop {
        if stop.is_cancelled() {
            break;
        }
        let mut url = format!(
            "{base}/v1/health/service/{name}?passing=true&wait={LONG_POLL_WAIT}"
        );
        if let Some(index) = index {
            url.push_str(&format!("&index={index}"));
        }
        let response = tokio::select! {
            _ = stop.cancelled() => break,
            response = client.get(&url).send() => response,
        };
        let entries = match response {
            Ok(response) if response.status().is_success() => {
                index = response
                    .headers()
                    .get("x-consul-index")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok());
                match response.json::<Vec<HealthEntry>>().await {
                    Ok(entries) => entries,
                    Err(e) => {
                        debug!(error = %e, "consul watch decode failed");
                        if !sleep_backoff(&stop, &mut backoff).await {
                            break;
                        }
                        continue;
                    }
                }
            }
            other => {
                if let Err(e) = other {
                    debug!(error = %e, "consul watch poll failed");
                }
                if !sleep_backoff(&stop, &mut backoff).await {
                    break;
                }
                continue;
            }
        };
        backoff = BACKOFF_FLOOR;

        let mut current: HashMap<String, (String, Node)> = HashMap::new();
        for entry in &entries {
            let node = entry.service.node();
            current.insert(node.id.clone(), (entry.service.version(), node));
        }

        let mut created: HashMap<String, Service> = HashMap::new();
        for (id, (version, node)) in &current {
            if !known.contains_key(id) {
                created
                    .entry(version.clone())
                    .or_insert_with(|| Service::new(name.clone(), version.clone()))
                    .nodes
                    .push(node.clone());
            }
        }
        let mut deleted: HashMap<String, Service> = HashMap::new();
        for (id, (version, node)) in &known {
            if !current.contains_key(id) {
                deleted
                    .entry(version.clone())
                    .or_insert_with(|| Service::new(name.clone(), version.clone()))
                    .nodes
                    .push(node.clone());
            }
        }
        known = current;

        for service in created.into_values() {
            if tx
                .send(RegistryEvent {
                    kind: EventKind::Create,
                    service,
                })
                .await
                .is_err()
            {
                return;
            }
        }
        for service in deleted.into_values() {
            if tx
                .send(RegistryEvent {
                    kind: EventKind::Delete,
                    service,
                })
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

/// Poll the catalog periodically, diffing service names.
async fn watch_catalog(
    client: reqwest::Client,
    base: String,
    tx: mpsc::Sender<RegistryEvent>,
    stop: CancellationToken,
) {
    let mut known: HashMap<String, String> = HashMap::new();
    let mut backoff = BACKOFF_FLOOR;
    loop {
        if stop.is_cancelled() {
            break;
        }
        let url = format!("{base}/v1/catalog/services");
        let response = tokio::select! {
            _ = stop.cancelled() => break,
            response = client.get(&url).send() => response,
        };
        let catalog: HashMap<String, Vec<String>> = match response {
            Ok(response) if response.status().is_success() => {
                match response.json().await {
                    Ok(catalog) => catalog,
                    Err(_) => {
                        if !sleep_backoff(&stop, &mut backoff).await {
                            break;
                        }
                        continue;
                    }
                }
            }
            _ => {
                if !sleep_backoff(&stop, &mut backoff).await {
                    break;
                }
                continue;
            }
        };
        backoff = BACKOFF_FLOOR;

        let current: HashMap<String, String> = catalog
            .into_iter()
            .map(|(name, tags)| {
                let version = tags
                    .iter()
                    .find_map(|t| t.strip_prefix("version="))
                    .unwrap_or("latest")
                    .to_string();
                (name, version)
            })
            .collect();

        for (name, version) in &current {
            if !known.contains_key(name)
                && tx
                    .send(RegistryEvent {
                        kind: EventKind::Create,
                        service: Service::new(name.clone(), version.clone()),
                    })
                    .await
                    .is_err()
            {
                return;
            }
        }
        for (name, version) in &known {
            if !current.contains_key(name)
                && tx
                    .send(RegistryEvent {
                        kind: EventKind::Delete,
                        service: Service::new(name.clone(), version.clone()),
                    })
                    .await
                    .is_err()
            {
                return;
            }
        }
        known = current;

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(CATALOG_POLL_INTERVAL) => {}
        }
    }
}

/// Sleep the current backoff, doubling it up to the cap. Returns `false`
/// when the watcher was stopped mid-sleep.
async fn sleep_backoff(stop: &CancellationToken, backoff: &mut Duration) -> bool {
    let sleep_for = *backoff;
    *backoff = (*backoff * 2).min(BACKOFF_CAP);
    tokio::select! {
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(sleep_for) => true,
    }
}
