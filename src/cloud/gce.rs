//! Google Compute Engine implementation of the cloud port.
//!
//! Thin REST layer over the compute v1 surface. Creates treat HTTP 409 as
//! success, every mutating call that answers with an `Operation` is polled to
//! `DONE`, and the shared URL map is only touched under a process-wide lock.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::cloud::urlmap::{ensure_route, UrlMap};
use crate::cloud::{Cloud, NetworkEndpoint};
use crate::config::CloudConfig;
use crate::errors::{DaemonError, Result};
use crate::tag::Affinity;

const COMPUTE_API: &str = "https://www.googleapis.com/compute/v1";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const OPERATION_POLL_INTERVAL: Duration = Duration::from_secs(3);
const OPERATION_POLL_CEILING: Duration = Duration::from_secs(30 * 60);
/// Refresh tokens a minute before the metadata server says they lapse.
const TOKEN_EXPIRY_SLACK: u64 = 60;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MANAGED_DESCRIPTION: &str = "Managed by consul-gclb-sync";

pub struct GceCloud {
    http: reqwest::Client,
    token: TokenSource,
    api_base: String,
    project: String,
    zone: String,
    network_url: String,
    /// The URL map is shared by every reconciler; this lock serializes the
    /// whole read-modify-write cycle.
    url_map_lock: Mutex<()>,
}

impl GceCloud {
    pub fn new(config: &CloudConfig) -> Result<Self> {
        Self::with_endpoints(config, COMPUTE_API, METADATA_TOKEN_URL)
    }

    fn with_endpoints(config: &CloudConfig, api_base: &str, token_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let api_base = api_base.trim_end_matches('/').to_string();
        let network_url = format!(
            "{}/projects/{}/global/networks/{}",
            api_base, config.project, config.network
        );
        Ok(Self {
            token: TokenSource::new(http.clone(), token_url),
            http,
            api_base,
            project: config.project.clone(),
            zone: config.zone.clone(),
            network_url,
            url_map_lock: Mutex::new(()),
        })
    }

    fn zonal_url(&self, suffix: &str) -> String {
        format!(
            "{}/projects/{}/zones/{}/{}",
            self.api_base, self.project, self.zone, suffix
        )
    }

    fn global_url(&self, suffix: &str) -> String {
        format!("{}/projects/{}/global/{}", self.api_base, self.project, suffix)
    }

    fn neg_url(&self, neg_name: &str) -> String {
        self.zonal_url(&format!("networkEndpointGroups/{}", neg_name))
    }

    fn health_check_url(&self, hc_name: &str) -> String {
        self.global_url(&format!("healthChecks/{}", hc_name))
    }

    async fn authorized(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let token = self.token.access_token().await?;
        Ok(builder.bearer_auth(token).send().await?)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, context: &str) -> Result<T> {
        let response = self.authorized(self.http.get(url)).await?;
        let response = expect_success(response, context).await?;
        Ok(response.json().await?)
    }

    async fn post_create(
        &self,
        url: &str,
        body: serde_json::Value,
        context: &str,
    ) -> Result<CreateOutcome> {
        let response = self.authorized(self.http.post(url).json(&body)).await?;
        if response.status() == reqwest::StatusCode::CONFLICT {
            return Ok(CreateOutcome::AlreadyExists);
        }
        let response = expect_success(response, context).await?;
        Ok(CreateOutcome::Created(response.json().await?))
    }

    async fn finish_create(
        &self,
        outcome: CreateOutcome,
        scope: OpScope,
        context: &str,
    ) -> Result<()> {
        match outcome {
            CreateOutcome::AlreadyExists => {
                info!("{}: resource already exists", context);
                Ok(())
            }
            CreateOutcome::Created(op) => self.wait_for_operation(op, scope, context).await,
        }
    }

    async fn wait_for_operation(
        &self,
        mut op: Operation,
        scope: OpScope,
        context: &str,
    ) -> Result<()> {
        if op.status != "DONE" {
            debug!("waiting for {} (operation {})", context, op.name);
        }
        let deadline = Instant::now() + OPERATION_POLL_CEILING;
        loop {
            if op.status == "DONE" {
                return op.into_result();
            }
            if Instant::now() >= deadline {
                return Err(DaemonError::OperationTimeout(op.name));
            }
            sleep(OPERATION_POLL_INTERVAL).await;
            let url = match scope {
                OpScope::Global => self.global_url(&format!("operations/{}", op.name)),
                OpScope::Zonal => self.zonal_url(&format!("operations/{}", op.name)),
            };
            op = self.get_json(&url, "operation poll").await?;
        }
    }
}

#[async_trait]
impl Cloud for GceCloud {
    async fn create_network_endpoint_group(&self, name: &str) -> Result<()> {
        let context = format!("network endpoint group {} creation", name);
        let body = json!({
            "name": name,
            "description": MANAGED_DESCRIPTION,
            "defaultPort": 80,
            "networkEndpointType": "GCE_VM_IP_PORT",
            "network": self.network_url,
        });
        let outcome = self
            .post_create(&self.zonal_url("networkEndpointGroups"), body, &context)
            .await?;
        self.finish_create(outcome, OpScope::Zonal, &context).await
    }

    async fn create_health_check(&self, name: &str, path: &str) -> Result<()> {
        let context = format!("health check {} creation", name);
        let path = if path.is_empty() { "/" } else { path };
        let body = json!({
            "name": name,
            "description": MANAGED_DESCRIPTION,
            "type": "HTTP",
            "httpHealthCheck": {
                "portSpecification": "USE_SERVING_PORT",
                "requestPath": path,
            },
            "timeoutSec": 5,
            "checkIntervalSec": 10,
            "healthyThreshold": 2,
            "unhealthyThreshold": 3,
        });
        let outcome = self
            .post_create(&self.global_url("healthChecks"), body, &context)
            .await?;
        self.finish_create(outcome, OpScope::Global, &context).await
    }

    async fn create_backend_service(
        &self,
        name: &str,
        neg_name: &str,
        hc_name: &str,
        affinity: Affinity,
        cdn: bool,
    ) -> Result<()> {
        let context = format!("backend service {} creation", name);
        let body = json!({
            "name": name,
            "description": MANAGED_DESCRIPTION,
            "backends": [{
                "group": self.neg_url(neg_name),
                "balancingMode": "RATE",
                "maxRatePerEndpoint": 10000,
            }],
            "healthChecks": [self.health_check_url(hc_name)],
            "enableCDN": cdn,
            "sessionAffinity": affinity.session_affinity(),
        });
        let outcome = self
            .post_create(&self.global_url("backendServices"), body, &context)
            .await?;
        self.finish_create(outcome, OpScope::Global, &context).await
    }

    async fn update_url_map(
        &self,
        url_map_name: &str,
        bs_name: &str,
        host: &str,
        path: &str,
    ) -> Result<()> {
        // Concurrent read-modify-write cycles lose rules.
        let _guard = self.url_map_lock.lock().await;

        let context = format!("url map {} update", url_map_name);
        let map_url = self.global_url(&format!("urlMaps/{}", url_map_name));
        let mut map: UrlMap = self.get_json(&map_url, &context).await?;
        let backend: BackendService = self
            .get_json(
                &self.global_url(&format!("backendServices/{}", bs_name)),
                &context,
            )
            .await?;

        if !ensure_route(&mut map, &backend.self_link, host, path) {
            debug!("url map {} already routes {}{}", url_map_name, host, path);
            return Ok(());
        }

        info!(
            "updating url map {}: {}{} -> {}",
            url_map_name, host, path, bs_name
        );
        let response = self.authorized(self.http.put(&map_url).json(&map)).await?;
        let response = expect_success(response, &context).await?;
        let op: Operation = response.json().await?;
        self.wait_for_operation(op, OpScope::Global, &context).await
    }

    async fn attach_endpoints(&self, neg_name: &str, endpoints: &[NetworkEndpoint]) -> Result<()> {
        let context = format!("attaching {} endpoints to {}", endpoints.len(), neg_name);
        info!("{}", context);
        let url = format!("{}/attachNetworkEndpoints", self.neg_url(neg_name));
        let outcome = self
            .post_create(&url, endpoints_body(endpoints)?, &context)
            .await?;
        self.finish_create(outcome, OpScope::Zonal, &context).await
    }

    async fn detach_endpoints(&self, neg_name: &str, endpoints: &[NetworkEndpoint]) -> Result<()> {
        let context = format!("detaching {} endpoints from {}", endpoints.len(), neg_name);
        info!("{}", context);
        let url = format!("{}/detachNetworkEndpoints", self.neg_url(neg_name));
        let outcome = self
            .post_create(&url, endpoints_body(endpoints)?, &context)
            .await?;
        self.finish_create(outcome, OpScope::Zonal, &context).await
    }
}

fn endpoints_body(endpoints: &[NetworkEndpoint]) -> Result<serde_json::Value> {
    let mut entries = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        // The registry carries ports as strings; the compute API wants an
        // integer on the wire.
        let port: u32 = endpoint
            .port
            .parse()
            .map_err(|_| DaemonError::EndpointPort {
                instance: endpoint.instance.clone(),
                port: endpoint.port.clone(),
            })?;
        entries.push(json!({
            "instance": endpoint.instance,
            "ipAddress": endpoint.ip,
            "port": port,
        }));
    }
    Ok(json!({ "networkEndpoints": entries }))
}

enum CreateOutcome {
    Created(Operation),
    AlreadyExists,
}

#[derive(Clone, Copy)]
enum OpScope {
    Global,
    Zonal,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Operation {
    name: String,
    status: String,
    error: Option<OperationErrors>,
}

#[derive(Debug, Default, Deserialize)]
struct OperationErrors {
    #[serde(default)]
    errors: Vec<OperationErrorDetail>,
}

#[derive(Debug, Default, Deserialize)]
struct OperationErrorDetail {
    #[serde(default)]
    message: String,
}

impl Operation {
    fn into_result(self) -> Result<()> {
        let message = self
            .error
            .as_ref()
            .and_then(|errors| errors.errors.first())
            .map(|detail| detail.message.clone());
        match message {
            Some(message) => Err(DaemonError::OperationFailed {
                name: self.name,
                message,
            }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BackendService {
    self_link: String,
}

async fn expect_success(response: reqwest::Response, context: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(DaemonError::CloudApi {
        context: context.to_string(),
        status,
        body,
    })
}

/// Application-default credentials: bearer tokens minted by the GCE metadata
/// server, cached until shortly before expiry.
struct TokenSource {
    http: reqwest::Client,
    url: String,
    cached: Mutex<Option<CachedToken>>,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

impl TokenSource {
    fn new(http: reqwest::Client, url: &str) -> Self {
        Self {
            http,
            url: url.to_string(),
            cached: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.token.clone());
            }
        }

        debug!("fetching access token from the metadata server");
        let response = self
            .http
            .get(&self.url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        let response = expect_success(response, "token fetch").await?;
        let token: MetadataToken = response.json().await?;
        let expires_at =
            Instant::now() + Duration::from_secs(token.expires_in.saturating_sub(TOKEN_EXPIRY_SLACK));
        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at,
        });
        Ok(token.access_token)
    }
}

#[cfg(test)]
mod tests;
