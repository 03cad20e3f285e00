//! Sample application deployment.
//!
//! Deploys a small storefront (frontend + catalog + cart behind a
//! LoadBalancer gateway) into the injection-labeled namespace, then
//! observes it the way the original workflow did: wait for every rollout,
//! wait for the gateway to get an external address, and probe the frontend
//! over HTTP until it answers.
//!
//! The manifests ship embedded as templates rendered with the target
//! namespace; `app.manifestDir` swaps in a user-provided set (plain YAML
//! or `.j2` templates) for deploying something else, such as the full
//! vendor demo.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use minijinja::{context, Environment};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::AppConfig;
use crate::k8s::{split_documents, KubeApi};
use crate::poll::{wait_for, PollConfig, PollOutcome};
use crate::{Error, Result};

/// Embedded storefront manifests
const STOREFRONT_TEMPLATE: &str = include_str!("../templates/app/storefront.yaml.j2");

/// Per-request timeout for the frontend probe; the overall budget comes
/// from [`PollConfig`]
const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of the frontend HTTP probe
#[derive(Clone, Debug)]
pub struct ProbeReport {
    /// URL that was probed
    pub url: String,
    /// Status the frontend finally answered with
    pub status: u16,
    /// Number of requests sent, including the successful one
    pub attempts: u32,
    /// Wall-clock time from first request to success
    pub elapsed: Duration,
    /// When the successful response was observed
    pub checked_at: DateTime<Utc>,
}

/// Deploys and observes the sample application
pub struct AppDeployer {
    k8s: KubeApi,
    config: AppConfig,
}

impl AppDeployer {
    /// Create a deployer for the configured namespace
    pub fn new(k8s: KubeApi, config: AppConfig) -> Self {
        Self { k8s, config }
    }

    /// Render the manifest set for the target namespace.
    ///
    /// Returns one string per YAML document, in apply order.
    pub async fn render_manifests(&self) -> Result<Vec<String>> {
        let rendered = match &self.config.manifest_dir {
            Some(dir) => self.render_dir(dir).await?,
            None => vec![render_template(
                STOREFRONT_TEMPLATE,
                &self.config.namespace,
                &self.config.gateway_service,
            )?],
        };

        Ok(rendered
            .iter()
            .flat_map(|stream| split_documents(stream))
            .collect())
    }

    async fn render_dir(&self, dir: &Path) -> Result<Vec<String>> {
        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".yaml") || name.ends_with(".yml") || name.ends_with(".j2") {
                entries.push((name, path));
            }
        }
        if entries.is_empty() {
            return Err(Error::validation(format!(
                "manifest directory {} contains no YAML files",
                dir.display()
            )));
        }
        // Deploy order follows file name order, like kubectl apply -f dir/
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut rendered = Vec::new();
        for (name, path) in entries {
            let content = tokio::fs::read_to_string(&path).await?;
            if name.ends_with(".j2") {
                rendered.push(render_template(
                    &content,
                    &self.config.namespace,
                    &self.config.gateway_service,
                )?);
            } else {
                rendered.push(content);
            }
        }
        Ok(rendered)
    }

    /// Apply the manifest set and wait until every Deployment in the
    /// namespace has rolled out. Rollout waits run concurrently; the call
    /// resolves when the slowest one does.
    pub async fn deploy(&self, poll: &PollConfig, cancel: &CancellationToken) -> Result<()> {
        self.k8s.ensure_namespace(&self.config.namespace).await?;

        let docs = self.render_manifests().await?;
        info!(
            namespace = %self.config.namespace,
            documents = docs.len(),
            "Applying application manifests"
        );
        for doc in &docs {
            self.k8s.apply_manifest(doc).await?;
        }

        let names = self.k8s.deployment_names(&self.config.namespace).await?;
        if names.is_empty() {
            return Err(Error::validation(format!(
                "no deployments found in namespace '{}' after apply",
                self.config.namespace
            )));
        }

        let waits = names.iter().map(|name| {
            let k8s = self.k8s.clone();
            let namespace = self.config.namespace.clone();
            async move {
                let operation = format!("deployment {}/{} rollout", namespace, name);
                wait_for(poll, &operation, cancel, || {
                    let k8s = k8s.clone();
                    let namespace = namespace.clone();
                    let name = name.clone();
                    async move {
                        if k8s.deployment_available(&namespace, &name).await? {
                            Ok(PollOutcome::Ready(()))
                        } else {
                            Ok(PollOutcome::pending("replicas not yet available"))
                        }
                    }
                })
                .await
            }
        });
        futures::future::try_join_all(waits).await?;

        info!(namespace = %self.config.namespace, "All rollouts complete");
        Ok(())
    }

    /// Wait for the gateway Service to publish an external address
    pub async fn wait_gateway_address(
        &self,
        poll: &PollConfig,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let operation = format!("gateway {} external address", self.config.gateway_service);
        wait_for(poll, &operation, cancel, || async move {
            match self
                .k8s
                .service_external_ip(&self.config.namespace, &self.config.gateway_service)
                .await?
            {
                Some(address) => Ok(PollOutcome::Ready(address)),
                None => Ok(PollOutcome::pending("load balancer not published")),
            }
        })
        .await
    }

    /// Probe the frontend over HTTP until it answers with the expected
    /// status. Connection errors and wrong statuses are pending, not
    /// fatal; a fresh load balancer drops traffic for a while.
    pub async fn probe_frontend(
        &self,
        address: &str,
        poll: &PollConfig,
        cancel: &CancellationToken,
    ) -> Result<ProbeReport> {
        let url = format!("http://{}{}", address, self.config.probe_path);
        let expected = self.config.expected_status;
        let client = reqwest::Client::builder()
            .timeout(PROBE_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::http(e.to_string()))?;

        let attempts = AtomicU32::new(0);
        let started = Instant::now();

        let operation = format!("frontend to serve HTTP {}", expected);
        let client_ref = &client;
        let url_ref = url.as_str();
        let attempts_ref = &attempts;
        let status = wait_for(poll, &operation, cancel, || async move {
            attempts_ref.fetch_add(1, Ordering::SeqCst);
            match client_ref.get(url_ref).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if status == expected {
                        Ok(PollOutcome::Ready(status))
                    } else {
                        Ok(PollOutcome::pending(format!("HTTP {}", status)))
                    }
                }
                Err(e) => Ok(PollOutcome::pending(format!("request failed: {}", e))),
            }
        })
        .await?;

        Ok(ProbeReport {
            url,
            status,
            attempts: attempts.load(Ordering::SeqCst),
            elapsed: started.elapsed(),
            checked_at: Utc::now(),
        })
    }

    /// Delete the application namespace and everything in it
    pub async fn undeploy(&self) -> Result<()> {
        info!(namespace = %self.config.namespace, "Deleting application namespace");
        self.k8s.delete_namespace(&self.config.namespace).await
    }
}

/// Render one manifest template with the deploy context
fn render_template(template: &str, namespace: &str, gateway_service: &str) -> Result<String> {
    let env = Environment::new();
    let rendered = env.render_str(
        template,
        context! { namespace => namespace, gateway_service => gateway_service },
    )?;
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_config() -> AppConfig {
        AppConfig::default()
    }

    // =========================================================================
    // Manifest rendering
    // =========================================================================

    /// Story: the embedded storefront lands entirely in the target namespace
    #[test]
    fn story_every_document_is_namespaced_to_the_target() {
        let rendered =
            render_template(STOREFRONT_TEMPLATE, "demo", "frontend-external").unwrap();
        let docs = split_documents(&rendered);
        assert!(docs.len() >= 7, "storefront has at least 7 documents");

        for doc in &docs {
            let value: serde_json::Value = serde_yaml::from_str(doc).expect("valid YAML");
            assert_eq!(
                value.pointer("/metadata/namespace").and_then(|v| v.as_str()),
                Some("demo"),
                "document missing namespace: {}",
                doc.lines().take(5).collect::<Vec<_>>().join(" | ")
            );
        }
    }

    #[test]
    fn storefront_exposes_a_load_balancer_gateway() {
        let rendered =
            render_template(STOREFRONT_TEMPLATE, "shop", "frontend-external").unwrap();
        let docs = split_documents(&rendered);

        let gateway = docs
            .iter()
            .map(|d| serde_yaml::from_str::<serde_json::Value>(d).unwrap())
            .find(|v| {
                v.pointer("/metadata/name").and_then(|n| n.as_str())
                    == Some("frontend-external")
            })
            .expect("gateway service present");

        assert_eq!(
            gateway.pointer("/spec/type").and_then(|v| v.as_str()),
            Some("LoadBalancer")
        );
        assert_eq!(gateway["kind"], "Service");
    }

    #[test]
    fn custom_gateway_name_is_rendered() {
        let rendered = render_template(STOREFRONT_TEMPLATE, "shop", "shop-gw").unwrap();
        assert!(rendered.contains("name: shop-gw"));
        assert!(!rendered.contains("{{ gateway_service }}"));
    }

    #[test]
    fn storefront_deployments_carry_app_labels() {
        let rendered =
            render_template(STOREFRONT_TEMPLATE, "demo", "frontend-external").unwrap();
        let docs = split_documents(&rendered);

        let deployments: Vec<serde_json::Value> = docs
            .iter()
            .map(|d| serde_yaml::from_str::<serde_json::Value>(d).unwrap())
            .filter(|v| v["kind"] == "Deployment")
            .collect();
        assert_eq!(deployments.len(), 3);

        for d in &deployments {
            let app = d
                .pointer("/spec/template/metadata/labels/app")
                .and_then(|v| v.as_str());
            assert!(app.is_some(), "pod template must carry an app label");
        }
    }

    // =========================================================================
    // Manifest directory override
    // =========================================================================

    #[tokio::test]
    async fn manifest_dir_renders_templates_and_passes_yaml_through() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("10-ns.yaml"),
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: fixed\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("20-svc.yaml.j2"),
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: web\n  namespace: {{ namespace }}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let mut config = app_config();
        config.manifest_dir = Some(dir.path().to_path_buf());
        let deployer = AppDeployer {
            k8s: unreachable_k8s(),
            config,
        };

        let docs = deployer.render_manifests().await.unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs[0].contains("name: fixed"));
        assert!(docs[1].contains("namespace: demo"));
    }

    #[tokio::test]
    async fn empty_manifest_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = app_config();
        config.manifest_dir = Some(dir.path().to_path_buf());
        let deployer = AppDeployer {
            k8s: unreachable_k8s(),
            config,
        };

        let err = deployer.render_manifests().await.unwrap_err();
        assert!(err.to_string().contains("no YAML files"));
    }

    /// A kube client pointed at a reserved address; rendering paths must
    /// never dereference it.
    fn unreachable_k8s() -> KubeApi {
        let config = kube::Config::new("http://192.0.2.1:6443".parse().unwrap());
        KubeApi::new(kube::Client::try_from(config).expect("client from static config"))
    }

    // =========================================================================
    // Frontend probe
    // =========================================================================

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_poll() -> PollConfig {
        PollConfig::new(Duration::from_millis(5), Duration::from_secs(5))
    }

    /// Story: the probe rides out the load balancer's warmup
    ///
    /// A fresh LB typically serves errors before the backends are wired
    /// up; the probe must treat those as pending and keep going.
    #[tokio::test]
    async fn story_probe_waits_through_warmup_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let deployer = AppDeployer {
            k8s: unreachable_k8s(),
            config: app_config(),
        };

        let cancel = CancellationToken::new();
        let report = deployer
            .probe_frontend(&server.address().to_string(), &fast_poll(), &cancel)
            .await
            .unwrap();

        assert_eq!(report.status, 200);
        assert_eq!(report.attempts, 3);
        assert!(report.url.ends_with('/'));
    }

    #[tokio::test]
    async fn probe_times_out_with_the_last_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let deployer = AppDeployer {
            k8s: unreachable_k8s(),
            config: app_config(),
        };

        let cancel = CancellationToken::new();
        let poll = PollConfig::new(Duration::from_millis(5), Duration::from_millis(100));
        let err = deployer
            .probe_frontend(&server.address().to_string(), &poll, &cancel)
            .await
            .unwrap_err();

        match err {
            Error::Timeout { last, .. } => assert_eq!(last, "HTTP 404"),
            other => panic!("expected timeout, got {}", other),
        }
    }

    #[tokio::test]
    async fn probe_honors_a_custom_expected_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/admin"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let mut config = app_config();
        config.probe_path = "/admin".to_string();
        config.expected_status = 401;
        let deployer = AppDeployer {
            k8s: unreachable_k8s(),
            config,
        };

        let cancel = CancellationToken::new();
        let report = deployer
            .probe_frontend(&server.address().to_string(), &fast_poll(), &cancel)
            .await
            .unwrap();
        assert_eq!(report.status, 401);
    }
}
