//! Cloud provider wrapper.
//!
//! A thin typed layer over `gcloud` for the resources this tool manages:
//! enabled services, the cluster itself, fleet membership, and a
//! kubeconfig for API access. Cluster state is read through
//! `describe --format=json` and parsed into [`ClusterState`] rather than
//! scraped from human-readable output.
//!
//! The wrapper never mutates the user's global kubeconfig. Instead of
//! `gcloud container clusters get-credentials`, [`GkeProvider::write_kubeconfig`]
//! synthesizes a dedicated kubeconfig from the cluster's endpoint and CA
//! plus a fresh access token, written to a private temp file.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ClusterConfig;
use crate::exec::CommandRunner;
use crate::poll::{wait_for, PollConfig, PollOutcome};
use crate::{Error, Result};

/// Cluster lifecycle status as reported by the provider
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    /// Control plane and nodes are being created
    Provisioning,
    /// Fully operational
    Running,
    /// Some work is happening (resize, upgrade); usable
    Reconciling,
    /// Being deleted
    Stopping,
    /// Unrecoverable error
    Error,
    /// Requires user action to restore full functionality
    Degraded,
    /// Not set by the API
    StatusUnspecified,
}

/// Parse of `gcloud container clusters describe --format=json`
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    /// Cluster name
    pub name: String,
    /// Lifecycle status
    pub status: ClusterStatus,
    /// Detail accompanying ERROR/DEGRADED states
    #[serde(default)]
    pub status_message: Option<String>,
    /// Public endpoint of the control plane
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Nodes currently in the cluster
    #[serde(default)]
    pub current_node_count: Option<u32>,
    /// Control-plane version
    #[serde(default)]
    pub current_master_version: Option<String>,
    /// Control-plane credentials material
    #[serde(default)]
    pub master_auth: Option<MasterAuth>,
}

/// Control-plane credentials material from `describe`
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterAuth {
    /// Base64-encoded cluster CA certificate
    #[serde(default)]
    pub cluster_ca_certificate: Option<String>,
}

/// True when a gcloud failure means the resource does not exist
fn is_not_found(message: &str) -> bool {
    message.contains("NOT_FOUND")
        || message.contains("No cluster named")
        || message.contains("404")
}

/// True when a gcloud failure means the resource already exists
fn is_already_exists(message: &str) -> bool {
    message.contains("ALREADY_EXISTS") || message.contains("already exists")
}

/// Typed wrapper over `gcloud` for one project/location pair
pub struct GkeProvider {
    runner: Arc<dyn CommandRunner>,
    project: String,
    location: String,
    zonal: bool,
}

impl GkeProvider {
    /// Create a provider for the given project and location
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        project: impl Into<String>,
        location: impl Into<String>,
        zonal: bool,
    ) -> Self {
        Self {
            runner,
            project: project.into(),
            location: location.into(),
            zonal,
        }
    }

    fn location_flag(&self) -> String {
        if self.zonal {
            format!("--zone={}", self.location)
        } else {
            format!("--region={}", self.location)
        }
    }

    fn project_flag(&self) -> String {
        format!("--project={}", self.project)
    }

    async fn gcloud(&self, args: &[String]) -> Result<String> {
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner.run("gcloud", &refs).await
    }

    async fn gcloud_streaming(&self, args: &[String]) -> Result<()> {
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner.run_streaming("gcloud", &refs, &[]).await
    }

    /// Enable the given cloud APIs on the project
    pub async fn enable_services(&self, apis: &[&str]) -> Result<()> {
        info!(apis = ?apis, "Enabling cloud APIs");
        let mut args: Vec<String> = vec!["services".into(), "enable".into()];
        args.extend(apis.iter().map(|s| s.to_string()));
        args.push(self.project_flag());
        self.gcloud_streaming(&args).await
    }

    /// Fetch the cluster's current state, or `None` if it does not exist
    pub async fn describe(&self, name: &str) -> Result<Option<ClusterState>> {
        let args = vec![
            "container".into(),
            "clusters".into(),
            "describe".into(),
            name.into(),
            self.project_flag(),
            self.location_flag(),
            "--format=json".into(),
        ];

        match self.gcloud(&args).await {
            Ok(json) => {
                let state: ClusterState = serde_json::from_str(&json).map_err(|e| {
                    Error::serialization(format!("cannot parse cluster describe output: {}", e))
                })?;
                Ok(Some(state))
            }
            Err(Error::CommandFailed { message, .. }) if is_not_found(&message) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Create the cluster, or adopt it if it already exists and is running.
    ///
    /// A pre-existing cluster in any other state is an error: the operator
    /// has to decide whether to wait, repair, or delete it.
    pub async fn create_cluster(&self, cfg: &ClusterConfig) -> Result<()> {
        match self.describe(&cfg.name).await? {
            Some(state) if state.status == ClusterStatus::Running => {
                info!(cluster = %cfg.name, "Cluster already exists and is running, adopting");
                return Ok(());
            }
            Some(state) => {
                return Err(Error::provider(format!(
                    "cluster '{}' already exists in state {:?}{}",
                    cfg.name,
                    state.status,
                    state
                        .status_message
                        .map(|m| format!(": {}", m))
                        .unwrap_or_default()
                )));
            }
            None => {}
        }

        info!(cluster = %cfg.name, location = %self.location, "Creating cluster");
        let mut args = vec![
            "container".into(),
            "clusters".into(),
            "create".into(),
            cfg.name.clone(),
            self.project_flag(),
            self.location_flag(),
            format!("--machine-type={}", cfg.machine_type),
            format!("--num-nodes={}", cfg.node_count),
            format!("--release-channel={}", cfg.release_channel),
            format!("--network={}", cfg.network),
            format!("--subnetwork={}", cfg.subnetwork),
            format!("--workload-pool={}.svc.id.goog", self.project),
        ];
        if !cfg.labels.is_empty() {
            args.push(format!("--labels={}", render_labels(&cfg.labels)));
        }

        self.gcloud_streaming(&args).await
    }

    /// Poll the cluster until it reports `RUNNING`.
    ///
    /// `ERROR` and `DEGRADED` abort immediately instead of burning the
    /// budget; those states do not resolve on their own.
    pub async fn wait_running(
        &self,
        name: &str,
        poll: &PollConfig,
        cancel: &CancellationToken,
    ) -> Result<ClusterState> {
        wait_for(poll, "cluster to reach RUNNING", cancel, || async move {
            match self.describe(name).await? {
                None => Ok(PollOutcome::pending("cluster not visible yet")),
                Some(state) => match state.status {
                    ClusterStatus::Running => Ok(PollOutcome::Ready(state)),
                    ClusterStatus::Error | ClusterStatus::Degraded => {
                        Err(Error::provider(format!(
                            "cluster entered {:?}: {}",
                            state.status,
                            state
                                .status_message
                                .as_deref()
                                .unwrap_or("no detail from provider")
                        )))
                    }
                    other => Ok(PollOutcome::pending(format!("cluster is {:?}", other))),
                },
            }
        })
        .await
    }

    /// Delete the cluster. Deleting a cluster that is already gone is fine.
    pub async fn delete_cluster(&self, name: &str) -> Result<()> {
        info!(cluster = %name, "Deleting cluster");
        let args = vec![
            "container".into(),
            "clusters".into(),
            "delete".into(),
            name.into(),
            self.project_flag(),
            self.location_flag(),
            "--quiet".into(),
        ];

        match self.gcloud_streaming(&args).await {
            Ok(()) => Ok(()),
            Err(Error::CommandFailed { message, .. }) if is_not_found(&message) => {
                info!(cluster = %name, "Cluster already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Register the cluster to the project fleet.
    ///
    /// Idempotent: an existing membership with the same name is accepted.
    pub async fn register_to_fleet(&self, name: &str) -> Result<()> {
        info!(cluster = %name, "Registering cluster to fleet");
        let args = vec![
            "container".into(),
            "hub".into(),
            "memberships".into(),
            "register".into(),
            name.into(),
            format!("--gke-cluster={}/{}", self.location, name),
            "--enable-workload-identity".into(),
            self.project_flag(),
        ];

        match self.gcloud_streaming(&args).await {
            Ok(()) => Ok(()),
            Err(Error::CommandFailed { message, .. }) if is_already_exists(&message) => {
                info!(cluster = %name, "Fleet membership already present");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Build a kubeconfig for the cluster and write it to a private temp
    /// file. Returns the path.
    pub async fn write_kubeconfig(&self, name: &str) -> Result<PathBuf> {
        let state = self.describe(name).await?.ok_or_else(|| {
            Error::provider(format!("cluster '{}' does not exist", name))
        })?;

        let token = self
            .gcloud(&["auth".into(), "print-access-token".into()])
            .await?;

        let kubeconfig = render_kubeconfig(
            &state,
            token.trim(),
            &self.project,
            &self.location,
        )?;

        let path = std::env::temp_dir().join(format!("{}-kubeconfig.yaml", name));
        tokio::fs::write(&path, &kubeconfig).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        info!(path = %path.display(), "Wrote kubeconfig");
        Ok(path)
    }
}

/// Render cluster labels as the `key=value,...` form gcloud expects
fn render_labels(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Render a self-contained kubeconfig for the cluster.
///
/// The CA certificate is carried base64-encoded exactly as `describe`
/// returns it; it is decoded once here to fail early on corrupt output.
fn render_kubeconfig(
    state: &ClusterState,
    token: &str,
    project: &str,
    location: &str,
) -> Result<String> {
    let endpoint = state
        .endpoint
        .as_deref()
        .ok_or_else(|| Error::kubeconfig("cluster has no endpoint yet"))?;
    let ca = state
        .master_auth
        .as_ref()
        .and_then(|a| a.cluster_ca_certificate.as_deref())
        .ok_or_else(|| Error::kubeconfig("cluster has no CA certificate"))?;

    base64::engine::general_purpose::STANDARD
        .decode(ca)
        .map_err(|e| Error::kubeconfig(format!("cluster CA is not valid base64: {}", e)))?;

    // Same context naming scheme gcloud uses, so the file is recognizable
    let context = format!("gke_{}_{}_{}", project, location, state.name);

    let doc = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": context,
            "cluster": {
                "server": format!("https://{}", endpoint),
                "certificate-authority-data": ca,
            },
        }],
        "users": [{
            "name": context,
            "user": { "token": token },
        }],
        "contexts": [{
            "name": context,
            "context": { "cluster": context, "user": context },
        }],
        "current-context": context,
    });

    serde_yaml::to_string(&doc).map_err(|e| Error::serialization(e.to_string()))
}
