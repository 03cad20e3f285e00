//! Managed service-mesh control-plane installation.
//!
//! Wraps `asmcli install --managed` and the post-install wiring the
//! original scripts did by hand: waiting for the injection webhook to be
//! registered, labeling namespaces with the control-plane revision, and
//! restarting existing workloads so they pick up sidecars.
//!
//! The managed control plane runs off-cluster, so readiness cannot be
//! observed from an istiod Deployment; the signal that injection will work
//! is the mutating webhook the installer registers in the cluster.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{MeshConfig, ReleaseChannel};
use crate::exec::CommandRunner;
use crate::k8s::KubeApi;
use crate::poll::{wait_for, PollConfig, PollOutcome};
use crate::{Result, LEGACY_INJECTION_LABEL, MESH_REVISION_LABEL, MESH_WEBHOOK_PREFIX};

/// Control-plane revision name for a managed channel.
///
/// These are the fixed revision names the managed control plane registers
/// its webhook under; the namespace label must match exactly.
pub fn revision_for(channel: ReleaseChannel) -> &'static str {
    match channel {
        ReleaseChannel::Rapid => "asm-managed-rapid",
        ReleaseChannel::Regular => "asm-managed",
        ReleaseChannel::Stable => "asm-managed-stable",
    }
}

/// Namespaces to label for injection: the app namespace plus any extras
/// from config, deduplicated in order.
pub fn injection_targets(mesh: &MeshConfig, app_namespace: &str) -> Vec<String> {
    let mut targets = vec![app_namespace.to_string()];
    for ns in &mesh.injection_namespaces {
        if !targets.contains(ns) {
            targets.push(ns.clone());
        }
    }
    targets
}

/// The asmcli command line for a managed install against one cluster
pub fn build_install_args(
    project: &str,
    location: &str,
    cluster: &str,
    config: &MeshConfig,
) -> Vec<String> {
    let mut args = vec![
        "install".to_string(),
        format!("--project_id={}", project),
        format!("--cluster_location={}", location),
        format!("--cluster_name={}", cluster),
        "--managed".to_string(),
        format!("--channel={}", config.channel),
        format!("--ca={}", config.ca.as_flag()),
        "--enable_all".to_string(),
    ];
    if config.enable_fleet_registration {
        args.push(format!("--fleet_id={}", project));
    }
    args
}

/// Installs and wires up the managed control plane for one cluster
pub struct MeshInstaller {
    runner: Arc<dyn CommandRunner>,
    k8s: KubeApi,
    project: String,
    location: String,
    cluster: String,
    config: MeshConfig,
}

impl MeshInstaller {
    /// Create an installer for the given cluster
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        k8s: KubeApi,
        project: impl Into<String>,
        location: impl Into<String>,
        cluster: impl Into<String>,
        config: MeshConfig,
    ) -> Self {
        Self {
            runner,
            k8s,
            project: project.into(),
            location: location.into(),
            cluster: cluster.into(),
            config,
        }
    }

    /// The control-plane revision this install targets
    pub fn revision(&self) -> &'static str {
        revision_for(self.config.channel)
    }

    /// The full asmcli command line for this cluster
    pub fn install_args(&self) -> Vec<String> {
        build_install_args(&self.project, &self.location, &self.cluster, &self.config)
    }

    /// Run `asmcli install`, streaming its narration to the console.
    ///
    /// asmcli drives `kubectl` itself, so it gets the pipeline's dedicated
    /// kubeconfig through the environment.
    pub async fn install(&self, kubeconfig: &str) -> Result<()> {
        info!(
            cluster = %self.cluster,
            channel = %self.config.channel,
            revision = %self.revision(),
            "Installing managed control plane"
        );
        let args = self.install_args();
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner
            .run_streaming("asmcli", &refs, &[("KUBECONFIG", kubeconfig)])
            .await
    }

    /// Wait until the injection webhook is registered in the cluster
    pub async fn wait_ready(&self, poll: &PollConfig, cancel: &CancellationToken) -> Result<()> {
        wait_for(poll, "mesh injection webhook", cancel, || async move {
            if self.k8s.webhook_present(MESH_WEBHOOK_PREFIX).await? {
                Ok(PollOutcome::Ready(()))
            } else {
                Ok(PollOutcome::pending("injection webhook not registered yet"))
            }
        })
        .await
    }

    /// Label the target namespaces for sidecar injection.
    ///
    /// Sets the revision label and clears any legacy `istio-injection`
    /// label in the same patch; the two must never coexist. Each namespace
    /// is also annotated with when injection was enabled, so `verify` and
    /// operators can see who wired it up. Idempotent.
    pub async fn enable_injection(&self, app_namespace: &str) -> Result<()> {
        let revision = self.revision();
        let stamp = chrono::Utc::now().to_rfc3339();
        for ns in injection_targets(&self.config, app_namespace) {
            info!(namespace = %ns, revision = %revision, "Labeling namespace for injection");
            self.k8s.ensure_namespace(&ns).await?;
            self.k8s
                .label_namespace(
                    &ns,
                    &[
                        (MESH_REVISION_LABEL, Some(revision)),
                        (LEGACY_INJECTION_LABEL, None),
                    ],
                )
                .await?;
            self.k8s
                .annotate_namespace(
                    &ns,
                    &[("meshstrap.dev/injection-enabled-at", Some(stamp.as_str()))],
                )
                .await?;
        }
        Ok(())
    }

    /// Rolling-restart every Deployment in a namespace so running pods are
    /// re-admitted through the injection webhook
    pub async fn restart_workloads(&self, namespace: &str) -> Result<()> {
        let stamp = chrono::Utc::now().to_rfc3339();
        for name in self.k8s.deployment_names(namespace).await? {
            info!(namespace = %namespace, deployment = %name, "Restarting for injection");
            self.k8s
                .restart_deployment(namespace, &name, &stamp)
                .await?;
        }
        Ok(())
    }
}
