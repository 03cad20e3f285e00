//! Phase sequencing for the CLI subcommands.
//!
//! Each subcommand is a fixed sequence of phases with numbered banners,
//! mirroring the script-per-stage layout this tool replaces. `up` runs
//! everything; the other subcommands run their slice of it against
//! whatever already exists.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::app::{AppDeployer, ProbeReport};
use crate::config::EnvironmentConfig;
use crate::exec::{check_prerequisites, CommandRunner, REQUIRED_TOOLS};
use crate::gke::{ClusterStatus, GkeProvider};
use crate::k8s::KubeApi;
use crate::mesh::MeshInstaller;
use crate::poll::PollConfig;
use crate::{Result, MESH_WEBHOOK_PREFIX, REQUIRED_SERVICES};

/// Budget for the observation-only probe in `verify`; a healthy frontend
/// answers well inside this
const VERIFY_PROBE: PollConfig = PollConfig {
    interval: Duration::from_secs(3),
    timeout: Duration::from_secs(15),
};

/// Runs the provisioning phases against one environment
pub struct Pipeline {
    config: EnvironmentConfig,
    runner: Arc<dyn CommandRunner>,
    cancel: CancellationToken,
}

/// What `verify` observed, in pipeline order
#[derive(Debug, Default)]
pub struct VerifyReport {
    /// Provider-reported cluster status, if the cluster exists
    pub cluster_status: Option<String>,
    /// Whether the mesh injection webhook is registered
    pub webhook_present: bool,
    /// Rollout state per application deployment
    pub deployments: Vec<(String, bool)>,
    /// (ready, total) pods in the application namespace
    pub pods: Option<(usize, usize)>,
    /// Gateway external address, if published
    pub gateway_address: Option<String>,
    /// Frontend probe result, if the gateway was reachable
    pub probe: Option<ProbeReport>,
}

impl VerifyReport {
    /// True when every observation is the one `up` leaves behind
    pub fn healthy(&self) -> bool {
        self.cluster_status.as_deref() == Some("Running")
            && self.webhook_present
            && !self.deployments.is_empty()
            && self.deployments.iter().all(|(_, ok)| *ok)
            && self.probe.is_some()
    }

    /// Print the report in checklist form
    pub fn print(&self) {
        println!("\n=== Environment report ===\n");
        match &self.cluster_status {
            Some(status) => println!("  cluster:    {}", status),
            None => println!("  cluster:    not found"),
        }
        println!(
            "  mesh:       {}",
            if self.webhook_present {
                "injection webhook registered"
            } else {
                "injection webhook missing"
            }
        );
        for (name, ok) in &self.deployments {
            println!(
                "  rollout:    {} {}",
                name,
                if *ok { "available" } else { "NOT available" }
            );
        }
        if let Some((ready, total)) = self.pods {
            println!("  pods:       {}/{} ready", ready, total);
        }
        match &self.gateway_address {
            Some(address) => println!("  gateway:    {}", address),
            None => println!("  gateway:    no external address"),
        }
        match &self.probe {
            Some(probe) => println!("  frontend:   HTTP {} from {}", probe.status, probe.url),
            None => println!("  frontend:   not probed"),
        }
        println!(
            "\n  overall:    {}\n",
            if self.healthy() { "HEALTHY" } else { "UNHEALTHY" }
        );
    }
}

impl Pipeline {
    /// Create a pipeline over a validated config
    pub fn new(
        config: EnvironmentConfig,
        runner: Arc<dyn CommandRunner>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            runner,
            cancel,
        }
    }

    fn provider(&self) -> GkeProvider {
        GkeProvider::new(
            self.runner.clone(),
            self.config.project.id.clone(),
            self.config.location(),
            self.config.is_zonal(),
        )
    }

    fn mesh_installer(&self, k8s: KubeApi) -> MeshInstaller {
        MeshInstaller::new(
            self.runner.clone(),
            k8s,
            self.config.project.id.clone(),
            self.config.location(),
            self.config.cluster.name.clone(),
            self.config.mesh.clone(),
        )
    }

    /// Write a kubeconfig for the cluster and open an API client on it
    async fn connect(&self) -> Result<(KubeApi, PathBuf)> {
        let path = self
            .provider()
            .write_kubeconfig(&self.config.cluster.name)
            .await?;
        let k8s = KubeApi::from_kubeconfig(&path).await?;
        Ok((k8s, path))
    }

    fn banner(phase: usize, total: usize, title: &str) {
        println!("\n[Phase {}/{}] {}\n", phase, total, title);
    }

    /// Run the whole sequence: prerequisites through frontend probe
    pub async fn up(&self) -> Result<()> {
        let start = Instant::now();
        let result = self.run_up().await;

        if result.is_ok() {
            println!("\n=== Environment ready ===");
            println!("Duration: {:?}", start.elapsed());
        } else {
            println!("\nProvisioning did not complete.");
            println!("Fix the failure and re-run 'meshstrap up' (phases are re-entrant),");
            println!("or tear down with 'meshstrap destroy'.");
        }
        result
    }

    async fn run_up(&self) -> Result<()> {
        Self::banner(1, 7, "Checking prerequisites");
        check_prerequisites(self.runner.as_ref(), REQUIRED_TOOLS).await?;

        Self::banner(2, 7, "Enabling cloud APIs");
        let provider = self.provider();
        provider.enable_services(REQUIRED_SERVICES).await?;

        Self::banner(3, 7, "Creating cluster");
        provider.create_cluster(&self.config.cluster).await?;
        let state = provider
            .wait_running(
                &self.config.cluster.name,
                &self.config.timeouts.cluster_running(),
                &self.cancel,
            )
            .await?;
        println!(
            "  Cluster '{}' is running ({} nodes, control plane {})",
            self.config.cluster.name,
            state.current_node_count.unwrap_or_default(),
            state.current_master_version.as_deref().unwrap_or("unknown"),
        );

        Self::banner(4, 7, "Fetching cluster credentials");
        let (k8s, kubeconfig) = self.connect().await?;
        println!("  Kubeconfig written to {}", kubeconfig.display());

        Self::banner(5, 7, "Installing managed service mesh");
        let mesh = self.mesh_installer(k8s.clone());
        if self.config.mesh.enable_fleet_registration {
            provider
                .register_to_fleet(&self.config.cluster.name)
                .await?;
        }
        mesh.install(&kubeconfig.to_string_lossy()).await?;
        mesh.wait_ready(&self.config.timeouts.mesh_ready(), &self.cancel)
            .await?;
        println!("  Control plane ready (revision {})", mesh.revision());

        Self::banner(6, 7, "Enabling sidecar injection");
        mesh.enable_injection(&self.config.app.namespace).await?;
        mesh.restart_workloads(&self.config.app.namespace).await?;

        Self::banner(7, 7, "Deploying storefront");
        let app = AppDeployer::new(k8s, self.config.app.clone());
        app.deploy(&self.config.timeouts.rollout(), &self.cancel)
            .await?;
        let address = app
            .wait_gateway_address(&self.config.timeouts.gateway_ip(), &self.cancel)
            .await?;
        let probe = app
            .probe_frontend(&address, &self.config.timeouts.probe(), &self.cancel)
            .await?;

        println!(
            "\n  Storefront is serving: {} (HTTP {}, {} attempt{}, {:?})",
            probe.url,
            probe.status,
            probe.attempts,
            if probe.attempts == 1 { "" } else { "s" },
            probe.elapsed,
        );
        Ok(())
    }

    /// Prerequisites, APIs, cluster, credentials. No mesh, no app.
    pub async fn provision(&self) -> Result<()> {
        Self::banner(1, 4, "Checking prerequisites");
        check_prerequisites(self.runner.as_ref(), REQUIRED_TOOLS).await?;

        Self::banner(2, 4, "Enabling cloud APIs");
        let provider = self.provider();
        provider.enable_services(REQUIRED_SERVICES).await?;

        Self::banner(3, 4, "Creating cluster");
        provider.create_cluster(&self.config.cluster).await?;
        provider
            .wait_running(
                &self.config.cluster.name,
                &self.config.timeouts.cluster_running(),
                &self.cancel,
            )
            .await?;

        Self::banner(4, 4, "Fetching cluster credentials");
        let (_, kubeconfig) = self.connect().await?;
        println!("  Kubeconfig written to {}", kubeconfig.display());
        Ok(())
    }

    /// Mesh install and injection wiring against an existing cluster
    pub async fn mesh(&self) -> Result<()> {
        Self::banner(1, 3, "Fetching cluster credentials");
        let (k8s, kubeconfig) = self.connect().await?;

        Self::banner(2, 3, "Installing managed service mesh");
        let mesh = self.mesh_installer(k8s);
        if self.config.mesh.enable_fleet_registration {
            self.provider()
                .register_to_fleet(&self.config.cluster.name)
                .await?;
        }
        mesh.install(&kubeconfig.to_string_lossy()).await?;
        mesh.wait_ready(&self.config.timeouts.mesh_ready(), &self.cancel)
            .await?;

        Self::banner(3, 3, "Enabling sidecar injection");
        mesh.enable_injection(&self.config.app.namespace).await?;
        mesh.restart_workloads(&self.config.app.namespace).await?;
        Ok(())
    }

    /// Deploy the application against an existing, mesh-enabled cluster
    pub async fn deploy(&self) -> Result<()> {
        Self::banner(1, 2, "Fetching cluster credentials");
        let (k8s, _) = self.connect().await?;

        Self::banner(2, 2, "Deploying storefront");
        let app = AppDeployer::new(k8s, self.config.app.clone());
        app.deploy(&self.config.timeouts.rollout(), &self.cancel)
            .await?;
        let address = app
            .wait_gateway_address(&self.config.timeouts.gateway_ip(), &self.cancel)
            .await?;
        let probe = app
            .probe_frontend(&address, &self.config.timeouts.probe(), &self.cancel)
            .await?;
        println!("\n  Storefront is serving: {} (HTTP {})", probe.url, probe.status);
        Ok(())
    }

    /// Observe the environment without changing it and print a report
    pub async fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();

        let provider = self.provider();
        let state = provider.describe(&self.config.cluster.name).await?;
        let Some(state) = state else {
            report.print();
            return Ok(report);
        };
        report.cluster_status = Some(format!("{:?}", state.status));

        if state.status != ClusterStatus::Running {
            report.print();
            return Ok(report);
        }

        let (k8s, _) = self.connect().await?;
        report.webhook_present = k8s.webhook_present(MESH_WEBHOOK_PREFIX).await?;

        let namespace = &self.config.app.namespace;
        for name in k8s.deployment_names(namespace).await? {
            let available = k8s.deployment_available(namespace, &name).await?;
            report.deployments.push((name, available));
        }
        report.pods = Some(k8s.pods_ready(namespace, "").await?);

        report.gateway_address = k8s
            .service_external_ip(namespace, &self.config.app.gateway_service)
            .await?;

        if let Some(address) = &report.gateway_address {
            let app = AppDeployer::new(k8s, self.config.app.clone());
            match app.probe_frontend(address, &VERIFY_PROBE, &self.cancel).await {
                Ok(probe) => report.probe = Some(probe),
                Err(e) => warn!(error = %e, "Frontend probe failed"),
            }
        }

        report.print();
        Ok(report)
    }

    /// Delete the application namespace and, unless kept, the cluster
    pub async fn destroy(&self, keep_cluster: bool) -> Result<()> {
        let provider = self.provider();
        let total = if keep_cluster { 1 } else { 2 };

        Self::banner(1, total, "Deleting application namespace");
        match provider.describe(&self.config.cluster.name).await? {
            Some(state) if state.status == ClusterStatus::Running => {
                let (k8s, _) = self.connect().await?;
                let app = AppDeployer::new(k8s, self.config.app.clone());
                app.undeploy().await?;
            }
            _ => {
                println!("  Cluster not reachable, skipping namespace cleanup");
            }
        }

        if !keep_cluster {
            Self::banner(2, total, "Deleting cluster");
            provider.delete_cluster(&self.config.cluster.name).await?;
        }

        println!("\n=== Teardown complete ===");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_report() -> ProbeReport {
        ProbeReport {
            url: "http://203.0.113.20/".to_string(),
            status: 200,
            attempts: 1,
            elapsed: Duration::from_millis(80),
            checked_at: chrono::Utc::now(),
        }
    }

    fn healthy_report() -> VerifyReport {
        VerifyReport {
            cluster_status: Some("Running".to_string()),
            webhook_present: true,
            deployments: vec![
                ("frontend".to_string(), true),
                ("catalog".to_string(), true),
            ],
            pods: Some((4, 4)),
            gateway_address: Some("203.0.113.20".to_string()),
            probe: Some(probe_report()),
        }
    }

    /// Story: the report is only healthy when every phase left its mark
    #[test]
    fn story_report_health_requires_every_observation() {
        assert!(healthy_report().healthy());

        let mut missing_cluster = healthy_report();
        missing_cluster.cluster_status = None;
        assert!(!missing_cluster.healthy());

        let mut no_webhook = healthy_report();
        no_webhook.webhook_present = false;
        assert!(!no_webhook.healthy());

        let mut stuck_rollout = healthy_report();
        stuck_rollout.deployments[1].1 = false;
        assert!(!stuck_rollout.healthy());

        let mut unprobed = healthy_report();
        unprobed.probe = None;
        assert!(!unprobed.healthy());
    }

    #[test]
    fn empty_namespace_is_not_healthy() {
        let mut report = healthy_report();
        report.deployments.clear();
        assert!(!report.healthy(), "an empty namespace means deploy never ran");
    }

    #[test]
    fn reconciling_cluster_is_not_healthy() {
        let mut report = healthy_report();
        report.cluster_status = Some("Reconciling".to_string());
        assert!(!report.healthy());
    }
}
