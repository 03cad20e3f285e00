//! Declarative environment configuration.
//!
//! Replaces the environment-variable file the original workflow sourced
//! before each script. The whole run is described by one YAML document,
//! validated once at startup; nothing talks to the cloud until validation
//! has passed.
//!
//! A minimal config needs three values:
//!
//! ```yaml
//! project:
//!   id: my-project
//!   region: us-central1
//! cluster:
//!   name: mesh-demo
//! ```
//!
//! `MESHSTRAP_PROJECT_ID`, `MESHSTRAP_CLUSTER_NAME`, and
//! `MESHSTRAP_CLUSTER_LOCATION` override the file, preserving the
//! env-var-driven workflow for CI.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::poll::PollConfig;
use crate::{Error, Result};

/// Namespaces the tool refuses to target for application workloads
const SYSTEM_NAMESPACES: &[&str] = &[
    "kube-system",
    "kube-public",
    "kube-node-lease",
    "istio-system",
];

/// Root configuration document
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// Cloud project and location
    pub project: ProjectConfig,
    /// Cluster shape
    pub cluster: ClusterConfig,
    /// Managed mesh options
    #[serde(default)]
    pub mesh: MeshConfig,
    /// Sample application options
    #[serde(default)]
    pub app: AppConfig,
    /// Per-phase poll intervals and budgets
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Cloud project and location
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProjectConfig {
    /// Project identifier
    pub id: String,
    /// Region (e.g. "us-central1")
    pub region: String,
    /// Zone for zonal clusters (e.g. "us-central1-b"); regional when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
}

/// Cluster shape
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClusterConfig {
    /// Cluster name
    pub name: String,
    /// Node machine type
    #[serde(default = "default_machine_type")]
    pub machine_type: String,
    /// Number of nodes
    #[serde(default = "default_node_count")]
    pub node_count: u32,
    /// Release channel the cluster subscribes to
    #[serde(default)]
    pub release_channel: ReleaseChannel,
    /// VPC network
    #[serde(default = "default_network")]
    pub network: String,
    /// Subnetwork
    #[serde(default = "default_network")]
    pub subnetwork: String,
    /// Resource labels applied to the cluster
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

fn default_machine_type() -> String {
    "e2-standard-4".to_string()
}

fn default_node_count() -> u32 {
    4
}

fn default_network() -> String {
    "default".to_string()
}

/// Release channel, shared by the cluster and the managed control plane
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseChannel {
    /// Newest components, fastest rollout
    Rapid,
    /// Default cadence
    #[default]
    Regular,
    /// Slowest, most soak time
    Stable,
}

impl fmt::Display for ReleaseChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReleaseChannel::Rapid => "rapid",
            ReleaseChannel::Regular => "regular",
            ReleaseChannel::Stable => "stable",
        };
        f.write_str(s)
    }
}

/// Managed mesh options
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MeshConfig {
    /// Managed control-plane channel
    #[serde(default)]
    pub channel: ReleaseChannel,
    /// Certificate authority backing workload mTLS
    #[serde(default)]
    pub ca: MeshCa,
    /// Register the cluster to the project fleet during install
    #[serde(default = "default_true")]
    pub enable_fleet_registration: bool,
    /// Extra namespaces to label for sidecar injection (the app namespace
    /// is always labeled)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub injection_namespaces: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            channel: ReleaseChannel::default(),
            ca: MeshCa::default(),
            enable_fleet_registration: true,
            injection_namespaces: Vec::new(),
        }
    }
}

/// Certificate authority for the mesh
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MeshCa {
    /// Managed mesh CA
    #[default]
    MeshCa,
    /// Customer-managed CA Service
    PrivateCa,
}

impl MeshCa {
    /// Flag value passed to the mesh installer
    pub fn as_flag(&self) -> &'static str {
        match self {
            MeshCa::MeshCa => "mesh_ca",
            MeshCa::PrivateCa => "gcp_cas",
        }
    }
}

/// Sample application options
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AppConfig {
    /// Namespace the application deploys into
    #[serde(default = "default_app_namespace")]
    pub namespace: String,
    /// Directory of manifests to deploy instead of the embedded storefront
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_dir: Option<PathBuf>,
    /// LoadBalancer Service exposing the frontend
    #[serde(default = "default_gateway_service")]
    pub gateway_service: String,
    /// Path probed on the frontend after deploy
    #[serde(default = "default_probe_path")]
    pub probe_path: String,
    /// HTTP status the probe waits for
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
}

fn default_app_namespace() -> String {
    "demo".to_string()
}

fn default_gateway_service() -> String {
    "frontend-external".to_string()
}

fn default_probe_path() -> String {
    "/".to_string()
}

fn default_expected_status() -> u16 {
    200
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            namespace: default_app_namespace(),
            manifest_dir: None,
            gateway_service: default_gateway_service(),
            probe_path: default_probe_path(),
            expected_status: default_expected_status(),
        }
    }
}

/// Per-phase poll intervals and budgets, in seconds.
///
/// Defaults preserve the retry budgets the original scripts encoded: long
/// waits for cloud provisioning, short intervals for in-cluster state.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Budget for the cluster to reach RUNNING
    #[serde(default = "default_cluster_running_secs")]
    pub cluster_running_secs: u64,
    /// Interval between cluster status probes
    #[serde(default = "default_cluster_poll_secs")]
    pub cluster_poll_secs: u64,
    /// Budget for the mesh injection webhook to appear
    #[serde(default = "default_mesh_ready_secs")]
    pub mesh_ready_secs: u64,
    /// Interval between mesh readiness probes
    #[serde(default = "default_short_poll_secs")]
    pub mesh_poll_secs: u64,
    /// Budget for every application deployment to become available
    #[serde(default = "default_rollout_secs")]
    pub rollout_secs: u64,
    /// Interval between rollout probes
    #[serde(default = "default_short_poll_secs")]
    pub rollout_poll_secs: u64,
    /// Budget for the gateway load balancer to publish an address
    #[serde(default = "default_gateway_secs")]
    pub gateway_ip_secs: u64,
    /// Interval between load-balancer probes
    #[serde(default = "default_short_poll_secs")]
    pub gateway_poll_secs: u64,
    /// Budget for the frontend to answer with the expected status
    #[serde(default = "default_probe_secs")]
    pub probe_secs: u64,
    /// Interval between HTTP probes
    #[serde(default = "default_short_poll_secs")]
    pub probe_poll_secs: u64,
}

fn default_cluster_running_secs() -> u64 {
    1800
}
fn default_cluster_poll_secs() -> u64 {
    15
}
fn default_mesh_ready_secs() -> u64 {
    600
}
fn default_rollout_secs() -> u64 {
    600
}
fn default_gateway_secs() -> u64 {
    300
}
fn default_probe_secs() -> u64 {
    300
}
fn default_short_poll_secs() -> u64 {
    5
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            cluster_running_secs: default_cluster_running_secs(),
            cluster_poll_secs: default_cluster_poll_secs(),
            mesh_ready_secs: default_mesh_ready_secs(),
            mesh_poll_secs: default_short_poll_secs(),
            rollout_secs: default_rollout_secs(),
            rollout_poll_secs: default_short_poll_secs(),
            gateway_ip_secs: default_gateway_secs(),
            gateway_poll_secs: default_short_poll_secs(),
            probe_secs: default_probe_secs(),
            probe_poll_secs: default_short_poll_secs(),
        }
    }
}

impl TimeoutConfig {
    /// Poll config for the cluster-RUNNING wait
    pub fn cluster_running(&self) -> PollConfig {
        PollConfig::new(
            Duration::from_secs(self.cluster_poll_secs),
            Duration::from_secs(self.cluster_running_secs),
        )
    }

    /// Poll config for the mesh readiness wait
    pub fn mesh_ready(&self) -> PollConfig {
        PollConfig::new(
            Duration::from_secs(self.mesh_poll_secs),
            Duration::from_secs(self.mesh_ready_secs),
        )
    }

    /// Poll config for application rollout waits
    pub fn rollout(&self) -> PollConfig {
        PollConfig::new(
            Duration::from_secs(self.rollout_poll_secs),
            Duration::from_secs(self.rollout_secs),
        )
    }

    /// Poll config for the gateway address wait
    pub fn gateway_ip(&self) -> PollConfig {
        PollConfig::new(
            Duration::from_secs(self.gateway_poll_secs),
            Duration::from_secs(self.gateway_ip_secs),
        )
    }

    /// Poll config for the frontend HTTP probe
    pub fn probe(&self) -> PollConfig {
        PollConfig::new(
            Duration::from_secs(self.probe_poll_secs),
            Duration::from_secs(self.probe_secs),
        )
    }
}

impl EnvironmentConfig {
    /// Load a config file, apply environment-variable overrides, and
    /// validate the result.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::validation(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a config document from YAML
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::validation(format!("invalid config file: {}", e)))
    }

    /// Apply environment-variable overrides through a lookup function.
    ///
    /// `MESHSTRAP_CLUSTER_LOCATION` accepts either a zone or a region; a
    /// zone (three dash-separated parts) also rewrites the region prefix.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("MESHSTRAP_PROJECT_ID") {
            self.project.id = id;
        }
        if let Some(name) = lookup("MESHSTRAP_CLUSTER_NAME") {
            self.cluster.name = name;
        }
        if let Some(location) = lookup("MESHSTRAP_CLUSTER_LOCATION") {
            self.set_location(&location);
        }
    }

    fn set_location(&mut self, location: &str) {
        if location.matches('-').count() >= 2 {
            // Zone, e.g. us-central1-b: region is everything before the
            // final suffix
            if let Some(idx) = location.rfind('-') {
                self.project.region = location[..idx].to_string();
            }
            self.project.zone = Some(location.to_string());
        } else {
            self.project.region = location.to_string();
            self.project.zone = None;
        }
    }

    /// The location flag target: the zone when set, the region otherwise
    pub fn location(&self) -> &str {
        self.project.zone.as_deref().unwrap_or(&self.project.region)
    }

    /// True when the cluster is zonal
    pub fn is_zonal(&self) -> bool {
        self.project.zone.is_some()
    }

    /// Validate the whole document. Runs once at startup; any failure here
    /// stops the pipeline before the first external command.
    pub fn validate(&self) -> Result<()> {
        if self.project.id.is_empty() {
            return Err(Error::validation("project.id must not be empty"));
        }
        if self.project.id.len() < 6 || !is_dns_label(&self.project.id, 30) {
            return Err(Error::validation(format!(
                "project.id '{}' is not a valid project identifier",
                self.project.id
            )));
        }

        if self.project.region.is_empty() {
            return Err(Error::validation("project.region must not be empty"));
        }
        if let Some(zone) = &self.project.zone {
            if !zone.starts_with(&self.project.region) {
                return Err(Error::validation(format!(
                    "zone '{}' is not in region '{}'",
                    zone, self.project.region
                )));
            }
        }

        if !is_dns_label(&self.cluster.name, 40) {
            return Err(Error::validation(format!(
                "cluster name '{}' must be a lowercase alphanumeric label of at most 40 characters",
                self.cluster.name
            )));
        }
        if self.cluster.node_count < 1 {
            return Err(Error::validation("cluster.nodeCount must be at least 1"));
        }

        for ns in self
            .mesh
            .injection_namespaces
            .iter()
            .chain(std::iter::once(&self.app.namespace))
        {
            if !is_dns_label(ns, 63) {
                return Err(Error::validation(format!(
                    "namespace '{}' is not a valid DNS label",
                    ns
                )));
            }
            if SYSTEM_NAMESPACES.contains(&ns.as_str()) {
                return Err(Error::validation(format!(
                    "refusing to target system namespace '{}'",
                    ns
                )));
            }
        }

        if !self.app.probe_path.starts_with('/') {
            return Err(Error::validation(format!(
                "app.probePath '{}' must start with '/'",
                self.app.probe_path
            )));
        }
        if !(100..=599).contains(&self.app.expected_status) {
            return Err(Error::validation(format!(
                "app.expectedStatus {} is not an HTTP status code",
                self.app.expected_status
            )));
        }

        Ok(())
    }
}

/// RFC 1035/1123 style label: lowercase alphanumeric and hyphens, starts
/// with a letter, does not end with a hyphen.
fn is_dns_label(s: &str, max_len: usize) -> bool {
    if s.is_empty() || s.len() > max_len {
        return false;
    }
    let mut chars = s.chars();
    let first = chars.next().expect("non-empty");
    if !first.is_ascii_lowercase() {
        return false;
    }
    if s.ends_with('-') {
        return false;
    }
    s.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
project:
  id: mesh-demo-project
  region: us-central1
cluster:
  name: mesh-demo
"#
    }

    fn minimal() -> EnvironmentConfig {
        EnvironmentConfig::from_yaml(minimal_yaml()).expect("minimal config parses")
    }

    // =========================================================================
    // Defaults
    // =========================================================================

    /// Story: a three-value config file is a complete environment
    ///
    /// Everything beyond project id, region, and cluster name has a default
    /// mirroring the original workflow's environment file.
    #[test]
    fn story_minimal_config_is_complete() {
        let config = minimal();

        assert_eq!(config.cluster.machine_type, "e2-standard-4");
        assert_eq!(config.cluster.node_count, 4);
        assert_eq!(config.cluster.release_channel, ReleaseChannel::Regular);
        assert_eq!(config.mesh.channel, ReleaseChannel::Regular);
        assert!(config.mesh.enable_fleet_registration);
        assert_eq!(config.app.namespace, "demo");
        assert_eq!(config.app.gateway_service, "frontend-external");
        assert_eq!(config.app.expected_status, 200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn regional_cluster_when_zone_unset() {
        let config = minimal();
        assert!(!config.is_zonal());
        assert_eq!(config.location(), "us-central1");
    }

    #[test]
    fn zonal_cluster_uses_zone_as_location() {
        let mut config = minimal();
        config.project.zone = Some("us-central1-b".to_string());
        assert!(config.is_zonal());
        assert_eq!(config.location(), "us-central1-b");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = r#"
project:
  id: mesh-demo-project
  region: us-central1
cluster:
  name: mesh-demo
  nodeCout: 3
"#;
        assert!(EnvironmentConfig::from_yaml(yaml).is_err());
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Story: validation catches misconfigurations before provisioning
    #[test]
    fn story_invalid_cluster_name_fails_before_any_cloud_call() {
        let mut config = minimal();
        config.cluster.name = "My Cluster!".to_string();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cluster name"));
    }

    #[test]
    fn cluster_name_over_forty_chars_is_rejected() {
        let mut config = minimal();
        config.cluster.name = "a".repeat(41);
        assert!(config.validate().is_err());

        config.cluster.name = "a".repeat(40);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_nodes_is_rejected() {
        let mut config = minimal();
        config.cluster.node_count = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn zone_outside_region_is_rejected() {
        let mut config = minimal();
        config.project.zone = Some("europe-west1-b".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("not in region"));
    }

    /// Story: the tool refuses to deploy the demo app into system namespaces
    #[test]
    fn story_system_namespaces_are_off_limits() {
        let mut config = minimal();
        config.app.namespace = "kube-system".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("system namespace"));

        let mut config = minimal();
        config.mesh.injection_namespaces = vec!["istio-system".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn probe_path_must_be_absolute() {
        let mut config = minimal();
        config.app.probe_path = "healthz".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn expected_status_must_be_http() {
        let mut config = minimal();
        config.app.expected_status = 42;
        assert!(config.validate().is_err());
    }

    // =========================================================================
    // Environment overrides
    // =========================================================================

    /// Story: CI overrides the file through environment variables
    ///
    /// The original workflow was driven entirely by PROJECT_ID/CLUSTER_NAME/
    /// CLUSTER_ZONE exports; the same shape still works on top of the file.
    #[test]
    fn story_env_vars_override_the_file() {
        let mut config = minimal();
        config.apply_overrides(|key| match key {
            "MESHSTRAP_PROJECT_ID" => Some("ci-project-42".to_string()),
            "MESHSTRAP_CLUSTER_NAME" => Some("ci-run-7".to_string()),
            "MESHSTRAP_CLUSTER_LOCATION" => Some("europe-west1-b".to_string()),
            _ => None,
        });

        assert_eq!(config.project.id, "ci-project-42");
        assert_eq!(config.cluster.name, "ci-run-7");
        assert_eq!(config.project.zone.as_deref(), Some("europe-west1-b"));
        assert_eq!(config.project.region, "europe-west1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn region_override_clears_the_zone() {
        let mut config = minimal();
        config.project.zone = Some("us-central1-b".to_string());
        config.apply_overrides(|key| match key {
            "MESHSTRAP_CLUSTER_LOCATION" => Some("asia-east1".to_string()),
            _ => None,
        });

        assert_eq!(config.project.region, "asia-east1");
        assert_eq!(config.project.zone, None);
    }

    #[test]
    fn no_overrides_leaves_config_untouched() {
        let mut config = minimal();
        let before = config.clone();
        config.apply_overrides(|_| None);
        assert_eq!(config, before);
    }

    // =========================================================================
    // Timeouts
    // =========================================================================

    #[test]
    fn timeout_defaults_preserve_the_script_budgets() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.cluster_running().timeout, Duration::from_secs(1800));
        assert_eq!(timeouts.cluster_running().interval, Duration::from_secs(15));
        assert_eq!(timeouts.probe().timeout, Duration::from_secs(300));
        assert_eq!(timeouts.probe().interval, Duration::from_secs(5));
    }

    #[test]
    fn timeouts_are_overridable_per_phase() {
        let yaml = r#"
project:
  id: mesh-demo-project
  region: us-central1
cluster:
  name: mesh-demo
timeouts:
  clusterRunningSecs: 60
  probePollSecs: 1
"#;
        let config = EnvironmentConfig::from_yaml(yaml).unwrap();
        assert_eq!(
            config.timeouts.cluster_running().timeout,
            Duration::from_secs(60)
        );
        assert_eq!(config.timeouts.probe().interval, Duration::from_secs(1));
        // Untouched fields keep their defaults
        assert_eq!(config.timeouts.mesh_ready().timeout, Duration::from_secs(600));
    }
}
