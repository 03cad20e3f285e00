//! Integration tests for environment config loading.
//!
//! These exercise the same path the CLI takes: a config file on disk,
//! loaded and validated before any phase runs.

use std::time::Duration;

use meshstrap::config::{EnvironmentConfig, ReleaseChannel};

fn write_config(content: &str) -> tempfile::NamedTempFile {
    use std::io::Write;
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(content.as_bytes()).expect("write config");
    file
}

#[tokio::test]
async fn loads_a_full_config_file() {
    let file = write_config(
        r#"
project:
  id: storefront-prod
  region: us-central1
  zone: us-central1-b
cluster:
  name: storefront
  machineType: e2-standard-8
  nodeCount: 6
  releaseChannel: rapid
mesh:
  channel: rapid
  injectionNamespaces: [payments]
app:
  namespace: shop
  gatewayService: shop-gateway
  probePath: /healthz
timeouts:
  clusterRunningSecs: 900
"#,
    );

    let config = EnvironmentConfig::load(file.path()).await.expect("loads");

    assert_eq!(config.project.id, "storefront-prod");
    assert_eq!(config.location(), "us-central1-b");
    assert!(config.is_zonal());
    assert_eq!(config.cluster.machine_type, "e2-standard-8");
    assert_eq!(config.cluster.node_count, 6);
    assert_eq!(config.mesh.channel, ReleaseChannel::Rapid);
    assert_eq!(config.mesh.injection_namespaces, vec!["payments"]);
    assert_eq!(config.app.namespace, "shop");
    assert_eq!(config.app.probe_path, "/healthz");
    assert_eq!(
        config.timeouts.cluster_running().timeout,
        Duration::from_secs(900)
    );
}

#[tokio::test]
async fn invalid_config_fails_at_load_time() {
    let file = write_config(
        r#"
project:
  id: storefront-prod
  region: us-central1
cluster:
  name: storefront
  nodeCount: 0
"#,
    );

    let err = EnvironmentConfig::load(file.path()).await.unwrap_err();
    assert!(err.to_string().contains("at least 1"));
}

#[tokio::test]
async fn missing_file_is_a_clear_error() {
    let err = EnvironmentConfig::load(std::path::Path::new("/nonexistent/meshstrap.yaml"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot read config file"));
}

#[tokio::test]
async fn yaml_typos_are_rejected_not_ignored() {
    // nodeCout instead of nodeCount: deny_unknown_fields turns a silent
    // misconfiguration into a load failure.
    let file = write_config(
        r#"
project:
  id: storefront-prod
  region: us-central1
cluster:
  name: storefront
  nodeCout: 6
"#,
    );

    let err = EnvironmentConfig::load(file.path()).await.unwrap_err();
    assert!(err.to_string().contains("invalid config file"));
}
