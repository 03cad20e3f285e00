//! Kubernetes API wrapper.
//!
//! Everything the pipeline does inside the cluster goes through the API
//! directly: server-side apply for manifests, merge patches for label and
//! annotation mutation, and typed reads for rollout, pod, and service
//! status. The original workflow shelled out to `kubectl` and scraped its
//! output for all of this.
//!
//! Status interpretation (is this deployment available, is this pod ready,
//! has the load balancer published an address) is factored into pure
//! functions over the API types so it can be tested without a cluster.

use std::path::Path;

use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::{Client, Config};
use tracing::debug;

use crate::{Error, Result, FIELD_MANAGER};

/// Handle to one cluster's API server
#[derive(Clone)]
pub struct KubeApi {
    client: Client,
}

impl KubeApi {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from a kubeconfig file (as written by
    /// [`crate::gke::GkeProvider::write_kubeconfig`])
    pub async fn from_kubeconfig(path: &Path) -> Result<Self> {
        let kubeconfig = Kubeconfig::read_from(path)
            .map_err(|e| Error::kubeconfig(format!("{}: {}", path.display(), e)))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::kubeconfig(e.to_string()))?;
        let client = Client::try_from(config).map_err(Error::Kube)?;
        Ok(Self { client })
    }

    fn apply_params() -> PatchParams {
        PatchParams::apply(FIELD_MANAGER).force()
    }

    /// Create the namespace if it does not exist (server-side apply)
    pub async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name },
        });
        api.patch(name, &Self::apply_params(), &Patch::Apply(&ns))
            .await?;
        Ok(())
    }

    /// Merge-patch namespace labels. A `None` value clears that label.
    pub async fn label_namespace(
        &self,
        name: &str,
        labels: &[(&str, Option<&str>)],
    ) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "metadata": { "labels": label_map(labels) },
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Merge-patch namespace annotations. A `None` value clears it.
    pub async fn annotate_namespace(
        &self,
        name: &str,
        annotations: &[(&str, Option<&str>)],
    ) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "metadata": { "annotations": label_map(annotations) },
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Delete a namespace; deleting one that is already gone is fine
    pub async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of all Deployments in a namespace
    pub async fn deployment_names(&self, namespace: &str) -> Result<Vec<String>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|d| d.metadata.name)
            .collect())
    }

    /// Whether a Deployment has its full complement of updated, available
    /// replicas. A Deployment that does not exist yet is simply not
    /// available.
    pub async fn deployment_available(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .get_opt(name)
            .await?
            .map(|d| deployment_is_available(&d))
            .unwrap_or(false))
    }

    /// Count of (ready, total) pods matching a label selector; an empty
    /// selector counts every pod in the namespace
    pub async fn pods_ready(&self, namespace: &str, selector: &str) -> Result<(usize, usize)> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = if selector.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(selector)
        };
        let pods = api.list(&params).await?.items;
        let total = pods.len();
        let ready = pods.iter().filter(|p| pod_is_ready(p)).count();
        Ok((ready, total))
    }

    /// The external address a LoadBalancer Service has published, if any
    pub async fn service_external_ip(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .get_opt(name)
            .await?
            .as_ref()
            .and_then(service_ingress_address))
    }

    /// Stamp a restartedAt annotation on a Deployment's pod template,
    /// triggering a rolling restart (what `kubectl rollout restart` does)
    pub async fn restart_deployment(
        &self,
        namespace: &str,
        name: &str,
        stamp: &str,
    ) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "spec": { "template": { "metadata": { "annotations": {
                "kubectl.kubernetes.io/restartedAt": stamp,
            }}}},
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Whether any MutatingWebhookConfiguration name starts with the prefix
    pub async fn webhook_present(&self, name_prefix: &str) -> Result<bool> {
        let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .iter()
            .filter_map(|w| w.metadata.name.as_deref())
            .any(|n| n.starts_with(name_prefix)))
    }

    /// Server-side apply one YAML document, discovering its group/version/
    /// kind from the document itself
    pub async fn apply_manifest(&self, manifest: &str) -> Result<()> {
        let obj: serde_json::Value = serde_yaml::from_str(manifest)
            .map_err(|e| Error::serialization(format!("invalid manifest YAML: {}", e)))?;

        let target = ManifestTarget::from_value(&obj)?;
        let api_resource = ApiResource::from_gvk(&target.gvk);

        let api: Api<DynamicObject> = match &target.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &api_resource),
            None => Api::all_with(self.client.clone(), &api_resource),
        };

        api.patch(&target.name, &Self::apply_params(), &Patch::Apply(&obj))
            .await?;

        debug!(kind = %target.gvk.kind, name = %target.name, "Applied manifest");
        Ok(())
    }

    /// Apply every document in a multi-document YAML stream, in order
    pub async fn apply_multidoc(&self, yaml: &str) -> Result<usize> {
        let docs = split_documents(yaml);
        for doc in &docs {
            self.apply_manifest(doc).await?;
        }
        Ok(docs.len())
    }
}

fn label_map(pairs: &[(&str, Option<&str>)]) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = pairs
        .iter()
        .map(|(k, v)| {
            (
                k.to_string(),
                v.map(|s| serde_json::Value::String(s.to_string()))
                    .unwrap_or(serde_json::Value::Null),
            )
        })
        .collect();
    serde_json::Value::Object(map)
}

/// Addressing information extracted from one manifest document
#[derive(Clone, Debug, PartialEq)]
struct ManifestTarget {
    gvk: GroupVersionKind,
    name: String,
    namespace: Option<String>,
}

impl ManifestTarget {
    fn from_value(obj: &serde_json::Value) -> Result<Self> {
        let kind = obj
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::serialization("manifest is missing kind"))?;
        let api_version = obj
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::serialization("manifest is missing apiVersion"))?;
        let name = obj
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::serialization("manifest is missing metadata.name"))?;
        let namespace = obj
            .pointer("/metadata/namespace")
            .and_then(|v| v.as_str())
            .map(String::from);

        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };

        Ok(Self {
            gvk: GroupVersionKind {
                group,
                version,
                kind: kind.to_string(),
            },
            name: name.to_string(),
            namespace,
        })
    }
}

/// Split a multi-document YAML stream into individual documents, dropping
/// comment-only and empty fragments
pub fn split_documents(yaml: &str) -> Vec<String> {
    yaml.split("\n---")
        .map(str::trim)
        .map(|doc| doc.strip_prefix("---").unwrap_or(doc).trim())
        .filter(|doc| !doc.is_empty() && doc.contains("kind:"))
        .map(String::from)
        .collect()
}

/// Whether a Deployment has all desired replicas updated and available
pub fn deployment_is_available(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    status.available_replicas.unwrap_or(0) >= desired
        && status.updated_replicas.unwrap_or(0) >= desired
}

/// Whether a Pod reports the Ready condition as True
pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// The first ingress address (IP preferred, hostname otherwise) a
/// LoadBalancer Service has published
pub fn service_ingress_address(service: &Service) -> Option<String> {
    let ingress = service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?;
    ingress.ip.clone().or_else(|| ingress.hostname.clone())
}
