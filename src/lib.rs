//! Meshstrap - provision a GKE cluster, install the managed service mesh,
//! and deploy a demo storefront application.
//!
//! Meshstrap replaces a set of shell scripts that drove `gcloud`, `kubectl`,
//! and `asmcli` by hand. It runs the same sequence as a single pipeline:
//!
//! 1. Check prerequisites and enable the required cloud APIs
//! 2. Create the cluster and wait for it to reach `RUNNING`
//! 3. Install the managed service-mesh control plane and wait for the
//!    injection webhook to appear
//! 4. Label application namespaces for sidecar injection
//! 5. Deploy the storefront, wait for rollouts and the gateway address,
//!    and probe the frontend over HTTP
//!
//! Everything the pipeline waits on goes through the [`poll`] module, the
//! one reusable abstraction in this tool: a condition poller with a
//! configurable interval, an overall timeout, and cooperative cancellation.
//!
//! # Modules
//!
//! - [`config`] - Declarative environment config (replaces the env-var file)
//! - [`exec`] - External tool invocation (`gcloud`, `kubectl`, `asmcli`)
//! - [`poll`] - Wait-until-condition poller and transient-failure retry
//! - [`gke`] - Cloud provider wrapper (cluster create/describe/delete)
//! - [`k8s`] - Kubernetes API wrapper (status reads, label mutation, apply)
//! - [`mesh`] - Managed control-plane installation and injection wiring
//! - [`app`] - Sample storefront deployment and frontend probing
//! - [`pipeline`] - Phase sequencing behind the CLI subcommands
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod app;
pub mod config;
pub mod error;
pub mod exec;
pub mod gke;
pub mod k8s;
pub mod mesh;
pub mod pipeline;
pub mod poll;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Centralized so CLI defaults, config defaults, and test fixtures agree.

/// Cloud APIs that must be enabled before a mesh-enabled cluster can be built
pub const REQUIRED_SERVICES: &[&str] = &[
    "container.googleapis.com",
    "mesh.googleapis.com",
    "gkehub.googleapis.com",
];

/// Namespace label selecting the mesh control-plane revision for injection
pub const MESH_REVISION_LABEL: &str = "istio.io/rev";

/// Legacy injection label that must be absent when revision labels are used
pub const LEGACY_INJECTION_LABEL: &str = "istio-injection";

/// Name prefix of the mutating webhook the managed control plane installs
pub const MESH_WEBHOOK_PREFIX: &str = "istiod-";

/// Field manager used for all server-side apply patches
pub const FIELD_MANAGER: &str = "meshstrap";
