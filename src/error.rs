//! Error types for meshstrap

use std::time::Duration;

use thiserror::Error;

/// Main error type for meshstrap operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Kubeconfig construction error
    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    /// Environment config failed validation
    #[error("validation error: {0}")]
    Validation(String),

    /// A required tool is missing from PATH
    #[error("prerequisite not found: {tool} - {hint}")]
    PrerequisiteNotFound {
        /// The tool that was not found
        tool: String,
        /// Hint for how to install it
        hint: String,
    },

    /// An external command exited nonzero
    #[error("command failed: {command} - {message}")]
    CommandFailed {
        /// The command that failed
        command: String,
        /// Stderr from the command
        message: String,
    },

    /// Cloud provider reported an unrecoverable cluster state
    #[error("provider error: {0}")]
    Provider(String),

    /// A wait-until-condition poll exhausted its budget
    #[error("timed out waiting for {operation} after {waited:?} (last state: {last})")]
    Timeout {
        /// The operation being waited on
        operation: String,
        /// How long we waited
        waited: Duration,
        /// Last pending reason observed before the deadline
        last: String,
    },

    /// An operation was cancelled (ctrl-c)
    #[error("cancelled while {operation}")]
    Cancelled {
        /// The operation that was interrupted
        operation: String,
    },

    /// HTTP probe error
    #[error("http error: {0}")]
    Http(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Manifest rendering error
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a provider error with the given message
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create an HTTP error with the given message
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a kubeconfig error with the given message
    pub fn kubeconfig(msg: impl Into<String>) -> Self {
        Self::Kubeconfig(msg.into())
    }

    /// Create a command failure for the given command line
    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// True if this error should be treated as transient by retry loops.
    ///
    /// Vendor CLIs and the Kubernetes API both fail transiently while a
    /// cluster is converging; config and template errors never recover.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube(_) | Error::CommandFailed { .. } | Error::Http(_) => true,
            Error::Validation(_)
            | Error::Provider(_)
            | Error::PrerequisiteNotFound { .. }
            | Error::Template(_)
            | Error::Serialization(_)
            | Error::Kubeconfig(_)
            | Error::Timeout { .. }
            | Error::Cancelled { .. }
            | Error::Io(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Propagation Through the Pipeline
    // ==========================================================================
    //
    // Each error category maps to a different operator experience: config
    // errors stop before any cloud call, command failures carry the vendor
    // tool's stderr, and timeouts name what was being waited on.

    /// Story: config validation stops the pipeline before any external call
    #[test]
    fn story_validation_rejects_bad_config_up_front() {
        let err = Error::validation("cluster name 'My Cluster!' contains invalid characters");
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("invalid characters"));
        assert!(!err.is_transient());
    }

    /// Story: a failed gcloud invocation surfaces its stderr verbatim
    #[test]
    fn story_command_failures_carry_vendor_stderr() {
        let err = Error::command(
            "gcloud container clusters create demo",
            "ERROR: (gcloud.container.clusters.create) quota exceeded",
        );
        let text = err.to_string();
        assert!(text.contains("gcloud container clusters create demo"));
        assert!(text.contains("quota exceeded"));

        // Infra might recover, so retries are allowed to see this one
        assert!(err.is_transient());
    }

    /// Story: timeouts report the operation and the last observed state
    ///
    /// When the frontend never returns 200, the operator needs to know both
    /// what we were waiting for and where it got stuck.
    #[test]
    fn story_timeouts_name_the_stuck_operation() {
        let err = Error::Timeout {
            operation: "frontend to serve HTTP 200".to_string(),
            waited: Duration::from_secs(300),
            last: "connection refused".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("frontend to serve HTTP 200"));
        assert!(text.contains("300"));
        assert!(text.contains("connection refused"));
        assert!(!err.is_transient(), "a burned budget is final");
    }

    /// Story: missing prerequisites come with install hints
    #[test]
    fn story_missing_tool_includes_install_hint() {
        let err = Error::PrerequisiteNotFound {
            tool: "asmcli".to_string(),
            hint: "curl https://storage.googleapis.com/csm-artifacts/asm/asmcli > asmcli"
                .to_string(),
        };
        assert!(err.to_string().contains("asmcli"));
        assert!(err.to_string().contains("csm-artifacts"));
    }

    /// Story: cancellation is reported as an interruption, not a failure
    #[test]
    fn story_cancellation_names_the_interrupted_phase() {
        let err = Error::Cancelled {
            operation: "waiting for cluster to reach RUNNING".to_string(),
        };
        assert!(err.to_string().contains("cancelled"));
        assert!(err.to_string().contains("RUNNING"));
    }
}
