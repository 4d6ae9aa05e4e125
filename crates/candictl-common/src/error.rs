//! Error types for candictl
//!
//! Errors are structured with fields so that the phase, step or node that
//! failed is visible in the final message. Per-node failures inside a node
//! group are gathered into a [`MultiError`] instead of aborting early.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for candictl operations
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration document failed schema or cross-field validation
    #[error("invalid configuration{}: {message}", document.as_ref().map(|d| format!(" [{}]", d)).unwrap_or_default())]
    ConfigInvalid {
        /// Description of what's invalid
        message: String,
        /// Document kind or field path, if known
        document: Option<String>,
    },

    /// The state cache carries a tombstone and must not be reused
    #[error(
        "state cache {} is exhausted: the cluster was probably already bootstrapped or destroyed. \
         Delete the cache directory manually to proceed",
        path.display()
    )]
    CacheExhausted {
        /// Cache directory
        path: PathBuf,
    },

    /// A cache entry could not be decoded
    #[error("state cache entry {key} is corrupt: {message}")]
    CacheCorrupt {
        /// Cache key
        key: String,
        /// Description of the decoding failure
        message: String,
    },

    /// The runner has been stopped and refuses further operations
    #[error("runner {step} is stopped")]
    RunnerStopped {
        /// Runner step or name
        step: String,
    },

    /// The pipeline was declined by the user or cancelled
    #[error("pipeline {pipeline} aborted: {reason}")]
    PipelineAborted {
        /// Pipeline name
        pipeline: String,
        /// Why the pipeline did not proceed
        reason: String,
    },

    /// The IaC subprocess exited with an error
    #[error("{command} failed for {step}: {message}")]
    PipelineFailed {
        /// Runner step or name
        step: String,
        /// Subcommand that failed (init, plan, apply, destroy, output)
        command: String,
        /// Captured stderr or a pointer to the debug output
        message: String,
    },

    /// Expected state is absent
    #[error("{message}")]
    StateMissing {
        /// Description of the missing state
        message: String,
    },

    /// A readiness wait timed out
    #[error("not ready: {message}")]
    NodeNotReady {
        /// Description of what did not become ready
        message: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Kubernetes API operation failed with additional context
    #[error("kubernetes {operation} failed: {message}")]
    KubeApi {
        /// Operation that failed (e.g. "get secret d8-system/foo")
        operation: String,
        /// Description of the failure
        message: String,
    },

    /// SSH host is not reachable
    #[error("ssh {host} is unavailable: {message}")]
    SshUnavailable {
        /// Target host
        host: String,
        /// Description of the failure
        message: String,
    },

    /// The kube proxy or a tunnel could not be established
    #[error("proxy failed: {message}")]
    ProxyFailed {
        /// Description of the failure
        message: String,
    },

    /// Several independent failures collected within one group
    #[error("{0}")]
    Multi(MultiError),

    /// A retry loop or wait was interrupted by shutdown
    #[error("{operation}: loop cancelled")]
    LoopCancelled {
        /// Name of the interrupted operation
        operation: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document or resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Filesystem or process I/O error
    #[error("io error: {source}")]
    Io {
        /// The underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a config validation error
    pub fn config_invalid(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: msg.into(),
            document: None,
        }
    }

    /// Create a config validation error for a specific document or field
    pub fn config_invalid_in(document: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: msg.into(),
            document: Some(document.into()),
        }
    }

    /// Create a corrupt cache entry error
    pub fn cache_corrupt(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CacheCorrupt {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a runner-stopped error
    pub fn runner_stopped(step: impl Into<String>) -> Self {
        Self::RunnerStopped { step: step.into() }
    }

    /// Create a pipeline-aborted error
    pub fn pipeline_aborted(pipeline: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PipelineAborted {
            pipeline: pipeline.into(),
            reason: reason.into(),
        }
    }

    /// Create a pipeline-failed error
    pub fn pipeline_failed(
        step: impl Into<String>,
        command: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::PipelineFailed {
            step: step.into(),
            command: command.into(),
            message: msg.into(),
        }
    }

    /// Create a state-missing error
    pub fn state_missing(msg: impl Into<String>) -> Self {
        Self::StateMissing {
            message: msg.into(),
        }
    }

    /// Create a readiness timeout error
    pub fn node_not_ready(msg: impl Into<String>) -> Self {
        Self::NodeNotReady {
            message: msg.into(),
        }
    }

    /// Create a kubernetes operation error
    pub fn kube_api(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::KubeApi {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create an SSH availability error
    pub fn ssh_unavailable(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SshUnavailable {
            host: host.into(),
            message: msg.into(),
        }
    }

    /// Create a proxy error
    pub fn proxy_failed(msg: impl Into<String>) -> Self {
        Self::ProxyFailed {
            message: msg.into(),
        }
    }

    /// Create a cancelled-loop error
    pub fn loop_cancelled(operation: impl Into<String>) -> Self {
        Self::LoopCancelled {
            operation: operation.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a known document kind
    pub fn serialization_for(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error means the operation was interrupted rather than failed
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::LoopCancelled { .. } | Self::PipelineAborted { .. } | Self::RunnerStopped { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl From<MultiError> for Error {
    fn from(e: MultiError) -> Self {
        Self::Multi(e)
    }
}

/// A list of errors collected while iterating over independent items
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<Error>,
}

impl MultiError {
    /// Create an empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an error
    pub fn push(&mut self, err: Error) {
        self.errors.push(err);
    }

    /// Number of collected errors
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// True when nothing was collected
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collected errors in insertion order
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// `Ok(())` when empty, otherwise `Err(Error::Multi)`
    pub fn into_result(self) -> Result<(), Error> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Multi(self))
        }
    }

    /// Like [`into_result`](Self::into_result), but a lone error is returned as is
    pub fn into_flat_result(mut self) -> Result<(), Error> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(Error::Multi(self)),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.len() == 1 {
            return write!(f, "1 error occurred:\n\t* {}", self.errors[0]);
        }
        write!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n\t* {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
