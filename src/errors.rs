use thiserror::Error;

/// Error kinds surfaced by the core (workload-mutation engine). CLI-level
/// glue wraps these in `anyhow::Error` the way the teacher wraps I/O and
/// config failures with `anyhow::Context`.
#[derive(Debug, Error)]
pub enum PodwireError {
    #[error("no namespace selected")]
    NoNamespaceSelected,

    #[error("no resource selected")]
    NoResourceSelected,

    #[error("no resources available in namespace")]
    NoResources,

    #[error("no containers available on the selected workload")]
    NoContainers,

    #[error("container {0:?} not found on the selected workload")]
    ContainerNotFound(String),

    #[error("invalid resource type {0:?}")]
    InvalidResourceType(String),

    #[error("a {0} session is already active on this workload")]
    CrossModeConflict(&'static str),

    #[error("workload is already in use by a session on container {0:?}")]
    InUse(String),

    #[error("no rollback manifest available for this workload")]
    NoRollback,

    #[error("pod did not become ready within the wait timeout")]
    PodNotReady,

    #[error("invalid port mapping {0:?}")]
    InvalidPortMapping(String),

    #[error("invalid environment variable definition {0:?}")]
    InvalidEnvDefinition(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("kubernetes API call failed: {verb} {kind}: {cause}")]
    KubeAPIError {
        verb: &'static str,
        kind: &'static str,
        #[source]
        cause: kube::Error,
    },

    #[error("sync engine exited with status {exit}: {output}")]
    SyncEngineError { exit: i32, output: String },

    #[error("terminated by signal: {0}")]
    SignalTerminated(&'static str),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl PodwireError {
    pub fn kube(verb: &'static str, kind: &'static str, cause: kube::Error) -> Self {
        PodwireError::KubeAPIError { verb, kind, cause }
    }
}

pub type Result<T> = std::result::Result<T, PodwireError>;
