use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum VguestError {
    #[error("invalid configuration: {message}")]
    Config { message: String },

    #[error("missing required environment variables: {}", missing.join(", "))]
    #[diagnostic(help("set them in the environment or in the .env file passed via --env-file"))]
    MissingConfig { missing: Vec<String> },

    #[error("failed to connect to vSphere: {message}")]
    #[diagnostic(help("check the host address, credentials and TLS settings (--insecure for self-signed lab hosts)"))]
    Connection { message: String },

    #[error("VM '{name}' not found")]
    VmNotFound { name: String },

    #[error("VMware Tools are not running in VM '{vm}' (status: {status})")]
    #[diagnostic(help("the guest must be powered on with VMware Tools active"))]
    ToolsNotRunning { vm: String, status: String },

    #[error("vSphere API error: {message}")]
    Api { message: String },

    #[error("guest command did not finish within {seconds}s")]
    Timeout {
        seconds: u64,
        #[help]
        hint: String,
    },

    #[error("guest file not found: {path}")]
    FileNotFound { path: String },

    #[error("guest command failed: {message}")]
    Execution { message: String },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("cancelled")]
    PromptCancelled,

    #[error("prompt error: {message}")]
    Prompt { message: String },
}

impl VguestError {
    /// Narrow a failure during command execution to the kinds a run reports.
    /// A missing guest file there is a guest API fault, not a read failure.
    pub(crate) fn into_execution(self) -> Self {
        match self {
            VguestError::Transport { message } => VguestError::Execution { message },
            VguestError::FileNotFound { path } => VguestError::Api {
                message: format!("FileNotFound: {path}"),
            },
            other => other,
        }
    }
}

impl From<reqwest::Error> for VguestError {
    fn from(e: reqwest::Error) -> Self {
        VguestError::Transport {
            message: e.to_string(),
        }
    }
}
