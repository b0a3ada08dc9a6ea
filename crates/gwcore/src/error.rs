use thiserror::Error;

/// Failure modes for [`crate::config::Config::load`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure modes for [`crate::process::EngineProcess`].
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("engine binary not found: {0}")]
    NotFound(String),
    #[error("process already running")]
    AlreadyRunning,
    #[error("failed to spawn engine process: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

/// Failure modes surfaced by [`crate::manager::EngineManager`].
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("unsupported engine kind: {0}")]
    UnsupportedEngine(String),
    #[error("no variant of model '{0}' has sufficient context for {1} tokens")]
    NoSuitableVariant(String, u32),
    #[error("model '{0}' not found in configuration")]
    UnknownModel(String),
    #[error("engine for model '{0}' did not become ready within {1}s")]
    EngineNotReady(String, f64),
    #[error("engine process error: {0}")]
    Process(#[from] ProcessError),
    #[error("engine manager has been shut down")]
    ManagerShutdown,
}

/// The single error funnel `RequestHandler` converts to an HTTP status and
/// an OpenAI-shaped JSON error body: `ClientError` -> 400, `UpstreamError`
/// -> 502, `InternalError` -> 500, `ManagerShutdown` -> 500.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    ClientError(String),
    #[error("{0}")]
    UpstreamError(String),
    #[error("{0}")]
    InternalError(String),
    #[error("gateway is shutting down")]
    ManagerShutdown,
}

impl GatewayError {
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::ClientError(_) => 400,
            GatewayError::UpstreamError(_) => 502,
            GatewayError::InternalError(_) => 500,
            GatewayError::ManagerShutdown => 500,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::ClientError(_) => "invalid_request_error",
            _ => "internal_error",
        }
    }
}

impl From<ManagerError> for GatewayError {
    fn from(e: ManagerError) -> Self {
        match e {
            ManagerError::UnsupportedEngine(_)
            | ManagerError::NoSuitableVariant(_, _)
            | ManagerError::UnknownModel(_) => GatewayError::ClientError(e.to_string()),
            ManagerError::EngineNotReady(_, _) | ManagerError::Process(_) => {
                GatewayError::UpstreamError(e.to_string())
            }
            ManagerError::ManagerShutdown => GatewayError::ManagerShutdown,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::UpstreamError(e.to_string())
    }
}
