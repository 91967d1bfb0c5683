use telemetry_core::ErrorKind;
use telemetry_rpc::rpc_client::RpcError;
use thiserror::Error;

/// Failure of a REST lookup against the geolocation or price service.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("response is missing `{0}`")]
    MissingField(&'static str),
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Http(e) if e.is_decode() => ErrorKind::UpstreamMalformed,
            FetchError::MissingField(_) => ErrorKind::UpstreamMalformed,
            FetchError::NotConfigured(_) | FetchError::Http(_) | FetchError::Status(_) => {
                ErrorKind::UpstreamUnavailable
            }
        }
    }
}

/// A required upstream call failed, so the pipeline run produced no snapshot.
#[derive(Debug, Error)]
#[error("{method} failed: {source}")]
pub struct PipelineError {
    pub method: &'static str,
    #[source]
    pub source: RpcError,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}
