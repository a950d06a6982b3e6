use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to build HTTP client: {0}")]
    ClientSetup(#[source] reqwest::Error),
    #[error("token request failed: {0}")]
    Transport(#[from] CallError),
    #[error("provider rejected credentials: {0}")]
    Rejected(String),
    #[error("malformed token payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("request to {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {path} returned HTTP {status}: {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },
}

#[derive(Debug, Error)]
#[error("no endpoint available for {operation}")]
pub struct AllFailedError {
    pub operation: String,
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("response from {path} is not valid JSON: {source}")]
    InvalidJson {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("response from {path} is missing `{field}`")]
    MissingField { path: String, field: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NoData,
    Upstream,
    Internal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::NoData => "no_data",
            FailureKind::Upstream => "upstream",
            FailureKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    AllFailed(#[from] AllFailedError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("provider reported failure: {0}")]
    Rejected(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ApiError::AllFailed(_) => FailureKind::NoData,
            ApiError::Auth(_) | ApiError::Call(_) | ApiError::Data(_) | ApiError::Rejected(_) => {
                FailureKind::Upstream
            }
            ApiError::Internal(_) => FailureKind::Internal,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
