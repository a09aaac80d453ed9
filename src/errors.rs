use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("failed to read configuration file {path:?}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {path:?}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed tag: {0}")]
    MalformedTag(String),

    #[error("tag {0} is not present in the configuration")]
    UnknownTag(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected registry response: {0}")]
    Registry(String),

    #[error("{context} failed with status {status}: {body}")]
    CloudApi {
        context: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("endpoint {instance} carries a non-numeric port {port:?}")]
    EndpointPort { instance: String, port: String },

    #[error("operation {name} finished with an error: {message}")]
    OperationFailed { name: String, message: String },

    #[error("operation {0} did not reach DONE within the polling ceiling")]
    OperationTimeout(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
