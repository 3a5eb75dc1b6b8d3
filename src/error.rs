//! Typed error taxonomy. Collapses the C original's combined success/failure
//! return-code enum (`OK`, `OPENED`, `CONNECTED`, `BOUND`, ... alongside the
//! actual failure codes) into `Result<T, ReactorError>` plus state-query
//! methods on `Socket` — see DESIGN.md's Open Question resolutions.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("bad parameter: {0}")]
    BadParam(&'static str),

    #[error("host {host:?} could not be resolved: {source}")]
    BadHostname { host: String, source: io::Error },

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("operation not valid while connected")]
    AlreadyConnected,

    #[error("operation not valid while bound")]
    AlreadyBound,

    #[error("socket is not listening")]
    NotListening,

    #[error("open failed: {0}")]
    OpenFailed(#[source] io::Error),

    #[error("connect failed: {0}")]
    ConnectFailed(#[source] io::Error),

    #[error("bind failed: {0}")]
    BindFailed(#[source] io::Error),

    #[error("write failed: {0}")]
    WriteFailed(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ReactorError>;
