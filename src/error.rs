//! Error taxonomy for the proxy core.
//!
//! Each subsystem gets its own error enum; [`ProxyError`] composes them so call
//! sites that cross subsystem boundaries (the session state machine, the
//! bootstrap binary) can propagate a single type with `?`.

use thiserror::Error;

/// Errors raised while decoding or encoding backend-protocol packets.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("unexpected end of packet while reading {0}")]
    Eof(&'static str),
    #[error("invalid packet: {0}")]
    Invalid(&'static str),
    #[error("unsupported packet feature: {0}")]
    Unsupported(&'static str),
}

/// Errors raised while decoding ASN.1 DER structures (SPNEGO tokens).
#[derive(Error, Debug)]
pub enum Asn1Error {
    #[error("unexpected end of ASN.1 data while reading {0}")]
    Eof(&'static str),
    #[error("invalid ASN.1 encoding: {0}")]
    Invalid(&'static str),
    #[error("unsupported ASN.1 construct: {0}")]
    Unsupported(&'static str),
}

/// Errors raised by the connection pool.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("connection pool exhausted for identity {0:?}")]
    Exhausted(Option<String>),
}

/// Errors raised by the backend registry.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend {0} is already registered")]
    Duplicate(String),
    #[error("backend {0} is down")]
    Down(String),
    #[error("no backend index {0}")]
    NotFound(usize),
}

/// Errors raised during client or upstream authentication.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("authentication denied for {0:?}")]
    Denied(Option<String>),
    #[error("upstream authentication error: {0}")]
    UpstreamError(String),
}

/// Top-level error type threaded through the session state machine and the
/// bootstrap binary.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Asn1(#[from] Asn1Error),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session cancelled")]
    Cancelled,
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
