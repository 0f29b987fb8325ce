//! Error taxonomy for a benchmark run

use std::io;
use std::path::PathBuf;

use crate::checksum::Digest;
use crate::strategy::Strategy;

/// TLS context setup or negotiation failure
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("certificate or key: {0}")]
    Credentials(String),

    #[error("TLS configuration: {0}")]
    Config(#[from] rustls::Error),

    #[error("handshake I/O: {0}")]
    Io(#[from] io::Error),
}

/// Kernel TLS offload setup failure
#[derive(Debug, thiserror::Error)]
pub enum OffloadError {
    #[error("kernel TLS offload is not available on this platform")]
    Unavailable,

    #[error("negotiated cipher suite cannot be offloaded")]
    UnsupportedCipher,

    #[error("negotiated protocol version cannot be offloaded")]
    UnsupportedProtocol,

    #[error("client sessions never offload their write direction")]
    ClientRole,

    #[error("extracting session secrets: {0}")]
    SecretExtraction(rustls::Error),

    #[error("setting TCP_ULP \"tls\": {0}")]
    Ulp(io::Error),

    #[error("installing TLS_TX crypto state: {0}")]
    TxInstall(io::Error),
}

/// I/O failure while moving file data
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("read source: {0}")]
    Read(io::Error),

    #[error("write to peer: {0}")]
    Write(io::Error),

    #[error("store {path}: {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("sendfile: {0}")]
    Sendfile(io::Error),

    #[error("splice: {0}")]
    Splice(io::Error),

    #[error("create pipe: {0}")]
    Pipe(io::Error),

    #[error("source ended after {moved} of {expected} bytes")]
    Truncated { expected: u64, moved: u64 },

    #[error("{strategy} cannot run over a {channel} channel")]
    Precondition {
        strategy: Strategy,
        channel: &'static str,
    },

    #[error("{0} is not supported on this platform")]
    Unsupported(Strategy),
}

/// Temporary file removal failed; logged, never propagated
#[derive(Debug, thiserror::Error)]
#[error("remove {path}: {source}")]
pub struct CleanupWarning {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("{context}: {source}")]
    Connection {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("kernel TLS offload failed: {0}")]
    Offload(#[from] OffloadError),

    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("digest mismatch: expected {expected}, received {actual}")]
    Verification { expected: Digest, actual: Digest },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BenchError {
    pub fn connection(context: impl Into<String>, source: io::Error) -> Self {
        BenchError::Connection {
            context: context.into(),
            source,
        }
    }

    /// Infrastructure failures stop the remaining rounds; data failures only fail the round
    pub fn aborts_run(&self) -> bool {
        match self {
            BenchError::Connection { .. }
            | BenchError::Handshake(_)
            | BenchError::Offload(_)
            | BenchError::Config(_) => true,
            BenchError::Transfer(_) | BenchError::Verification { .. } => false,
        }
    }

    pub fn is_verification(&self) -> bool {
        matches!(self, BenchError::Verification { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_errors_abort_the_run() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(BenchError::connection("connect 127.0.0.1:1", refused).aborts_run());
        assert!(BenchError::from(OffloadError::Unavailable).aborts_run());
        assert!(BenchError::from(HandshakeError::Io(io::ErrorKind::UnexpectedEof.into())).aborts_run());
    }

    #[test]
    fn data_errors_fail_only_the_round() {
        let truncated = TransferError::Truncated {
            expected: 10,
            moved: 4,
        };
        assert!(!BenchError::from(truncated).aborts_run());
    }
}
