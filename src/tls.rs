use std::fmt;
use std::fs;
use std::io::{self, BufReader, Read, Write};
use std::net::{IpAddr, TcpStream};
use std::path::Path;
use std::sync::Arc;

use clap::ValueEnum;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ClientConnection, Connection, DigitallySignedStruct, ServerConfig,
    ServerConnection, SignatureScheme, SupportedCipherSuite, SupportedProtocolVersion,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{HandshakeError, OffloadError};
use crate::ktls::OffloadCryptoParams;

/// The single cipher suite a run is allowed to negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum CipherPolicy {
    /// TLS 1.3 TLS_AES_128_GCM_SHA256
    #[serde(rename = "tls13-aes128-gcm")]
    #[value(name = "tls13-aes128-gcm")]
    Tls13Aes128Gcm,
    /// TLS 1.2 ECDHE-ECDSA-AES128-GCM-SHA256
    #[serde(rename = "tls12-ecdsa-aes128-gcm")]
    #[value(name = "tls12-ecdsa-aes128-gcm")]
    Tls12EcdsaAes128Gcm,
}

impl Default for CipherPolicy {
    fn default() -> Self {
        Self::Tls13Aes128Gcm
    }
}

impl CipherPolicy {
    fn suite(self) -> SupportedCipherSuite {
        match self {
            CipherPolicy::Tls13Aes128Gcm => ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
            CipherPolicy::Tls12EcdsaAes128Gcm => {
                ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
            }
        }
    }

    fn version(self) -> &'static SupportedProtocolVersion {
        match self {
            CipherPolicy::Tls13Aes128Gcm => &rustls::version::TLS13,
            CipherPolicy::Tls12EcdsaAes128Gcm => &rustls::version::TLS12,
        }
    }

    /// Provider that knows exactly one suite, so negotiation cannot fall back
    fn provider(self) -> Arc<CryptoProvider> {
        Arc::new(CryptoProvider {
            cipher_suites: vec![self.suite()],
            ..ring::default_provider()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => f.write_str("server"),
            Role::Client => f.write_str("client"),
        }
    }
}

/// Read the cert chain and key, generating a self-signed pair if either is missing
pub fn load_or_generate_credentials(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), HandshakeError> {
    let cred = |what: &str, e: &dyn fmt::Display| HandshakeError::Credentials(format!("{}: {}", what, e));

    if !cert_path.exists() || !key_path.exists() {
        for dir in [cert_path.parent(), key_path.parent()].into_iter().flatten() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(|e| cred("create credential dir", &e))?;
            }
        }
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| cred("generate self-signed cert", &e))?;
        let pem = cert.serialize_pem().map_err(|e| cred("serialize cert", &e))?;
        fs::write(cert_path, pem).map_err(|e| cred("write cert pem", &e))?;
        fs::write(key_path, cert.serialize_private_key_pem())
            .map_err(|e| cred("write key pem", &e))?;
        info!("generated self-signed certificate at {}", cert_path.display());
    }

    let certs = {
        let mut rd = BufReader::new(fs::File::open(cert_path).map_err(|e| cred("open cert", &e))?);
        rustls_pemfile::certs(&mut rd)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| cred("read cert", &e))?
    };
    if certs.is_empty() {
        return Err(HandshakeError::Credentials(format!(
            "no certificates in {}",
            cert_path.display()
        )));
    }
    let key = {
        let mut rd = BufReader::new(fs::File::open(key_path).map_err(|e| cred("open key", &e))?);
        rustls_pemfile::private_key(&mut rd)
            .map_err(|e| cred("read key", &e))?
            .ok_or_else(|| {
                HandshakeError::Credentials(format!("no private key in {}", key_path.display()))
            })?
    };
    Ok((certs, key))
}

fn fp_sha256_hex(cert: &CertificateDer<'_>) -> String {
    let mut h = Sha256::new();
    h.update(cert.as_ref());
    let digest = h.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect::<String>()
}

/// Accepts any server certificate chain but still checks handshake signatures
#[derive(Debug)]
struct NoChainVerification {
    algs: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for NoChainVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algs)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algs.supported_schemes()
    }
}

/// Process-wide TLS state, created once before the first round and shut down after the last
pub struct TlsContext {
    policy: CipherPolicy,
    server: Option<Arc<ServerConfig>>,
    client: Option<Arc<ClientConfig>>,
}

impl TlsContext {
    /// Server context; `secret_extraction` must be set for kernel offload to work
    pub fn init_server(
        cert_path: &Path,
        key_path: &Path,
        policy: CipherPolicy,
        secret_extraction: bool,
    ) -> Result<Self, HandshakeError> {
        let (certs, key) = load_or_generate_credentials(cert_path, key_path)?;
        info!("server certificate sha256={}", fp_sha256_hex(&certs[0]));

        let mut cfg = ServerConfig::builder_with_provider(policy.provider())
            .with_protocol_versions(&[policy.version()])?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        cfg.enable_secret_extraction = secret_extraction;
        debug!(?policy, secret_extraction, "server TLS context ready");

        Ok(TlsContext {
            policy,
            server: Some(Arc::new(cfg)),
            client: None,
        })
    }

    pub fn init_client(policy: CipherPolicy) -> Result<Self, HandshakeError> {
        let provider = policy.provider();
        let verifier = NoChainVerification {
            algs: provider.signature_verification_algorithms,
        };
        let cfg = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[policy.version()])?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        debug!(?policy, "client TLS context ready");

        Ok(TlsContext {
            policy,
            server: None,
            client: Some(Arc::new(cfg)),
        })
    }

    /// Releases the configs; sessions still alive keep their own references
    pub fn shutdown(self) {
        debug!(policy = ?self.policy, "TLS context shut down");
    }
}

pub fn server_name_for(host: &str) -> Result<ServerName<'static>, HandshakeError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string())
        .map_err(|e| HandshakeError::Credentials(format!("server name {:?}: {}", host, e)))
}

/// A TCP connection that has completed a TLS handshake
pub struct TlsSession {
    role: Role,
    conn: Connection,
    sock: TcpStream,
}

/// Run the handshake to completion on a blocking socket
pub fn handshake(
    sock: TcpStream,
    role: Role,
    ctx: &TlsContext,
    server_name: Option<ServerName<'static>>,
) -> Result<TlsSession, HandshakeError> {
    let conn = match role {
        Role::Server => {
            let cfg = ctx.server.clone().ok_or_else(|| {
                HandshakeError::Credentials("context was not initialised for the server role".into())
            })?;
            Connection::Server(ServerConnection::new(cfg)?)
        }
        Role::Client => {
            let cfg = ctx.client.clone().ok_or_else(|| {
                HandshakeError::Credentials("context was not initialised for the client role".into())
            })?;
            let name = match server_name {
                Some(n) => n,
                None => server_name_for("localhost")?,
            };
            Connection::Client(ClientConnection::new(cfg, name)?)
        }
    };

    let mut session = TlsSession { role, conn, sock };
    while session.is_handshaking() {
        session.complete_io()?;
    }
    // TLS 1.3 tickets go out now so the write sequence number is settled
    session.flush_tls()?;
    debug!(
        role = %session.role,
        suite = ?session.negotiated_suite(),
        version = ?session.protocol_version(),
        "handshake complete"
    );
    Ok(session)
}

impl TlsSession {
    pub fn negotiated_suite(&self) -> Option<rustls::CipherSuite> {
        match &self.conn {
            Connection::Client(c) => c.negotiated_cipher_suite().map(|s| s.suite()),
            Connection::Server(c) => c.negotiated_cipher_suite().map(|s| s.suite()),
        }
    }

    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        match &self.conn {
            Connection::Client(c) => c.protocol_version(),
            Connection::Server(c) => c.protocol_version(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match &self.conn {
            Connection::Client(c) => c.is_handshaking(),
            Connection::Server(c) => c.is_handshaking(),
        }
    }

    fn complete_io(&mut self) -> io::Result<(usize, usize)> {
        match &mut self.conn {
            Connection::Client(c) => c.complete_io(&mut self.sock),
            Connection::Server(c) => c.complete_io(&mut self.sock),
        }
    }

    fn flush_tls(&mut self) -> io::Result<()> {
        loop {
            let n = match &mut self.conn {
                Connection::Client(c) if c.wants_write() => c.write_tls(&mut self.sock)?,
                Connection::Server(c) if c.wants_write() => c.write_tls(&mut self.sock)?,
                _ => return Ok(()),
            };
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
        }
    }

    /// Decrypt application data; `Ok(0)` once the peer has sent close_notify
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.conn {
            Connection::Client(c) => rustls::Stream::new(c, &mut self.sock).read(buf),
            Connection::Server(c) => rustls::Stream::new(c, &mut self.sock).read(buf),
        }
    }

    /// Encrypt and send; the returned count is plaintext bytes accepted
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.conn {
            Connection::Client(c) => rustls::Stream::new(c, &mut self.sock).write(buf),
            Connection::Server(c) => rustls::Stream::new(c, &mut self.sock).write(buf),
        }
    }

    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match &mut self.conn {
            Connection::Client(c) => rustls::Stream::new(c, &mut self.sock).write_all(buf),
            Connection::Server(c) => rustls::Stream::new(c, &mut self.sock).write_all(buf),
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.flush_tls()
    }

    /// Send close_notify and hand back the socket
    pub fn close(mut self) -> io::Result<TcpStream> {
        match &mut self.conn {
            Connection::Client(c) => c.send_close_notify(),
            Connection::Server(c) => c.send_close_notify(),
        }
        self.flush_tls()?;
        Ok(self.sock)
    }

    /// Give up user-space protection and take the write-direction crypto state.
    ///
    /// The session is consumed, so nothing can encrypt through rustls afterwards.
    pub fn into_offload_params(self) -> Result<(TcpStream, OffloadCryptoParams), OffloadError> {
        let TlsSession { conn, sock, .. } = self;
        let server = match conn {
            Connection::Server(s) => s,
            Connection::Client(_) => return Err(OffloadError::ClientRole),
        };
        let version = server.protocol_version();
        let secrets = server
            .dangerous_extract_secrets()
            .map_err(OffloadError::SecretExtraction)?;
        let params = OffloadCryptoParams::from_write_secrets(version, secrets.tx)?;
        Ok((sock, params))
    }
}
