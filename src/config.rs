//! Run configuration: TOML file, then command-line overrides

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::checksum::DigestAlgorithm;
use crate::error::BenchError;
use crate::strategy::{Strategy, DEFAULT_CHUNK_SIZE};
use crate::tls::CipherPolicy;

pub const DEFAULT_PORT: u16 = 4433;
pub const DEFAULT_TEMP_FILE: &str = ".TMP_ktls";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchConfig {
    /// IPv4 address the client connects to
    pub host: String,
    pub port: u16,
    /// File the server sends each round
    pub source: PathBuf,
    /// File the client verifies against; the source when unset
    pub reference: Option<PathBuf>,
    /// Where the client stores each received copy
    pub temp: PathBuf,
    pub rounds: u32,
    /// Hand write-direction crypto to the kernel after the handshake
    pub offload: bool,
    /// Skip TLS entirely
    pub plaintext: bool,
    pub strategy: Strategy,
    pub chunk_size: usize,
    pub digest: DigestAlgorithm,
    pub cipher: CipherPolicy,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            source: PathBuf::new(),
            reference: None,
            temp: PathBuf::from(DEFAULT_TEMP_FILE),
            rounds: 3,
            offload: false,
            plaintext: false,
            strategy: Strategy::TlsRecordWrite,
            chunk_size: DEFAULT_CHUNK_SIZE,
            digest: DigestAlgorithm::Md5,
            cipher: CipherPolicy::Tls13Aes128Gcm,
            cert: PathBuf::from("cert.pem"),
            key: PathBuf::from("key.pem"),
        }
    }
}

impl BenchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: BenchConfig =
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn reference_path(&self) -> &Path {
        self.reference.as_deref().unwrap_or(&self.source)
    }

    /// Reject combinations that could never complete a round
    pub fn validate(&self) -> Result<(), BenchError> {
        let bad = |msg: String| Err(BenchError::Config(msg));
        if self.rounds == 0 {
            return bad("rounds must be at least 1".into());
        }
        if self.chunk_size == 0 {
            return bad("chunk size must be positive".into());
        }
        if self.host.parse::<Ipv4Addr>().is_err() {
            return bad(format!("host {:?} is not an IPv4 address", self.host));
        }
        if self.plaintext && self.offload {
            return bad("kernel offload needs TLS; drop --plaintext or --offload".into());
        }
        if self.strategy.requires_user_tls() {
            if self.plaintext {
                return bad(format!("{} needs a TLS session", self.strategy));
            }
            if self.offload {
                return bad(format!(
                    "{} encrypts in user space and cannot run after offload",
                    self.strategy
                ));
            }
        } else if !self.plaintext && !self.offload {
            return bad(format!(
                "{} writes raw socket bytes; use --offload or --plaintext",
                self.strategy
            ));
        }
        Ok(())
    }

    /// Server-side checks that need the filesystem
    pub fn validate_source(&self) -> Result<(), BenchError> {
        if !self.source.is_file() {
            return Err(BenchError::Config(format!(
                "source {} is not a readable file",
                self.source.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_a_valid_user_space_run() {
        let cfg = BenchConfig::default();
        assert_eq!(cfg.port, 4433);
        assert_eq!(cfg.chunk_size, 4096);
        assert_eq!(cfg.temp, PathBuf::from(".TMP_ktls"));
        cfg.validate().unwrap();
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: BenchConfig = toml::from_str(
            r#"
            source = "data.bin"
            rounds = 5
            offload = true
            strategy = "splice"
            digest = "blake3"
            cipher = "tls12-ecdsa-aes128-gcm"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.rounds, 5);
        assert_eq!(cfg.strategy, Strategy::SpliceZeroCopy);
        assert_eq!(cfg.digest, DigestAlgorithm::Blake3);
        assert_eq!(cfg.cipher, CipherPolicy::Tls12EcdsaAes128Gcm);
        assert_eq!(cfg.host, "127.0.0.1");
        cfg.validate().unwrap();
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<BenchConfig>("roundz = 2").is_err());
    }

    #[test]
    fn rejects_impossible_combinations() {
        let base = BenchConfig::default();
        let cases = [
            BenchConfig { rounds: 0, ..base.clone() },
            BenchConfig { chunk_size: 0, ..base.clone() },
            BenchConfig { host: "localhost".into(), ..base.clone() },
            BenchConfig { host: "::1".into(), ..base.clone() },
            BenchConfig { plaintext: true, offload: true, strategy: Strategy::RawSocketSend, ..base.clone() },
            BenchConfig { plaintext: true, ..base.clone() },
            BenchConfig { offload: true, ..base.clone() },
            BenchConfig { strategy: Strategy::SendfileZeroCopy, ..base.clone() },
        ];
        for cfg in cases {
            assert!(matches!(cfg.validate(), Err(BenchError::Config(_))), "{:?}", cfg);
        }
    }

    #[test]
    fn raw_strategies_accept_offload_or_plaintext() {
        for strategy in [Strategy::RawSocketSend, Strategy::SendfileZeroCopy, Strategy::SpliceZeroCopy] {
            let offload = BenchConfig { strategy, offload: true, ..Default::default() };
            let plain = BenchConfig { strategy, plaintext: true, ..Default::default() };
            offload.validate().unwrap();
            plain.validate().unwrap();
        }
    }

    #[test]
    fn reference_defaults_to_source() {
        let cfg = BenchConfig { source: "a.bin".into(), ..Default::default() };
        assert_eq!(cfg.reference_path(), Path::new("a.bin"));
        let cfg = BenchConfig { reference: Some("b.bin".into()), ..cfg };
        assert_eq!(cfg.reference_path(), Path::new("b.bin"));
    }
}
