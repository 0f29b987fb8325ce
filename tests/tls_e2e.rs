use anyhow::Result;
use ktls_bench::checksum::DigestAlgorithm;
use ktls_bench::config::BenchConfig;
use ktls_bench::error::{BenchError, OffloadError};
use ktls_bench::harness::{self, LocalRun};
use ktls_bench::ktls::{self, KernelOffload, OffloadCryptoParams, OffloadInstaller};
use ktls_bench::strategy::Strategy;
use ktls_bench::tls::CipherPolicy;
use std::io::Write;
use std::net::TcpStream;
use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;

fn write_file(path: &Path, size: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    if size == 0 {
        return Ok(());
    }
    let mut buf = vec![0u8; 1024 * 64];
    let mut remaining = size;
    let mut val: u8 = 0;
    while remaining > 0 {
        for b in buf.iter_mut() {
            *b = val;
            val = val.wrapping_add(1);
        }
        let n = remaining.min(buf.len());
        f.write_all(&buf[..n])?;
        remaining -= n;
    }
    Ok(())
}

/// Port 0 lets the listener pick; the client is pointed at whatever it got
fn bench_config(dir: &Path, source: &Path) -> BenchConfig {
    BenchConfig {
        port: 0,
        source: source.to_path_buf(),
        temp: dir.join(".TMP_ktls"),
        cert: dir.join("cert.pem"),
        key: dir.join("key.pem"),
        ..Default::default()
    }
}

/// A blocked role would hang the test binary; fail it instead
fn returns_within<T, F>(secs: u64, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(Duration::from_secs(secs))
        .expect("local run still blocked")
}

fn raw_strategies() -> Vec<Strategy> {
    let mut v = vec![Strategy::RawSocketSend];
    if cfg!(target_os = "linux") {
        v.push(Strategy::SendfileZeroCopy);
        v.push(Strategy::SpliceZeroCopy);
    }
    v
}

fn assert_all_passed(run: &LocalRun, rounds: u32, size: u64) {
    assert!(run.server.aborted.is_none(), "server aborted: {:?}", run.server.aborted);
    assert!(run.client.aborted.is_none(), "client aborted: {:?}", run.client.aborted);
    assert_eq!(run.server.rounds.len(), rounds as usize);
    assert_eq!(run.client.passed(), rounds as usize);
    for outcome in run.server.rounds.iter().chain(run.client.rounds.iter()) {
        let moved = outcome.result.as_ref().map(|r| r.bytes_moved).ok();
        assert_eq!(moved, Some(size), "round {}", outcome.round);
    }
    assert!(run.is_success());
}

#[test]
fn user_space_tls_round_trips_boundary_sizes() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    for size in [0usize, 1, 4095, 4096, 4097, 1_100_000] {
        let source = tmp.path().join(format!("src-{}.bin", size));
        write_file(&source, size)?;
        let cfg = BenchConfig {
            rounds: 2,
            ..bench_config(tmp.path(), &source)
        };
        let run = harness::run_local(&cfg)?;
        assert_all_passed(&run, 2, size as u64);
        assert!(!cfg.temp.exists());
    }
    Ok(())
}

#[test]
fn tls12_policy_with_blake3_digest() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let source = tmp.path().join("src.bin");
    write_file(&source, 70_000)?;
    let cfg = BenchConfig {
        rounds: 2,
        cipher: CipherPolicy::Tls12EcdsaAes128Gcm,
        digest: DigestAlgorithm::Blake3,
        ..bench_config(tmp.path(), &source)
    };
    let run = harness::run_local(&cfg)?;
    assert_all_passed(&run, 2, 70_000);
    Ok(())
}

#[test]
fn plaintext_raw_strategies_are_equivalent() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let source = tmp.path().join("src.bin");
    write_file(&source, 50_001)?;
    for strategy in raw_strategies() {
        let cfg = BenchConfig {
            rounds: 2,
            plaintext: true,
            strategy,
            chunk_size: 1000,
            ..bench_config(tmp.path(), &source)
        };
        let run = harness::run_local(&cfg)?;
        assert_all_passed(&run, 2, 50_001);
        assert!(!cfg.temp.exists());
    }
    Ok(())
}

#[test]
#[ignore = "needs the kernel tls ULP"]
fn kernel_tls_splice_three_rounds() -> Result<()> {
    if !ktls::offload_available() {
        eprintln!("kernel TLS unavailable; skipping");
        return Ok(());
    }
    let tmp = tempfile::tempdir()?;
    let source = tmp.path().join("src.bin");
    write_file(&source, 10_000)?;
    let cfg = BenchConfig {
        rounds: 3,
        offload: true,
        strategy: Strategy::SpliceZeroCopy,
        chunk_size: 4096,
        ..bench_config(tmp.path(), &source)
    };
    let run = harness::run_local_with(&cfg, KernelOffload)?;
    assert_all_passed(&run, 3, 10_000);
    assert!(!cfg.temp.exists());
    Ok(())
}

#[test]
#[ignore = "needs the kernel tls ULP"]
fn kernel_tls_every_raw_strategy_and_policy() -> Result<()> {
    if !ktls::offload_available() {
        eprintln!("kernel TLS unavailable; skipping");
        return Ok(());
    }
    let tmp = tempfile::tempdir()?;
    let source = tmp.path().join("src.bin");
    write_file(&source, 300_007)?;
    for cipher in [CipherPolicy::Tls13Aes128Gcm, CipherPolicy::Tls12EcdsaAes128Gcm] {
        for strategy in raw_strategies() {
            let cfg = BenchConfig {
                rounds: 1,
                offload: true,
                strategy,
                cipher,
                ..bench_config(tmp.path(), &source)
            };
            let run = harness::run_local(&cfg)?;
            assert_all_passed(&run, 1, 300_007);
        }
    }
    Ok(())
}

struct FailingInstaller;

impl OffloadInstaller for FailingInstaller {
    fn available(&self) -> bool {
        true
    }

    fn install(&self, _: &TcpStream, _: OffloadCryptoParams) -> Result<(), OffloadError> {
        Err(OffloadError::TxInstall(std::io::Error::new(
            std::io::ErrorKind::Other,
            "simulated TLS_TX rejection",
        )))
    }
}

#[test]
fn offload_failure_aborts_remaining_rounds() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let source = tmp.path().join("src.bin");
    write_file(&source, 20_000)?;
    let cfg = BenchConfig {
        rounds: 3,
        offload: true,
        strategy: Strategy::RawSocketSend,
        ..bench_config(tmp.path(), &source)
    };
    let run = harness::run_local_with(&cfg, FailingInstaller)?;

    assert!(matches!(
        run.server.aborted,
        Some(BenchError::Offload(OffloadError::TxInstall(_)))
    ));
    assert!(run.server.rounds.is_empty());
    assert_eq!(run.client.passed(), 0);
    assert!(!run.is_success());
    assert!(!cfg.temp.exists());
    Ok(())
}

#[test]
fn verification_failures_do_not_stop_later_rounds() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let source = tmp.path().join("src.bin");
    let reference = tmp.path().join("other.bin");
    write_file(&source, 9_000)?;
    std::fs::write(&reference, b"not the same bytes")?;
    let cfg = BenchConfig {
        rounds: 3,
        reference: Some(reference),
        ..bench_config(tmp.path(), &source)
    };
    let run = harness::run_local(&cfg)?;

    assert!(run.client.aborted.is_none());
    assert_eq!(run.client.rounds.len(), 3);
    for outcome in &run.client.rounds {
        assert!(matches!(&outcome.result, Err(e) if e.is_verification()));
    }
    assert_eq!(run.server.passed(), 3);
    assert!(!run.is_success());
    assert!(!cfg.temp.exists());
    Ok(())
}

#[test]
fn invalid_configuration_is_rejected_before_listening() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let source = tmp.path().join("src.bin");
    write_file(&source, 10)?;

    let zero_rounds = BenchConfig {
        rounds: 0,
        ..bench_config(tmp.path(), &source)
    };
    assert!(matches!(harness::run_local(&zero_rounds), Err(BenchError::Config(_))));

    let raw_over_user_tls = BenchConfig {
        strategy: Strategy::SendfileZeroCopy,
        ..bench_config(tmp.path(), &source)
    };
    assert!(matches!(harness::run_local(&raw_over_user_tls), Err(BenchError::Config(_))));

    let hostname = BenchConfig {
        host: "localhost".into(),
        ..bench_config(tmp.path(), &source)
    };
    assert!(matches!(harness::run_local(&hostname), Err(BenchError::Config(_))));

    let missing = bench_config(tmp.path(), &tmp.path().join("absent.bin"));
    assert!(matches!(harness::run_local(&missing), Err(BenchError::Config(_))));
    assert!(!tmp.path().join("cert.pem").exists());
    Ok(())
}

#[test]
fn cipher_mismatch_aborts_both_roles() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let source = tmp.path().join("src.bin");
    write_file(&source, 5_000)?;
    let server_cfg = BenchConfig {
        rounds: 3,
        cipher: CipherPolicy::Tls13Aes128Gcm,
        ..bench_config(tmp.path(), &source)
    };
    let client_cfg = BenchConfig {
        cipher: CipherPolicy::Tls12EcdsaAes128Gcm,
        ..server_cfg.clone()
    };
    let temp = server_cfg.temp.clone();

    let run = returns_within(30, move || {
        harness::run_local_pair(&server_cfg, &client_cfg, KernelOffload)
    })?;

    assert!(matches!(run.server.aborted, Some(BenchError::Handshake(_))));
    assert!(run.server.rounds.is_empty());
    assert!(matches!(run.client.aborted, Some(BenchError::Handshake(_))));
    assert!(run.client.rounds.is_empty());
    assert!(!run.is_success());
    assert!(!temp.exists());
    Ok(())
}

#[test]
fn client_abort_stops_a_server_with_rounds_left() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let source = tmp.path().join("src.bin");
    write_file(&source, 20_000)?;
    // plaintext bytes where the client expects a ServerHello
    let server_cfg = BenchConfig {
        rounds: 3,
        plaintext: true,
        strategy: Strategy::RawSocketSend,
        ..bench_config(tmp.path(), &source)
    };
    let client_cfg = BenchConfig {
        plaintext: false,
        strategy: Strategy::TlsRecordWrite,
        ..server_cfg.clone()
    };
    let temp = server_cfg.temp.clone();

    let run = returns_within(30, move || {
        harness::run_local_pair(&server_cfg, &client_cfg, KernelOffload)
    })?;

    assert!(matches!(run.client.aborted, Some(BenchError::Handshake(_))));
    assert!(matches!(run.server.aborted, Some(BenchError::Connection { .. })));
    assert!(run.server.rounds.len() <= 1);
    assert!(!run.is_success());
    assert!(!temp.exists());
    Ok(())
}
