//! Two-role benchmark loop: the server sends the source file N times, the
//! client receives each copy into a temporary file and verifies its digest.

use std::fs::{self, File};
use std::io::{self, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rustls::pki_types::ServerName;
use tracing::{debug, error, info, warn};

use crate::channel::{self, Channel};
use crate::checksum;
use crate::config::BenchConfig;
use crate::error::{BenchError, CleanupWarning, TransferError};
use crate::ktls::{KernelOffload, OffloadInstaller};
use crate::net;
use crate::strategy::{Strategy, TransferJob, TransferResult};
use crate::tls::{self, Role, TlsContext};

const RECV_BUF_SIZE: usize = 8192;

/// Record protection the server applies for the whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    Plain,
    UserTls,
    KernelTls,
}

/// Settle protection and strategy once, before the first round
pub fn resolve_mode<I: OffloadInstaller + ?Sized>(
    config: &BenchConfig,
    installer: &I,
) -> (Protection, Strategy) {
    if config.plaintext {
        return (Protection::Plain, config.strategy);
    }
    if !config.offload {
        return (Protection::UserTls, config.strategy);
    }
    if installer.available() {
        return (Protection::KernelTls, config.strategy);
    }
    warn!(
        requested = %config.strategy,
        "kernel TLS offload unavailable; falling back to user-space TLS with {}",
        Strategy::TlsRecordWrite
    );
    (Protection::UserTls, Strategy::TlsRecordWrite)
}

#[derive(Debug)]
pub struct RoundOutcome {
    pub round: u32,
    pub result: Result<TransferResult, BenchError>,
}

impl RoundOutcome {
    pub fn passed(&self) -> bool {
        self.result.is_ok()
    }
}

/// Everything one role observed during a run
#[derive(Debug)]
pub struct RunReport {
    pub role: Role,
    pub rounds: Vec<RoundOutcome>,
    /// Set when an infrastructure failure stopped the run early
    pub aborted: Option<BenchError>,
}

impl RunReport {
    fn new(role: Role) -> Self {
        RunReport {
            role,
            rounds: Vec::new(),
            aborted: None,
        }
    }

    pub fn passed(&self) -> usize {
        self.rounds.iter().filter(|r| r.passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.rounds.len() - self.passed()
    }

    pub fn is_success(&self) -> bool {
        self.aborted.is_none() && self.failed() == 0
    }

    pub fn log_summary(&self) {
        let moved: u64 = self
            .rounds
            .iter()
            .filter_map(|r| r.result.as_ref().ok())
            .map(|t| t.bytes_moved)
            .sum();
        match &self.aborted {
            Some(e) => error!(
                role = %self.role,
                passed = self.passed(),
                failed = self.failed(),
                "run aborted: {}",
                e
            ),
            None => info!(
                role = %self.role,
                passed = self.passed(),
                failed = self.failed(),
                bytes = moved,
                "run done"
            ),
        }
    }

    // Infrastructure errors end the run; anything else only fails this round
    fn record(&mut self, round: u32, result: Result<TransferResult, BenchError>) -> bool {
        match result {
            Err(e) if e.aborts_run() => {
                error!(role = %self.role, round, "{}", e);
                self.aborted = Some(e);
                false
            }
            result => {
                if let Err(e) = &result {
                    error!(role = %self.role, round, "round failed: {}", e);
                }
                self.rounds.push(RoundOutcome { round, result });
                true
            }
        }
    }
}

/// Sending side: accept, protect, transfer, tear down, N times
pub struct ServerRunner<'a, I: OffloadInstaller = KernelOffload> {
    config: &'a BenchConfig,
    installer: I,
    peer_stopped: Option<Arc<AtomicBool>>,
}

impl<'a> ServerRunner<'a, KernelOffload> {
    pub fn new(config: &'a BenchConfig) -> Self {
        ServerRunner::with_installer(config, KernelOffload)
    }
}

impl<'a, I: OffloadInstaller> ServerRunner<'a, I> {
    pub fn with_installer(config: &'a BenchConfig, installer: I) -> Self {
        ServerRunner {
            config,
            installer,
            peer_stopped: None,
        }
    }

    /// Abort at the next accept once `flag` is set; the setter must also
    /// connect once so a blocked accept returns
    pub fn stop_on(mut self, flag: Arc<AtomicBool>) -> Self {
        self.peer_stopped = Some(flag);
        self
    }

    fn peer_stopped(&self) -> bool {
        self.peer_stopped
            .as_ref()
            .is_some_and(|f| f.load(Ordering::SeqCst))
    }

    /// Serve every round on `listener`, which is closed when this returns
    pub fn run(&self, listener: TcpListener) -> RunReport {
        let mut report = RunReport::new(Role::Server);
        let (protection, strategy) = resolve_mode(self.config, &self.installer);
        info!(
            ?protection,
            %strategy,
            rounds = self.config.rounds,
            chunk = self.config.chunk_size,
            "server starting"
        );

        let ctx = match protection {
            Protection::Plain => None,
            _ => match TlsContext::init_server(
                &self.config.cert,
                &self.config.key,
                self.config.cipher,
                protection == Protection::KernelTls,
            ) {
                Ok(ctx) => Some(ctx),
                Err(e) => {
                    report.aborted = Some(e.into());
                    report.log_summary();
                    return report;
                }
            },
        };

        for round in 1..=self.config.rounds {
            let result = self.round(round, &listener, protection, strategy, ctx.as_ref());
            if !report.record(round, result) {
                break;
            }
        }

        if let Some(ctx) = ctx {
            ctx.shutdown();
        }
        drop(listener);
        report.log_summary();
        report
    }

    fn round(
        &self,
        round: u32,
        listener: &TcpListener,
        protection: Protection,
        strategy: Strategy,
        ctx: Option<&TlsContext>,
    ) -> Result<TransferResult, BenchError> {
        let (sock, peer) = net::accept(listener)?;
        if self.peer_stopped() {
            return Err(BenchError::connection(
                "client role stopped",
                io::ErrorKind::ConnectionAborted.into(),
            ));
        }
        debug!(round, %peer, "accepted");

        let mut channel = match (protection, ctx) {
            (Protection::Plain, _) | (_, None) => Channel::Plain(sock),
            (Protection::UserTls, Some(ctx)) => {
                Channel::UserTls(tls::handshake(sock, Role::Server, ctx, None)?)
            }
            (Protection::KernelTls, Some(ctx)) => {
                let session = tls::handshake(sock, Role::Server, ctx, None)?;
                channel::engage_offload(session, &self.installer)?
            }
        };
        if let Some(session) = channel.tls_session_mut() {
            debug!(round, suite = ?session.negotiated_suite(), "handshake complete");
        }

        let sent = TransferJob::open(&self.config.source, self.config.chunk_size).and_then(|mut job| {
            debug!(
                round,
                path = %job.path().display(),
                total = job.total_length(),
                chunk = job.chunk_size(),
                "sending"
            );
            strategy.send(&mut channel, &mut job)
        });
        let channel_name = channel.name();
        if let Err(e) = channel.finish() {
            warn!(round, "teardown: {}", e);
        }
        let sent = sent?;

        info!(
            round,
            channel = channel_name,
            %strategy,
            bytes = sent.bytes_moved,
            elapsed_ms = sent.elapsed.as_secs_f64() * 1000.0,
            mib_s = sent.throughput_mib_s(),
            "sent"
        );
        Ok(sent)
    }
}

/// Removes the temporary file on every exit path of a client round
struct TempFileGuard {
    path: PathBuf,
}

impl TempFileGuard {
    fn create(path: &Path) -> Result<(Self, File), TransferError> {
        let file = File::create(path).map_err(|source| TransferError::Store {
            path: path.to_path_buf(),
            source,
        })?;
        Ok((
            TempFileGuard {
                path: path.to_path_buf(),
            },
            file,
        ))
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => warn!(
                "{}",
                CleanupWarning {
                    path: self.path.clone(),
                    source,
                }
            ),
        }
    }
}

/// Copy everything the peer sends until it closes
fn receive<F>(mut read: F, out: &mut File, path: &Path) -> Result<u64, TransferError>
where
    F: FnMut(&mut [u8]) -> io::Result<usize>,
{
    let store = |source| TransferError::Store {
        path: path.to_path_buf(),
        source,
    };
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    let mut total = 0u64;
    loop {
        match read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                out.write_all(&buf[..n]).map_err(store)?;
                total += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // peer closed without close_notify; the digest decides
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("peer closed without close_notify");
                break;
            }
            Err(e) => return Err(TransferError::Read(e)),
        }
    }
    out.flush().map_err(store)?;
    Ok(total)
}

/// Receiving side: connect, receive, verify, clean up, N times
pub struct ClientRunner<'a> {
    config: &'a BenchConfig,
}

impl<'a> ClientRunner<'a> {
    pub fn new(config: &'a BenchConfig) -> Self {
        ClientRunner { config }
    }

    pub fn run(&self) -> RunReport {
        let mut report = RunReport::new(Role::Client);
        let tls = if self.config.plaintext {
            None
        } else {
            let setup = TlsContext::init_client(self.config.cipher)
                .and_then(|ctx| Ok((ctx, tls::server_name_for(&self.config.host)?)));
            match setup {
                Ok(pair) => Some(pair),
                Err(e) => {
                    report.aborted = Some(e.into());
                    report.log_summary();
                    return report;
                }
            }
        };

        for round in 1..=self.config.rounds {
            let ctx = tls.as_ref().map(|(ctx, name)| (ctx, name));
            let result = self.round(round, ctx);
            if !report.record(round, result) {
                break;
            }
        }

        if let Some((ctx, _)) = tls {
            ctx.shutdown();
        }
        report.log_summary();
        report
    }

    fn round(
        &self,
        round: u32,
        tls: Option<(&TlsContext, &ServerName<'static>)>,
    ) -> Result<TransferResult, BenchError> {
        let sock = net::connect(&self.config.host, self.config.port)?;
        let temp = &self.config.temp;
        let (_guard, mut out) = TempFileGuard::create(temp)?;

        let start = Instant::now();
        let received = match tls {
            Some((ctx, name)) => {
                let mut session = tls::handshake(sock, Role::Client, ctx, Some(name.clone()))?;
                receive(|buf| session.read(buf), &mut out, temp)?
            }
            None => {
                let mut sock = sock;
                receive(|buf| io::Read::read(&mut sock, buf), &mut out, temp)?
            }
        };
        let elapsed = start.elapsed();
        drop(out);

        let algorithm = self.config.digest;
        let reference = self.config.reference_path();
        let actual = checksum::digest_file(temp, algorithm).map_err(TransferError::Read)?;
        let expected = checksum::digest_file(reference, algorithm).map_err(|source| {
            TransferError::Open {
                path: reference.to_path_buf(),
                source,
            }
        })?;

        if !checksum::equal(&expected, &actual) {
            warn!(round, bytes = received, %expected, %actual, "FAIL");
            return Err(BenchError::Verification { expected, actual });
        }
        info!(round, bytes = received, digest = %actual, "PASS");
        Ok(TransferResult {
            bytes_moved: received,
            elapsed,
        })
    }
}

/// Both roles of a completed local run
#[derive(Debug)]
pub struct LocalRun {
    pub server: RunReport,
    pub client: RunReport,
}

impl LocalRun {
    pub fn is_success(&self) -> bool {
        self.server.is_success() && self.client.is_success()
    }
}

/// Run only the sending role
pub fn serve(config: &BenchConfig) -> Result<RunReport, BenchError> {
    config.validate()?;
    config.validate_source()?;
    let listener = net::listen(config.port)?;
    Ok(ServerRunner::new(config).run(listener))
}

/// Run only the receiving role against a remote server
pub fn fetch(config: &BenchConfig) -> Result<RunReport, BenchError> {
    config.validate()?;
    let reference = config.reference_path();
    if !reference.is_file() {
        return Err(BenchError::Config(format!(
            "reference {} is not a readable file",
            reference.display()
        )));
    }
    Ok(ClientRunner::new(config).run())
}

/// Both roles in one process, the client on its own thread
pub fn run_local(config: &BenchConfig) -> Result<LocalRun, BenchError> {
    run_local_with(config, KernelOffload)
}

pub fn run_local_with<I: OffloadInstaller>(
    config: &BenchConfig,
    installer: I,
) -> Result<LocalRun, BenchError> {
    run_local_pair(config, config, installer)
}

/// Local run where each role has its own configuration; the client is
/// pointed at the server's listener whatever its configured port
pub fn run_local_pair<I: OffloadInstaller>(
    server_config: &BenchConfig,
    client_config: &BenchConfig,
    installer: I,
) -> Result<LocalRun, BenchError> {
    server_config.validate()?;
    server_config.validate_source()?;
    client_config.validate()?;
    let listener = net::listen(server_config.port)?;
    let port = listener
        .local_addr()
        .map_err(|e| BenchError::connection("listener address", e))?
        .port();

    let client_config = BenchConfig {
        port,
        ..client_config.clone()
    };
    let stopped = Arc::new(AtomicBool::new(false));
    let client_stopped = Arc::clone(&stopped);
    let client = std::thread::Builder::new()
        .name("client".into())
        .spawn(move || {
            let report = ClientRunner::new(&client_config).run();
            if report.aborted.is_some() {
                client_stopped.store(true, Ordering::SeqCst);
                // wake a server blocked in accept; refused once it is gone
                let _ = TcpStream::connect((Ipv4Addr::LOCALHOST, port));
            }
            report
        })
        .map_err(|e| BenchError::connection("spawn client thread", e))?;

    let server = ServerRunner::with_installer(server_config, installer)
        .stop_on(stopped)
        .run(listener);
    let client = match client.join() {
        Ok(report) => report,
        Err(panic) => std::panic::resume_unwind(panic),
    };
    Ok(LocalRun { server, client })
}
