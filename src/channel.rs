//! The write path a strategy sends through after a round's setup

use std::io;
use std::net::{Shutdown, TcpStream};

use tracing::{debug, warn};

use crate::error::OffloadError;
use crate::ktls::{self, OffloadInstaller};
use crate::tls::TlsSession;

/// Protection mode of a connected server socket.
///
/// `KernelTls` holds only the socket: the rustls session was consumed when its
/// write state moved into the kernel, so user-space encryption is unreachable.
pub enum Channel {
    UserTls(TlsSession),
    KernelTls(KtlsSocket),
    Plain(TcpStream),
}

/// A socket whose transmit direction is encrypted by the kernel
pub struct KtlsSocket {
    sock: TcpStream,
}

impl KtlsSocket {
    pub(crate) fn installed(sock: TcpStream) -> Self {
        KtlsSocket { sock }
    }
}

/// Move a handshaken server session's write direction into the kernel
pub fn engage_offload<I: OffloadInstaller + ?Sized>(
    session: TlsSession,
    installer: &I,
) -> Result<Channel, OffloadError> {
    if !installer.available() {
        return Err(OffloadError::Unavailable);
    }
    let (sock, params) = session.into_offload_params()?;
    installer.install(&sock, params)?;
    debug!("kernel TLS transmit offload engaged");
    Ok(Channel::KernelTls(KtlsSocket::installed(sock)))
}

impl Channel {
    pub fn name(&self) -> &'static str {
        match self {
            Channel::UserTls(_) => "user-space TLS",
            Channel::KernelTls(_) => "kernel TLS",
            Channel::Plain(_) => "plaintext",
        }
    }

    /// `None` once offload is engaged
    pub fn tls_session_mut(&mut self) -> Option<&mut TlsSession> {
        match self {
            Channel::UserTls(s) => Some(s),
            _ => None,
        }
    }

    /// The socket raw writes may go to; `None` while user space owns the records
    pub fn raw_socket_mut(&mut self) -> Option<&mut TcpStream> {
        match self {
            Channel::UserTls(_) => None,
            Channel::KernelTls(k) => Some(&mut k.sock),
            Channel::Plain(s) => Some(s),
        }
    }

    /// Teardown: close_notify where TLS is active, then shut down the write side
    pub fn finish(self) -> io::Result<()> {
        let sock = match self {
            Channel::UserTls(session) => session.close()?,
            Channel::KernelTls(k) => {
                if let Err(e) = ktls::send_close_notify(&k.sock) {
                    warn!("kernel close_notify not sent: {}", e);
                }
                k.sock
            }
            Channel::Plain(s) => s,
        };
        match sock.shutdown(Shutdown::Write) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e),
        }
    }
}
