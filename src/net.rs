//! TCP endpoints for both roles

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};

use tracing::debug;

use crate::error::BenchError;

const SOCKET_BUF_SIZE: i32 = 8 * 1024 * 1024;

/// Bind and listen on all IPv4 interfaces (std sets SO_REUSEADDR on Unix)
pub fn listen(port: u16) -> Result<TcpListener, BenchError> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    let listener =
        TcpListener::bind(addr).map_err(|e| BenchError::connection(format!("bind {}", addr), e))?;
    debug!("listening on {}", addr);
    Ok(listener)
}

pub fn accept(listener: &TcpListener) -> Result<(TcpStream, SocketAddr), BenchError> {
    let (stream, peer) = listener
        .accept()
        .map_err(|e| BenchError::connection("accept", e))?;
    tune_socket(&stream);
    Ok((stream, peer))
}

/// Connect to an IPv4 peer
pub fn connect(host: &str, port: u16) -> Result<TcpStream, BenchError> {
    let ip: Ipv4Addr = host.parse().map_err(|_| {
        BenchError::Config(format!("host {:?} is not an IPv4 address", host))
    })?;
    let addr = SocketAddrV4::new(ip, port);
    debug!("connecting to {}", addr);
    let stream =
        TcpStream::connect(addr).map_err(|e| BenchError::connection(format!("connect {}", addr), e))?;
    tune_socket(&stream);
    Ok(stream)
}

// Socket tuning: enlarge buffers and disable Nagle for throughput
fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;
        let fd = stream.as_raw_fd();
        let p = &SOCKET_BUF_SIZE as *const _ as *const libc::c_void;
        let len = std::mem::size_of_val(&SOCKET_BUF_SIZE) as libc::socklen_t;
        unsafe {
            let _ = libc::setsockopt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, p, len);
            let _ = libc::setsockopt(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, p, len);
        }
    }
}
