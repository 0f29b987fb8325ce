//! Kernel TLS (kTLS) transmit offload
//!
//! After a rustls handshake the write-direction AEAD state is pulled out of the
//! session and handed to the kernel with two `setsockopt` calls:
//!
//! 1. `SOL_TCP / TCP_ULP = "tls"` attaches the TLS upper layer to the socket
//! 2. `SOL_TLS / TLS_TX = tls12_crypto_info_aes_gcm_128` seeds the transmit side
//!
//! From then on plain `write`, `sendfile` and `splice` on the socket produce
//! TLS records. Only AES-128-GCM (TLS 1.2 and 1.3) is supported. The receive
//! direction is never offloaded.

use std::fmt;
use std::net::TcpStream;

use rustls::{ConnectionTrafficSecrets, ProtocolVersion};

use crate::error::OffloadError;

// include/uapi/linux/tls.h
pub const SOL_TLS: i32 = 282;
pub const TCP_ULP: i32 = 31;
pub const TLS_TX: i32 = 1;
pub const TLS_SET_RECORD_TYPE: i32 = 1;

pub const TLS_1_2_VERSION: u16 = 0x0303;
pub const TLS_1_3_VERSION: u16 = 0x0304;
pub const TLS_CIPHER_AES_GCM_128: u16 = 51;

const AES_GCM_128_IV_SIZE: usize = 8;
const AES_GCM_128_KEY_SIZE: usize = 16;
const AES_GCM_128_SALT_SIZE: usize = 4;
const AES_GCM_128_REC_SEQ_SIZE: usize = 8;

const RECORD_TYPE_ALERT: u8 = 21;
const ALERT_LEVEL_WARNING: u8 = 1;
const ALERT_CLOSE_NOTIFY: u8 = 0;

/// struct tls_crypto_info
#[repr(C)]
#[derive(Clone, Copy)]
struct TlsCryptoInfoHeader {
    version: u16,
    cipher_type: u16,
}

/// struct tls12_crypto_info_aes_gcm_128
#[repr(C)]
struct Tls12CryptoInfoAesGcm128 {
    info: TlsCryptoInfoHeader,
    iv: [u8; AES_GCM_128_IV_SIZE],
    key: [u8; AES_GCM_128_KEY_SIZE],
    salt: [u8; AES_GCM_128_SALT_SIZE],
    rec_seq: [u8; AES_GCM_128_REC_SEQ_SIZE],
}

impl Drop for Tls12CryptoInfoAesGcm128 {
    fn drop(&mut self) {
        secure_zero(&mut self.iv);
        secure_zero(&mut self.key);
        secure_zero(&mut self.salt);
        secure_zero(&mut self.rec_seq);
    }
}

// volatile writes so the wipe is not optimised away
fn secure_zero(data: &mut [u8]) {
    for byte in data.iter_mut() {
        unsafe { std::ptr::write_volatile(byte, 0) };
    }
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Write-direction AEAD state of one session at one point in time.
///
/// Consumed by [`OffloadInstaller::install`]; wiped on drop and never printed.
pub struct OffloadCryptoParams {
    version: u16,
    key: [u8; AES_GCM_128_KEY_SIZE],
    salt: [u8; AES_GCM_128_SALT_SIZE],
    iv: [u8; AES_GCM_128_IV_SIZE],
    sequence_number: u64,
}

impl OffloadCryptoParams {
    /// Split the 12-byte rustls IV into the 4-byte implicit salt and 8-byte explicit part
    pub(crate) fn new(
        version: u16,
        key: [u8; AES_GCM_128_KEY_SIZE],
        full_iv: &[u8],
        sequence_number: u64,
    ) -> Result<Self, OffloadError> {
        if full_iv.len() != AES_GCM_128_SALT_SIZE + AES_GCM_128_IV_SIZE {
            return Err(OffloadError::UnsupportedCipher);
        }
        let mut salt = [0u8; AES_GCM_128_SALT_SIZE];
        let mut iv = [0u8; AES_GCM_128_IV_SIZE];
        salt.copy_from_slice(&full_iv[..AES_GCM_128_SALT_SIZE]);
        iv.copy_from_slice(&full_iv[AES_GCM_128_SALT_SIZE..]);
        Ok(OffloadCryptoParams {
            version,
            key,
            salt,
            iv,
            sequence_number,
        })
    }

    pub(crate) fn from_write_secrets(
        version: Option<ProtocolVersion>,
        tx: (u64, ConnectionTrafficSecrets),
    ) -> Result<Self, OffloadError> {
        let version = match version {
            Some(ProtocolVersion::TLSv1_2) => TLS_1_2_VERSION,
            Some(ProtocolVersion::TLSv1_3) => TLS_1_3_VERSION,
            _ => return Err(OffloadError::UnsupportedProtocol),
        };
        let (seq, secrets) = tx;
        match secrets {
            ConnectionTrafficSecrets::Aes128Gcm { key, iv } => {
                let key: [u8; AES_GCM_128_KEY_SIZE] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| OffloadError::UnsupportedCipher)?;
                Self::new(version, key, iv.as_ref(), seq)
            }
            _ => Err(OffloadError::UnsupportedCipher),
        }
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    fn crypto_info(&self) -> Tls12CryptoInfoAesGcm128 {
        Tls12CryptoInfoAesGcm128 {
            info: TlsCryptoInfoHeader {
                version: self.version,
                cipher_type: TLS_CIPHER_AES_GCM_128,
            },
            iv: self.iv,
            key: self.key,
            salt: self.salt,
            rec_seq: self.sequence_number.to_be_bytes(),
        }
    }
}

impl Drop for OffloadCryptoParams {
    fn drop(&mut self) {
        secure_zero(&mut self.key);
        secure_zero(&mut self.salt);
        secure_zero(&mut self.iv);
        self.sequence_number = 0;
    }
}

impl fmt::Debug for OffloadCryptoParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffloadCryptoParams")
            .field("version", &format_args!("{:#06x}", self.version))
            .field("key", &"<redacted>")
            .field("salt", &"<redacted>")
            .field("iv", &"<redacted>")
            .field("sequence_number", &"<redacted>")
            .finish()
    }
}

/// Runtime check for the kernel `tls` upper-layer protocol
#[cfg(target_os = "linux")]
pub fn offload_available() -> bool {
    if let Ok(ulps) = std::fs::read_to_string("/proc/sys/net/ipv4/tcp_available_ulp") {
        if ulps.split_whitespace().any(|u| u == "tls") {
            return true;
        }
    }
    std::path::Path::new("/sys/module/tls").exists()
}

#[cfg(not(target_os = "linux"))]
pub fn offload_available() -> bool {
    false
}

/// Installs write-direction crypto state into a connected socket
pub trait OffloadInstaller {
    fn available(&self) -> bool;

    /// Both steps succeed or the socket must be discarded
    fn install(&self, socket: &TcpStream, params: OffloadCryptoParams) -> Result<(), OffloadError>;
}

/// The real Linux kTLS installer
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelOffload;

impl OffloadInstaller for KernelOffload {
    fn available(&self) -> bool {
        offload_available()
    }

    #[cfg(target_os = "linux")]
    fn install(&self, socket: &TcpStream, params: OffloadCryptoParams) -> Result<(), OffloadError> {
        use std::os::fd::AsRawFd;

        let fd = socket.as_raw_fd();
        setup_ulp(fd).map_err(OffloadError::Ulp)?;
        let info = params.crypto_info();
        drop(params);
        setup_tx(fd, &info).map_err(OffloadError::TxInstall)
    }

    #[cfg(not(target_os = "linux"))]
    fn install(&self, _socket: &TcpStream, _params: OffloadCryptoParams) -> Result<(), OffloadError> {
        Err(OffloadError::Unavailable)
    }
}

#[cfg(target_os = "linux")]
fn setup_ulp(fd: std::os::fd::RawFd) -> std::io::Result<()> {
    const ULP_NAME: &[u8] = b"tls\0";
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_TCP,
            TCP_ULP,
            ULP_NAME.as_ptr() as *const libc::c_void,
            ULP_NAME.len() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn setup_tx(fd: std::os::fd::RawFd, info: &Tls12CryptoInfoAesGcm128) -> std::io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            SOL_TLS,
            TLS_TX,
            info as *const _ as *const libc::c_void,
            std::mem::size_of::<Tls12CryptoInfoAesGcm128>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Emit a close_notify alert record through the kernel record layer
#[cfg(target_os = "linux")]
pub fn send_close_notify(socket: &TcpStream) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let mut alert = [ALERT_LEVEL_WARNING, ALERT_CLOSE_NOTIFY];
    let mut iov = libc::iovec {
        iov_base: alert.as_mut_ptr() as *mut libc::c_void,
        iov_len: alert.len(),
    };
    // u64 storage keeps the cmsghdr aligned
    let mut control = [0u64; 4];
    let space = unsafe { libc::CMSG_SPACE(1) } as usize;
    debug_assert!(space <= std::mem::size_of_val(&control));

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = space as _;

    let rc = unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(std::io::ErrorKind::InvalidInput.into());
        }
        (*cmsg).cmsg_level = SOL_TLS;
        (*cmsg).cmsg_type = TLS_SET_RECORD_TYPE;
        (*cmsg).cmsg_len = libc::CMSG_LEN(1) as _;
        *libc::CMSG_DATA(cmsg) = RECORD_TYPE_ALERT;
        libc::sendmsg(socket.as_raw_fd(), &msg, 0)
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn send_close_notify(_socket: &TcpStream) -> std::io::Result<()> {
    Err(std::io::ErrorKind::Unsupported.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::crypto::cipher::{AeadKey, Iv};

    fn params() -> OffloadCryptoParams {
        let iv: Vec<u8> = (1..=12).collect();
        OffloadCryptoParams::new(TLS_1_3_VERSION, [7u8; 16], &iv, 3).unwrap()
    }

    #[test]
    fn kernel_struct_layout() {
        // header(4) + iv(8) + key(16) + salt(4) + rec_seq(8)
        assert_eq!(std::mem::size_of::<Tls12CryptoInfoAesGcm128>(), 40);
        assert_eq!(std::mem::size_of::<TlsCryptoInfoHeader>(), 4);
    }

    #[test]
    fn iv_splits_into_salt_and_explicit_part() {
        let p = params();
        let info = p.crypto_info();
        assert_eq!(info.salt, [1, 2, 3, 4]);
        assert_eq!(info.iv, [5, 6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(info.key, [7u8; 16]);
        assert_eq!(info.rec_seq, 3u64.to_be_bytes());
        assert_eq!(info.info.cipher_type, TLS_CIPHER_AES_GCM_128);
    }

    #[test]
    fn short_iv_is_rejected() {
        let err = OffloadCryptoParams::new(TLS_1_2_VERSION, [0u8; 16], &[0u8; 8], 0).unwrap_err();
        assert!(matches!(err, OffloadError::UnsupportedCipher));
    }

    #[test]
    fn debug_output_hides_key_material() {
        let s = format!("{:?}", params());
        assert!(s.contains("redacted"));
        assert!(!s.contains("7, 7"));
    }

    #[test]
    fn wipe_clears_key_material() {
        let mut p = params();
        secure_zero(&mut p.key);
        assert!(p.key.iter().all(|&b| b == 0));
    }

    #[test]
    fn aes256_sessions_cannot_be_offloaded() {
        let tx = (
            0,
            ConnectionTrafficSecrets::Aes256Gcm {
                key: AeadKey::from([0u8; 32]),
                iv: Iv::new([0u8; 12]),
            },
        );
        let err = OffloadCryptoParams::from_write_secrets(Some(ProtocolVersion::TLSv1_3), tx)
            .unwrap_err();
        assert!(matches!(err, OffloadError::UnsupportedCipher));
    }

    #[test]
    fn unknown_protocol_versions_are_rejected() {
        let tx = (
            0,
            ConnectionTrafficSecrets::Aes256Gcm {
                key: AeadKey::from([0u8; 32]),
                iv: Iv::new([0u8; 12]),
            },
        );
        let err = OffloadCryptoParams::from_write_secrets(None, tx).unwrap_err();
        assert!(matches!(err, OffloadError::UnsupportedProtocol));
    }
}
