//! Recovery of the pre-redirection destination of an intercepted connection.
//!
//! The kernel NAT layer keeps the original tuple and exposes it through the
//! `SO_ORIGINAL_DST` socket option (IP level, option 80). The answer is a
//! `sockaddr_in`:
//!
//! ```text
//! 0      2      4              8                16
//! ├family┼─port─┼────ipv4──────┼─────padding────┤
//!  native  BE        BE octets
//! ```
//!
//! Only Linux offers this; other platforms get a resolver that always fails.

use std::fmt;
use std::net::Ipv4Addr;

use common::ProxyError;
use tokio::net::TcpStream;

/// Size of `struct sockaddr_in`.
pub const SOCKADDR_IN_LEN: usize = 16;

/// `AF_INET` as reported in `sin_family`.
const AF_INET: u16 = 2;

/// Destination the workload addressed before redirection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginalDestination {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl OriginalDestination {
    /// Decode a raw `sockaddr_in` as returned by `getsockopt`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Resolution`] if the address family is not IPv4.
    pub fn from_sockaddr_in(raw: &[u8; SOCKADDR_IN_LEN]) -> Result<Self, ProxyError> {
        let family = u16::from_ne_bytes([raw[0], raw[1]]);
        if family != AF_INET {
            return Err(ProxyError::Resolution(format!(
                "unexpected address family {family}"
            )));
        }
        Ok(Self {
            port: u16::from_be_bytes([raw[2], raw[3]]),
            ip: Ipv4Addr::new(raw[4], raw[5], raw[6], raw[7]),
        })
    }
}

impl fmt::Display for OriginalDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Query the original destination of a redirected connection.
///
/// # Errors
///
/// Returns [`ProxyError::Resolution`] if the socket option is unavailable,
/// typically because the connection did not pass through NAT redirection.
#[cfg(target_os = "linux")]
pub fn resolve(stream: &TcpStream) -> Result<OriginalDestination, ProxyError> {
    use std::os::fd::AsRawFd;

    let fd = stream.as_raw_fd();
    let mut raw = [0u8; SOCKADDR_IN_LEN];
    let mut len = SOCKADDR_IN_LEN as libc::socklen_t;

    // SAFETY: `raw` is a writable buffer of `len` bytes that outlives the call,
    // and `fd` stays open for as long as `stream` is borrowed.
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            libc::SO_ORIGINAL_DST,
            raw.as_mut_ptr().cast::<libc::c_void>(),
            &mut len,
        )
    };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(ProxyError::Resolution(format!(
            "getsockopt(SO_ORIGINAL_DST) failed: {err}"
        )));
    }
    if (len as usize) < 8 {
        return Err(ProxyError::Resolution(format!(
            "short SO_ORIGINAL_DST answer ({len} bytes)"
        )));
    }

    OriginalDestination::from_sockaddr_in(&raw)
}

#[cfg(not(target_os = "linux"))]
pub fn resolve(_stream: &TcpStream) -> Result<OriginalDestination, ProxyError> {
    Err(ProxyError::Resolution(
        "SO_ORIGINAL_DST is only available on Linux".into(),
    ))
}
