//! UDP transport (SMP over IP, as served by Zephyr's `smp_udp`).

use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use super::traits::{SmpTransport, TransportError};
use crate::protocol::constants::SMP_UDP_PORT;
use crate::protocol::header::WireHeader;

/// Largest datagram we are prepared to receive.
const RECV_BUFFER_LEN: usize = 1500;
/// Frame size used when the caller does not specify one.
pub const DEFAULT_UDP_MTU: usize = 1024;
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(5);

/// SMP over a connected UDP socket.
///
/// Exchanges are serialized: one request is outstanding at a time and
/// stale datagrams whose sequence number does not match are dropped.
pub struct UdpTransport {
    socket: Mutex<UdpSocket>,
    peer: SocketAddr,
    mtu: usize,
    timeout: Duration,
}

impl UdpTransport {
    /// Connect to `host`; a bare host name or address gets the SMP port.
    #[instrument(level = "info")]
    pub fn connect(host: &str) -> Result<Self, TransportError> {
        let target = match host.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, SMP_UDP_PORT).to_string(),
            Err(_) if host.contains(':') => host.to_string(),
            Err(_) => format!("{host}:{SMP_UDP_PORT}"),
        };

        let peer = target
            .to_socket_addrs()
            .map_err(|e| TransportError::OpenFailed(format!("{target}: {e}")))?
            .next()
            .ok_or_else(|| TransportError::OpenFailed(format!("{target}: no address")))?;

        Self::connect_addr(peer)
    }

    pub fn connect_addr(peer: SocketAddr) -> Result<Self, TransportError> {
        let bind: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind)?;
        socket.connect(peer)?;
        socket.set_read_timeout(Some(DEFAULT_UDP_TIMEOUT))?;

        info!(%peer, "UDP transport ready");

        Ok(Self {
            socket: Mutex::new(socket),
            peer,
            mtu: DEFAULT_UDP_MTU,
            timeout: DEFAULT_UDP_TIMEOUT,
        })
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, TransportError> {
        self.socket
            .lock()
            .map_err(|_| TransportError::SendFailed("socket lock poisoned".into()))?
            .set_read_timeout(Some(timeout))?;
        self.timeout = timeout;
        Ok(self)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl SmpTransport for UdpTransport {
    #[instrument(skip(self, frame), fields(len = frame.len()))]
    fn send(&self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        let request = WireHeader::from_bytes(frame)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let socket = self
            .socket
            .lock()
            .map_err(|_| TransportError::SendFailed("socket lock poisoned".into()))?;

        socket
            .send(frame)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        // Stale datagrams do not extend the exchange past its deadline.
        let deadline = Instant::now() + self.timeout;
        let timed_out = || TransportError::Timeout {
            timeout_ms: self.timeout.as_millis() as u64,
        };
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out());
            }
            socket.set_read_timeout(Some(remaining))?;

            let n = match socket.recv(&mut buf) {
                Ok(n) => n,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(timed_out());
                }
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    return Err(TransportError::Disconnected);
                }
                Err(e) => return Err(TransportError::ReceiveFailed(e.to_string())),
            };

            match WireHeader::from_bytes(&buf[..n]) {
                Ok(header) if header.sequence == request.sequence => {
                    debug!(bytes_read = n, "Response received");
                    return Ok(buf[..n].to_vec());
                }
                Ok(header) => {
                    warn!(
                        expected = request.sequence,
                        got = header.sequence,
                        "Dropping stale response"
                    );
                }
                Err(e) => warn!(error = %e, "Dropping malformed datagram"),
            }
        }
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}
