use std::cell::Cell;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{IngestError, IngestResult};
use crate::packet::{self, MAX_BOARDS, MAX_PACKET_LEN};

/// Upper bound on any single receive attempt.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(50);

/// Kernel receive buffer requested for the socket; a 16-board stream runs at tens of MB/s.
pub const DEFAULT_RECV_BUFFER: usize = 8 * 1024 * 1024;

/// Largest datagram drained by `flush`.
const FLUSH_DATAGRAM: usize = 65_536;

/// One bound UDP socket. Replaced wholesale on address/port change or after a fault.
pub struct Session {
    socket: UdpSocket,
    local: SocketAddr,
    read_timeout: Cell<Option<Duration>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("local", &self.local).finish()
    }
}

impl Session {
    /// Bind a new socket to `ip:port` with the default receive buffer.
    pub fn bind(ip: IpAddr, port: u16) -> IngestResult<Self> {
        Self::bind_with_buffer(ip, port, DEFAULT_RECV_BUFFER)
    }

    pub fn bind_with_buffer(ip: IpAddr, port: u16, recv_buffer: usize) -> IngestResult<Self> {
        let addr = SocketAddr::new(ip, port);
        let bind_err = |source| IngestError::Bind { addr, source };

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        if let Err(e) = socket.set_recv_buffer_size(recv_buffer) {
            warn!("Could not set UDP receive buffer to {} bytes: {}", recv_buffer, e);
        }
        socket.bind(&addr.into()).map_err(bind_err)?;

        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(RECV_TIMEOUT)).map_err(bind_err)?;
        let local = socket.local_addr().map_err(bind_err)?;
        info!("Bound UDP socket on {}", local);

        Ok(Self {
            socket,
            local,
            read_timeout: Cell::new(Some(RECV_TIMEOUT)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Whether this session is already bound where the configuration points.
    pub fn is_bound_to(&self, ip: IpAddr, port: u16) -> bool {
        self.local.ip() == ip && self.local.port() == port
    }

    /// Discard every datagram already queued on the socket. Returns how many were dropped.
    pub fn flush(&self) -> IngestResult<usize> {
        let mut scratch = vec![0u8; FLUSH_DATAGRAM];
        self.socket.set_nonblocking(true)?;

        let mut dropped = 0;
        let result = loop {
            match self.socket.recv(&mut scratch) {
                Ok(_) => dropped += 1,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(dropped),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                // ICMP errors surface here on some platforms; nothing left to drain.
                Err(e) if e.kind() == ErrorKind::ConnectionReset => break Ok(dropped),
                Err(e) => break Err(IngestError::Io(e)),
            }
        };

        self.socket.set_nonblocking(false)?;
        if dropped > 0 {
            debug!("Flushed {} stale datagrams", dropped);
        }
        result
    }

    fn set_timeout(&self, timeout: Duration) -> IngestResult<()> {
        let timeout = Some(timeout.max(Duration::from_millis(1)));
        if self.read_timeout.get() != timeout {
            self.socket.set_read_timeout(timeout)?;
            self.read_timeout.set(timeout);
        }
        Ok(())
    }

    /// Receive one datagram into `buf`, waiting at most `timeout`.
    ///
    /// With `expected_boards > 0` exactly that packet's length is read and anything
    /// shorter fails. With `expected_boards == 0` up to the largest packet size is read
    /// and the board count is taken from the first packet's header; the checksum is not
    /// verified. Returns the board count.
    pub fn receive_one(
        &self,
        buf: &mut [u8],
        expected_boards: usize,
        timeout: Duration,
    ) -> IngestResult<usize> {
        if expected_boards > MAX_BOARDS {
            return Err(IngestError::InvalidPacket("board count out of range"));
        }

        let want = if expected_boards > 0 {
            packet::packet_len(expected_boards)
        } else {
            MAX_PACKET_LEN
        };
        if buf.len() < want {
            return Err(IngestError::ShortRead {
                expected: want,
                received: buf.len(),
            });
        }

        let received = self.recv_within(&mut buf[..want], timeout)?;

        if expected_boards > 0 {
            return if received == want {
                Ok(expected_boards)
            } else {
                Err(IngestError::ShortRead {
                    expected: want,
                    received,
                })
            };
        }

        packet::boards_from_header(&buf[..received])
            .ok_or(IngestError::InvalidPacket("unrecognized channel-count header"))
    }

    /// Fill `buf` with `batch` back-to-back packets of `boards` boards each.
    ///
    /// The whole batch fails as soon as one slot times out or comes back short.
    pub fn receive_batch(&self, buf: &mut [u8], boards: usize, batch: usize) -> IngestResult<()> {
        let len = packet::packet_len(boards);
        if buf.len() < len * batch {
            return Err(IngestError::ShortRead {
                expected: len * batch,
                received: buf.len(),
            });
        }

        for (slot, chunk) in buf.chunks_exact_mut(len).take(batch).enumerate() {
            self.receive_one(chunk, boards, RECV_TIMEOUT)
                .map_err(|e| IngestError::BatchFailure {
                    slot,
                    source: Box::new(e),
                })?;
        }
        Ok(())
    }

    fn recv_within(&self, buf: &mut [u8], timeout: Duration) -> IngestResult<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(IngestError::Timeout(timeout));
            }
            self.set_timeout(remaining)?;

            match self.socket.recv(buf) {
                // empty datagrams carry nothing; keep waiting
                Ok(0) => continue,
                Ok(n) => return Ok(n),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(IngestError::Timeout(timeout));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(IngestError::Io(e)),
            }
        }
    }
}
