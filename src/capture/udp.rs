use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Emitter;
use crate::packet::{Packet, MAX_DATAGRAM_SIZE};

/// How often the receive loop wakes up to check the shutdown flag
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Live reader connected to a local UDP endpoint
#[derive(Debug)]
pub struct UdpCapture {
    socket: UdpSocket,
    endpoint: SocketAddr,
}

impl UdpCapture {
    /// Create the socket and connect it to `endpoint`. A single attempt, no retries.
    /// An empty datagram is sent once so that an endpoint with no listener
    /// reports port-unreachable, which surfaces as a receive error in `run`.
    pub fn connect(endpoint: SocketAddr) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(endpoint), Type::DGRAM, Some(Protocol::UDP))
            .context("Failed to create UDP socket")?;

        if let Err(e) = socket.set_recv_buffer_size(1024 * 1024) {
            warn!("Failed to set large receive buffer: {}", e);
        }
        socket.set_read_timeout(Some(READ_TIMEOUT))?;

        let local = SocketAddr::new(local_bind_ip(endpoint.ip()), 0);
        socket
            .bind(&local.into())
            .with_context(|| format!("Failed to bind UDP socket to {}", local))?;
        socket
            .connect(&endpoint.into())
            .with_context(|| format!("Failed to connect UDP socket to {}", endpoint))?;

        let socket: UdpSocket = socket.into();
        socket
            .send(&[])
            .with_context(|| format!("UDP source {} is unreachable", endpoint))?;
        info!("Connected to UDP source {} from {}", endpoint, socket.local_addr()?);

        Ok(Self { socket, endpoint })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive datagrams until `running` is cleared (Ok) or the socket fails (Err)
    pub fn run(self, emitter: &mut Emitter<'_>, running: &AtomicBool) -> Result<u64> {
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
        let mut received = 0u64;

        while running.load(Ordering::Relaxed) {
            match self.socket.recv(&mut buffer) {
                Ok(size) => {
                    emitter.emit(Packet::captured_now(buffer[..size].to_vec()));
                    received += 1;
                    debug!("Received UDP packet: size={} bytes", size);
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => continue,
                    _ => {
                        return Err(e).with_context(|| {
                            format!("Error receiving from {} after {} packets", self.endpoint, received)
                        });
                    }
                },
            }
        }

        info!("UDP capture stopped after {} packets", received);
        Ok(received)
    }
}

fn local_bind_ip(remote: IpAddr) -> IpAddr {
    match remote {
        IpAddr::V4(ip) if ip.is_loopback() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(ip) if ip.is_loopback() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn wait_for(pipeline: &Pipeline, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while pipeline.store().len() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_datagrams_become_packets() {
        let source = UdpSocket::bind("127.0.0.1:0").unwrap();
        let capture = UdpCapture::connect(source.local_addr().unwrap()).unwrap();
        let capture_addr = capture.local_addr().unwrap();

        let pipeline = Arc::new(Pipeline::default());
        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let pipeline = pipeline.clone();
            let running = running.clone();
            thread::spawn(move || capture.run(&mut Emitter::new(&pipeline), &running))
        };

        source.send_to(&[0xAA, 0xBB], capture_addr).unwrap();
        source.send_to(&[], capture_addr).unwrap();
        source.send_to(&[7u8; 2000], capture_addr).unwrap();
        wait_for(&pipeline, 3);

        running.store(false, Ordering::Relaxed);
        let received = handle.join().unwrap().unwrap();
        assert_eq!(received, 3);

        let packets = pipeline.snapshot();
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].raw_data(), &[0xAA, 0xBB]);
        assert_eq!(packets[1].size(), 0);
        // Oversized datagrams are truncated to the receive buffer
        assert_eq!(packets[2].size(), MAX_DATAGRAM_SIZE);

        for packet in &packets {
            assert_eq!(packet.size(), packet.raw_data().len());
        }
        for pair in packets.windows(2) {
            assert!(pair[1].timestamp() >= pair[0].timestamp());
        }
    }

    #[test]
    fn test_ignores_datagrams_from_other_peers() {
        let source = UdpSocket::bind("127.0.0.1:0").unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").unwrap();
        let capture = UdpCapture::connect(source.local_addr().unwrap()).unwrap();
        let capture_addr = capture.local_addr().unwrap();

        let pipeline = Arc::new(Pipeline::default());
        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let pipeline = pipeline.clone();
            let running = running.clone();
            thread::spawn(move || capture.run(&mut Emitter::new(&pipeline), &running))
        };

        stranger.send_to(&[1], capture_addr).unwrap();
        source.send_to(&[2], capture_addr).unwrap();
        wait_for(&pipeline, 1);
        thread::sleep(Duration::from_millis(50));

        running.store(false, Ordering::Relaxed);
        handle.join().unwrap().unwrap();

        let packets = pipeline.snapshot();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].raw_data(), &[2]);
    }

    #[test]
    fn test_closed_endpoint_fails_receive() {
        let closed = UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let capture = UdpCapture::connect(closed).unwrap();

        let pipeline = Pipeline::default();
        let running = AtomicBool::new(true);
        let started = Instant::now();
        let err = capture
            .run(&mut Emitter::new(&pipeline), &running)
            .unwrap_err();

        let io = err.downcast_ref::<std::io::Error>().unwrap();
        assert_eq!(io.kind(), ErrorKind::ConnectionRefused);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(pipeline.store().is_empty());
    }
}
