//! UDP transport.
//!
//! One broadcast-enabled socket bound to the protocol port carries every
//! exchange: discovery broadcasts, gateway commands and gateway replies. A
//! reader task forwards received datagrams to the engine actor, which writes
//! with non-blocking sends through [`UdpSink`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lifx_protocol::MAX_PACKET_SIZE;

use crate::gateway::DatagramSink;

/// A datagram as it came off the socket.
#[derive(Debug, Clone)]
pub struct InboundDatagram {
    pub peer: SocketAddr,
    pub bytes: Vec<u8>,
    pub received_at: Instant,
}

/// Binds the engine socket with broadcast enabled.
pub async fn bind(addr: SocketAddr) -> io::Result<Arc<UdpSocket>> {
    let socket = UdpSocket::bind(addr).await?;
    socket.set_broadcast(true)?;
    info!(local_addr = %socket.local_addr()?, "UDP transport started");
    Ok(Arc::new(socket))
}

/// Spawns the task forwarding received datagrams to `tx`.
///
/// The task stops when `cancel` fires or the receiver is dropped. Receive
/// errors are logged and the loop carries on.
pub fn spawn_reader(
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<InboundDatagram>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        debug!("UDP receive loop starting");

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => received,
            };
            match received {
                Ok((len, peer)) => {
                    let datagram = InboundDatagram {
                        peer,
                        bytes: buf.get(..len).unwrap_or_default().to_vec(),
                        received_at: Instant::now(),
                    };
                    if tx.send(datagram).await.is_err() {
                        info!("datagram channel closed, stopping receive loop");
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "UDP receive error"),
            }
        }

        debug!("UDP receive loop stopped");
    })
}

/// Non-blocking writes on the engine socket.
pub struct UdpSink<'a> {
    socket: &'a UdpSocket,
}

impl<'a> UdpSink<'a> {
    pub fn new(socket: &'a UdpSocket) -> Self {
        Self { socket }
    }
}

impl DatagramSink for UdpSink<'_> {
    fn send_to(&mut self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        self.socket.try_send_to(buf, peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reader_forwards_datagrams() {
        let socket = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let reader = spawn_reader(socket, tx, cancel.clone());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", addr).await.unwrap();

        let datagram = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(datagram.bytes, b"hello");
        assert_eq!(datagram.peer, client.local_addr().unwrap());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_sink_sends() {
        let socket = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut sink = UdpSink::new(&socket);

        let n = sink.send_to(b"abc", peer.local_addr().unwrap()).unwrap();
        assert_eq!(n, 3);
        let mut buf = [0u8; 8];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"abc");
    }
}
