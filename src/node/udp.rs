//! UDP point-of-attachment transport.
//!
//! One socket per node, bound to the attachment recorded in the flow
//! registry. Each netstring frame travels as one datagram; delivery is
//! best-effort.

use std::net::SocketAddr;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::debug;

use super::{NodeError, PoaTransport};
use crate::defaults;
use crate::policy::{PoaUdp, PolicyValue};

pub struct UdpTransport {
    socket: UdpSocket,
    poa: PoaUdp,
}

impl UdpTransport {
    /// Bind to the recorded attachment.
    ///
    /// A rejected bind is surfaced as [`NodeError::Bind`]; a stale
    /// registry record pointing at a taken port shows up here.
    pub async fn bind(poa: &PoaUdp) -> Result<Self, NodeError> {
        let address: SocketAddr = format!("{}:{}", poa.addr, poa.port)
            .parse()
            .map_err(|fault| {
                NodeError::Bind(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("unparseable attachment address: {}", fault),
                ))
            })?;

        let socket = Socket::new(Domain::for_address(address), Type::DGRAM, Some(Protocol::UDP))
            .map_err(NodeError::Bind)?;
        socket
            .set_recv_buffer_size(defaults::SOCKET_BUFFER)
            .map_err(NodeError::Bind)?;
        socket.set_nonblocking(true).map_err(NodeError::Bind)?;
        socket.bind(&address.into()).map_err(NodeError::Bind)?;

        let socket = UdpSocket::from_std(socket.into()).map_err(NodeError::Bind)?;
        debug!("udp attachment bound on {}", address);
        Ok(Self {
            socket,
            poa: poa.clone(),
        })
    }
}

#[async_trait]
impl PoaTransport for UdpTransport {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn poa(&self) -> PolicyValue {
        PolicyValue::Udp(self.poa.clone())
    }

    async fn send_to(&self, frame: &[u8], poa: &PolicyValue) -> Result<(), NodeError> {
        let remote = poa
            .as_udp()
            .ok_or_else(|| NodeError::NoAttachment("udp".to_string()))?;
        self.socket
            .send_to(frame, (remote.addr.as_str(), remote.port))
            .await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, NodeError> {
        let (len, _remote) = self.socket.recv_from(buf).await?;
        Ok(len)
    }
}
