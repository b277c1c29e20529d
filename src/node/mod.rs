//! # Node Runtime
//!
//! The per-process actor that owns one point of attachment, a framing
//! decoder, and the two application queues:
//!
//! - **down** carries messages the application wants sent;
//! - **up** carries messages routed here for the application to consume.
//!
//! Inbound datagrams are de-framed, decoded and handed to the hop
//! engine; forwarded copies are re-emitted with the hop count raised and
//! `via` rewritten, local deliveries surface on the up queue. All
//! decode and routing faults are logged and the node keeps serving.
//!
//! Each POA policy variant names the transport it activates; the node
//! composes with that implementation through the [`PoaTransport`] trait,
//! so new attachment kinds plug in without touching the routing logic.

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::defaults;
use crate::framing::Decoder;
use crate::message::{Address, Message};
use crate::policy::{self, PolicyValue, TransportKind};
use crate::registry::{self, CreateRequest, RegistryError, Token};
use crate::router;

pub mod udp;

pub use udp::UdpTransport;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The operating system refused the socket binding.
    #[error("socket bind rejected: {0}")]
    Bind(std::io::Error),

    #[error("transport I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// No usable point of attachment of the named kind.
    #[error("no point of attachment of kind '{0}'")]
    NoAttachment(String),
}

/// The transport behaviour one POA policy variant activates.
#[async_trait]
pub trait PoaTransport: Send + Sync {
    /// The policy name this transport serves.
    fn name(&self) -> &'static str;

    /// The local attachment this transport is bound to.
    fn poa(&self) -> PolicyValue;

    /// Transmit one frame to a remote attachment.
    async fn send_to(&self, frame: &[u8], poa: &PolicyValue) -> Result<(), NodeError>;

    /// Receive one datagram into `buf`, returning its length.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize, NodeError>;
}

/// Instantiate the transport a policy variant declares.
pub async fn transport_for(
    kind: TransportKind,
    poa: &PolicyValue,
) -> Result<Box<dyn PoaTransport>, NodeError> {
    match kind {
        TransportKind::Udp => {
            let udp = poa
                .as_udp()
                .ok_or_else(|| NodeError::NoAttachment("udp".to_string()))?;
            Ok(Box::new(UdpTransport::bind(udp).await?))
        }
    }
}

/// One node: token, transport, decoder and the application queues.
pub struct Node {
    token: Token,
    transport: Box<dyn PoaTransport>,
    decoder: Decoder,
    down: mpsc::Receiver<Message>,
    up: mpsc::Sender<Message>,
}

/// Build a node attached over UDP.
///
/// Reuses the endpoint's registered `udp` and `application` policies
/// when a previous flow left them behind; otherwise creates a fresh
/// flow, which allocates a port from the pool. The socket is bound to
/// the recorded attachment; a rejected bind surfaces to the caller.
pub async fn create_udp_node(
    token: &Token,
    down: mpsc::Receiver<Message>,
    up: mpsc::Sender<Message>,
) -> Result<Node, NodeError> {
    let tok = token.clone();
    let poa = tokio::task::spawn_blocking(move || local_attachment(&tok))
        .await
        .map_err(|fault| NodeError::Io(std::io::Error::new(std::io::ErrorKind::Other, fault)))??;

    let spec = policy::lookup(defaults::POLICY_UDP)
        .ok_or_else(|| NodeError::NoAttachment(defaults::POLICY_UDP.to_string()))?;
    let kind = spec
        .transport
        .ok_or_else(|| NodeError::NoAttachment(defaults::POLICY_UDP.to_string()))?;
    let transport = transport_for(kind, &poa).await?;

    Ok(Node {
        token: token.clone(),
        transport,
        decoder: Decoder::new(),
        down,
        up,
    })
}

/// The endpoint's recorded UDP attachment, registered on first use.
fn local_attachment(token: &Token) -> Result<PolicyValue, NodeError> {
    let existing = registry::find(token, Some(&token.application), Some(defaults::POLICY_UDP))?;
    if let Some(value) = existing.first().and_then(registry::inspect) {
        return Ok(value);
    }

    let request = CreateRequest {
        poa: vec![defaults::POLICY_UDP.to_string()],
        routing: vec![defaults::POLICY_APPLICATION.to_string()],
        ..Default::default()
    };
    let resources = registry::create(token, &request)?;
    resources
        .first()
        .cloned()
        .flatten()
        .and_then(|resource| registry::inspect(&resource))
        .ok_or_else(|| NodeError::NoAttachment(defaults::POLICY_UDP.to_string()))
}

impl Node {
    /// The attachment this node is bound to.
    pub fn attachment(&self) -> PolicyValue {
        self.transport.poa()
    }

    /// Serve both directions until shutdown or the down queue closes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), NodeError> {
        let Node {
            token,
            transport,
            mut decoder,
            mut down,
            up,
        } = self;
        let transport = transport.as_ref();
        let mut buf = vec![0u8; defaults::DATAGRAM_CAPACITY];

        debug!("node {} serving on {:?}", token.address(), transport.poa());
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = transport.recv(&mut buf) => match received {
                    Ok(len) => {
                        let chunk = buf[..len].to_vec();
                        inbound(&token, transport, &mut decoder, &up, &chunk).await;
                    }
                    Err(fault) => warn!("receive failure: {}", fault),
                },
                queued = down.recv() => match queued {
                    Some(msg) => outbound(&token, transport, &up, msg).await,
                    None => break,
                },
            }
        }
        debug!("node {} stopped", token.address());
        Ok(())
    }
}

/// Drain every frame the chunk completes, routing each one.
async fn inbound(
    token: &Token,
    transport: &dyn PoaTransport,
    decoder: &mut Decoder,
    up: &mpsc::Sender<Message>,
    chunk: &[u8],
) {
    let mut fed = decoder.feed(chunk);
    loop {
        match fed {
            Ok(None) => break,
            Ok(Some(text)) => match Message::from_wire(&text) {
                Ok(msg) => route_inbound(token, transport, up, msg).await,
                Err(fault) => warn!("undecodable message dropped: {}", fault),
            },
            Err(fault) => warn!("{}", fault),
        }
        fed = decoder.feed(&[]);
    }
}

/// Forward or deliver one decoded message.
async fn route_inbound(
    token: &Token,
    transport: &dyn PoaTransport,
    up: &mpsc::Sender<Message>,
    msg: Message,
) {
    let (poa, msg) = hop_off_loop(token, msg, None).await;
    match (poa, msg) {
        (Some(poa), Some(msg)) => transmit(transport, &msg, &poa).await,
        (None, Some(msg)) => deliver(token, up, msg).await,
        _ => {}
    }
}

/// Send one message from the down queue.
///
/// A `via` the sender pre-populated overrides the next-hop lookup:
/// the message is pushed towards that application first.
async fn outbound(
    token: &Token,
    transport: &dyn PoaTransport,
    up: &mpsc::Sender<Message>,
    msg: Message,
) {
    let source_route = msg.header.via.clone();
    let (poa, msg) = hop_off_loop(token, msg, source_route).await;
    match (poa, msg) {
        (Some(poa), Some(msg)) => transmit(transport, &msg, &poa).await,
        (None, Some(msg)) => deliver(token, up, msg).await,
        _ => {}
    }
}

/// Run the hop engine off the event loop; registry reads touch the
/// filesystem.
async fn hop_off_loop(
    token: &Token,
    msg: Message,
    source_route: Option<Address>,
) -> (Option<PolicyValue>, Option<Message>) {
    let token = token.clone();
    let routed = tokio::task::spawn_blocking(move || {
        let (poa, msg) = router::hop(&token, msg, defaults::POLICY_UDP);
        match source_route {
            Some(via) => {
                let overridden = registry::find(
                    &token,
                    Some(&via.application),
                    Some(defaults::POLICY_UDP),
                )
                .ok()
                .and_then(|hops| hops.first().and_then(registry::inspect));
                (overridden.or(poa), msg)
            }
            None => (poa, msg),
        }
    })
    .await;
    match routed {
        Ok(routed) => routed,
        Err(fault) => {
            warn!("routing task failed: {}", fault);
            (None, None)
        }
    }
}

/// Surface a message upward when it is addressed here; otherwise it is
/// a dead letter.
async fn deliver(token: &Token, up: &mpsc::Sender<Message>, msg: Message) {
    if msg.header.dst.as_ref() == Some(&token.address()) {
        if up.send(msg).await.is_err() {
            warn!("up queue closed; delivery lost");
        }
    } else {
        warn!(
            "no route for message {} to {:?}; dropped",
            msg.header.id, msg.header.dst
        );
    }
}

async fn transmit(transport: &dyn PoaTransport, msg: &Message, poa: &PolicyValue) {
    let frame = crate::framing::encode(&msg.to_wire());
    if let Err(fault) = transport.send_to(&frame, poa).await {
        warn!("transmit failure: {}", fault);
    }
}
