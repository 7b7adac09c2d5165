//! src/transport/mod.rs
//!
//! The message-oriented network layer. The `Transport` actor owns the QUIC
//! endpoint and its accept loop; cloned `TransportHandle`s perform bounded
//! sends and the bootstrap exchange. Every inbound frame is verified against
//! the cluster MAC before it reaches the rest of the node.

use crate::{
    error::{Error, Result},
    wire::{BootstrapRequest, BootstrapResponse, Envelope, Message, WireMac},
};
use quinn::{Endpoint, TokioRuntime};
use socket2::{Domain, Protocol, Socket, Type};
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::time;
use tokio_util::sync::CancellationToken;

pub mod connection;
pub mod tls;

/// The maximum allowed size for a single incoming message on a QUIC stream.
pub const MAX_MESSAGE_SIZE: usize = 1_024 * 1_024; // 1 MiB
/// Limit for concurrently handled inbound streams.
const MAX_CONCURRENT_STREAMS: usize = 256;
/// Upper bound on a single send or bootstrap exchange. A timeout is a send
/// failure and feeds the peer's failure counter upstream.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Traffic delivered by the transport to the node's dispatch loop. The
/// transport knows nothing about who consumes these.
#[derive(Debug)]
pub enum Inbound {
    Gossip(Message),
    Bootstrap {
        request: BootstrapRequest,
        reply: oneshot::Sender<BootstrapResponse>,
    },
}

/// The network I/O actor.
pub struct Transport {
    endpoint: Endpoint,
    inbound_tx: mpsc::Sender<Inbound>,
    mac: WireMac,
    connections: connection::ConnectionCache,
    stream_semaphore: Arc<Semaphore>,
    shutdown_token: CancellationToken,
}

impl Transport {
    /// Binds the UDP socket and builds the endpoint. The returned transport
    /// must be `run` for inbound traffic to flow.
    pub fn bind(
        bind_addr: SocketAddr,
        mac: WireMac,
        inbound_tx: mpsc::Sender<Inbound>,
        shutdown_token: CancellationToken,
    ) -> Result<Self> {
        let (server_config, client_config) = tls::configure()?;

        let socket = Socket::new(
            Domain::for_address(bind_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&bind_addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();
        std_socket.set_nonblocking(true)?;

        let mut endpoint = Endpoint::new(
            Default::default(),
            Some(server_config),
            std_socket,
            Arc::new(TokioRuntime),
        )?;
        endpoint.set_default_client_config(client_config);

        Ok(Self {
            endpoint,
            inbound_tx,
            mac,
            connections: Arc::new(Mutex::new(HashMap::new())),
            stream_semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_STREAMS)),
            shutdown_token,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// A cheap, cloneable handle for outbound traffic.
    pub fn handle(&self) -> TransportHandle {
        TransportHandle {
            endpoint: self.endpoint.clone(),
            connections: self.connections.clone(),
            mac: self.mac.clone(),
            shutdown_token: self.shutdown_token.clone(),
        }
    }

    /// The accept loop. Runs until shutdown, then drains the endpoint.
    pub async fn run(self) {
        let local_addr = match self.endpoint.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(error = %e, "Transport has no local address");
                return;
            }
        };
        tracing::info!(listen_addr = %local_addr, "Transport service started");

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    tracing::debug!("Transport service received shutdown signal.");
                    break;
                },
                accepted = self.endpoint.accept() => {
                    let Some(conn) = accepted else {
                        tracing::debug!("Endpoint closed. Transport service shutting down.");
                        break;
                    };
                    let connections = self.connections.clone();
                    let inbound_tx = self.inbound_tx.clone();
                    let mac = self.mac.clone();
                    let stream_semaphore = self.stream_semaphore.clone();
                    tokio::spawn(async move {
                        if let Err(e) = connection::handle_connection(
                            conn,
                            connections,
                            inbound_tx,
                            mac,
                            stream_semaphore,
                        )
                        .await
                        {
                            tracing::debug!(error = %e, "Connection handling failed");
                        }
                    });
                },
            }
        }
        self.endpoint.close(0u32.into(), b"shutdown");
        self.endpoint.wait_idle().await;
    }
}

/// Outbound side of the transport, safe to clone into any task.
#[derive(Clone)]
pub struct TransportHandle {
    endpoint: Endpoint,
    connections: connection::ConnectionCache,
    mac: WireMac,
    shutdown_token: CancellationToken,
}

impl TransportHandle {
    pub fn is_stopped(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Sends one gossip message to `addr` (a `host:port` string), bounded
    /// by `SEND_TIMEOUT`.
    pub async fn send(&self, addr: &str, message: &Message) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::Transport("transport is stopped".to_string()));
        }
        let addr = resolve(addr).await?;
        let frame = Envelope::seal(message, &self.mac)?;
        time::timeout(
            SEND_TIMEOUT,
            connection::send_frame(self.endpoint.clone(), self.connections.clone(), addr, frame),
        )
        .await
        .map_err(|_| Error::SendTimeout(addr))?
    }

    /// Performs the bootstrap request/response exchange with a seed.
    pub async fn bootstrap(
        &self,
        addr: &str,
        request: &BootstrapRequest,
    ) -> Result<BootstrapResponse> {
        if self.is_stopped() {
            return Err(Error::Transport("transport is stopped".to_string()));
        }
        let addr = resolve(addr).await?;
        let frame = Envelope::seal(request, &self.mac)?;
        let bytes = time::timeout(
            SEND_TIMEOUT,
            connection::exchange_frame(
                self.endpoint.clone(),
                self.connections.clone(),
                addr,
                frame,
            ),
        )
        .await
        .map_err(|_| Error::SendTimeout(addr))??;
        Envelope::open(&bytes, &self.mac)
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| Error::AddrResolve(addr.to_string()))
}
