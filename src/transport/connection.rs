//! src/transport/connection.rs
//!
//! Handles the logic for establishing, caching, and using QUIC connections.
//! Gossip messages travel on unidirectional streams; the bootstrap handshake
//! is a single request/response exchange on a bidirectional stream.

use crate::{
    error::{Error, Result},
    transport::{Inbound, MAX_MESSAGE_SIZE},
    wire::{BootstrapRequest, Envelope, Message, WireMac},
};
use quinn::{Connection, Endpoint};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};

pub type ConnectionCache = Arc<Mutex<HashMap<SocketAddr, Connection>>>;

/// Establishes a connection to a peer and caches it.
pub async fn connect_to_peer(
    endpoint: Endpoint,
    connections: ConnectionCache,
    peer_addr: SocketAddr,
) -> Result<Connection> {
    let connecting = endpoint.connect(peer_addr, "repram").map_err(|e| match e {
        quinn::ConnectError::EndpointStopping => {
            Error::Transport("endpoint is stopping".to_string())
        }
        e => Error::ConnectFailed(peer_addr, e),
    })?;

    let conn = connecting
        .await
        .map_err(|e| Error::ConnectionEstablishFailed(peer_addr, e))?;

    tracing::debug!(peer = %peer_addr, "Connected to peer");
    connections.lock().await.insert(peer_addr, conn.clone());
    Ok(conn)
}

/// Gets a cached connection or creates a new one.
async fn get_or_create_connection(
    endpoint: Endpoint,
    connections: ConnectionCache,
    addr: SocketAddr,
) -> Result<Connection> {
    let mut conns_guard = connections.lock().await;
    if let Some(conn) = conns_guard.get(&addr) {
        if conn.close_reason().is_none() {
            return Ok(conn.clone());
        }
        // Connection is closed, remove it.
        conns_guard.remove(&addr);
    }
    drop(conns_guard);
    connect_to_peer(endpoint, connections, addr).await
}

/// Sends one framed gossip message on a fresh unidirectional stream.
pub async fn send_frame(
    endpoint: Endpoint,
    connections: ConnectionCache,
    addr: SocketAddr,
    frame: Vec<u8>,
) -> Result<()> {
    let conn = get_or_create_connection(endpoint, connections, addr).await?;
    let mut send_stream = conn.open_uni().await?;
    send_stream.write_all(&frame).await?;
    send_stream.finish().await?;
    tracing::trace!(peer = %addr, "Sent message");
    Ok(())
}

/// Writes a framed request on a bidirectional stream and reads back the
/// framed response.
pub async fn exchange_frame(
    endpoint: Endpoint,
    connections: ConnectionCache,
    addr: SocketAddr,
    frame: Vec<u8>,
) -> Result<Vec<u8>> {
    let conn = get_or_create_connection(endpoint, connections, addr).await?;
    let (mut send_stream, mut recv_stream) = conn.open_bi().await?;
    send_stream.write_all(&frame).await?;
    send_stream.finish().await?;
    Ok(recv_stream.read_to_end(MAX_MESSAGE_SIZE).await?)
}

/// Handles a single established QUIC connection, processing all incoming
/// streams until the connection closes.
pub async fn handle_connection(
    conn: quinn::Connecting,
    connections: ConnectionCache,
    inbound_tx: mpsc::Sender<Inbound>,
    mac: WireMac,
    stream_semaphore: Arc<Semaphore>,
) -> Result<()> {
    let connection = conn.await?;
    let peer_addr = connection.remote_address();
    tracing::debug!(peer = %peer_addr, "Accepted connection from peer");

    connections.lock().await.insert(peer_addr, connection.clone());

    loop {
        tokio::select! {
            stream = connection.accept_uni() => {
                match stream {
                    Ok(mut recv) => {
                        let inbound_tx = inbound_tx.clone();
                        let mac = mac.clone();
                        // `acquire_owned` ties the permit lifetime to the task.
                        let permit = match stream_semaphore.clone().acquire_owned().await {
                            Ok(p) => p,
                            Err(_) => {
                                tracing::warn!("Semaphore closed, cannot accept new streams.");
                                break Ok(());
                            }
                        };
                        tokio::spawn(async move {
                            match recv.read_to_end(MAX_MESSAGE_SIZE).await {
                                Ok(bytes) => match Envelope::open::<Message>(&bytes, &mac) {
                                    Ok(message) => {
                                        if inbound_tx.send(Inbound::Gossip(message)).await.is_err() {
                                            tracing::warn!("Inbound message channel is closed.");
                                        }
                                    }
                                    Err(Error::Forbidden) => {
                                        tracing::warn!(from = %peer_addr, "Rejected message with missing or invalid signature")
                                    }
                                    Err(e) => tracing::error!(from = %peer_addr, error = %e, "Failed to decode message"),
                                },
                                Err(e) => tracing::error!(from = %peer_addr, error = %e, "Failed to read from stream (potential DoS: exceeded size limit)"),
                            }
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        tracing::debug!(peer = %peer_addr, error = %e, "Stream acceptance failed");
                        break Ok(());
                    }
                }
            }
            stream = connection.accept_bi() => {
                match stream {
                    Ok((mut send, mut recv)) => {
                        let inbound_tx = inbound_tx.clone();
                        let mac = mac.clone();
                        let permit = match stream_semaphore.clone().acquire_owned().await {
                            Ok(p) => p,
                            Err(_) => {
                                tracing::warn!("Semaphore closed, cannot accept new streams.");
                                break Ok(());
                            }
                        };
                        tokio::spawn(async move {
                            if let Err(e) = serve_bootstrap(&mut send, &mut recv, inbound_tx, &mac).await {
                                match e {
                                    Error::Forbidden => tracing::warn!(from = %peer_addr, "Rejected bootstrap with missing or invalid signature"),
                                    e => tracing::debug!(from = %peer_addr, error = %e, "Bootstrap exchange failed"),
                                }
                            }
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        tracing::debug!(peer = %peer_addr, error = %e, "Stream acceptance failed");
                        break Ok(());
                    }
                }
            }
            reason = connection.closed() => {
                tracing::debug!(peer = %peer_addr, reason = %reason, "Connection closed");
                connections.lock().await.remove(&peer_addr);
                return Ok(());
            }
        }
    }
}

/// Seed side of the bootstrap handshake: decode and verify the request,
/// hand it upward, and write back whatever response comes out.
async fn serve_bootstrap(
    send: &mut quinn::SendStream,
    recv: &mut quinn::RecvStream,
    inbound_tx: mpsc::Sender<Inbound>,
    mac: &WireMac,
) -> Result<()> {
    let bytes = recv.read_to_end(MAX_MESSAGE_SIZE).await?;
    let request: BootstrapRequest = Envelope::open(&bytes, mac)?;

    let (reply_tx, reply_rx) = oneshot::channel();
    inbound_tx
        .send(Inbound::Bootstrap {
            request,
            reply: reply_tx,
        })
        .await
        .map_err(|_| Error::Shutdown)?;
    let response = reply_rx.await.map_err(|_| Error::Shutdown)?;

    let frame = Envelope::seal(&response, mac)?;
    send.write_all(&frame).await?;
    send.finish().await?;
    Ok(())
}
