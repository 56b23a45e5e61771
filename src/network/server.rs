//! Network Server
//!
//! TCP server for accepting connections from other nodes.

use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::{read_message, write_message, Message};
use crate::error::{Error, Result};

/// Answers requests arriving on a connection
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one request; `None` sends no response
    async fn handle(&self, peer_addr: &str, message: Message) -> Option<Message>;
}

/// Network server for node-to-node communication
pub struct NetworkServer {
    /// Bind address
    bind_address: String,
    /// Message handler
    handler: Arc<dyn MessageHandler>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl NetworkServer {
    /// Create a new network server
    pub fn new(bind_address: String, handler: Arc<dyn MessageHandler>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            bind_address,
            handler,
            shutdown: shutdown_tx,
        }
    }

    /// Bind the listener and accept connections on a background task.
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Network server listening on {}", local_addr);

        let handler = Arc::clone(&self.handler);
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((socket, addr)) => {
                                let peer_addr = addr.to_string();
                                let handler = Arc::clone(&handler);
                                let shutdown_rx = shutdown_rx.clone();

                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(socket, &peer_addr, handler, shutdown_rx).await {
                                        tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Network server on {} stopped", local_addr);
        });

        Ok(local_addr)
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handle a single connection
async fn handle_connection(
    socket: TcpStream,
    peer_addr: &str,
    handler: Arc<dyn MessageHandler>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let message = tokio::select! {
            result = read_message(&mut reader) => result,
            _ = shutdown_rx.changed() => break,
        };

        match message {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);

                if let Some(response) = handler.handle(peer_addr, message).await {
                    write_message(&mut writer, &response).await?;
                }
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading message from {}: {}", peer_addr, e);
                break;
            }
        }
    }

    Ok(())
}
