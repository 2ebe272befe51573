use std::net::SocketAddr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::envelope::ChangeEnvelope;
use crate::hub::ChangeHub;

/// First line a client sends after connecting. An empty table list means
/// "stream every table".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscribeRequest {
    #[serde(default)]
    pub tables: Vec<String>,
}

/// Running TCP change-stream server. Shuts down when dropped.
pub struct ChangeServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ChangeServer {
    /// Bind a listener and start serving the hub's change stream. Bind to
    /// port 0 to let the OS pick a port, then read it back from
    /// [`ChangeServer::local_addr`].
    pub async fn bind(addr: SocketAddr, hub: ChangeHub) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind change server on {addr}"))?;
        let local_addr = listener
            .local_addr()
            .context("failed to read change server local address")?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        debug!("change server shutting down");
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                debug!(peer = %peer, "change client connected");
                                tokio::spawn(serve_client(stream, peer, hub.clone()));
                            }
                            Err(err) => {
                                warn!(error = %err, "failed to accept change client");
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for ChangeServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn serve_client(stream: TcpStream, peer: SocketAddr, hub: ChangeHub) {
    if let Err(err) = stream_changes(stream, &hub).await {
        debug!(peer = %peer, error = %err, "change client disconnected");
    }
}

async fn stream_changes(stream: TcpStream, hub: &ChangeHub) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let request: SubscribeRequest = match lines.next_line().await? {
        Some(line) => serde_json::from_str(&line).context("malformed subscribe request")?,
        None => return Ok(()),
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<ChangeEnvelope>();
    let ids: Vec<_> = if request.tables.is_empty() {
        let tx = tx.clone();
        vec![hub.subscribe_all(move |envelope| {
            let _ = tx.send(envelope.clone());
        })]
    } else {
        request
            .tables
            .iter()
            .map(|table| {
                let tx = tx.clone();
                hub.subscribe(table, move |envelope| {
                    let _ = tx.send(envelope.clone());
                })
            })
            .collect()
    };
    drop(tx);

    let result = async {
        loop {
            tokio::select! {
                // Clients are write-only after the subscribe line; reading to
                // EOF is how we notice a disconnect between publishes.
                next = lines.next_line() => {
                    match next? {
                        Some(_) => continue,
                        None => break,
                    }
                }
                received = rx.recv() => {
                    match received {
                        Some(envelope) => {
                            let mut line = envelope.to_line()?;
                            line.push('\n');
                            write_half.write_all(line.as_bytes()).await?;
                        }
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    for id in ids {
        hub.unsubscribe(id);
    }
    result
}
