//! Network listeners
//!
//! A listener accepts connections and hands the resulting byte stream to the
//! broker's session machine. TCP ships here; TLS/WebSocket front-ends plug in
//! through the same trait.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::broker::Broker;

/// A network listener feeding accepted connections into the broker.
#[async_trait]
pub trait Listener: Send + Sync {
    fn id(&self) -> &str;
    fn protocol(&self) -> &str;
    fn address(&self) -> String;

    /// Accept connections until closed, spawning a session per accept.
    async fn serve(&self, broker: Arc<Broker>);

    /// Stop accepting; live sessions are closed by the broker.
    fn close(&self);
}

/// Plain TCP listener.
pub struct TcpListener {
    id: String,
    local_addr: SocketAddr,
    inner: Mutex<Option<tokio::net::TcpListener>>,
    closed: Notify,
}

impl TcpListener {
    /// Bind eagerly so address errors surface before serving starts.
    pub async fn bind(id: impl Into<String>, addr: SocketAddr) -> std::io::Result<Self> {
        let inner = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            id: id.into(),
            local_addr,
            inner: Mutex::new(Some(inner)),
            closed: Notify::new(),
        })
    }

    /// The bound address, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Listener for TcpListener {
    fn id(&self) -> &str {
        &self.id
    }

    fn protocol(&self) -> &str {
        "tcp"
    }

    fn address(&self) -> String {
        self.local_addr.to_string()
    }

    async fn serve(&self, broker: Arc<Broker>) {
        let Some(listener) = self.inner.lock().take() else {
            return;
        };

        loop {
            tokio::select! {
                _ = self.closed.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(listener = %self.id, remote = %addr, "accepted connection");
                        let broker = broker.clone();
                        let listener_id = self.id.clone();
                        tokio::spawn(async move {
                            if let Err(e) = broker
                                .establish_connection(&listener_id, stream, addr)
                                .await
                            {
                                debug!(remote = %addr, error = %e, "connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        error!(listener = %self.id, error = %e, "accept failed");
                    }
                },
            }
        }
        debug!(listener = %self.id, "listener closed");
    }

    fn close(&self) {
        self.closed.notify_waiters();
        self.closed.notify_one();
    }
}
