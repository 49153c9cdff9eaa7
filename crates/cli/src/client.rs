//! Daemon client

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use testscope_common::{ClientCommand, RelayMessage, RunRequest};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use url::Url;

/// `/health` response
#[derive(Debug, Clone, Deserialize)]
pub struct Health {
    pub status: String,
    pub version: String,
    pub clients: usize,
    pub session: Option<String>,
}

/// Client for communicating with the Testscope daemon
pub struct DaemonClient {
    base: Url,
}

impl DaemonClient {
    /// Create a new daemon client for `addr` (`http://host:port`)
    pub fn new(addr: &str) -> Result<Self> {
        let base = Url::parse(addr).with_context(|| format!("invalid daemon address {}", addr))?;
        match base.scheme() {
            "http" | "https" => Ok(Self { base }),
            other => Err(anyhow!("unsupported scheme {} in {}", other, addr)),
        }
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    /// WebSocket address of the relay
    pub fn relay_url(&self) -> Result<Url> {
        let mut url = self.base.clone();
        let scheme = if self.base.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot derive relay url from {}", self.base))?;
        url.set_path("/ws");
        Ok(url)
    }

    /// Check if the daemon is healthy
    pub async fn health(&self) -> Result<Health> {
        let url = self.base.join("/health")?;
        let health = reqwest::get(url).await?.error_for_status()?.json().await?;
        Ok(health)
    }

    /// Open the relay socket
    pub async fn connect(&self) -> Result<RelaySocket> {
        let url = self.relay_url()?;
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .with_context(|| format!("cannot connect to {}", url))?;
        debug!("Connected to {}", url);
        Ok(RelaySocket { stream })
    }
}

/// Open relay connection
pub struct RelaySocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RelaySocket {
    /// Ask the daemon to start a run
    pub async fn send_run(&mut self, request: &RunRequest) -> Result<()> {
        let text = serde_json::to_string(&ClientCommand::Run(request.clone()))?;
        trace!("-> {}", text);
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Next relay message; `None` once the daemon hangs up.
    ///
    /// Frames that do not parse are skipped.
    pub async fn next_message(&mut self) -> Result<Option<RelayMessage>> {
        while let Some(frame) = self.stream.next().await {
            match frame? {
                Message::Text(text) => match serde_json::from_str(&text) {
                    Ok(message) => return Ok(Some(message)),
                    Err(e) => debug!("Skipping unreadable frame: {}", e),
                },
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }

    pub async fn close(mut self) -> Result<()> {
        self.stream.close(None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_url() {
        let client = DaemonClient::new("http://127.0.0.1:51205").unwrap();
        assert_eq!(client.relay_url().unwrap().as_str(), "ws://127.0.0.1:51205/ws");

        let client = DaemonClient::new("https://tests.local/ui").unwrap();
        assert_eq!(client.relay_url().unwrap().as_str(), "wss://tests.local/ws");
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert!(DaemonClient::new("ftp://host").is_err());
        assert!(DaemonClient::new("not a url").is_err());
    }
}
