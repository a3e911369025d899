//! Local TCP listeners announced by the peer (spec.md §3, §4.5).
//!
//! Grounded on `socket/server.rs`'s `SocketServer::start`/`accept_loop`
//! (bind, spawn an accept loop, announce each accepted connection upstream
//! through a channel), translated from a Unix-domain IPC socket to a
//! loopback TCP listener.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::TunnelError;

/// Announced listener: binds `bind_addr:port`, and on accept, reports the
/// new connection to the session loop (which allocates a channel and sends
/// CHANNEL_OPEN).
#[derive(Debug)]
pub struct Listener {
    /// Port announced by, and bound to match, the peer.
    pub port: u16,
    /// Symbolic name from the LISTEN announcement (for logging/UI only).
    pub name: String,
    /// Target host/port this listener's channels should open toward at the
    /// broker end.
    pub target_host: String,
    pub target_port: u16,
    accept_task: JoinHandle<()>,
}

/// One accepted local connection, handed from the accept loop to the session.
#[derive(Debug)]
pub struct AcceptedConnection {
    pub port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub socket: TcpStream,
    pub peer_addr: SocketAddr,
}

impl Listener {
    /// Bind and start accepting on `bind_addr:port`.
    ///
    /// Per spec.md §4.5, `bind_addr` must be loopback unless the embedder has
    /// explicitly allow-listed a non-loopback address; that policy check
    /// happens in [`ListenerTable::announce`], not here.
    async fn start(
        port: u16,
        bind_addr: IpAddr,
        name: String,
        target_host: String,
        target_port: u16,
        accepted_tx: mpsc::UnboundedSender<AcceptedConnection>,
    ) -> Result<Self, TunnelError> {
        let listener = TcpListener::bind(SocketAddr::new(bind_addr, port))
            .await
            .map_err(TunnelError::Io)?;

        log::info!("listener: bound port {port} ({name}) -> {target_host}:{target_port}");

        let th = target_host.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer_addr)) => {
                        let _ = socket.set_nodelay(true);
                        let conn = AcceptedConnection {
                            port,
                            target_host: th.clone(),
                            target_port,
                            socket,
                            peer_addr,
                        };
                        if accepted_tx.send(conn).is_err() {
                            break; // session loop gone
                        }
                    }
                    Err(e) => {
                        log::warn!("listener: accept error on port {port}: {e}");
                    }
                }
            }
        });

        Ok(Self {
            port,
            name,
            target_host,
            target_port,
            accept_task,
        })
    }

    /// Stop accepting new connections on this listener (spec.md §4.5:
    /// LISTEN_CLOSE affects only new connections; existing channels are
    /// unaffected since they own their own sockets already).
    fn stop(self) {
        self.accept_task.abort();
    }
}

/// Set of listeners announced by the peer, keyed by local port.
#[derive(Debug)]
pub struct ListenerTable {
    listeners: std::collections::HashMap<u16, Listener>,
    /// Non-loopback bind addresses this embedder has explicitly allowed.
    allow_list: Vec<IpAddr>,
    /// Whether the textual literal `localhost` is rewritten to `127.0.0.1`
    /// (spec.md §6, §9 Open Question 2): some remote-desktop clients bind
    /// only to the IPv4 loopback, so the original client rewrote
    /// unconditionally. Kept as an explicit, documented, default-on flag
    /// rather than hardcoded, per the spec's own resolution of that question.
    rewrite_localhost: bool,
}

impl Default for ListenerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: std::collections::HashMap::new(),
            allow_list: Vec::new(),
            rewrite_localhost: true,
        }
    }

    /// Permit binding a specific non-loopback address (embedder opt-in).
    pub fn allow_bind_address(&mut self, addr: IpAddr) {
        self.allow_list.push(addr);
    }

    /// Override the default `localhost` -> `127.0.0.1` rewrite (spec.md §6, §9).
    pub fn set_rewrite_localhost(&mut self, rewrite: bool) {
        self.rewrite_localhost = rewrite;
    }

    fn resolve_bind_addr(&self, requested: &str) -> Result<IpAddr, TunnelError> {
        let addr: IpAddr = if self.rewrite_localhost && requested.eq_ignore_ascii_case("localhost") {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            requested
                .parse()
                .map_err(|_| TunnelError::ProtocolViolation(format!("bad bind address {requested}")))?
        };
        if !addr.is_loopback() && !self.allow_list.contains(&addr) {
            return Err(TunnelError::ProtocolViolation(format!(
                "non-loopback bind address {addr} not in allow-list"
            )));
        }
        Ok(addr)
    }

    /// Handle a LISTEN announcement: bind and start accepting.
    pub async fn announce(
        &mut self,
        port: u16,
        bind_addr: &str,
        name: String,
        target_host: String,
        target_port: u16,
        accepted_tx: mpsc::UnboundedSender<AcceptedConnection>,
    ) -> Result<(), TunnelError> {
        let addr = self.resolve_bind_addr(bind_addr)?;
        let listener =
            Listener::start(port, addr, name, target_host, target_port, accepted_tx).await?;
        self.listeners.insert(port, listener);
        Ok(())
    }

    /// Handle a LISTEN_CLOSE: stop accepting new connections on `port`.
    pub fn close(&mut self, port: u16) {
        if let Some(listener) = self.listeners.remove(&port) {
            listener.stop();
        }
    }

    /// Tear down every listener (session shutdown).
    pub fn close_all(&mut self) {
        for (_, listener) in self.listeners.drain() {
            listener.stop();
        }
    }

    #[must_use]
    pub fn is_announced(&self, port: u16) -> bool {
        self.listeners.contains_key(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_loopback_without_allow_list() {
        let table = ListenerTable::new();
        let err = table.resolve_bind_addr("10.0.0.5").unwrap_err();
        assert!(matches!(err, TunnelError::ProtocolViolation(_)));
    }

    #[test]
    fn rewrites_localhost_literal_to_ipv4_loopback() {
        let table = ListenerTable::new();
        let addr = table.resolve_bind_addr("localhost").unwrap();
        assert_eq!(addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn localhost_rewrite_can_be_disabled() {
        let mut table = ListenerTable::new();
        table.set_rewrite_localhost(false);
        let err = table.resolve_bind_addr("localhost").unwrap_err();
        assert!(matches!(err, TunnelError::ProtocolViolation(_)));
    }

    #[test]
    fn allow_listed_non_loopback_is_permitted() {
        let mut table = ListenerTable::new();
        let addr: IpAddr = "10.0.0.5".parse().unwrap();
        table.allow_bind_address(addr);
        assert_eq!(table.resolve_bind_addr("10.0.0.5").unwrap(), addr);
    }

    #[tokio::test]
    async fn announce_and_close_round_trip() {
        let mut table = ListenerTable::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        table
            .announce(0, "127.0.0.1", "test".into(), "backend".into(), 3389, tx)
            .await
            .unwrap();
        // port 0 means OS-assigned; can't assert on it directly here, but the
        // announce call should at least succeed without an allow-list entry
        // since 127.0.0.1 is loopback.
    }
}
