//! Thin wrapper binary: reads a server URL from the command line and a
//! connection id from standard input, then runs a tunnel session to
//! completion, printing `TUNNEL DISCONNECT: <reason>` to stderr on anything
//! other than a graceful close.

use std::io::BufRead;
use std::net::IpAddr;

use clap::Parser;
use mimalloc::MiMalloc;

use vtunnel::{reason_string, DisconnectCause, Session, SessionConfig, SessionEvent, TunnelError};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "vtunnel")]
#[command(about = "Client-side multiplexing tunnel proxy for desktop-broker HTTP transports")]
struct Cli {
    /// Broker URL, e.g. https://broker.example.com:8443/tunnel
    server_url: String,

    /// PEM file of additional trusted CA certificates for the outer TLS handshake.
    #[arg(long, env = "VTUNNEL_CA_PATH")]
    ca_path: Option<String>,

    /// Opaque authenticator blob passed through to the broker's AUTHENTICATE step.
    #[arg(long, env = "VTUNNEL_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Non-loopback address a peer-announced listener may bind (repeatable).
    #[arg(long = "allow-bind")]
    allow_bind: Vec<IpAddr>,

    /// Rewrite a peer-announced bind address of the literal `localhost` to
    /// `127.0.0.1` (spec.md §6, §9): some remote-desktop clients only bind
    /// their IPv4 loopback.
    #[arg(long, default_value_t = true)]
    rewrite_localhost: bool,
}

fn main() -> std::process::ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut connection_id = String::new();
    if let Err(e) = std::io::stdin().lock().read_line(&mut connection_id) {
        eprintln!("vtunnel: failed to read connection id from stdin: {e}");
        return std::process::ExitCode::from(2);
    }
    let connection_id = connection_id.trim_end_matches(['\n', '\r']).to_string();

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("vtunnel: failed to start async runtime: {e}");
            return std::process::ExitCode::from(2);
        }
    };

    runtime.block_on(run(cli, connection_id))
}

async fn run(cli: Cli, connection_id: String) -> std::process::ExitCode {
    let config = SessionConfig {
        server_url: cli.server_url,
        connection_id,
        ca_path: cli.ca_path,
        allow_bind_addresses: cli.allow_bind,
        auth_token: cli.auth_token.map(String::into_bytes),
        rewrite_localhost: cli.rewrite_localhost,
    };

    let (session, mut events_rx) = Session::create(config);
    let session = std::sync::Arc::new(session);

    let (ctrlc_tx, mut ctrlc_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send(());
    }) {
        eprintln!("vtunnel: failed to install Ctrl-C handler: {e}");
        return std::process::ExitCode::from(2);
    }

    let cancel_session = session.clone();
    tokio::spawn(async move {
        if ctrlc_rx.recv().await.is_some() {
            log::info!("vtunnel: Ctrl-C received, cancelling session");
            cancel_session.cancel().await;
        }
    });

    let handle = session.start();

    let cause = loop {
        match events_rx.recv().await {
            Some(SessionEvent::ListenerAnnounced { port, name }) => {
                log::info!("vtunnel: listener '{name}' ready on 127.0.0.1:{port}");
            }
            Some(SessionEvent::ListenerClosed { port }) => {
                log::info!("vtunnel: listener on port {port} closed");
            }
            Some(SessionEvent::Disconnected(cause)) => break cause,
            None => break DisconnectCause::Graceful,
        }
    };
    let _ = handle.await;

    match cause {
        DisconnectCause::Graceful => std::process::ExitCode::from(0),
        DisconnectCause::Error(TunnelError::ClientCancel) => std::process::ExitCode::from(0),
        DisconnectCause::Error(ref e) => {
            eprintln!("TUNNEL DISCONNECT: {}", reason_string(e));
            std::process::ExitCode::from(1)
        }
    }
}
