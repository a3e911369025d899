//! Client-side multiplexing tunnel proxy: dials a broker over an outer
//! HTTP(S) transport (optionally through an HTTP CONNECT proxy) and carries
//! a framed sub-protocol that multiplexes local TCP connections across it.

pub mod channel;
pub mod dispatch;
pub mod error;
pub mod framer;
pub mod listener;
pub mod message;
pub mod proxy_resolve;
pub mod replay;
pub mod session;
pub mod transport;
pub mod url;

pub use channel::{ChannelState, ChannelTable, CloseReason};
pub use error::{reason_string, DisconnectCause, TunnelError};
pub use framer::Framer;
pub use listener::{AcceptedConnection, ListenerTable};
pub use message::{FramedMessage, MessageType};
pub use proxy_resolve::ProxyUrl;
pub use replay::ReplayBuffer;
pub use session::{Session, SessionConfig, SessionEvent, SessionPhase};
pub use transport::Transport;
pub use url::ServerUrl;
