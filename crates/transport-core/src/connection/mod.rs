//! Connections and the registry that owns them

mod connection;
mod events;
mod key;
mod registry;
mod stream;
#[cfg(feature = "tls")]
mod tls;
mod tuning;
mod udp;

pub use connection::{ConnectionLease, Direction, SipConnection, KEEPALIVE_PONG};
pub use events::{ChannelListener, ConnectionEvent, ConnectionEventListener, ListenerId};
pub use key::{BindingInfo, ConnectionKey};
pub use registry::{ConnectionRegistry, RegistryBuilder, RegistryStats};
#[cfg(feature = "tls")]
pub use tls::TlsContext;
pub use tuning::{NoopTuner, Socket2Tuner, SocketTuner};

pub(crate) use udp::spawn_datagram_reader;
