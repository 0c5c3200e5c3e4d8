//! Listening sockets
//!
//! A [`UdpListener`] reads datagrams off one bound socket and lends that
//! socket to the registry for outbound UDP. A [`StreamListener`] accepts TCP
//! or TLS connections and registers each one as an incoming connection.

mod stream;
mod udp;

pub use stream::StreamListener;
pub use udp::UdpListener;
