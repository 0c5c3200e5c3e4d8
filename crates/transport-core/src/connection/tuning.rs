use std::io;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpStream, UdpSocket};

/// Hook applied to every socket the registry opens or accepts
///
/// An error is logged by the caller and the socket is used untuned.
pub trait SocketTuner: Send + Sync {
    fn tune_stream(&self, stream: &TcpStream) -> io::Result<()>;

    fn tune_datagram(&self, socket: &UdpSocket) -> io::Result<()>;
}

/// Leaves sockets at OS defaults
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTuner;

impl SocketTuner for NoopTuner {
    fn tune_stream(&self, _stream: &TcpStream) -> io::Result<()> {
        Ok(())
    }

    fn tune_datagram(&self, _socket: &UdpSocket) -> io::Result<()> {
        Ok(())
    }
}

/// Socket options set through socket2
#[derive(Debug, Clone)]
pub struct Socket2Tuner {
    pub nodelay: bool,
    /// Idle time before TCP keepalive probes start; `None` leaves keepalive off
    pub keepalive: Option<Duration>,
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
}

impl Default for Socket2Tuner {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: Some(Duration::from_secs(60)),
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

impl SocketTuner for Socket2Tuner {
    fn tune_stream(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        let socket = SockRef::from(stream);
        if let Some(idle) = self.keepalive {
            socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        Ok(())
    }

    fn tune_datagram(&self, socket: &UdpSocket) -> io::Result<()> {
        let socket = SockRef::from(socket);
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        Ok(())
    }
}
