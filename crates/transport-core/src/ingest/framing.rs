//! Message framing for stream transports
//!
//! SIP over TCP/TLS carries back-to-back messages; the boundary is the blank
//! line after the headers plus `Content-Length` body bytes. Between messages
//! a peer may send RFC 5626 keepalives:
//!
//! ```text
//! CRLF CRLF   ping  -> yielded as an empty frame
//! CRLF        pong  -> discarded
//! ```

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::{Error, Result};

const PING: &[u8] = b"\r\n\r\n";
const CRLF: &[u8] = b"\r\n";

/// Largest message accepted by default
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65_535;

/// Splits a SIP byte stream into messages
#[derive(Debug, Clone)]
pub struct SipStreamFramer {
    max_message_size: usize,
}

impl SipStreamFramer {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Default for SipStreamFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(PING.len()).position(|w| w == PING)
}

/// `Content-Length` (or compact `l`) from a header block; absent means 0
fn content_length(headers: &[u8]) -> Result<usize> {
    for line in headers.split(|&b| b == b'\n') {
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let name = String::from_utf8_lossy(&line[..colon]);
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            let value = String::from_utf8_lossy(&line[colon + 1..]);
            return value
                .trim()
                .parse()
                .map_err(|_| Error::Framing(format!("invalid Content-Length: {}", value.trim())));
        }
    }
    Ok(0)
}

impl Decoder for SipStreamFramer {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        loop {
            if src.starts_with(PING) {
                src.advance(PING.len());
                return Ok(Some(Bytes::new()));
            }
            if src.starts_with(CRLF) {
                if src.len() < PING.len() && PING.starts_with(&src[..]) {
                    // Could still become a ping
                    return Ok(None);
                }
                src.advance(CRLF.len());
                continue;
            }
            break;
        }

        if src.is_empty() {
            return Ok(None);
        }

        let Some(end) = find_header_end(&src[..]) else {
            if src.len() > self.max_message_size {
                return Err(Error::Framing(format!(
                    "no header terminator within {} bytes",
                    self.max_message_size
                )));
            }
            return Ok(None);
        };

        let header_len = end + PING.len();
        let total = header_len + content_length(&src[..end])?;
        if total > self.max_message_size {
            return Err(Error::Framing(format!(
                "message of {} bytes exceeds limit of {}",
                total, self.max_message_size
            )));
        }

        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        Ok(Some(src.split_to(total).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPTIONS: &str = "OPTIONS sip:a@example.com SIP/2.0\r\nCall-ID: 1\r\nContent-Length: 0\r\n\r\n";

    #[test]
    fn test_splits_back_to_back_messages() {
        let body_msg = "MESSAGE sip:a@example.com SIP/2.0\r\nl: 5\r\n\r\nhello";
        let mut buf = BytesMut::from(format!("{}{}", OPTIONS, body_msg).as_str());
        let mut framer = SipStreamFramer::default();

        assert_eq!(framer.decode(&mut buf).unwrap().unwrap(), OPTIONS.as_bytes());
        assert_eq!(framer.decode(&mut buf).unwrap().unwrap(), body_msg.as_bytes());
        assert!(framer.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_waits_for_body() {
        let mut buf = BytesMut::from("INFO sip:a SIP/2.0\r\nContent-Length: 10\r\n\r\n12345");
        let mut framer = SipStreamFramer::default();
        assert!(framer.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"67890");
        let frame = framer.decode(&mut buf).unwrap().unwrap();
        assert!(frame.ends_with(b"1234567890"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_keepalive_ping_and_pong() {
        let mut framer = SipStreamFramer::default();

        let mut buf = BytesMut::from("\r\n\r\n");
        assert_eq!(framer.decode(&mut buf).unwrap(), Some(Bytes::new()));

        let mut buf = BytesMut::from("\r\n");
        assert!(framer.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(OPTIONS.as_bytes());
        assert_eq!(framer.decode(&mut buf).unwrap().unwrap(), OPTIONS.as_bytes());
    }

    #[test]
    fn test_oversized_and_invalid_rejected() {
        let mut framer = SipStreamFramer::new(64);
        let mut buf = BytesMut::from("MESSAGE sip:a SIP/2.0\r\nContent-Length: 500\r\n\r\n");
        assert!(matches!(framer.decode(&mut buf), Err(Error::Framing(_))));

        let mut framer = SipStreamFramer::default();
        let mut buf = BytesMut::from("MESSAGE sip:a SIP/2.0\r\nContent-Length: many\r\n\r\n");
        assert!(matches!(framer.decode(&mut buf), Err(Error::Framing(_))));
    }
}
