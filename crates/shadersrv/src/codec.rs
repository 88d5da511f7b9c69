//! Framed TCP codec.
//!
//! Requests arrive as an 8-byte size word followed by the payload. The low
//! 32 bits of the word carry the byte length; a non-zero high half means the
//! peer's native endianness differs from ours and the whole word must be
//! byte-swapped before use. The swap flag is remembered and applied to the
//! length field of the response frame.

use std::{
    net::Ipv4Addr,
    sync::atomic::{AtomicI64, Ordering},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time,
};
use tracing::debug;

use crate::{
    error::ServerError,
    protocol::{JobState, ProtocolVersion},
};

/// Frames above 1 MiB are rejected in both directions.
pub const MAX_FRAME_SIZE: u64 = 1024 * 1024;

const SEND_BLOCK: usize = 4 * 1024;
const RECV_BUDGET: Duration = Duration::from_secs(10);

static OPEN_SOCKETS: AtomicI64 = AtomicI64::new(0);

/// One TCP connection speaking the framed request/response protocol.
pub struct FramedStream {
    stream: TcpStream,
    swap_endian: bool,
    received: bool,
    sent: bool,
}

impl FramedStream {
    pub fn new(stream: TcpStream) -> Self {
        OPEN_SOCKETS.fetch_add(1, Ordering::SeqCst);
        FramedStream {
            stream,
            swap_endian: false,
            received: false,
            sent: false,
        }
    }

    /// Opens an outbound connection to a fallback peer.
    pub async fn connect(host: &str, port: u16) -> Result<Self, ServerError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| ServerError::PeerConnect {
                peer: format!("{host}:{port}"),
                source,
            })?;
        Ok(Self::new(stream))
    }

    /// Process-wide count of live framed sockets.
    pub fn open_socket_count() -> i64 {
        OPEN_SOCKETS.load(Ordering::SeqCst)
    }

    /// IPv4 address of the remote endpoint; 0.0.0.0 when unavailable.
    pub fn peer_ip(&self) -> Ipv4Addr {
        match self.stream.peer_addr() {
            Ok(std::net::SocketAddr::V4(addr)) => *addr.ip(),
            _ => Ipv4Addr::UNSPECIFIED,
        }
    }

    /// Receives one request frame. A peer that stalls past the receive
    /// budget, sends a zero or oversized length, or closes mid-frame
    /// invalidates the connection.
    pub async fn recv_frame(&mut self) -> Result<Vec<u8>, ServerError> {
        let result = time::timeout(RECV_BUDGET, self.recv_frame_inner()).await;
        match result {
            Ok(inner) => inner,
            Err(_) => Err(ServerError::RecvTimeout {
                budget: RECV_BUDGET,
            }),
        }
    }

    async fn recv_frame_inner(&mut self) -> Result<Vec<u8>, ServerError> {
        let mut word = [0u8; 8];
        self.stream
            .read_exact(&mut word)
            .await
            .map_err(|source| ServerError::SocketRead { source })?;

        let mut size = u64::from_le_bytes(word);
        self.swap_endian = (size >> 32) != 0;
        if self.swap_endian {
            size = size.swap_bytes();
        }

        if size == 0 || size > MAX_FRAME_SIZE {
            return Err(ServerError::InvalidFrameSize {
                size,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut payload = vec![0u8; size as usize];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|source| ServerError::SocketRead { source })?;

        self.received = true;
        Ok(payload)
    }

    /// Sends a response frame: 4-byte length, then (for V2+) the job state
    /// byte, then the payload. The length is byte-swapped when the request
    /// arrived with the foreign-endian flag set.
    pub async fn send_response(
        &mut self,
        payload: &[u8],
        state: JobState,
        version: ProtocolVersion,
    ) -> Result<(), ServerError> {
        let offset = if version.has_state_byte() { 5 } else { 4 };
        let mut frame = Vec::with_capacity(payload.len() + offset);

        let mut length = payload.len() as u32;
        if self.swap_endian {
            length = length.swap_bytes();
        }
        frame.extend_from_slice(&length.to_le_bytes());
        if version.has_state_byte() {
            frame.push(state.code());
        }
        frame.extend_from_slice(payload);

        self.send_chunked(&frame).await?;
        self.sent = true;
        Ok(())
    }

    /// Unframed text send, used by the Identify ping and the status page.
    pub async fn send_text(&mut self, text: &str) -> Result<(), ServerError> {
        self.send_chunked(text.as_bytes()).await?;
        self.sent = true;
        Ok(())
    }

    /// Relays a request to a fallback peer: 8-byte length word + payload.
    pub async fn forward(&mut self, payload: &[u8]) -> Result<(), ServerError> {
        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        frame.extend_from_slice(payload);
        self.send_chunked(&frame).await?;
        self.sent = true;
        Ok(())
    }

    /// Reads the peer's reply to a forwarded request: 4-byte length, then
    /// that many bytes (state byte and body included).
    pub async fn backward(&mut self) -> Result<Vec<u8>, ServerError> {
        let mut word = [0u8; 4];
        self.stream
            .read_exact(&mut word)
            .await
            .map_err(|source| ServerError::SocketRead { source })?;
        let size = u32::from_le_bytes(word) as u64;
        if size > MAX_FRAME_SIZE {
            return Err(ServerError::InvalidFrameSize {
                size,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut payload = vec![0u8; size as usize];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|source| ServerError::SocketRead { source })?;
        self.received = true;
        Ok(payload)
    }

    async fn send_chunked(&mut self, data: &[u8]) -> Result<(), ServerError> {
        for block in data.chunks(SEND_BLOCK) {
            self.stream
                .write_all(block)
                .await
                .map_err(|source| ServerError::SocketWrite { source })?;
        }
        self.stream
            .flush()
            .await
            .map_err(|source| ServerError::SocketWrite { source })
    }
}

impl Drop for FramedStream {
    fn drop(&mut self) {
        OPEN_SOCKETS.fetch_sub(1, Ordering::SeqCst);
        if !self.received || !self.sent {
            debug!(
                received = self.received,
                sent = self.sent,
                "closing socket before a full request/response exchange"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, FramedStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, FramedStream::new(server))
    }

    #[tokio::test]
    async fn recv_then_send_round_trips_payload() {
        let (mut client, mut server) = socket_pair().await;

        let payload = b"<R Version=\"2.1\" JobType=\"Compile\"/>".to_vec();
        let mut frame = (payload.len() as u64).to_le_bytes().to_vec();
        frame.extend_from_slice(&payload);
        client.write_all(&frame).await.unwrap();

        let received = server.recv_frame().await.unwrap();
        assert_eq!(received, payload);

        server
            .send_response(&received, JobState::Done, ProtocolVersion::V2_1)
            .await
            .unwrap();

        let mut length = [0u8; 4];
        client.read_exact(&mut length).await.unwrap();
        assert_eq!(u32::from_le_bytes(length) as usize, payload.len());
        let mut state = [0u8; 1];
        client.read_exact(&mut state).await.unwrap();
        assert_eq!(state[0], JobState::Done.code());
        let mut body = vec![0u8; payload.len()];
        client.read_exact(&mut body).await.unwrap();
        assert_eq!(body, payload);
    }

    #[tokio::test]
    async fn v1_response_has_no_state_byte() {
        let (mut client, mut server) = socket_pair().await;

        let payload = b"abc".to_vec();
        let mut frame = (payload.len() as u64).to_le_bytes().to_vec();
        frame.extend_from_slice(&payload);
        client.write_all(&frame).await.unwrap();
        server.recv_frame().await.unwrap();

        server
            .send_response(b"xyz", JobState::Done, ProtocolVersion::V1)
            .await
            .unwrap();

        let mut reply = [0u8; 7];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &3u32.to_le_bytes());
        assert_eq!(&reply[4..], b"xyz");
    }

    #[tokio::test]
    async fn foreign_endian_size_word_is_swapped_both_ways() {
        let (mut client, mut server) = socket_pair().await;

        let payload = b"swapped".to_vec();
        let word = (payload.len() as u64).to_be_bytes();
        client.write_all(&word).await.unwrap();
        client.write_all(&payload).await.unwrap();

        let received = server.recv_frame().await.unwrap();
        assert_eq!(received, payload);

        server
            .send_response(b"ok", JobState::Done, ProtocolVersion::V2)
            .await
            .unwrap();

        let mut length = [0u8; 4];
        client.read_exact(&mut length).await.unwrap();
        assert_eq!(u32::from_be_bytes(length), 2);
    }

    #[tokio::test]
    async fn zero_and_oversized_frames_are_rejected() {
        let (mut client, mut server) = socket_pair().await;
        client.write_all(&0u64.to_le_bytes()).await.unwrap();
        assert!(matches!(
            server.recv_frame().await,
            Err(ServerError::InvalidFrameSize { size: 0, .. })
        ));

        let (mut client, mut server) = socket_pair().await;
        client
            .write_all(&(MAX_FRAME_SIZE + 1).to_le_bytes())
            .await
            .unwrap();
        assert!(matches!(
            server.recv_frame().await,
            Err(ServerError::InvalidFrameSize { .. })
        ));
    }

    #[tokio::test]
    async fn forward_backward_peer_framing() {
        let (mut peer, mut local) = socket_pair().await;

        local.forward(b"relayed request").await.unwrap();
        let mut word = [0u8; 8];
        peer.read_exact(&mut word).await.unwrap();
        assert_eq!(u64::from_le_bytes(word), 15);
        let mut body = [0u8; 15];
        peer.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"relayed request");

        let reply = b"\x01compiled";
        peer.write_all(&(reply.len() as u32).to_le_bytes())
            .await
            .unwrap();
        peer.write_all(reply).await.unwrap();
        assert_eq!(local.backward().await.unwrap(), reply);
    }
}
