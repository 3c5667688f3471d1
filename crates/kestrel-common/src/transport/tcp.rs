use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::{RpcRequest, RpcResponse, TransportError};
use crate::transport::codec::{Codec, MAX_MESSAGE_SIZE};

/// Async TCP transport for Kestrel.
///
/// # Wire Protocol
///
/// Messages are sent with a 4-byte length prefix (big-endian u32) followed
/// by the encoded envelope (format tag + body):
///
/// ```text
/// [4-byte length] [1-byte tag] [body]
/// ```
///
/// Every operation is bounded by the transport's timeout; an expired timer
/// surfaces as [`TransportError::Timeout`].
///
/// # Example
///
/// ```no_run
/// use kestrel_common::transport::{Codec, TcpTransportAsync};
/// use kestrel_common::protocol::RpcRequest;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = TcpTransportAsync::new(Duration::from_secs(5));
/// let mut stream = transport.connect("127.0.0.1:8080").await?;
///
/// let request = RpcRequest::builder("UserService", "getUser").param(&1u64)?.build();
/// let response = transport.send_request(&mut stream, &Codec::json(), &request).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TcpTransportAsync {
    timeout: Duration,
}

impl TcpTransportAsync {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    /// Connects to a remote endpoint.
    ///
    /// Resolution and each connect attempt share the transport timeout. When
    /// the address resolves to several socket addresses they are tried in
    /// order until one accepts.
    pub async fn connect(&self, addr: &str) -> Result<TcpStream, TransportError> {
        let timeout_ms = self.timeout_ms();
        let socket_addrs = tokio::time::timeout(self.timeout, tokio::net::lookup_host(addr))
            .await
            .map_err(|_| TransportError::Timeout(timeout_ms))?
            .map_err(|e| TransportError::ConnectionRefused(format!("Invalid address '{}': {}", addr, e)))?;

        let mut last_err = None;
        for socket_addr in socket_addrs {
            match tokio::time::timeout(self.timeout, TcpStream::connect(socket_addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Ok(Err(e)) => last_err = Some(TransportError::from_io(e, "connecting", timeout_ms)),
                Err(_) => last_err = Some(TransportError::Timeout(timeout_ms)),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            TransportError::ConnectionRefused(format!("No addresses resolved for {}", addr))
        }))
    }

    /// Sends an already-encoded envelope and returns the raw reply envelope.
    pub async fn round_trip(&self, stream: &mut TcpStream, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        let timeout_ms = self.timeout_ms();
        tokio::time::timeout(self.timeout, async {
            send_message(stream, payload).await?;
            receive_message(stream).await
        })
        .await
        .map_err(|_| TransportError::Timeout(timeout_ms))?
    }

    /// Encodes `request`, sends it and decodes the reply.
    pub async fn send_request(
        &self,
        stream: &mut TcpStream,
        codec: &Codec,
        request: &RpcRequest,
    ) -> Result<RpcResponse, TransportError> {
        let encoded = codec.encode_request(request)?;
        let reply = self.round_trip(stream, &encoded).await?;
        Codec::decode_response(&reply)
    }
}

impl Default for TcpTransportAsync {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Writes one frame: `[4-byte length as u32 big-endian] + [data]`.
pub async fn send_message<W>(stream: &mut W, data: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: data.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let len = data.len() as u32;
    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| TransportError::from_io(e, "writing length prefix", 0))?;
    stream
        .write_all(data)
        .await
        .map_err(|e| TransportError::from_io(e, "writing data", 0))?;
    stream
        .flush()
        .await
        .map_err(|e| TransportError::from_io(e, "flushing stream", 0))?;

    Ok(())
}

/// Reads one frame.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly before a
/// new frame started.
pub async fn try_receive_message<R>(stream: &mut R) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TransportError::from_io(e, "reading length prefix", 0)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    // Validate length to prevent allocation of excessively large buffers
    if len > MAX_MESSAGE_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| TransportError::from_io(e, "reading data", 0))?;

    Ok(Some(buf))
}

/// Reads one frame, treating a closed connection as an error.
pub async fn receive_message<R>(stream: &mut R) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    try_receive_message(stream)
        .await?
        .ok_or_else(|| TransportError::Closed("peer closed the connection".to_string()))
}
