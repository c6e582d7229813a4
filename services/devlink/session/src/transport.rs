//! Prompt-terminated byte transports over TCP and TLS.
//!
//! [`Transport`] is the byte-stream contract sessions drive: bounded writes,
//! bounded reads up to the first of a set of sentinel strings, and close.
//! [`StreamTransport`] implements it over plain TCP (telnet-style devices) or,
//! with the `tls` feature, over a TLS client stream.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::TransportError;

/// Byte-stream conversation with a prompt-driven device
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write `buf` within the per-call write deadline.
    ///
    /// Returns the number of bytes written; a write interrupted part-way
    /// reports the count in [`TransportError::PartialWrite`].
    async fn send(&self, buf: &[u8]) -> Result<usize, TransportError>;

    /// Same as [`Transport::send`] but the payload never reaches the logs
    async fn send_sensitive(&self, buf: &[u8]) -> Result<usize, TransportError>;

    /// Read until the input ends with any of the `expected` sentinels.
    ///
    /// Returns everything read, sentinel included. An empty sentinel matches
    /// immediately and yields an empty buffer. The deadline covers the whole
    /// call.
    async fn read_until(&self, expected: &[&[u8]]) -> Result<Bytes, TransportError>;

    /// Close the transport; later calls report [`TransportError::Closed`]
    async fn close(&self) -> Result<(), TransportError>;
}

/// Unified stream type that can be either plain TCP or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS client stream
    #[cfg(feature = "tls")]
    TlsClient(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// TLS protocol version accepted by [`dial_tls`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    /// TLS 1.0.
    ///
    /// Accepted so configurations naming it still parse, but rustls does not
    /// implement TLS 1.0: `dial_tls` with this version always fails with
    /// [`TransportError::UnsupportedTlsVersion`].
    V1_0,
    /// TLS 1.2
    V1_2,
}

impl FromStr for TlsVersion {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1.0" => Ok(TlsVersion::V1_0),
            "1.2" => Ok(TlsVersion::V1_2),
            other => Err(TransportError::UnsupportedTlsVersion(other.to_string())),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsVersion::V1_0 => write!(f, "1.0"),
            TlsVersion::V1_2 => write!(f, "1.2"),
        }
    }
}

/// [`Transport`] over a buffered TCP or TLS stream with a fixed per-call timeout
pub struct StreamTransport {
    peer: String,
    timeout: Duration,
    stream: Mutex<BufReader<IoStream>>,
    closed: AtomicBool,
}

impl StreamTransport {
    /// Wrap an established stream; `timeout` bounds every call
    pub fn new(stream: IoStream, peer: impl Into<String>, timeout: Duration) -> Self {
        Self {
            peer: peer.into(),
            timeout,
            stream: Mutex::new(BufReader::new(stream)),
            closed: AtomicBool::new(false),
        }
    }

    /// Address this transport was dialled to
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Whether [`Transport::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn write_bytes(&self, buf: &[u8]) -> Result<usize, TransportError> {
        self.ensure_open()?;
        let mut stream = self.stream.lock().await;
        let mut written = 0;

        let result = timeout(self.timeout, async {
            let writer = stream.get_mut();
            while written < buf.len() {
                let n = writer.write(&buf[written..]).await?;
                if n == 0 {
                    return Err(io::Error::from(io::ErrorKind::WriteZero));
                }
                written += n;
            }
            writer.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(written),
            Ok(Err(source)) if written > 0 => Err(TransportError::PartialWrite { written, source }),
            Ok(Err(e)) => Err(e.into()),
            Err(_) if written > 0 => Err(TransportError::PartialWrite {
                written,
                source: io::ErrorKind::TimedOut.into(),
            }),
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn send(&self, buf: &[u8]) -> Result<usize, TransportError> {
        debug!("Sending to {}: {:?}", self.peer, String::from_utf8_lossy(buf));
        self.write_bytes(buf).await
    }

    async fn send_sensitive(&self, buf: &[u8]) -> Result<usize, TransportError> {
        debug!("Sending {} redacted bytes to {}", buf.len(), self.peer);
        self.write_bytes(buf).await
    }

    async fn read_until(&self, expected: &[&[u8]]) -> Result<Bytes, TransportError> {
        if expected.iter().any(|sentinel| sentinel.is_empty()) {
            return Ok(Bytes::new());
        }
        self.ensure_open()?;

        let mut stream = self.stream.lock().await;
        let mut buf = BytesMut::with_capacity(256);

        let result = timeout(self.timeout, async {
            loop {
                buf.put_u8(stream.read_u8().await?);
                if expected.iter().any(|sentinel| buf.ends_with(sentinel)) {
                    return Ok::<(), io::Error>(());
                }
            }
        })
        .await;

        match result {
            Ok(Ok(())) => {
                debug!("Received from {}: {:?}", self.peer, String::from_utf8_lossy(&buf));
                Ok(buf.freeze())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let mut stream = self.stream.lock().await;
        debug!("Closing connection to {}", self.peer);
        timeout(self.timeout, stream.get_mut().shutdown())
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;
        Ok(())
    }
}

impl fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTransport")
            .field("peer", &self.peer)
            .field("timeout", &self.timeout)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Connect to a TCP address within `timeout`
pub async fn connect_tcp(addr: &str, timeout_after: Duration) -> Result<TcpStream, TransportError> {
    let stream = timeout(timeout_after, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout(timeout_after))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Dial a plain TCP (telnet-style) device
pub async fn dial_tcp(addr: &str, timeout_after: Duration) -> Result<StreamTransport, TransportError> {
    let stream = connect_tcp(addr, timeout_after).await?;
    info!("Connected to {}", addr);
    Ok(StreamTransport::new(IoStream::Plain(stream), addr, timeout_after))
}

/// Dial a TLS device. Certificates are not verified.
#[cfg(feature = "tls")]
pub async fn dial_tls(
    addr: &str,
    version: TlsVersion,
    timeout_after: Duration,
) -> Result<StreamTransport, TransportError> {
    let stream = connect_tcp(addr, timeout_after).await?;
    let stream = timeout(timeout_after, tls::connect(stream, addr, version))
        .await
        .map_err(|_| TransportError::Timeout(timeout_after))??;
    info!("Connected to {} over TLS {}", addr, version);
    Ok(StreamTransport::new(stream, addr, timeout_after))
}

// TLS-specific functionality
#[cfg(feature = "tls")]
mod tls {
    use super::*;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
    use std::sync::Arc;
    use tokio_rustls::TlsConnector;

    /// Accepts any server certificate; devices ship self-signed ones
    #[derive(Debug)]
    struct AcceptAnyCert(Arc<CryptoProvider>);

    impl ServerCertVerifier for AcceptAnyCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    /// Build a client configuration pinned to `version` with every cipher
    /// suite the provider offers
    fn client_config(version: TlsVersion) -> Result<ClientConfig, TransportError> {
        let versions: &[&'static rustls::SupportedProtocolVersion] = match version {
            TlsVersion::V1_2 => &[&rustls::version::TLS12],
            // rustls implements TLS 1.2 and 1.3 only
            TlsVersion::V1_0 => {
                return Err(TransportError::UnsupportedTlsVersion(format!(
                    "{} (not available with rustls)",
                    version
                )))
            }
        };

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(versions)
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
            .with_no_client_auth();
        Ok(config)
    }

    fn server_name(addr: &str) -> Result<ServerName<'static>, TransportError> {
        let host = addr
            .rsplit_once(':')
            .map(|(host, _port)| host)
            .unwrap_or(addr)
            .trim_start_matches('[')
            .trim_end_matches(']');
        ServerName::try_from(host.to_owned())
            .map_err(|_| TransportError::InvalidServerName(host.to_owned()))
    }

    pub(super) async fn connect(
        stream: TcpStream,
        addr: &str,
        version: TlsVersion,
    ) -> Result<IoStream, TransportError> {
        let connector = TlsConnector::from(Arc::new(client_config(version)?));
        let name = server_name(addr)?;
        debug!("Starting TLS {} handshake with {}", version, addr);

        let stream = connector
            .connect(name, stream)
            .await
            .map_err(|e| TransportError::Tls(format!("handshake with {} failed: {}", addr, e)))?;
        Ok(IoStream::TlsClient(stream))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_server_name_from_address() {
            assert!(server_name("device.local:992").is_ok());
            assert!(server_name("10.0.0.5:992").is_ok());
            assert!(server_name("[::1]:992").is_ok());
            assert!(matches!(
                server_name("bad host:992"),
                Err(TransportError::InvalidServerName(_))
            ));
        }

        #[test]
        fn test_tls10_unavailable() {
            assert!(client_config(TlsVersion::V1_2).is_ok());
            assert!(matches!(
                client_config(TlsVersion::V1_0),
                Err(TransportError::UnsupportedTlsVersion(_))
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Listener that echoes every byte back on each accepted connection
    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = socket.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        addr
    }

    /// Listener that accepts and then stays silent
    async fn silent_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_read_until_sentinel() {
        let addr = echo_server().await;
        let transport = dial_tcp(&addr, Duration::from_secs(2)).await.unwrap();

        transport.send(b"hello\r\n").await.unwrap();
        transport.send(b"world\r\n").await.unwrap();
        let out = transport.read_until(&[b"world\r\n"]).await.unwrap();
        assert_eq!(&out[..], b"hello\r\nworld\r\n");

        transport.send(b"and\r\n").await.unwrap();
        transport.send(b"again\r\n").await.unwrap();
        let out = transport.read_until(&[b"again\r\n"]).await.unwrap();
        assert_eq!(&out[..], b"and\r\nagain\r\n");
    }

    #[tokio::test]
    async fn test_read_until_first_matching_sentinel() {
        let addr = echo_server().await;
        let transport = dial_tcp(&addr, Duration::from_secs(2)).await.unwrap();

        transport.send(b"router# ").await.unwrap();
        transport.send(b"more> ").await.unwrap();

        let prompts: [&[u8]; 2] = [b"> ", b"# "];
        let out = transport.read_until(&prompts).await.unwrap();
        assert_eq!(&out[..], b"router# ");

        // Bytes past the first sentinel stay buffered for the next read
        let out = transport.read_until(&prompts).await.unwrap();
        assert_eq!(&out[..], b"more> ");
    }

    #[tokio::test]
    async fn test_empty_sentinel_returns_immediately() {
        let addr = silent_server().await;
        let transport = dial_tcp(&addr, Duration::from_secs(5)).await.unwrap();

        let out = transport.read_until(&[b"# ", b""]).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let addr = silent_server().await;
        let transport = dial_tcp(&addr, Duration::from_millis(50)).await.unwrap();

        let result = transport.read_until(&[b"# "]).await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_sensitive_send_reaches_peer() {
        let addr = echo_server().await;
        let transport = dial_tcp(&addr, Duration::from_secs(2)).await.unwrap();

        assert_eq!(transport.send_sensitive(b"s3cret\r\n").await.unwrap(), 8);
        let out = transport.read_until(&[b"\r\n"]).await.unwrap();
        assert_eq!(&out[..], b"s3cret\r\n");
    }

    #[tokio::test]
    async fn test_close_is_reported_once() {
        let addr = echo_server().await;
        let transport = dial_tcp(&addr, Duration::from_secs(2)).await.unwrap();

        transport.close().await.unwrap();
        assert!(transport.is_closed());
        assert!(matches!(transport.close().await, Err(TransportError::Closed)));
        assert!(matches!(transport.send(b"x").await, Err(TransportError::Closed)));
        assert!(matches!(
            transport.read_until(&[b"x"]).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = dial_tcp(&addr, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[test]
    fn test_tls_version_parsing() {
        assert_eq!("1.0".parse::<TlsVersion>().unwrap(), TlsVersion::V1_0);
        assert_eq!("1.2".parse::<TlsVersion>().unwrap(), TlsVersion::V1_2);
        for bad in ["1.1", "1.3", "", "tls1.2"] {
            assert!(matches!(
                bad.parse::<TlsVersion>(),
                Err(TransportError::UnsupportedTlsVersion(_))
            ));
        }
        assert_eq!(TlsVersion::V1_2.to_string(), "1.2");
    }

    #[cfg(feature = "tls")]
    #[tokio::test]
    async fn test_dial_tls10_fails_after_parsing() {
        let addr = silent_server().await;
        let version: TlsVersion = "1.0".parse().unwrap();

        let result = dial_tls(&addr, version, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(TransportError::UnsupportedTlsVersion(_))));
    }
}
