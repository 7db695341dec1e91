//! Byte-socket transport: TCP, upgraded in place to TLS and optionally
//! wrapped in a zlib codec.

use async_trait::async_trait;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::error::XmppError;
use crate::transport::{CompressionLevel, Transport, TransportKind};

/// TLS exporter label for channel binding (RFC 9266).
const EXPORTER_LABEL: &[u8] = b"EXPORTER-Channel-Binding";

/// Socket transport for C2S connections.
pub struct SocketTransport {
    inner: StreamInner,
    tls_acceptor: TlsAcceptor,
    zlib: Option<ZlibCodec>,
}

#[derive(Default)]
enum StreamInner {
    #[default]
    None,
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl StreamInner {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, XmppError> {
        match self {
            StreamInner::None => Err(XmppError::internal("transport not initialized")),
            StreamInner::Tcp(s) => Ok(s.read(buf).await?),
            StreamInner::Tls(s) => Ok(s.read(buf).await?),
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), XmppError> {
        match self {
            StreamInner::None => Err(XmppError::internal("transport not initialized")),
            StreamInner::Tcp(s) => {
                s.write_all(bytes).await?;
                Ok(s.flush().await?)
            }
            StreamInner::Tls(s) => {
                s.write_all(bytes).await?;
                Ok(s.flush().await?)
            }
        }
    }

    async fn shutdown(&mut self) -> Result<(), XmppError> {
        match self {
            StreamInner::None => Ok(()),
            StreamInner::Tcp(s) => Ok(s.shutdown().await?),
            StreamInner::Tls(s) => Ok(s.shutdown().await?),
        }
    }
}

impl SocketTransport {
    /// Wrap an accepted TCP connection.
    pub fn new(stream: TcpStream, tls_acceptor: TlsAcceptor) -> Self {
        Self {
            inner: StreamInner::Tcp(stream),
            tls_acceptor,
            zlib: None,
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize, XmppError> {
        match &mut self.zlib {
            None => self.inner.read(buf).await,
            Some(codec) => loop {
                if !codec.pending.is_empty() {
                    let n = codec.pending.len().min(buf.len());
                    buf[..n].copy_from_slice(&codec.pending[..n]);
                    codec.pending.drain(..n);
                    return Ok(n);
                }
                let mut raw = [0u8; 8192];
                let n = self.inner.read(&mut raw).await?;
                if n == 0 {
                    return Ok(0);
                }
                codec.inflate(&raw[..n])?;
            },
        }
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), XmppError> {
        match &mut self.zlib {
            None => self.inner.write_all(bytes).await,
            Some(codec) => {
                let compressed = codec.deflate(bytes)?;
                self.inner.write_all(&compressed).await
            }
        }
    }

    async fn start_tls(&mut self) -> Result<(), XmppError> {
        let tcp = match std::mem::take(&mut self.inner) {
            StreamInner::Tcp(s) => s,
            StreamInner::Tls(_) => return Err(XmppError::stream("already using TLS")),
            StreamInner::None => return Err(XmppError::internal("transport already taken")),
        };
        let tls = self
            .tls_acceptor
            .accept(tcp)
            .await
            .map_err(|e| XmppError::internal(format!("TLS accept error: {}", e)))?;
        self.inner = StreamInner::Tls(Box::new(tls));
        debug!("TLS upgrade complete");
        Ok(())
    }

    fn enable_compression(&mut self, level: CompressionLevel) -> Result<(), XmppError> {
        if self.zlib.is_some() {
            return Err(XmppError::stream("compression already enabled"));
        }
        let compression = match level {
            CompressionLevel::No => {
                return Err(XmppError::config("compression is disabled"));
            }
            CompressionLevel::Default => Compression::default(),
            CompressionLevel::BestSpeed => Compression::fast(),
            CompressionLevel::BestCompression => Compression::best(),
        };
        self.zlib = Some(ZlibCodec::new(compression));
        debug!("zlib compression enabled");
        Ok(())
    }

    fn channel_binding_data(&self) -> Option<Vec<u8>> {
        match &self.inner {
            StreamInner::Tls(stream) => {
                let (_, conn) = stream.get_ref();
                conn.export_keying_material(vec![0u8; 32], EXPORTER_LABEL, None)
                    .ok()
            }
            _ => None,
        }
    }

    async fn close(&mut self) -> Result<(), XmppError> {
        self.inner.shutdown().await
    }
}

/// Streaming zlib codec over the raw connection.
struct ZlibCodec {
    compress: Compress,
    decompress: Decompress,
    /// Inflated bytes not yet handed to the reader
    pending: Vec<u8>,
}

impl ZlibCodec {
    fn new(compression: Compression) -> Self {
        Self {
            compress: Compress::new(compression, true),
            decompress: Decompress::new(true),
            pending: Vec::new(),
        }
    }

    /// Deflate one write, flushed so the peer can decode it immediately.
    fn deflate(&mut self, data: &[u8]) -> Result<Vec<u8>, XmppError> {
        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        let start_in = self.compress.total_in();
        loop {
            let consumed = (self.compress.total_in() - start_in) as usize;
            out.reserve(256);
            let cap = out.capacity();
            self.compress
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| XmppError::internal(format!("zlib deflate error: {}", e)))?;
            let consumed = (self.compress.total_in() - start_in) as usize;
            if consumed >= data.len() && out.len() < cap {
                return Ok(out);
            }
        }
    }

    /// Inflate received bytes into the pending buffer.
    fn inflate(&mut self, data: &[u8]) -> Result<(), XmppError> {
        let start_in = self.decompress.total_in();
        loop {
            let consumed = (self.decompress.total_in() - start_in) as usize;
            self.pending.reserve(1024);
            let cap = self.pending.capacity();
            self.decompress
                .decompress_vec(&data[consumed..], &mut self.pending, FlushDecompress::None)
                .map_err(|e| XmppError::xml_parse(format!("zlib inflate error: {}", e)))?;
            let consumed = (self.decompress.total_in() - start_in) as usize;
            if consumed >= data.len() && self.pending.len() < cap {
                return Ok(());
            }
        }
    }
}
