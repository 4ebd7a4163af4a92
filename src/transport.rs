use crate::error::Error;
use crate::request::parse_ws_url;
use crate::stream::SocketPulseStream;
use futures::future::BoxFuture;
use log::debug;
use pki_types::ServerName;
use rustls::{ClientConfig as RustlsConfig, RootCertStore};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use url::Url;

/// Byte-oriented duplex stream the connection runs over.
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncDuplex for T {}

pub type BoxedStream = Box<dyn AsyncDuplex>;

/// Produces the duplex stream for a ws/wss URL. TLS and any proxy
/// tunneling are the transport's responsibility; the connection treats the
/// resulting stream as opaque bytes.
pub trait Transport: Send + Sync {
    fn connect<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<BoxedStream, Error>>;
}

/// Default transport: direct TCP, wrapped in rustls for `wss` URLs.
#[derive(Default, Clone)]
pub struct TcpTransport {
    /// TLS configuration override; when unset, a config trusting the
    /// webpki root store is built on first use.
    pub tls_config: Option<Arc<RustlsConfig>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tls_config(tls_config: Arc<RustlsConfig>) -> Self {
        Self {
            tls_config: Some(tls_config),
        }
    }

    fn tls_config(&self) -> Arc<RustlsConfig> {
        match &self.tls_config {
            Some(config) => config.clone(),
            None => {
                let mut root_store = RootCertStore::empty();
                root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                Arc::new(
                    RustlsConfig::builder()
                        .with_root_certificates(root_store)
                        .with_no_client_auth(),
                )
            }
        }
    }
}

impl Transport for TcpTransport {
    fn connect<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<BoxedStream, Error>> {
        Box::pin(async move {
            let (_, host, port, use_tls) = parse_ws_url(url.as_str())?;
            debug!("connecting TCP to {}:{}", host, port);

            // url keeps IPv6 hosts bracketed; the socket address and SNI
            // forms both want them bare.
            let bare_host = host.trim_start_matches('[').trim_end_matches(']');
            let stream = TcpStream::connect((bare_host, port)).await?;

            if !use_tls {
                return Ok(Box::new(SocketPulseStream::Plain(stream)) as BoxedStream);
            }

            let connector = TlsConnector::from(self.tls_config());
            let server_name = ServerName::try_from(bare_host.to_owned())?;
            let tls_stream = connector.connect(server_name, stream).await?;
            debug!("TLS established with {}", host);
            Ok(Box::new(SocketPulseStream::Secure(Box::new(tls_stream))) as BoxedStream)
        })
    }
}
