//! HTTP CONNECT proxy adapter.

use std::net::SocketAddrV4;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use splitroute_model::{TunnelConfig, TunnelState};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::{DatagramTunnel, ProviderError, StateCell, TunnelProvider, TunnelStream};

/// Largest CONNECT response we are willing to buffer.
const MAX_RESPONSE: usize = 4096;

/// Forwards connections through an HTTP proxy via `CONNECT`.
pub struct HttpProxyProvider {
    server: String,
    /// Pre-computed `Proxy-Authorization` header value.
    authorization: Option<String>,
    state: Arc<StateCell>,
}

impl HttpProxyProvider {
    pub fn from_config(config: &TunnelConfig) -> Result<Self, ProviderError> {
        let server = config
            .option("server")
            .ok_or(ProviderError::MissingOption("server"))?
            .to_owned();

        let authorization = match (config.option("username"), config.option("password")) {
            (Some(user), Some(pass)) => {
                let credentials =
                    base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));

                Some(format!("Basic {credentials}"))
            }
            (None, None) => None,
            (Some(_), None) | (None, Some(_)) => {
                return Err(ProviderError::BadOption {
                    key: "username",
                    reason: "username and password must be set together".to_owned(),
                });
            }
        };

        Ok(Self {
            server,
            authorization,
            state: Arc::new(StateCell::new()),
        })
    }

    async fn connect_handshake(&self, dst: SocketAddrV4) -> Result<TcpStream, ProviderError> {
        let mut stream = TcpStream::connect(self.server.as_str()).await?;
        stream.set_nodelay(true)?;

        let mut request = format!("CONNECT {dst} HTTP/1.1\r\nHost: {dst}\r\n");
        if let Some(authorization) = &self.authorization {
            request.push_str(&format!("Proxy-Authorization: {authorization}\r\n"));
        }
        request.push_str("\r\n");

        stream.write_all(request.as_bytes()).await?;

        let mut response = Vec::with_capacity(256);
        let mut byte = [0u8; 1];

        // Read byte-wise up to the header terminator so we never consume
        // tunnelled payload that follows the response.
        while !response.ends_with(b"\r\n\r\n") {
            if response.len() >= MAX_RESPONSE {
                return Err(ProviderError::Handshake(
                    "CONNECT response too large".to_owned(),
                ));
            }

            let n = stream.read(&mut byte).await?;
            if n == 0 {
                return Err(ProviderError::Handshake(
                    "proxy closed connection during CONNECT".to_owned(),
                ));
            }

            response.push(byte[0]);
        }

        let status_line = response
            .split(|b| *b == b'\r')
            .next()
            .map(String::from_utf8_lossy)
            .unwrap_or_default();

        if !is_success(&status_line) {
            return Err(ProviderError::Handshake(format!(
                "proxy refused CONNECT: {status_line}"
            )));
        }

        Ok(stream)
    }
}

fn is_success(status_line: &str) -> bool {
    // `HTTP/1.1 200 Connection established`
    status_line
        .split_whitespace()
        .nth(1)
        .is_some_and(|code| code.starts_with('2'))
}

#[async_trait]
impl TunnelProvider for HttpProxyProvider {
    async fn connect(&self, cancel: CancellationToken) -> Result<(), ProviderError> {
        self.state.set(TunnelState::Connecting);

        let probe = async {
            TcpStream::connect(self.server.as_str())
                .await
                .map_err(ProviderError::Io)
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            result = probe => result.map(|_| ()),
        };

        match &result {
            Ok(()) => self.state.set(TunnelState::Up),
            Err(_) => self.state.set(TunnelState::Error),
        }

        result
    }

    async fn disconnect(&self) {
        self.state.set(TunnelState::Down);
    }

    async fn dial_tcp(&self, dst: SocketAddrV4) -> Result<TunnelStream, ProviderError> {
        self.state.ensure_up()?;

        let stream = self.connect_handshake(dst).await?;

        Ok(Box::new(stream))
    }

    async fn dial_udp(&self, _dst: SocketAddrV4) -> Result<Box<dyn DatagramTunnel>, ProviderError> {
        Err(ProviderError::UnsupportedUdp)
    }

    fn state(&self) -> TunnelState {
        self.state.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splitroute_model::{TunnelId, TunnelProto};
    use tokio::net::TcpListener;

    fn config(server: &str) -> TunnelConfig {
        TunnelConfig {
            id: TunnelId::from("http-1"),
            proto: TunnelProto::Http,
            name: String::new(),
            options: [("server".to_owned(), server.to_owned())].into(),
        }
    }

    #[test]
    fn status_line_parsing() {
        assert!(is_success("HTTP/1.1 200 Connection established"));
        assert!(is_success("HTTP/1.0 200 OK"));
        assert!(!is_success("HTTP/1.1 407 Proxy Authentication Required"));
        assert!(!is_success("garbage"));
    }

    #[tokio::test]
    async fn dials_through_connect_proxy() {
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();

        // Minimal CONNECT endpoint: accept, swallow the request, say yes,
        // then echo one payload chunk back.
        tokio::spawn(async move {
            let (mut stream, _) = proxy.accept().await.unwrap();

            let mut buf = [0u8; 1024];
            let mut read = 0;
            while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                read += stream.read(&mut buf[read..]).await.unwrap();
            }

            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();

            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
        });

        let provider = HttpProxyProvider::from_config(&config(&proxy_addr.to_string())).unwrap();
        provider.connect(CancellationToken::new()).await.unwrap();

        let mut tunnel = provider
            .dial_tcp("93.184.216.34:443".parse().unwrap())
            .await
            .unwrap();

        tunnel.write_all(b"ping").await.unwrap();

        let mut reply = [0u8; 4];
        tunnel.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");
    }

    #[tokio::test]
    async fn refused_connect_is_an_error() {
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = proxy.accept().await.unwrap();

            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let provider = HttpProxyProvider::from_config(&config(&proxy_addr.to_string())).unwrap();
        provider.connect(CancellationToken::new()).await.unwrap();

        let err = provider
            .dial_tcp("93.184.216.34:443".parse().unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Handshake(_)));
    }
}
