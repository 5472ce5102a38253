//! SOCKS5 upstream proxy adapter.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use splitroute_model::{TunnelConfig, TunnelState};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tokio_util::sync::CancellationToken;

use crate::{DatagramTunnel, ProviderError, StateCell, TunnelProvider, TunnelStream};

/// Forwards connections through an upstream SOCKS5 server.
///
/// `connect` only probes reachability; there is no session to establish.
/// UDP ASSOCIATE is not implemented, so UDP flows are refused.
#[derive(Debug)]
pub struct Socks5Provider {
    server: String,
    auth: Option<(String, String)>,
    state: Arc<StateCell>,
}

impl Socks5Provider {
    pub fn from_config(config: &TunnelConfig) -> Result<Self, ProviderError> {
        let server = config
            .option("server")
            .ok_or(ProviderError::MissingOption("server"))?
            .to_owned();

        let auth = match (config.option("username"), config.option("password")) {
            (Some(user), Some(pass)) => Some((user.to_owned(), pass.to_owned())),
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
            auth,
            state: Arc::new(StateCell::new()),
        })
    }
}

#[async_trait]
impl TunnelProvider for Socks5Provider {
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

        let dst = SocketAddr::V4(dst);
        let stream = match &self.auth {
            Some((user, pass)) => {
                Socks5Stream::connect_with_password(self.server.as_str(), dst, user, pass).await?
            }
            None => Socks5Stream::connect(self.server.as_str(), dst).await?,
        };

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
    use std::collections::BTreeMap;

    fn config(options: &[(&str, &str)]) -> TunnelConfig {
        TunnelConfig {
            id: TunnelId::from("socks-1"),
            proto: TunnelProto::Socks5,
            name: String::new(),
            options: options
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn requires_server_option() {
        let err = Socks5Provider::from_config(&config(&[])).unwrap_err();

        assert!(matches!(err, ProviderError::MissingOption("server")));
    }

    #[test]
    fn rejects_partial_auth() {
        let err =
            Socks5Provider::from_config(&config(&[("server", "127.0.0.1:1080"), ("username", "u")]))
                .unwrap_err();

        assert!(matches!(err, ProviderError::BadOption { .. }));
    }

    #[tokio::test]
    async fn dial_before_connect_is_refused() {
        let provider =
            Socks5Provider::from_config(&config(&[("server", "127.0.0.1:1080")])).unwrap();

        let err = provider
            .dial_tcp("93.184.216.34:443".parse().unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::NotConnected));
    }

    #[tokio::test]
    async fn udp_is_unsupported() {
        let provider =
            Socks5Provider::from_config(&config(&[("server", "127.0.0.1:1080")])).unwrap();

        let err = provider
            .dial_udp("8.8.8.8:53".parse().unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::UnsupportedUdp));
    }
}
