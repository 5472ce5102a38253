//! WireGuard and AmneziaWG adapter.
//!
//! boringtun supplies the noise protocol, smoltcp the user-space sockets;
//! [`stack`] glues them together in a per-tunnel engine task. AmneziaWG is
//! the same engine with the obfuscation knobs from [`awg`] set.

mod awg;
mod stack;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use boringtun::noise::Tunn;
use boringtun::x25519::{PublicKey, StaticSecret};
use splitroute_model::{TunnelConfig, TunnelState};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use awg::AwgParams;
use crate::{
    DatagramTunnel, EndpointProvider, ProviderError, RawForwarder, StateCell, TunnelProvider,
    TunnelStream,
};

const DEFAULT_MTU: usize = 1400;
const DEFAULT_KEEPALIVE_SECS: u16 = 25;

#[derive(Debug)]
pub struct WireguardProvider {
    options: WgOptions,
    state: Arc<StateCell>,
    runtime: parking_lot::Mutex<Option<Runtime>>,
    endpoint_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

#[derive(Debug)]
struct Runtime {
    cmd_tx: mpsc::Sender<stack::Command>,
    task: tokio::task::JoinHandle<()>,
}

#[derive(Debug)]
struct WgOptions {
    private_key: [u8; 32],
    peer_public_key: [u8; 32],
    preshared_key: Option<[u8; 32]>,
    endpoint: String,
    address: Ipv4Addr,
    mtu: usize,
    keepalive: Option<u16>,
    awg: AwgParams,
}

impl WgOptions {
    fn parse(config: &TunnelConfig) -> Result<Self, ProviderError> {
        let endpoint = config
            .option("endpoint")
            .ok_or(ProviderError::MissingOption("endpoint"))?
            .to_owned();

        let address = config
            .option("address")
            .ok_or(ProviderError::MissingOption("address"))?
            .parse()
            .map_err(|_| ProviderError::BadOption {
                key: "address",
                reason: "expected an IPv4 address".to_owned(),
            })?;

        let mtu = match config.option("mtu") {
            Some(raw) => raw.parse().map_err(|_| ProviderError::BadOption {
                key: "mtu",
                reason: "expected a packet size".to_owned(),
            })?,
            None => DEFAULT_MTU,
        };

        let keepalive = match config.option("keepalive") {
            Some(raw) => {
                let secs: u16 = raw.parse().map_err(|_| ProviderError::BadOption {
                    key: "keepalive",
                    reason: "expected seconds".to_owned(),
                })?;

                (secs > 0).then_some(secs)
            }
            None => Some(DEFAULT_KEEPALIVE_SECS),
        };

        Ok(Self {
            private_key: required_key(config, "private_key")?,
            peer_public_key: required_key(config, "public_key")?,
            preshared_key: optional_key(config, "preshared_key")?,
            endpoint,
            address,
            mtu,
            keepalive,
            awg: AwgParams::from_config(config)?,
        })
    }
}

fn required_key(config: &TunnelConfig, key: &'static str) -> Result<[u8; 32], ProviderError> {
    optional_key(config, key)?.ok_or(ProviderError::MissingOption(key))
}

fn optional_key(
    config: &TunnelConfig,
    key: &'static str,
) -> Result<Option<[u8; 32]>, ProviderError> {
    let Some(raw) = config.option(key) else {
        return Ok(None);
    };

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map_err(|e| ProviderError::BadOption {
            key,
            reason: e.to_string(),
        })?;

    let bytes: [u8; 32] = decoded
        .try_into()
        .map_err(|_| ProviderError::BadOption {
            key,
            reason: "expected 32 bytes of base64".to_owned(),
        })?;

    Ok(Some(bytes))
}

impl WireguardProvider {
    pub fn from_config(config: &TunnelConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            options: WgOptions::parse(config)?,
            state: Arc::new(StateCell::new()),
            runtime: parking_lot::Mutex::new(None),
            endpoint_addr: parking_lot::Mutex::new(None),
        })
    }

    async fn bring_up(&self) -> Result<(), ProviderError> {
        let endpoint = tokio::net::lookup_host(&self.options.endpoint)
            .await?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| ProviderError::BadOption {
                key: "endpoint",
                reason: "did not resolve to an IPv4 address".to_owned(),
            })?;
        *self.endpoint_addr.lock() = Some(endpoint);

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect(endpoint).await?;

        let tunn = Tunn::new(
            StaticSecret::from(self.options.private_key),
            PublicKey::from(self.options.peer_public_key),
            self.options.preshared_key,
            self.options.keepalive,
            rand::random(),
            None,
        )
        .map_err(|e| ProviderError::Handshake(e.to_string()))?;

        let handle = stack::spawn(
            tunn,
            socket,
            self.options.address,
            self.options.mtu,
            self.options.awg,
            Arc::clone(&self.state),
        );

        let cmd_tx = handle.cmd_tx.clone();
        *self.runtime.lock() = Some(Runtime {
            cmd_tx: handle.cmd_tx,
            task: handle.task,
        });

        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(stack::Command::WaitHandshake { reply: reply_tx })
            .await
            .map_err(|_| ProviderError::NotConnected)?;

        reply_rx
            .await
            .map_err(|_| ProviderError::Handshake("engine stopped".to_owned()))?
    }

    fn teardown(&self) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        // Dropping the command channel stops the engine loop; abort covers
        // an engine that is blocked mid-send.
        drop(runtime.cmd_tx);
        runtime.task.abort();
    }

    fn cmd_tx(&self) -> Result<mpsc::Sender<stack::Command>, ProviderError> {
        Ok(self
            .runtime
            .lock()
            .as_ref()
            .ok_or(ProviderError::NotConnected)?
            .cmd_tx
            .clone())
    }
}

#[async_trait]
impl TunnelProvider for WireguardProvider {
    async fn connect(&self, cancel: CancellationToken) -> Result<(), ProviderError> {
        self.state.set(TunnelState::Connecting);

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            result = self.bring_up() => result,
        };

        match &result {
            Ok(()) => self.state.set(TunnelState::Up),
            Err(ProviderError::Cancelled) => {
                self.teardown();
                self.state.set(TunnelState::Down);
            }
            Err(_) => {
                self.teardown();
                self.state.set(TunnelState::Error);
            }
        }

        result
    }

    async fn disconnect(&self) {
        self.teardown();
        self.state.set(TunnelState::Down);
    }

    async fn dial_tcp(&self, dst: SocketAddrV4) -> Result<TunnelStream, ProviderError> {
        self.state.ensure_up()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx()?
            .send(stack::Command::DialTcp {
                dst,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ProviderError::NotConnected)?;

        reply_rx.await.map_err(|_| ProviderError::NotConnected)?
    }

    async fn dial_udp(&self, dst: SocketAddrV4) -> Result<Box<dyn DatagramTunnel>, ProviderError> {
        self.state.ensure_up()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx()?
            .send(stack::Command::DialUdp {
                dst,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ProviderError::NotConnected)?;

        reply_rx.await.map_err(|_| ProviderError::NotConnected)?
    }

    fn state(&self) -> TunnelState {
        self.state.get()
    }

    fn adapter_ip(&self) -> Option<Ipv4Addr> {
        Some(self.options.address)
    }

    fn as_raw_forwarder(&self) -> Option<&dyn RawForwarder> {
        Some(self)
    }

    fn as_endpoint_provider(&self) -> Option<&dyn EndpointProvider> {
        Some(self)
    }
}

impl RawForwarder for WireguardProvider {
    fn forward_ipv4(&self, packet: &[u8]) -> Result<(), ProviderError> {
        let guard = self.runtime.lock();
        let runtime = guard.as_ref().ok_or(ProviderError::NotConnected)?;

        runtime
            .cmd_tx
            .try_send(stack::Command::InjectRaw(packet.to_vec()))
            .map_err(|_| ProviderError::NotConnected)
    }
}

impl EndpointProvider for WireguardProvider {
    fn endpoints(&self) -> Vec<Ipv4Addr> {
        match *self.endpoint_addr.lock() {
            Some(SocketAddr::V4(addr)) => vec![*addr.ip()],
            Some(SocketAddr::V6(_)) | None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splitroute_model::{TunnelId, TunnelProto};
    use std::collections::BTreeMap;

    const KEY: &str = "GCXkOLCXTbBLDG1nv1nlLUpTBOJUCcN6n0nB1ej9pGI=";

    fn config(options: &[(&str, &str)]) -> TunnelConfig {
        TunnelConfig {
            id: TunnelId::from("wg-1"),
            proto: TunnelProto::Wireguard,
            name: String::new(),
            options: options
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn minimal() -> Vec<(&'static str, &'static str)> {
        vec![
            ("private_key", KEY),
            ("public_key", KEY),
            ("endpoint", "203.0.113.5:51820"),
            ("address", "10.8.0.2"),
        ]
    }

    #[test]
    fn parses_minimal_config() {
        let provider = WireguardProvider::from_config(&config(&minimal())).unwrap();

        assert_eq!(provider.options.mtu, DEFAULT_MTU);
        assert_eq!(provider.options.keepalive, Some(DEFAULT_KEEPALIVE_SECS));
        assert!(provider.options.awg.is_plain());
        assert_eq!(provider.adapter_ip(), Some(Ipv4Addr::new(10, 8, 0, 2)));
    }

    #[test]
    fn keepalive_zero_disables() {
        let mut options = minimal();
        options.push(("keepalive", "0"));

        let provider = WireguardProvider::from_config(&config(&options)).unwrap();

        assert_eq!(provider.options.keepalive, None);
    }

    #[test]
    fn rejects_truncated_key() {
        let mut options = minimal();
        options[0] = ("private_key", "dG9vLXNob3J0");

        let err = WireguardProvider::from_config(&config(&options)).unwrap_err();

        assert!(matches!(
            err,
            ProviderError::BadOption {
                key: "private_key",
                ..
            }
        ));
    }

    #[test]
    fn amnezia_options_are_picked_up() {
        let mut options = minimal();
        options.extend([("jc", "3"), ("jmin", "40"), ("jmax", "70"), ("s1", "15")]);

        let provider = WireguardProvider::from_config(&config(&options)).unwrap();

        assert!(!provider.options.awg.is_plain());
    }

    #[tokio::test]
    async fn dial_before_connect_is_refused() {
        let provider = WireguardProvider::from_config(&config(&minimal())).unwrap();

        let err = provider
            .dial_tcp("93.184.216.34:443".parse().unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out_against_silent_peer() {
        let _guard = splitroute_logging::test("debug");

        // A bound socket that never answers: the handshake must give up.
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpoint = silent.local_addr().unwrap();

        let endpoint = endpoint.to_string();
        let provider = WireguardProvider::from_config(&config(&[
            ("private_key", KEY),
            ("public_key", KEY),
            ("endpoint", endpoint.as_str()),
            ("address", "10.8.0.2"),
        ]))
        .unwrap();
        let err = provider
            .connect(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Handshake(_)));
        assert_eq!(provider.state(), TunnelState::Error);
    }
}
