//! VLESS adapter.
//!
//! The VLESS wire protocol lives in xray-core. We run the stock `xray`
//! binary with a generated config whose only inbound is a loopback SOCKS5
//! listener, then dial through that listener. Supervising the child process
//! is all this adapter does protocol-wise.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use splitroute_model::{TunnelConfig, TunnelState};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio_socks::tcp::Socks5Stream;
use tokio_util::sync::CancellationToken;

use crate::{
    DatagramTunnel, EndpointProvider, ProviderError, StateCell, TunnelProvider, TunnelStream,
};

/// How long we wait for the spawned xray to open its SOCKS5 inbound.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const STARTUP_POLL: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub struct VlessProvider {
    id: String,
    xray_path: PathBuf,
    server: String,
    port: u16,
    uuid: String,
    flow: Option<String>,
    security: String,
    sni: Option<String>,
    reality_public_key: Option<String>,
    reality_short_id: Option<String>,

    state: Arc<StateCell>,
    runtime: tokio::sync::Mutex<Option<XrayProcess>>,
}

#[derive(Debug)]
struct XrayProcess {
    child: Child,
    socks_port: u16,
    config_path: PathBuf,
}

impl VlessProvider {
    pub fn from_config(config: &TunnelConfig) -> Result<Self, ProviderError> {
        let server = config
            .option("server")
            .ok_or(ProviderError::MissingOption("server"))?
            .to_owned();
        let port = config
            .option("port")
            .ok_or(ProviderError::MissingOption("port"))?
            .parse::<u16>()
            .map_err(|e| ProviderError::BadOption {
                key: "port",
                reason: e.to_string(),
            })?;
        let uuid = config
            .option("uuid")
            .ok_or(ProviderError::MissingOption("uuid"))?
            .to_owned();

        let security = config.option("security").unwrap_or("tls").to_owned();
        if !matches!(security.as_str(), "none" | "tls" | "reality") {
            return Err(ProviderError::BadOption {
                key: "security",
                reason: format!("unknown security `{security}`"),
            });
        }

        Ok(Self {
            id: config.id.to_string(),
            xray_path: config.option("xray_path").unwrap_or("xray").into(),
            server,
            port,
            uuid,
            flow: config.option("flow").map(str::to_owned),
            security,
            sni: config.option("sni").map(str::to_owned),
            reality_public_key: config.option("public_key").map(str::to_owned),
            reality_short_id: config.option("short_id").map(str::to_owned),
            state: Arc::new(StateCell::new()),
            runtime: tokio::sync::Mutex::new(None),
        })
    }

    fn render_config(&self, socks_port: u16) -> serde_json::Value {
        let mut stream_settings = json!({
            "network": "tcp",
            "security": self.security,
        });

        match self.security.as_str() {
            "tls" => {
                stream_settings["tlsSettings"] = json!({
                    "serverName": self.sni.as_deref().unwrap_or(&self.server),
                });
            }
            "reality" => {
                stream_settings["realitySettings"] = json!({
                    "serverName": self.sni.as_deref().unwrap_or(&self.server),
                    "publicKey": self.reality_public_key,
                    "shortId": self.reality_short_id,
                });
            }
            _ => {}
        }

        let mut user = json!({
            "id": self.uuid,
            "encryption": "none",
        });
        if let Some(flow) = &self.flow {
            user["flow"] = json!(flow);
        }

        json!({
            "log": { "loglevel": "warning" },
            "inbounds": [{
                "listen": "127.0.0.1",
                "port": socks_port,
                "protocol": "socks",
                "settings": { "udp": false },
            }],
            "outbounds": [{
                "protocol": "vless",
                "settings": {
                    "vnext": [{
                        "address": self.server,
                        "port": self.port,
                        "users": [user],
                    }],
                },
                "streamSettings": stream_settings,
            }],
        })
    }

    async fn spawn_xray(&self) -> Result<XrayProcess, ProviderError> {
        // Learn a free loopback port by binding to 0 and releasing it.
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let socks_port = listener.local_addr()?.port();
        drop(listener);

        let config_path =
            std::env::temp_dir().join(format!("xray-{id}-{socks_port}.json", id = self.id));
        let rendered = self.render_config(socks_port);
        tokio::fs::write(&config_path, rendered.to_string()).await?;

        let child = Command::new(&self.xray_path)
            .arg("run")
            .arg("-c")
            .arg(&config_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        Ok(XrayProcess {
            child,
            socks_port,
            config_path,
        })
    }

    async fn wait_ready(&self, socks_port: u16) -> Result<(), ProviderError> {
        let deadline = tokio::time::Instant::now() + STARTUP_TIMEOUT;

        while tokio::time::Instant::now() < deadline {
            if TcpStream::connect((Ipv4Addr::LOCALHOST, socks_port))
                .await
                .is_ok()
            {
                return Ok(());
            }

            tokio::time::sleep(STARTUP_POLL).await;
        }

        Err(ProviderError::Handshake(
            "xray did not open its SOCKS5 inbound in time".to_owned(),
        ))
    }

    async fn teardown(&self) {
        let Some(mut process) = self.runtime.lock().await.take() else {
            return;
        };

        if let Err(e) = process.child.kill().await {
            tracing::debug!(id = %self.id, "Failed to kill xray: {e}");
        }

        if let Err(e) = tokio::fs::remove_file(&process.config_path).await {
            tracing::debug!(id = %self.id, "Failed to remove xray config: {e}");
        }
    }
}

#[async_trait]
impl TunnelProvider for VlessProvider {
    async fn connect(&self, cancel: CancellationToken) -> Result<(), ProviderError> {
        self.state.set(TunnelState::Connecting);

        let attempt = async {
            let process = self.spawn_xray().await?;
            let socks_port = process.socks_port;
            *self.runtime.lock().await = Some(process);

            self.wait_ready(socks_port).await
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            result = attempt => result,
        };

        match &result {
            Ok(()) => self.state.set(TunnelState::Up),
            Err(_) => {
                self.teardown().await;
                self.state.set(TunnelState::Error);
            }
        }

        result
    }

    async fn disconnect(&self) {
        self.teardown().await;
        self.state.set(TunnelState::Down);
    }

    async fn dial_tcp(&self, dst: SocketAddrV4) -> Result<TunnelStream, ProviderError> {
        self.state.ensure_up()?;

        let socks_port = self
            .runtime
            .lock()
            .await
            .as_ref()
            .ok_or(ProviderError::NotConnected)?
            .socks_port;

        let proxy = std::net::SocketAddr::from((Ipv4Addr::LOCALHOST, socks_port));
        let stream = Socks5Stream::connect(proxy, std::net::SocketAddr::V4(dst)).await?;

        Ok(Box::new(stream))
    }

    async fn dial_udp(&self, _dst: SocketAddrV4) -> Result<Box<dyn DatagramTunnel>, ProviderError> {
        Err(ProviderError::UnsupportedUdp)
    }

    fn state(&self) -> TunnelState {
        self.state.get()
    }

    fn as_endpoint_provider(&self) -> Option<&dyn EndpointProvider> {
        Some(self)
    }
}

impl EndpointProvider for VlessProvider {
    fn endpoints(&self) -> Vec<Ipv4Addr> {
        self.server.parse().ok().into_iter().collect()
    }
}
