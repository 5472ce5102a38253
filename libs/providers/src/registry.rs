//! Maps protocol tags to adapter constructors.

use std::sync::Arc;

use splitroute_model::{TunnelConfig, TunnelProto};

use crate::{ProviderError, ProviderFactory, TunnelProvider};
use crate::{HttpProxyProvider, Socks5Provider, VlessProvider, WireguardProvider};

/// Instantiates the adapter for `config.proto`.
///
/// Option parsing happens here, so a bad config fails at registration time
/// rather than at connect time.
pub fn create(config: &TunnelConfig) -> Result<Arc<dyn TunnelProvider>, ProviderError> {
    let provider: Arc<dyn TunnelProvider> = match config.proto {
        TunnelProto::Wireguard | TunnelProto::AmneziaWg => {
            Arc::new(WireguardProvider::from_config(config)?)
        }
        TunnelProto::Socks5 => Arc::new(Socks5Provider::from_config(config)?),
        TunnelProto::Http => Arc::new(HttpProxyProvider::from_config(config)?),
        TunnelProto::Vless => Arc::new(VlessProvider::from_config(config)?),
        TunnelProto::Direct => return Err(ProviderError::UnsupportedProto(TunnelProto::Direct)),
    };

    Ok(provider)
}

/// The production [`ProviderFactory`]: plain [`create`].
#[derive(Debug, Default)]
pub struct DefaultFactory;

impl ProviderFactory for DefaultFactory {
    fn create(&self, config: &TunnelConfig) -> Result<Arc<dyn TunnelProvider>, ProviderError> {
        create(config)
    }
}
