//! AmneziaWG wire obfuscation.
//!
//! AmneziaWG is WireGuard with a scrambled outer layer: handshake messages
//! carry a random junk prefix (`s1`/`s2`), the four message type words are
//! remapped (`h1`..`h4`), and `jc` junk datagrams of length `jmin..=jmax`
//! precede the initiation. Plain WireGuard is the zero value of all knobs.
//!
//! Everything here operates on the already-encrypted datagram, so it
//! composes with stock boringtun.

use rand::Rng as _;
use splitroute_model::TunnelConfig;

use crate::ProviderError;

const TYPE_INITIATION: u32 = 1;
const TYPE_RESPONSE: u32 = 2;
const TYPE_COOKIE: u32 = 3;
const TYPE_DATA: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AwgParams {
    /// Number of junk datagrams sent before the handshake initiation.
    pub jc: u16,
    pub jmin: u16,
    pub jmax: u16,
    /// Junk prefix length of the initiation message.
    pub s1: u16,
    /// Junk prefix length of the response message.
    pub s2: u16,
    pub h1: u32,
    pub h2: u32,
    pub h3: u32,
    pub h4: u32,
}

impl Default for AwgParams {
    fn default() -> Self {
        Self {
            jc: 0,
            jmin: 0,
            jmax: 0,
            s1: 0,
            s2: 0,
            h1: TYPE_INITIATION,
            h2: TYPE_RESPONSE,
            h3: TYPE_COOKIE,
            h4: TYPE_DATA,
        }
    }
}

pub(crate) enum Obfuscated<'a> {
    /// The datagram was rewritten in place; send this slice.
    InPlace(&'a [u8]),
    /// A junk prefix forced a copy; send this buffer.
    Replaced(Vec<u8>),
}

impl AwgParams {
    pub(crate) fn from_config(config: &TunnelConfig) -> Result<Self, ProviderError> {
        let mut params = Self::default();

        params.jc = parse_option(config, "jc", params.jc)?;
        params.jmin = parse_option(config, "jmin", params.jmin)?;
        params.jmax = parse_option(config, "jmax", params.jmax)?;
        params.s1 = parse_option(config, "s1", params.s1)?;
        params.s2 = parse_option(config, "s2", params.s2)?;
        params.h1 = parse_option(config, "h1", params.h1)?;
        params.h2 = parse_option(config, "h2", params.h2)?;
        params.h3 = parse_option(config, "h3", params.h3)?;
        params.h4 = parse_option(config, "h4", params.h4)?;

        if params.jmin > params.jmax {
            return Err(ProviderError::BadOption {
                key: "jmin",
                reason: format!("jmin ({}) exceeds jmax ({})", params.jmin, params.jmax),
            });
        }

        Ok(params)
    }

    pub(crate) fn is_plain(&self) -> bool {
        *self == Self::default()
    }

    /// Transforms an outgoing WireGuard packet into its AmneziaWG form.
    pub(crate) fn obfuscate<'a>(&self, packet: &'a mut [u8]) -> Obfuscated<'a> {
        if self.is_plain() || packet.len() < 4 {
            return Obfuscated::InPlace(packet);
        }

        let (mapped, junk) = match read_type(packet) {
            TYPE_INITIATION => (self.h1, usize::from(self.s1)),
            TYPE_RESPONSE => (self.h2, usize::from(self.s2)),
            TYPE_COOKIE => (self.h3, 0),
            TYPE_DATA => (self.h4, 0),
            _ => return Obfuscated::InPlace(packet),
        };

        write_type(packet, mapped);

        if junk == 0 {
            return Obfuscated::InPlace(packet);
        }

        let mut out = vec![0u8; junk + packet.len()];
        rand::thread_rng().fill(&mut out[..junk]);
        out[junk..].copy_from_slice(packet);

        Obfuscated::Replaced(out)
    }

    /// Recovers the WireGuard packet from an incoming datagram.
    ///
    /// Returns `None` for junk datagrams, which are simply dropped.
    pub(crate) fn deobfuscate<'a>(&self, datagram: &'a mut [u8]) -> Option<&'a mut [u8]> {
        if self.is_plain() {
            return Some(datagram);
        }

        // Data and cookie messages carry no junk prefix; check them first
        // since data is the steady state.
        if datagram.len() >= 4 {
            let msg_type = read_type(datagram);

            if msg_type == self.h4 {
                write_type(datagram, TYPE_DATA);
                return Some(datagram);
            }

            if msg_type == self.h3 {
                write_type(datagram, TYPE_COOKIE);
                return Some(datagram);
            }
        }

        let s2 = usize::from(self.s2);
        if datagram.len() >= s2 + 4 && read_type(&datagram[s2..]) == self.h2 {
            let packet = &mut datagram[s2..];
            write_type(packet, TYPE_RESPONSE);
            return Some(packet);
        }

        let s1 = usize::from(self.s1);
        if datagram.len() >= s1 + 4 && read_type(&datagram[s1..]) == self.h1 {
            let packet = &mut datagram[s1..];
            write_type(packet, TYPE_INITIATION);
            return Some(packet);
        }

        None
    }

    /// The junk datagrams preceding a handshake initiation.
    pub(crate) fn junk_packets(&self) -> Vec<Vec<u8>> {
        let mut rng = rand::thread_rng();

        (0..self.jc)
            .map(|_| {
                let len = rng.gen_range(usize::from(self.jmin)..=usize::from(self.jmax));
                let mut junk = vec![0u8; len];
                rng.fill(&mut junk[..]);

                junk
            })
            .collect()
    }
}

fn parse_option<T: std::str::FromStr>(
    config: &TunnelConfig,
    key: &'static str,
    default: T,
) -> Result<T, ProviderError>
where
    T::Err: std::fmt::Display,
{
    match config.option(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ProviderError::BadOption {
            key,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn read_type(packet: &[u8]) -> u32 {
    u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]])
}

fn write_type(packet: &mut [u8], msg_type: u32) {
    packet[..4].copy_from_slice(&msg_type.to_le_bytes());
}
