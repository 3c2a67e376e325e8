use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use serde::de::{self, Deserialize, Deserializer, SeqAccess, Visitor};
use serde::ser::{Serialize, Serializer};
use serde_derive::Deserialize as DeserializeDerive;

use super::PeerAddresses;

/// Non-compact tracker responses list peers as dicts. Hostname and IPv6
/// entries are skipped; this client only dials IPv4.
#[derive(DeserializeDerive)]
struct DictPeer {
    ip: String,
    port: u16,
}

struct PeerAddressesVisitor;

impl<'de> Visitor<'de> for PeerAddressesVisitor {
    type Value = PeerAddresses;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str(
            "compact 6-byte address records or a list of peer dictionaries",
        )
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        if v.len() % 6 != 0 {
            return Err(E::custom(format!("length is {}", v.len())));
        }
        Ok(PeerAddresses(
            v.chunks_exact(6)
                .map(|slice_6| {
                    SocketAddrV4::new(
                        Ipv4Addr::new(slice_6[0], slice_6[1], slice_6[2], slice_6[3]),
                        u16::from_be_bytes([slice_6[4], slice_6[5]]),
                    )
                })
                .collect(),
        ))
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut addrs = Vec::new();
        while let Some(peer) = seq.next_element::<DictPeer>()? {
            if let Ok(ip) = peer.ip.parse::<Ipv4Addr>() {
                addrs.push(SocketAddrV4::new(ip, peer.port));
            }
        }
        Ok(PeerAddresses(addrs))
    }
}

impl<'de> Deserialize<'de> for PeerAddresses {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(PeerAddressesVisitor)
    }
}

impl Serialize for PeerAddresses {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut single_slice = Vec::with_capacity(6 * self.0.len());
        for peer in &self.0 {
            single_slice.extend(peer.ip().octets());
            single_slice.extend(peer.port().to_be_bytes());
        }
        serializer.serialize_bytes(&single_slice)
    }
}
