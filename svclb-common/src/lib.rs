#![cfg_attr(not(test), no_std)]

pub mod resolve;
pub mod service;

use core::fmt::Display;

pub use resolve::{ConnectTuple, DenyReason, Destination, LbTables, Verdict, resolve, select_slot};
pub use service::{Backend4Key, Backend4Value, Service4Key, Service4Value};

pub type BackendId = u32;
pub type Slot = u16;

/// Slot holding the service master record.
pub const MASTER_SLOT: Slot = 0;

/// Backend protocol tag matching any transport.
pub const PROTO_ANY: u8 = 0;

pub const SERVICE_MAP_NAME: &str = "v4_svc_map";
pub const BACKEND_MAP_NAME: &str = "v4_backend_map";
pub const CONNECT4_PROGRAM_NAME: &str = "svclb_connect4";

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Default)]
pub enum Protocol {
    #[default]
    Tcp = 6,
    Udp = 17,
    Sctp = 132,
}

impl Protocol {
    pub const fn number(self) -> u8 {
        self as u8
    }
}

impl TryFrom<&str> for Protocol {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "TCP" | "tcp" | "Tcp" => Ok(Protocol::Tcp),
            "UDP" | "udp" | "Udp" => Ok(Protocol::Udp),
            "SCTP" | "sctp" | "Sctp" => Ok(Protocol::Sctp),
            _ => Err("protocol must be one of TCP, UDP or SCTP"),
        }
    }
}

impl TryFrom<u8> for Protocol {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            6 => Ok(Protocol::Tcp),
            17 => Ok(Protocol::Udp),
            132 => Ok(Protocol::Sctp),
            _ => Err("protocol number must be 6 (TCP), 17 (UDP) or 132 (SCTP)"),
        }
    }
}

impl TryFrom<u32> for Protocol {
    type Error = &'static str;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .map_err(|_| "protocol number out of range")
            .and_then(Protocol::try_from)
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Sctp => write!(f, "SCTP"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_protocol_conversions() {
        assert_eq!(Protocol::try_from("tcp"), Ok(Protocol::Tcp));
        assert_eq!(Protocol::try_from("SCTP"), Ok(Protocol::Sctp));
        assert!(Protocol::try_from("icmp").is_err());

        assert_eq!(Protocol::try_from(17u8), Ok(Protocol::Udp));
        assert_eq!(Protocol::try_from(132u32), Ok(Protocol::Sctp));
        assert!(Protocol::try_from(300u32).is_err());
        assert!(Protocol::try_from(PROTO_ANY).is_err());

        assert_eq!(Protocol::Udp.number(), 17);
        assert_eq!(Protocol::Tcp.to_string(), "TCP");
    }
}
