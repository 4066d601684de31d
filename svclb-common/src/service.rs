use core::net::Ipv4Addr;

use crate::{BackendId, MASTER_SLOT, PROTO_ANY, Protocol, Slot};

/// Key of `v4_svc_map`. Address octets are in network order and the port is
/// stored big-endian so the key can be built straight from `bpf_sock_addr`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Service4Key {
    pub address: [u8; 4],
    pub port: [u8; 2],
    pub backend_slot: Slot,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for Service4Key {}

impl Service4Key {
    pub const fn new(address: Ipv4Addr, port: u16, backend_slot: Slot) -> Self {
        Self {
            address: address.octets(),
            port: port.to_be_bytes(),
            backend_slot,
        }
    }

    pub const fn master(address: Ipv4Addr, port: u16) -> Self {
        Self::new(address, port, MASTER_SLOT)
    }

    /// Same service, different slot.
    pub const fn with_slot(self, backend_slot: Slot) -> Self {
        Self {
            address: self.address,
            port: self.port,
            backend_slot,
        }
    }

    pub const fn is_master(&self) -> bool {
        self.backend_slot == MASTER_SLOT
    }

    pub const fn ip(&self) -> Ipv4Addr {
        let [a, b, c, d] = self.address;
        Ipv4Addr::new(a, b, c, d)
    }

    pub const fn port(&self) -> u16 {
        u16::from_be_bytes(self.port)
    }
}

/// Value of `v4_svc_map`.
///
/// On the master slot `count` is the number of slots of the service including
/// the master itself, so backends live in slots `1..count`. On backend slots
/// `backend_id` points into `v4_backend_map` and `count` is unused.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Default)]
pub struct Service4Value {
    pub backend_id: BackendId,
    pub count: u16,
    pub rev_nat: u16,
    pub flags: u8,
    pub flags2: u8,
    pub pad: [u8; 2],
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for Service4Value {}

impl Service4Value {
    pub const fn master(count: u16, rev_nat: u16) -> Self {
        Self {
            backend_id: 0,
            count,
            rev_nat,
            flags: 0,
            flags2: 0,
            pad: [0; 2],
        }
    }

    pub const fn slot(backend_id: BackendId, rev_nat: u16) -> Self {
        Self {
            backend_id,
            count: 0,
            rev_nat,
            flags: 0,
            flags2: 0,
            pad: [0; 2],
        }
    }

    /// Number of backend slots a master record covers.
    pub const fn backend_slots(&self) -> u16 {
        self.count.saturating_sub(1)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Backend4Key {
    pub id: BackendId,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for Backend4Key {}

impl From<BackendId> for Backend4Key {
    fn from(id: BackendId) -> Self {
        Self { id }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Backend4Value {
    pub address: [u8; 4],
    pub port: [u8; 2],
    pub proto: u8,
    pub flags: u8,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for Backend4Value {}

impl Backend4Value {
    pub const fn new(address: Ipv4Addr, port: u16, protocol: Protocol) -> Self {
        Self {
            address: address.octets(),
            port: port.to_be_bytes(),
            proto: protocol.number(),
            flags: 0,
        }
    }

    /// A backend reachable over whatever transport the client socket uses.
    pub const fn any_protocol(address: Ipv4Addr, port: u16) -> Self {
        Self {
            address: address.octets(),
            port: port.to_be_bytes(),
            proto: PROTO_ANY,
            flags: 0,
        }
    }

    pub const fn ip(&self) -> Ipv4Addr {
        let [a, b, c, d] = self.address;
        Ipv4Addr::new(a, b, c, d)
    }

    pub const fn port(&self) -> u16 {
        u16::from_be_bytes(self.port)
    }

    /// `None` when the backend accepts any transport or carries an unknown tag.
    pub fn protocol(&self) -> Option<Protocol> {
        Protocol::try_from(self.proto).ok()
    }
}

#[cfg(test)]
mod test {
    use core::mem::size_of;

    use super::*;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(size_of::<Service4Key>(), 8);
        assert_eq!(size_of::<Service4Value>(), 12);
        assert_eq!(size_of::<Backend4Key>(), 4);
        assert_eq!(size_of::<Backend4Value>(), 8);
    }

    #[test]
    fn test_port_is_big_endian() {
        let key = Service4Key::master(Ipv4Addr::new(169, 1, 1, 1), 80);
        assert_eq!(key.port, [0, 80]);
        assert_eq!(key.address, [169, 1, 1, 1]);
        assert_eq!(key.port(), 80);
        assert!(key.is_master());

        let backend = Backend4Value::new(Ipv4Addr::new(10, 0, 0, 1), 8080, Protocol::Tcp);
        assert_eq!(backend.port, [0x1f, 0x90]);
    }

    #[test]
    fn test_backend_round_trip() {
        let backend = Backend4Value::new(Ipv4Addr::new(10, 1, 2, 3), 443, Protocol::Udp);
        assert_eq!(backend.ip(), Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(backend.port(), 443);
        assert_eq!(backend.protocol(), Some(Protocol::Udp));

        let any = Backend4Value::any_protocol(Ipv4Addr::new(10, 1, 2, 3), 443);
        assert_eq!(any.protocol(), None);
    }

    #[test]
    fn test_backend_slots() {
        assert_eq!(Service4Value::master(0, 0).backend_slots(), 0);
        assert_eq!(Service4Value::master(1, 0).backend_slots(), 0);
        assert_eq!(Service4Value::master(4, 0).backend_slots(), 3);

        let key = Service4Key::master(Ipv4Addr::new(10, 96, 0, 1), 53).with_slot(2);
        assert_eq!(key.backend_slot, 2);
        assert!(!key.is_master());
    }
}
