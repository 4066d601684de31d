//! Backend selection run on every IPv4 connect attempt.
//!
//! Shared verbatim between the `connect4` program and host-side tooling, so it
//! takes its entropy as an argument and never allocates.

use core::net::Ipv4Addr;

use crate::{Backend4Key, Backend4Value, PROTO_ANY, Service4Key, Service4Value, Slot};

/// Read-only view of the service and backend tables.
pub trait LbTables {
    fn service(&self, key: &Service4Key) -> Option<Service4Value>;
    fn backend(&self, key: &Backend4Key) -> Option<Backend4Value>;
}

/// Destination of a connect attempt as seen in `bpf_sock_addr`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectTuple {
    pub address: [u8; 4],
    pub port: [u8; 2],
    pub protocol: u8,
}

impl ConnectTuple {
    pub const fn new(address: Ipv4Addr, port: u16, protocol: u8) -> Self {
        Self {
            address: address.octets(),
            port: port.to_be_bytes(),
            protocol,
        }
    }

    fn master_key(&self) -> Service4Key {
        Service4Key {
            address: self.address,
            port: self.port,
            backend_slot: crate::MASTER_SLOT,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Destination {
    pub address: [u8; 4],
    pub port: [u8; 2],
}

impl Destination {
    pub const fn ip(&self) -> Ipv4Addr {
        let [a, b, c, d] = self.address;
        Ipv4Addr::new(a, b, c, d)
    }

    pub const fn port(&self) -> u16 {
        u16::from_be_bytes(self.port)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DenyReason {
    /// Master record present with `count == 0`.
    EmptyService,
    /// Master record covers no backend slot (`count == 1`).
    NoBackendSlots,
    SlotMissing { slot: Slot },
    BackendMissing { slot: Slot, backend_id: u32 },
    ProtocolMismatch { backend_id: u32 },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// Not a virtual service; leave the connection alone.
    Passthrough,
    Redirect(Destination),
    Deny(DenyReason),
}

/// Maps entropy onto the backend slots of a master whose `count` includes
/// slot 0. Returns `None` when no backend slot exists.
#[inline(always)]
pub fn select_slot(count: u16, entropy: u32) -> Option<Slot> {
    let backends = count.checked_sub(1).filter(|n| *n > 0)?;
    let offset = entropy % u32::from(backends);
    Some(1 + offset as Slot)
}

#[inline(always)]
pub fn resolve<T: LbTables>(tables: &T, tuple: &ConnectTuple, entropy: u32) -> Verdict {
    let master_key = tuple.master_key();
    let Some(master) = tables.service(&master_key) else {
        return Verdict::Passthrough;
    };
    if master.count == 0 {
        return Verdict::Deny(DenyReason::EmptyService);
    }
    let Some(slot) = select_slot(master.count, entropy) else {
        return Verdict::Deny(DenyReason::NoBackendSlots);
    };

    let Some(assignment) = tables.service(&master_key.with_slot(slot)) else {
        return Verdict::Deny(DenyReason::SlotMissing { slot });
    };
    let backend_id = assignment.backend_id;
    let Some(backend) = tables.backend(&Backend4Key { id: backend_id }) else {
        return Verdict::Deny(DenyReason::BackendMissing { slot, backend_id });
    };

    if backend.proto != PROTO_ANY && backend.proto != tuple.protocol {
        return Verdict::Deny(DenyReason::ProtocolMismatch { backend_id });
    }

    Verdict::Redirect(Destination {
        address: backend.address,
        port: backend.port,
    })
}
