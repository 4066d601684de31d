use aya_ebpf::{helpers::generated::bpf_get_prandom_u32, programs::SockAddrContext};
use aya_log_ebpf::{debug, info, warn};
use svclb_common::{
    Backend4Key, Backend4Value, ConnectTuple, DenyReason, LbTables, Service4Key, Service4Value,
    Verdict, resolve,
};

use crate::{V4_BACKEND_MAP, V4_SVC_MAP};

const AF_INET: u32 = 2;

// cgroup/connect4 return codes
const ALLOW: i32 = 1;
const DENY: i32 = 0;

/// Lookups against the pinned maps. Values are copied out because the control
/// plane may replace or delete an entry while the program holds a reference.
struct PinnedTables;

impl LbTables for PinnedTables {
    #[inline(always)]
    fn service(&self, key: &Service4Key) -> Option<Service4Value> {
        unsafe { V4_SVC_MAP.get(key).copied() }
    }

    #[inline(always)]
    fn backend(&self, key: &Backend4Key) -> Option<Backend4Value> {
        unsafe { V4_BACKEND_MAP.get(key).copied() }
    }
}

/// Return codes [0(deny),1(allow)]
#[inline]
pub fn try_svclb_connect4(ctx: SockAddrContext) -> Result<i32, i32> {
    let ptr = ctx.sock_addr;

    if unsafe { (*ptr).user_family } != AF_INET {
        return Ok(ALLOW);
    }

    // user_ip4 and the low half of user_port are in network byte order, which
    // is the layout the map keys use, so the bytes are taken as they are.
    let tuple = unsafe {
        ConnectTuple {
            address: (*ptr).user_ip4.to_ne_bytes(),
            port: ((*ptr).user_port as u16).to_ne_bytes(),
            protocol: u8::try_from((*ptr).protocol).unwrap_or(0),
        }
    };

    match resolve(&PinnedTables, &tuple, get_random()) {
        Verdict::Passthrough => Ok(ALLOW),
        Verdict::Redirect(dest) => {
            unsafe {
                (*ptr).user_ip4 = u32::from_ne_bytes(dest.address);
                (*ptr).user_port = u16::from_ne_bytes(dest.port) as u32;
            }
            info!(
                &ctx,
                "redirecting {:i}:{} to {:i}:{}",
                u32::from_be_bytes(tuple.address),
                u16::from_be_bytes(tuple.port),
                u32::from_be_bytes(dest.address),
                u16::from_be_bytes(dest.port)
            );
            Ok(ALLOW)
        }
        Verdict::Deny(reason) => {
            log_deny(&ctx, &tuple, reason);
            Err(DENY)
        }
    }
}

#[inline(always)]
fn log_deny(ctx: &SockAddrContext, tuple: &ConnectTuple, reason: DenyReason) {
    let ip = u32::from_be_bytes(tuple.address);
    let port = u16::from_be_bytes(tuple.port);
    match reason {
        DenyReason::EmptyService | DenyReason::NoBackendSlots => {
            debug!(ctx, "service {:i}:{} has no backends", ip, port)
        }
        DenyReason::SlotMissing { slot } => {
            warn!(ctx, "service {:i}:{} slot {} missing", ip, port, slot)
        }
        DenyReason::BackendMissing { slot, backend_id } => warn!(
            ctx,
            "service {:i}:{} slot {} references missing backend {}", ip, port, slot, backend_id
        ),
        DenyReason::ProtocolMismatch { backend_id } => debug!(
            ctx,
            "backend {} of {:i}:{} does not serve protocol {}", backend_id, ip, port, tuple.protocol
        ),
    }
}

#[inline(always)]
fn get_random() -> u32 {
    unsafe { bpf_get_prandom_u32() }
}
