#![no_std]

pub mod connect4;

use aya_ebpf::macros::map;
use aya_ebpf::maps::HashMap;
use svclb_common::{Backend4Key, Backend4Value, Service4Key, Service4Value};

// Pinned by name so the control plane and other readers can reopen them from
// the bpf fs after a restart.
#[map(name = "v4_svc_map")]
static V4_SVC_MAP: HashMap<Service4Key, Service4Value> = HashMap::pinned(65536, 0);

#[map(name = "v4_backend_map")]
static V4_BACKEND_MAP: HashMap<Backend4Key, Backend4Value> = HashMap::pinned(65536, 0);
