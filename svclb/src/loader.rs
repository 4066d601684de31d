use std::fs::File;
use std::os::fd::AsFd;
use std::path::Path;

use aya::maps::{HashMap, Map, MapData};
use aya::programs::cgroup_sock_addr::CgroupSockAddrLinkId;
use aya::programs::{CgroupAttachMode, CgroupSockAddr};
use aya::{Ebpf, EbpfLoader};
use nix::sys::resource::{RLIM_INFINITY, Resource, setrlimit};
use svclb_common::{
    BACKEND_MAP_NAME, Backend4Key, Backend4Value, CONNECT4_PROGRAM_NAME, SERVICE_MAP_NAME,
    Service4Key, Service4Value,
};
use tracing::{debug, info, warn};

use crate::config::{LoadArgs, PinArgs};
use crate::{Error, Result, cgroup};

pub type ServiceMap = HashMap<MapData, Service4Key, Service4Value>;
pub type BackendMap = HashMap<MapData, Backend4Key, Backend4Value>;

/// The loaded connect4 program. Dropping it detaches the program; the pinned
/// tables stay behind in the bpf fs.
pub struct Datapath {
    ebpf: Ebpf,
    _link_id: CgroupSockAddrLinkId,
}

impl Datapath {
    pub fn load(pin: &PinArgs, args: &LoadArgs) -> Result<Self> {
        raise_memlock_rlimit()?;

        let pin_dir = pin.pin_dir();
        std::fs::create_dir_all(&pin_dir)?;

        let mut loader = EbpfLoader::new();
        loader.map_pin_path(&pin_dir);
        let mut ebpf = match &args.bpf_object {
            Some(path) => {
                info!(path = %path.display(), "loading bpf object");
                loader.load_file(path)?
            }
            None => load_embedded(&mut loader)?,
        };
        if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
            warn!(%e, "failed to init ebpf logger");
        }
        for (name, _) in ebpf.maps() {
            debug!(name, pin_dir = %pin_dir.display(), "map ready");
        }
        info!(
            service_key_size = size_of::<Service4Key>(),
            service_value_size = size_of::<Service4Value>(),
            backend_key_size = size_of::<Backend4Key>(),
            backend_value_size = size_of::<Backend4Value>(),
            "loaded lb tables"
        );

        let cgroup_path = cgroup::cgroup_path(args.cgroup_path.as_deref())?;
        let cgroup = File::open(&cgroup_path)?;
        let _link_id = attach_cgroup_connect_bpf_program(
            &mut ebpf,
            cgroup,
            CONNECT4_PROGRAM_NAME,
            CgroupAttachMode::Single,
        )?;
        info!(cgroup = %cgroup_path.display(), "attached {CONNECT4_PROGRAM_NAME}");

        Ok(Self { ebpf, _link_id })
    }

    /// Takes the tables out of the loaded object; the attached program keeps
    /// using them.
    pub fn take_maps(&mut self) -> Result<(ServiceMap, BackendMap)> {
        let services = take_map(&mut self.ebpf, SERVICE_MAP_NAME)?.try_into()?;
        let backends = take_map(&mut self.ebpf, BACKEND_MAP_NAME)?.try_into()?;
        Ok((services, backends))
    }
}

/// Opens the tables pinned by a running instance.
pub fn open_pinned_maps(pin_dir: &Path) -> Result<(ServiceMap, BackendMap)> {
    debug!(pin_dir = %pin_dir.display(), "opening pinned maps");
    let services = open_pinned(pin_dir, SERVICE_MAP_NAME)?.try_into()?;
    let backends = open_pinned(pin_dir, BACKEND_MAP_NAME)?.try_into()?;
    Ok((services, backends))
}

fn open_pinned(pin_dir: &Path, name: &str) -> Result<Map> {
    let path = pin_dir.join(name);
    if !path.exists() {
        return Err(Error::MapNotFound { name: name.into() });
    }
    let map = MapData::from_pin(&path)?;
    Ok(Map::HashMap(map))
}

fn take_map(ebpf: &mut Ebpf, name: &str) -> Result<Map> {
    ebpf.take_map(name)
        .ok_or_else(|| Error::MapNotFound { name: name.into() })
}

fn raise_memlock_rlimit() -> Result<()> {
    setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY)?;
    Ok(())
}

#[cfg(feature = "embedded")]
fn load_embedded(loader: &mut EbpfLoader<'_>) -> Result<Ebpf> {
    Ok(loader.load(aya::include_bytes_aligned!(concat!(
        env!("OUT_DIR"),
        "/svclb-ebpf"
    )))?)
}

#[cfg(not(feature = "embedded"))]
fn load_embedded(_loader: &mut EbpfLoader<'_>) -> Result<Ebpf> {
    Err(Error::EbpfError(
        "built without an embedded bpf object, pass --bpf-object".into(),
    ))
}

fn attach_cgroup_connect_bpf_program<F: AsFd>(
    ebpf: &mut Ebpf,
    cgroup: F,
    name: &str,
    attach_mode: CgroupAttachMode,
) -> Result<CgroupSockAddrLinkId> {
    let program: &mut CgroupSockAddr = ebpf
        .program_mut(name)
        .ok_or_else(|| Error::EbpfProgramError(format!("failed to load program {name}")))?
        .try_into()?;
    if let Err(e) = program.load()
        && !matches!(e, aya::programs::ProgramError::AlreadyLoaded)
    {
        return Err(e.into());
    };
    Ok(program.attach(cgroup, attach_mode)?)
}
