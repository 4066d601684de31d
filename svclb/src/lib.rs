pub mod cgroup;
pub mod config;
pub mod http;
pub mod list;
pub mod loader;
pub mod manager;
pub mod metrics;
pub mod smoke;
pub mod tables;

use aya::EbpfError;
use aya::programs::ProgramError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    EbpfError(String),

    #[error("{0}")]
    EbpfProgramError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("conversion error: {0}")]
    ConversionError(String),

    #[error("map error: {0}")]
    MapError(#[from] aya::maps::MapError),

    #[error("map {name} not found")]
    MapNotFound { name: String },

    #[error("failed to raise memlock rlimit: {0}")]
    Rlimit(#[from] nix::Error),

    #[error("cgroup2 not mounted")]
    CgroupNotMounted,

    #[error("batch has {keys} keys but {values} values")]
    BatchLength { keys: usize, values: usize },

    #[error("service {service} claims {count} slots but slot {slot} is not populated")]
    SlotsNotPopulated {
        service: String,
        count: u16,
        slot: u16,
    },

    #[error("slot {slot} of service {service} is still covered by its master record")]
    SlotInUse { service: String, slot: u16 },

    #[error("backend {0} not found")]
    BackendNotFound(u32),

    #[error("backend {id} is referenced by {references} service slot(s)")]
    BackendInUse { id: u32, references: usize },

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<aya::EbpfError> for Error {
    fn from(err: EbpfError) -> Self {
        Self::EbpfError(err.to_string())
    }
}

impl From<aya::programs::ProgramError> for Error {
    fn from(err: ProgramError) -> Self {
        Self::EbpfProgramError(err.to_string())
    }
}

impl Error {
    pub fn metric_label(&self) -> String {
        let label = format!("{self:?}");
        let label = label.split(['(', ' ', '{']).next().unwrap_or_default();
        label.to_lowercase()
    }
}
