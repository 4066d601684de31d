use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use svclb_common::{BackendId, PROTO_ANY, Protocol};

#[derive(Debug, Parser)]
#[command(version, about = "Connect-time IPv4 service load balancing", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub pin: PinArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Load and attach the connect4 program, then serve metrics until stopped
    Run(RunArgs),

    /// Attach, register one service with one backend and send a request to it
    Smoke(SmokeArgs),

    /// Manage entries of the pinned service table
    #[command(subcommand)]
    Service(ServiceCommands),

    /// Manage entries of the pinned backend table
    #[command(subcommand)]
    Backend(BackendCommands),

    /// Show where a connection to VIP:PORT would be sent right now
    Resolve(ResolveArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PinArgs {
    /// Path to the bpf fs for bpf maps
    #[arg(long, global = true, env = "SVCLB_BPF_FS", default_value = "/sys/fs/bpf")]
    pub bpf_fs: PathBuf,

    /// Directory under the bpf fs the tables are pinned in
    #[arg(long, global = true, env = "SVCLB_PIN_NAME", default_value = "svclb")]
    pub pin_name: String,
}

impl PinArgs {
    pub fn pin_dir(&self) -> PathBuf {
        self.bpf_fs.join(&self.pin_name)
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoadArgs {
    /// Compiled connect4 object to load instead of the embedded one
    #[arg(long, env = "SVCLB_BPF_OBJECT")]
    pub bpf_object: Option<PathBuf>,

    /// cgroup v2 directory to attach to, defaults to the first cgroup2 mount
    #[arg(long, env = "SVCLB_CGROUP_PATH")]
    pub cgroup_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub load: LoadArgs,

    /// Metrics listener
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,

    /// How often table sizes are refreshed for metrics, in seconds
    #[arg(long, default_value = "10", value_parser = parse_seconds)]
    pub refresh_interval: Duration,
}

#[derive(Args, Debug, Clone)]
pub struct SmokeArgs {
    #[command(flatten)]
    pub load: LoadArgs,

    /// Virtual service address
    pub vip: Ipv4Addr,

    /// Address of the single backend
    pub backend: Ipv4Addr,

    /// Port of both the service and the backend
    #[arg(long, default_value = "80")]
    pub port: u16,

    #[arg(long, default_value = "500")]
    pub backend_id: BackendId,

    /// Request timeout, in seconds
    #[arg(long, default_value = "5", value_parser = parse_seconds)]
    pub timeout: Duration,
}

#[derive(Clone, Subcommand, Debug)]
pub enum ServiceCommands {
    /// Point a service at the given backends, in slot order
    Set {
        #[arg(long)]
        vip: Ipv4Addr,
        #[arg(long)]
        port: u16,
        /// Backend ids; none leaves the service registered but empty
        #[arg(long = "backend", num_args = 0..)]
        backends: Vec<BackendId>,
        #[arg(long, default_value = "0")]
        rev_nat: u16,
    },
    /// Withdraw a service, connections go to the original destination again
    Remove {
        #[arg(long)]
        vip: Ipv4Addr,
        #[arg(long)]
        port: u16,
    },
    /// List services and their slots
    List,
}

#[derive(Clone, Subcommand, Debug)]
pub enum BackendCommands {
    /// Insert or move a backend
    Set {
        #[arg(long)]
        id: BackendId,
        #[arg(long)]
        addr: Ipv4Addr,
        #[arg(long)]
        port: u16,
        /// TCP, UDP, SCTP or ANY
        #[arg(long, default_value = "tcp", value_parser = parse_protocol)]
        protocol: u8,
    },
    /// Remove a backend no service refers to
    Remove {
        #[arg(long)]
        id: BackendId,
    },
    /// List backends
    List,
}

#[derive(Args, Debug, Clone)]
pub struct ResolveArgs {
    #[arg(long)]
    pub vip: Ipv4Addr,

    #[arg(long)]
    pub port: u16,

    #[arg(long, default_value = "tcp", value_parser = parse_protocol)]
    pub protocol: u8,

    /// Fixed selection input, random when unset
    #[arg(long)]
    pub entropy: Option<u32>,
}

/// Protocol name to IP protocol number, `any` being 0.
pub fn parse_protocol(value: &str) -> Result<u8, String> {
    if value.eq_ignore_ascii_case("any") {
        return Ok(PROTO_ANY);
    }
    Protocol::try_from(value)
        .map(Protocol::number)
        .map_err(|e| e.to_string())
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| format!("invalid number of seconds: {e}"))
}

#[cfg(test)]
mod test {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_service_set() {
        let cli = Cli::parse_from([
            "svclb", "--pin-name", "lb", "service", "set", "--vip", "169.1.1.1", "--port", "80",
            "--backend", "500", "501",
        ]);
        assert_eq!(cli.pin.pin_dir(), PathBuf::from("/sys/fs/bpf/lb"));
        match cli.command {
            Commands::Service(ServiceCommands::Set {
                vip,
                port,
                backends,
                rev_nat,
            }) => {
                assert_eq!(vip, Ipv4Addr::new(169, 1, 1, 1));
                assert_eq!(port, 80);
                assert_eq!(backends, vec![500, 501]);
                assert_eq!(rev_nat, 0);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_smoke_defaults() {
        let cli = Cli::parse_from(["svclb", "smoke", "169.1.1.1", "10.0.0.5"]);
        match cli.command {
            Commands::Smoke(args) => {
                assert_eq!(args.port, 80);
                assert_eq!(args.backend_id, 500);
                assert_eq!(args.backend, Ipv4Addr::new(10, 0, 0, 5));
                assert_eq!(args.timeout, Duration::from_secs(5));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_protocol() {
        assert_eq!(parse_protocol("udp"), Ok(17));
        assert_eq!(parse_protocol("ANY"), Ok(PROTO_ANY));
        assert!(parse_protocol("icmp").is_err());
    }
}
