use std::sync::Arc;

use clap::Parser;
use svclb::config::{
    BackendCommands, Cli, Commands, PinArgs, ResolveArgs, RunArgs, ServiceCommands, SmokeArgs,
};
use svclb::loader::{self, BackendMap, Datapath, ServiceMap};
use svclb::manager::TableManager;
use svclb::metrics::Metrics;
use svclb::{Result, http, list, smoke};
use svclb_common::{Backend4Key, Backend4Value, ConnectTuple, Protocol, Service4Key, Verdict};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type PinnedManager = TableManager<ServiceMap, BackendMap>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_subscriber();

    let out = match cli.command {
        Commands::Run(args) => run(&cli.pin, args).await,
        Commands::Smoke(args) => run_smoke(&cli.pin, args).await,
        Commands::Service(cmd) => service(&cli.pin, cmd),
        Commands::Backend(cmd) => backend(&cli.pin, cmd),
        Commands::Resolve(args) => resolve(&cli.pin, args),
    };
    if let Err(e) = out {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(pin: &PinArgs, args: RunArgs) -> Result<()> {
    let metrics = Metrics::default();
    let mut datapath = Datapath::load(pin, &args.load)?;
    let (services, backends) = datapath.take_maps()?;
    let mut manager =
        TableManager::try_from_maps(services, backends)?.with_metrics(metrics.tables.clone());
    let pruned = manager.prune_stale_slots()?;
    manager.resync()?;
    info!(
        services = manager.services().len(),
        backends = manager.backends().len(),
        pruned,
        "recovered pinned tables"
    );

    let cancel = CancellationToken::new();
    let mut metrics_handle = tokio::spawn(http::serve(
        args.metrics_address,
        Arc::new(http::State::new(metrics)),
        cancel.child_token(),
    ));
    let mut refresh_handle = tokio::spawn(refresh_tables(
        manager,
        args.refresh_interval,
        cancel.child_token(),
    ));
    let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });
    // watch for shutdown and errors
    tokio::select! {
        h = &mut metrics_handle => exit("metrics", h),
        h = &mut refresh_handle => exit("refresh", h),
        _ = &mut shutdown_handle => {
                cancel.cancel();
                let (metrics, refresh) = tokio::join!(metrics_handle, refresh_handle);
                if let Err(m) = metrics {
                    error!("metrics exited with error: {}", m.to_string());
                }
                if let Err(r) = refresh {
                    error!("refresh exited with error: {}", r.to_string());
                }
            },
    };
    drop(datapath);
    info!("detached, pinned tables left in {}", pin.pin_dir().display());
    Ok(())
}

async fn refresh_tables(
    mut manager: PinnedManager,
    interval: std::time::Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                if let Err(e) = manager.resync() {
                    warn!(%e, "failed to read lb tables");
                }
            }
        }
    }
}

async fn run_smoke(pin: &PinArgs, args: SmokeArgs) -> Result<()> {
    let mut datapath = Datapath::load(pin, &args.load)?;
    let (services, backends) = datapath.take_maps()?;
    let mut manager = TableManager::try_from_maps(services, backends)?;
    smoke::bootstrap(
        &mut manager,
        args.vip,
        args.backend,
        args.port,
        args.backend_id,
    )?;

    match smoke::fetch(args.vip, args.port, args.timeout).await {
        Ok(summary) => info!(vip = %args.vip, backend = %args.backend, "response: {summary}"),
        Err(e) => error!(vip = %args.vip, backend = %args.backend, "request failed: {e}"),
    }
    drop(datapath);
    Ok(())
}

fn open_manager(pin: &PinArgs) -> Result<PinnedManager> {
    let (services, backends) = loader::open_pinned_maps(&pin.pin_dir())?;
    TableManager::try_from_maps(services, backends)
}

fn service(pin: &PinArgs, cmd: ServiceCommands) -> Result<()> {
    let mut manager = open_manager(pin)?;
    match cmd {
        ServiceCommands::Set {
            vip,
            port,
            backends,
            rev_nat,
        } => manager.set_backends(vip, port, &backends, rev_nat)?,
        ServiceCommands::Remove { vip, port } => {
            manager.remove_service(&Service4Key::master(vip, port))?
        }
        ServiceCommands::List => {
            println!("{}", list::render(list::service_rows(manager.services())));
        }
    }
    Ok(())
}

fn backend(pin: &PinArgs, cmd: BackendCommands) -> Result<()> {
    let mut manager = open_manager(pin)?;
    match cmd {
        BackendCommands::Set {
            id,
            addr,
            port,
            protocol,
        } => {
            let value = match Protocol::try_from(protocol) {
                Ok(protocol) => Backend4Value::new(addr, port, protocol),
                Err(_) => Backend4Value::any_protocol(addr, port),
            };
            manager.upsert_backend(Backend4Key { id }, value)?
        }
        BackendCommands::Remove { id } => manager.remove_backend(&Backend4Key { id })?,
        BackendCommands::List => {
            println!("{}", list::render(list::backend_rows(manager.backends())));
        }
    }
    Ok(())
}

fn resolve(pin: &PinArgs, args: ResolveArgs) -> Result<()> {
    let manager = open_manager(pin)?;
    let entropy = args.entropy.unwrap_or_else(rand::random);
    let tuple = ConnectTuple::new(args.vip, args.port, args.protocol);
    match manager.resolve(&tuple, entropy) {
        Verdict::Passthrough => {
            println!("{}:{} is not a service, passthrough", args.vip, args.port)
        }
        Verdict::Redirect(dest) => println!(
            "{}:{} -> {}:{}",
            args.vip,
            args.port,
            dest.ip(),
            dest.port()
        ),
        Verdict::Deny(reason) => println!("{}:{} denied: {reason:?}", args.vip, args.port),
    }
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "svclb=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(%e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(%e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {
          info!("captured ctrl_c signal");
        },
        _ = terminate => {},
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited")
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}")
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}")
        }
    }
}
