use clap::Parser;
use cli::{Cli, Command, DebugCommand, DownArgs, RemoteCommand, ResourceSelector};
use errors::{PodwireError, Result as PodwireResult};
use k8s::client::K8sClient;
use k8s::workload::Workload;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use session::coordinator;
use session::types::{ContainerRef, Mode, Session, SyncMode, WorkloadKind, WorkloadRef};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod cli;
mod errors;
mod k8s;
mod keys;
mod session;
mod ssh_config;
mod sync_engine;
mod tunnel;
mod version;
mod wizard;
mod workspace;

/// Resolves `--namespace`/`--deployment`/`--statefulset`/`--daemonset`/
/// `--container`, falling back to the interactive wizard for whichever
/// weren't supplied on the command line (spec.md §6's wizard supplement).
/// Returns the resolved selector plus whether the target container turned
/// out to be an init container.
async fn resolve_selector(
    client: &K8sClient,
    selector: &ResourceSelector,
) -> PodwireResult<(String, WorkloadKind, String, String, bool)> {
    let namespace = match &selector.namespace {
        Some(ns) => ns.clone(),
        None => wizard::select_namespace(client).await?,
    };

    let explicit = [
        selector.deployment.as_ref().map(|n| (WorkloadKind::Deployment, n.clone())),
        selector.statefulset.as_ref().map(|n| (WorkloadKind::StatefulSet, n.clone())),
        selector.daemonset.as_ref().map(|n| (WorkloadKind::DaemonSet, n.clone())),
    ]
    .into_iter()
    .flatten()
    .next();

    let (kind, name) = match explicit {
        Some(pair) => pair,
        None => wizard::select_workload(client, &namespace).await?,
    };

    let (container, is_init) = resolve_container(client, &namespace, kind, &name, selector.container.as_deref()).await?;

    Ok((namespace, kind, name, container, is_init))
}

/// Fetches the workload once to either validate an explicit `--container`
/// flag against it (returning its init-ness) or hand it to the container
/// wizard.
async fn resolve_container(
    client: &K8sClient,
    namespace: &str,
    kind: WorkloadKind,
    name: &str,
    explicit_container: Option<&str>,
) -> PodwireResult<(String, bool)> {
    match kind {
        WorkloadKind::Deployment => {
            let w: Deployment = client.get_workload(namespace, name).await?;
            pick_container(&w, explicit_container)
        }
        WorkloadKind::StatefulSet => {
            let w: StatefulSet = client.get_workload(namespace, name).await?;
            pick_container(&w, explicit_container)
        }
        WorkloadKind::DaemonSet => {
            let w: DaemonSet = client.get_workload(namespace, name).await?;
            pick_container(&w, explicit_container)
        }
    }
}

fn pick_container<W: Workload>(workload: &W, explicit: Option<&str>) -> PodwireResult<(String, bool)> {
    match explicit {
        Some(name) => {
            let (_, is_init) = workload.container_index(name)?;
            Ok((name.to_string(), is_init))
        }
        None => wizard::select_container(workload),
    }
}

/// Spinner shown while a bring-up is underway, matching the briefer
/// `info!` progress lines with something visible for an interactive
/// terminal. Purely cosmetic — the actual stage transitions are logged via
/// `tracing` regardless of whether a TTY is attached.
fn bring_up_spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = cli
        .log_filter
        .clone()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = run(cli).await {
        error!(%err, "podwire failed");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Version { show_all } => {
            version::run(show_all).await;
            Ok(())
        }
        Command::Remote(RemoteCommand::Up(args)) => remote_up(args).await,
        Command::Remote(RemoteCommand::Down(args)) => down(args, Mode::RemoteDev).await,
        Command::Debug(DebugCommand::Up(args)) => debug_up(args).await,
        Command::Debug(DebugCommand::Down(args)) => down(args, Mode::Debug).await,
    }
}

/// Expands to a `match` over the three workload kinds, binding a local type
/// alias `$ty` so the body can call kind-generic functions (`Workload`
/// bound) with a concrete type. Mirrors spec.md's Design Notes on
/// dispatch tables over deep inheritance.
macro_rules! with_workload_kind {
    ($kind:expr, |$ty:ident| $body:expr) => {
        match $kind {
            WorkloadKind::Deployment => {
                type $ty = Deployment;
                $body
            }
            WorkloadKind::StatefulSet => {
                type $ty = StatefulSet;
                $body
            }
            WorkloadKind::DaemonSet => {
                type $ty = DaemonSet;
                $body
            }
        }
    };
}

async fn remote_up(args: cli::RemoteUpArgs) -> anyhow::Result<()> {
    // port mappings are validated before any cluster call (spec.md Testable
    // Property 5 / Scenario S5); sync mode is validated by clap itself.
    let port_mappings = session::types::parse_port_mappings(&args.port_mappings)?;
    let sync_mode = args.sync_mode;

    let client = K8sClient::try_default().await?;
    let (namespace, kind, workload_name, container_name, is_init) =
        resolve_selector(&client, &args.selector).await?;

    let local_sync_path = match args.local_sync_path {
        Some(p) => p,
        None => wizard::prompt_local_sync_path()?,
    };
    let remote_sync_path = match args.remote_sync_path {
        Some(p) => p,
        None => wizard::prompt_remote_sync_path()?,
    };

    let session = Session {
        mode: Mode::RemoteDev,
        namespace,
        workload: WorkloadRef { kind, name: workload_name },
        container: ContainerRef {
            name: container_name,
            image: String::new(),
            is_init,
        },
        local_sync_path: Some(local_sync_path),
        remote_sync_path: Some(remote_sync_path),
        sync_mode,
        port_mappings,
        wait_timeout_sec: args.wait_timeout,
        started_at: unix_now(),
        force_recreate: args.force_recreate,
    };

    with_workload_kind!(kind, |W| {
        let spinner = bring_up_spinner("bringing up remote-dev session");
        let result = coordinator::bring_up_remote_dev::<W>(client.clone(), session, !args.no_tty).await;
        spinner.finish_and_clear();
        let running = result?;

        info!("remote-dev session running, waiting for shutdown signal");
        let signal = wait_for_shutdown().await;

        let spinner = bring_up_spinner("tearing down remote-dev session");
        let teardown_result = coordinator::teardown::<W>(running).await;
        spinner.finish_and_clear();
        teardown_result?;

        return Err(PodwireError::SignalTerminated(signal).into());
    });
}

async fn debug_up(args: cli::DebugUpArgs) -> anyhow::Result<()> {
    let env_overrides: Vec<(String, String)> = args
        .env
        .iter()
        .map(|raw| cli::parse_env_definition(raw))
        .collect::<PodwireResult<Vec<_>>>()?;

    let limits: Vec<(String, String)> = args
        .limits
        .iter()
        .map(|raw| cli::parse_resource_quantity(raw))
        .collect::<PodwireResult<Vec<_>>>()?;
    let requests: Vec<(String, String)> = args
        .requests
        .iter()
        .map(|raw| cli::parse_resource_quantity(raw))
        .collect::<PodwireResult<Vec<_>>>()?;

    let resources_override = if limits.is_empty() && requests.is_empty() {
        None
    } else {
        let mut obj = serde_json::Map::new();
        if !limits.is_empty() {
            obj.insert(
                "limits".to_string(),
                serde_json::Value::Object(
                    limits.into_iter().map(|(k, v)| (k, serde_json::Value::String(v))).collect(),
                ),
            );
        }
        if !requests.is_empty() {
            obj.insert(
                "requests".to_string(),
                serde_json::Value::Object(
                    requests.into_iter().map(|(k, v)| (k, serde_json::Value::String(v))).collect(),
                ),
            );
        }
        Some(serde_json::Value::Object(obj))
    };

    let client = K8sClient::try_default().await?;
    let (namespace, kind, workload_name, container_name, is_init) =
        resolve_selector(&client, &args.selector).await?;

    let session = Session {
        mode: Mode::Debug,
        namespace,
        workload: WorkloadRef { kind, name: workload_name },
        container: ContainerRef {
            name: container_name,
            image: String::new(),
            is_init,
        },
        local_sync_path: None,
        remote_sync_path: None,
        sync_mode: SyncMode::None,
        port_mappings: Vec::new(),
        wait_timeout_sec: args.wait_timeout,
        started_at: unix_now(),
        force_recreate: args.force_recreate,
    };

    with_workload_kind!(kind, |W| {
        let spinner = bring_up_spinner("bringing up debug session");
        let result = coordinator::bring_up_debug::<W>(client.clone(), session, env_overrides, resources_override).await;
        spinner.finish_and_clear();
        let running = result?;

        info!("debug session running, waiting for shutdown signal");
        let signal = wait_for_shutdown().await;

        let spinner = bring_up_spinner("tearing down debug session");
        let teardown_result = coordinator::teardown::<W>(running).await;
        spinner.finish_and_clear();
        teardown_result?;

        return Err(PodwireError::SignalTerminated(signal).into());
    });
}

async fn down(args: DownArgs, mode: Mode) -> anyhow::Result<()> {
    let namespace = args.namespace.ok_or(PodwireError::NoNamespaceSelected)?;

    let (kind, name) = [
        args.deployment.map(|n| (WorkloadKind::Deployment, n)),
        args.statefulset.map(|n| (WorkloadKind::StatefulSet, n)),
        args.daemonset.map(|n| (WorkloadKind::DaemonSet, n)),
    ]
    .into_iter()
    .flatten()
    .next()
    .ok_or(PodwireError::NoResourceSelected)?;

    let client = K8sClient::try_default().await?;

    with_workload_kind!(kind, |W| {
        coordinator::teardown_by_name::<W>(&client, &namespace, &name, mode).await?;
    });

    Ok(())
}

/// Blocks until SIGINT/SIGTERM, matching spec.md §5's signal watcher task.
/// Returns the signal name so the caller can surface
/// `PodwireError::SignalTerminated` after teardown completes (spec.md §7,
/// Scenario S6).
async fn wait_for_shutdown() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => { info!("received SIGINT"); "SIGINT" }
            _ = sigterm.recv() => { info!("received SIGTERM"); "SIGTERM" }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
        "SIGINT"
    }
}
