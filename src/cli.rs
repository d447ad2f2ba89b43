use clap::{crate_description, crate_version, Parser, Subcommand};

/// Turns a container inside a Kubernetes Deployment/StatefulSet/DaemonSet
/// into a live remote development target, or idles it for debugging.
#[derive(Parser, Debug)]
#[command(name = "podwire", version = crate_version!(), about = crate_description!())]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Filter expression for the tracing subscriber (overrides RUST_LOG).
    #[arg(long, global = true, env = "RUST_LOG")]
    pub log_filter: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Remote-development session: SSH server, synced volume, tunnels.
    #[command(subcommand)]
    Remote(RemoteCommand),
    /// Debug session: idle the target container for a shell attach.
    #[command(subcommand)]
    Debug(DebugCommand),
    /// Print program, sync-tool, and SSH-server image versions.
    Version {
        #[arg(long)]
        show_all: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum RemoteCommand {
    Up(RemoteUpArgs),
    Down(DownArgs),
}

#[derive(Subcommand, Debug)]
pub enum DebugCommand {
    Up(DebugUpArgs),
    Down(DownArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct ResourceSelector {
    #[arg(short = 'n', long, env = "PODWIRE_NAMESPACE")]
    pub namespace: Option<String>,

    #[arg(short = 'd', long, conflicts_with_all = ["statefulset", "daemonset"])]
    pub deployment: Option<String>,

    #[arg(short = 's', long, conflicts_with_all = ["deployment", "daemonset"])]
    pub statefulset: Option<String>,

    #[arg(short = 't', long, conflicts_with_all = ["deployment", "statefulset"])]
    pub daemonset: Option<String>,

    #[arg(long)]
    pub container: Option<String>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RemoteUpArgs {
    #[command(flatten)]
    pub selector: ResourceSelector,

    #[arg(short = 'l', long)]
    pub local_sync_path: Option<String>,

    #[arg(short = 'r', long)]
    pub remote_sync_path: Option<String>,

    /// `L>R` (forward) or `L<R` (reverse); repeatable or comma-separated.
    #[arg(short = 'p', long = "portforward")]
    pub port_mappings: Vec<String>,

    #[arg(long, value_enum, default_value = "two-way-resolved")]
    pub sync_mode: crate::session::types::SyncMode,

    #[arg(short = 'w', long, default_value_t = 120)]
    pub wait_timeout: u64,

    #[arg(long)]
    pub no_tty: bool,

    #[arg(long)]
    pub force_recreate: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct DebugUpArgs {
    #[command(flatten)]
    pub selector: ResourceSelector,

    #[arg(short = 'w', long, default_value_t = 120)]
    pub wait_timeout: u64,

    #[arg(long)]
    pub force_recreate: bool,

    /// `KEY=VALUE`, repeatable.
    #[arg(long = "env")]
    pub env: Vec<String>,

    /// `resource=quantity` (e.g. `cpu=500m`), repeatable.
    #[arg(long = "limit")]
    pub limits: Vec<String>,

    /// `resource=quantity` (e.g. `memory=256Mi`), repeatable.
    #[arg(long = "request")]
    pub requests: Vec<String>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct DownArgs {
    #[arg(short = 'n', long, env = "PODWIRE_NAMESPACE")]
    pub namespace: Option<String>,

    #[arg(short = 'd', long, conflicts_with_all = ["statefulset", "daemonset"])]
    pub deployment: Option<String>,

    #[arg(short = 's', long, conflicts_with_all = ["deployment", "daemonset"])]
    pub statefulset: Option<String>,

    #[arg(short = 't', long, conflicts_with_all = ["deployment", "statefulset"])]
    pub daemonset: Option<String>,
}

/// Parses `KEY=VALUE` env-var override syntax used by `debug up --env`.
pub fn parse_env_definition(raw: &str) -> crate::errors::Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| crate::errors::PodwireError::InvalidEnvDefinition(raw.to_string()))?;
    if key.is_empty() {
        return Err(crate::errors::PodwireError::InvalidEnvDefinition(raw.to_string()));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Parses `resource=quantity` syntax used by `debug up --limit`/`--request`.
pub fn parse_resource_quantity(raw: &str) -> crate::errors::Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| crate::errors::PodwireError::InvalidEnvDefinition(raw.to_string()))?;
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_env_definition() {
        let (k, v) = parse_env_definition("FOO=bar").unwrap();
        assert_eq!(k, "FOO");
        assert_eq!(v, "bar");
    }

    #[test]
    fn rejects_env_definition_without_equals() {
        assert!(parse_env_definition("FOO").is_err());
    }
}
