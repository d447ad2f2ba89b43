use crate::errors::{PodwireError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The two mutually-exclusive session flavours a workload can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    RemoteDev,
    Debug,
}

impl Mode {
    pub fn annotation_prefix(self) -> &'static str {
        match self {
            Mode::RemoteDev => "remote-dev.bunnyshell.com/",
            Mode::Debug => "debug.bunnyshell.com/",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Mode::RemoteDev => "remote-dev",
            Mode::Debug => "debug",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
}

impl WorkloadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::DaemonSet => "DaemonSet",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ContainerRef {
    pub name: String,
    pub image: String,
    pub is_init: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
#[clap(rename_all = "kebab-case")]
pub enum SyncMode {
    None,
    TwoWaySafe,
    TwoWayResolved,
    OneWaySafe,
    OneWayReplica,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::TwoWayResolved
    }
}

impl SyncMode {
    pub fn as_mutagen_str(self) -> &'static str {
        match self {
            SyncMode::None => "none",
            SyncMode::TwoWaySafe => "two-way-safe",
            SyncMode::TwoWayResolved => "two-way-resolved",
            SyncMode::OneWaySafe => "one-way-safe",
            SyncMode::OneWayReplica => "one-way-replica",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(SyncMode::None),
            "two-way-safe" => Some(SyncMode::TwoWaySafe),
            "two-way-resolved" => Some(SyncMode::TwoWayResolved),
            "one-way-safe" => Some(SyncMode::OneWaySafe),
            "one-way-replica" => Some(SyncMode::OneWayReplica),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

#[derive(Debug, Clone, Copy)]
pub struct PortMapping {
    pub local_port: u16,
    pub remote_port: u16,
    pub direction: Direction,
}

/// Parses the CLI port mapping syntax: `L>R` (forward) or `L<R` (reverse).
/// Multiple mappings are comma-separated by the caller before this is invoked
/// on each piece. Grounded on spec.md Testable Property 5.
pub fn parse_port_mapping(raw: &str) -> Result<PortMapping> {
    let raw = raw.trim();

    let (left, right, direction) = if let Some(idx) = raw.find('>') {
        (&raw[..idx], &raw[idx + 1..], Direction::Forward)
    } else if let Some(idx) = raw.find('<') {
        (&raw[..idx], &raw[idx + 1..], Direction::Reverse)
    } else {
        return Err(PodwireError::InvalidPortMapping(raw.to_string()));
    };

    let local_port: u16 = left
        .trim()
        .parse()
        .map_err(|_| PodwireError::InvalidPortMapping(raw.to_string()))?;
    let remote_port: u16 = right
        .trim()
        .parse()
        .map_err(|_| PodwireError::InvalidPortMapping(raw.to_string()))?;

    Ok(PortMapping {
        local_port,
        remote_port,
        direction,
    })
}

/// Parses a comma-separated list of port mappings, failing fast on the first
/// invalid entry (spec.md Scenario S5: a single bad mapping aborts before any
/// cluster call is made).
pub fn parse_port_mappings(raw: &[String]) -> Result<Vec<PortMapping>> {
    let mut mappings = Vec::new();
    for entry in raw {
        for piece in entry.split(',') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            mappings.push(parse_port_mapping(piece)?);
        }
    }
    Ok(mappings)
}

#[derive(Debug, Clone)]
pub struct Session {
    pub mode: Mode,
    pub namespace: String,
    pub workload: WorkloadRef,
    pub container: ContainerRef,
    pub local_sync_path: Option<String>,
    pub remote_sync_path: Option<String>,
    pub sync_mode: SyncMode,
    pub port_mappings: Vec<PortMapping>,
    pub wait_timeout_sec: u64,
    pub started_at: i64,
    pub force_recreate: bool,
}

impl Session {
    pub fn is_remote_dev(&self) -> bool {
        matches!(self.mode, Mode::RemoteDev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_forward_mapping() {
        let m = parse_port_mapping("8080>3000").unwrap();
        assert_eq!(m.local_port, 8080);
        assert_eq!(m.remote_port, 3000);
        assert_eq!(m.direction, Direction::Forward);
    }

    #[test]
    fn parses_reverse_mapping() {
        let m = parse_port_mapping("9003<9003").unwrap();
        assert_eq!(m.local_port, 9003);
        assert_eq!(m.remote_port, 9003);
        assert_eq!(m.direction, Direction::Reverse);
    }

    #[test]
    fn parses_comma_separated_list() {
        let mappings =
            parse_port_mappings(&["8080>3000,9003<9003".to_string()]).expect("should parse");
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].direction, Direction::Forward);
        assert_eq!(mappings[1].direction, Direction::Reverse);
    }

    #[test]
    fn rejects_malformed_mapping() {
        let err = parse_port_mapping("abc").unwrap_err();
        assert!(matches!(err, PodwireError::InvalidPortMapping(_)));
    }

    #[test]
    fn list_fails_fast_on_first_bad_entry() {
        let err =
            parse_port_mappings(&["8080>3000,9003<9003,badmapping".to_string()]).unwrap_err();
        assert!(matches!(err, PodwireError::InvalidPortMapping(_)));
    }
}
