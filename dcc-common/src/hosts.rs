//! Host definitions and the per-invocation host registry.

use crate::errors::DccError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default TCP port of the remote daemon.
pub const DEFAULT_PORT: u16 = 3632;

/// Slots assumed for `localhost` when the entry gives none.
pub const DEFAULT_LOCAL_SLOTS: u32 = 2;

/// Slots assumed for a remote host when the entry gives none.
pub const DEFAULT_REMOTE_SLOTS: u32 = 4;

/// How a host is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostMode {
    Local,
    Tcp,
    Ssh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    Lzo1x,
}

/// Where preprocessing happens for compiles sent to a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CppWhere {
    OnClient,
    OnServer,
}

/// Protocol version spoken to a host, derived from its feature pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    V1 = 1,
    V2 = 2,
    V3 = 3,
}

impl ProtocolVersion {
    pub fn number(self) -> u32 {
        self as u32
    }
}

/// Protocol version for a compression / preprocessing-location pair.
///
/// Server-side preprocessing ships whole source trees and is only defined
/// with compression.
pub fn protover_from_features(
    compression: Compression,
    cpp_where: CppWhere,
) -> Result<ProtocolVersion, DccError> {
    match (compression, cpp_where) {
        (Compression::None, CppWhere::OnClient) => Ok(ProtocolVersion::V1),
        (Compression::Lzo1x, CppWhere::OnClient) => Ok(ProtocolVersion::V2),
        (Compression::Lzo1x, CppWhere::OnServer) => Ok(ProtocolVersion::V3),
        (Compression::None, CppWhere::OnServer) => Err(DccError::BadHostSpec(
            "server-side preprocessing requires compression".to_string(),
        )),
    }
}

/// Inverse of [`protover_from_features`].
pub fn features_from_protover(protover: ProtocolVersion) -> (Compression, CppWhere) {
    match protover {
        ProtocolVersion::V1 => (Compression::None, CppWhere::OnClient),
        ProtocolVersion::V2 => (Compression::Lzo1x, CppWhere::OnClient),
        ProtocolVersion::V3 => (Compression::Lzo1x, CppWhere::OnServer),
    }
}

/// One candidate execution host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDefinition {
    pub mode: HostMode,
    pub user: Option<String>,
    pub hostname: String,
    pub port: u16,
    pub ssh_command: Option<String>,
    /// Concurrent jobs allowed; at least 1.
    pub slots: u32,
    pub protover: ProtocolVersion,
    pub compression: Compression,
    pub cpp_where: CppWhere,
    pub is_up: bool,
    /// The host-list entry this definition was parsed from.
    pub spec: String,
}

impl HostDefinition {
    /// The local machine with `slots` concurrent jobs.
    pub fn localhost(slots: u32) -> Self {
        Self {
            mode: HostMode::Local,
            user: None,
            hostname: "localhost".to_string(),
            port: 0,
            ssh_command: None,
            slots: slots.max(1),
            protover: ProtocolVersion::V1,
            compression: Compression::None,
            cpp_where: CppWhere::OnClient,
            is_up: true,
            spec: if slots == DEFAULT_LOCAL_SLOTS {
                "localhost".to_string()
            } else {
                format!("localhost/{slots}")
            },
        }
    }

    /// A TCP host with the given features.
    pub fn tcp(
        hostname: impl Into<String>,
        port: u16,
        slots: u32,
        compression: Compression,
        cpp_where: CppWhere,
    ) -> Result<Self, DccError> {
        let hostname = hostname.into();
        let protover = protover_from_features(compression, cpp_where)?;
        Ok(Self {
            mode: HostMode::Tcp,
            user: None,
            spec: format!("{hostname}:{port}/{slots}"),
            hostname,
            port,
            ssh_command: None,
            slots: slots.max(1),
            protover,
            compression,
            cpp_where,
            is_up: true,
        })
    }

    pub fn is_local(&self) -> bool {
        self.mode == HostMode::Local
    }

    /// Identity used to name lock and backoff files for this host.
    pub fn lock_key(&self) -> String {
        match self.mode {
            HostMode::Local => "localhost".to_string(),
            HostMode::Tcp => format!("tcp_{}_{}", self.hostname, self.port),
            HostMode::Ssh => format!("ssh_{}", self.hostname),
        }
    }

    /// Switch to client-side preprocessing and recompute the protocol.
    pub fn demote_to_client_cpp(&mut self) -> Result<(), DccError> {
        self.cpp_where = CppWhere::OnClient;
        self.protover = protover_from_features(self.compression, self.cpp_where)?;
        Ok(())
    }
}

impl fmt::Display for HostDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spec)
    }
}

/// Ordered hosts for one invocation.
///
/// Filtering builds a new registry; the original is never edited in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRegistry {
    hosts: Vec<HostDefinition>,
}

impl HostRegistry {
    pub fn new(hosts: Vec<HostDefinition>) -> Self {
        Self { hosts }
    }

    pub fn hosts(&self) -> &[HostDefinition] {
        &self.hosts
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostDefinition> {
        self.hosts.iter()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Hosts satisfying `keep`, in their original order.
    pub fn filter(&self, mut keep: impl FnMut(&HostDefinition) -> bool) -> HostRegistry {
        HostRegistry {
            hosts: self.hosts.iter().filter(|h| keep(h)).cloned().collect(),
        }
    }

    /// Hosts currently marked up.
    pub fn up_hosts(&self) -> HostRegistry {
        self.filter(|h| h.is_up)
    }

    /// Sum of slots over all hosts (the `-j` value).
    pub fn total_slots(&self) -> u32 {
        self.hosts.iter().map(|h| h.slots).sum()
    }

    /// Largest slot count of any host.
    pub fn max_slots(&self) -> u32 {
        self.hosts.iter().map(|h| h.slots).max().unwrap_or(0)
    }

    pub fn into_vec(self) -> Vec<HostDefinition> {
        self.hosts
    }
}

impl FromIterator<HostDefinition> for HostRegistry {
    fn from_iter<I: IntoIterator<Item = HostDefinition>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a HostRegistry {
    type Item = &'a HostDefinition;
    type IntoIter = std::slice::Iter<'a, HostDefinition>;

    fn into_iter(self) -> Self::IntoIter {
        self.hosts.iter()
    }
}
