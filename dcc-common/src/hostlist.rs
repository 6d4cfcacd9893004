//! Host list parsing and the default host-list provider.
//!
//! Grammar (whitespace separated, `#` to end of line is a comment):
//!
//! ```text
//! localhost[/N]
//! [user]@host[/N][,opt...]
//! host[:port][/N][,opt...]
//! ```
//!
//! Options: `lzo` enables compression, `cpp` enables server-side
//! preprocessing (and requires `lzo`).

use crate::config::Sourced;
use crate::errors::DccError;
use crate::hosts::{
    Compression, CppWhere, DEFAULT_LOCAL_SLOTS, DEFAULT_PORT, DEFAULT_REMOTE_SLOTS,
    HostDefinition, HostMode, HostRegistry, protover_from_features,
};
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Source of the candidate host list.
pub trait HostListProvider {
    fn host_list(&self) -> Result<HostRegistry, DccError>;
}

/// Reads `DISTCC_HOSTS`, falling back to the `hosts` file in the state dir.
#[derive(Debug, Clone)]
pub struct EnvHostListProvider {
    hosts: Option<String>,
    hosts_file: PathBuf,
}

impl EnvHostListProvider {
    pub fn new(hosts: Option<String>, hosts_file: PathBuf) -> Self {
        Self { hosts, hosts_file }
    }

    fn raw_list(&self) -> Result<Sourced<String>, DccError> {
        if let Some(hosts) = &self.hosts {
            return Ok(Sourced::from_env(hosts.clone(), "DISTCC_HOSTS"));
        }
        match fs::read_to_string(&self.hosts_file) {
            Ok(text) => Ok(Sourced::from_file(text, &self.hosts_file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "no host list in DISTCC_HOSTS or {}; can't distribute work",
                    self.hosts_file.display()
                );
                Err(DccError::NoHosts)
            }
            Err(e) => Err(DccError::io_path("read", &self.hosts_file, e)),
        }
    }
}

impl HostListProvider for EnvHostListProvider {
    fn host_list(&self) -> Result<HostRegistry, DccError> {
        let raw = self.raw_list()?;
        debug!(origin = %raw.source, "reading host list");
        parse_host_list(&raw.value)
    }
}

/// Parse a whole host list.
pub fn parse_host_list(text: &str) -> Result<HostRegistry, DccError> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or(""))
        .flat_map(str::split_whitespace)
        .map(parse_host_entry)
        .collect::<Result<Vec<_>, _>>()
        .map(HostRegistry::new)
}

/// Parse a single host-list entry.
pub fn parse_host_entry(entry: &str) -> Result<HostDefinition, DccError> {
    let bad = |why: &str| DccError::BadHostSpec(format!("{entry}: {why}"));

    let mut parts = entry.split(',');
    let location = parts.next().unwrap_or_default();

    let mut compression = Compression::None;
    let mut cpp_where = CppWhere::OnClient;
    for opt in parts {
        match opt {
            "lzo" => compression = Compression::Lzo1x,
            "cpp" => cpp_where = CppWhere::OnServer,
            other => return Err(bad(&format!("unknown option {other:?}"))),
        }
    }

    let (address, slots) = match location.split_once('/') {
        Some((address, n)) => {
            let n = n
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| bad("slot count must be a positive integer"))?;
            (address, Some(n))
        }
        None => (location, None),
    };
    if address.is_empty() {
        return Err(bad("missing host name"));
    }

    if address == "localhost" {
        if compression != Compression::None || cpp_where != CppWhere::OnClient {
            return Err(bad("options are not valid for localhost"));
        }
        let mut host = HostDefinition::localhost(slots.unwrap_or(DEFAULT_LOCAL_SLOTS));
        host.spec = entry.to_string();
        return Ok(host);
    }

    let protover = protover_from_features(compression, cpp_where)
        .map_err(|_| bad("cpp requires lzo"))?;

    let (mode, user, hostname, port) = match address.split_once('@') {
        Some((user, host)) => {
            let user = (!user.is_empty()).then(|| user.to_string());
            (HostMode::Ssh, user, host.to_string(), 0)
        }
        None => match address.split_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| bad("invalid port"))?;
                (HostMode::Tcp, None, host.to_string(), port)
            }
            None => (HostMode::Tcp, None, address.to_string(), DEFAULT_PORT),
        },
    };
    if hostname.is_empty() {
        return Err(bad("missing host name"));
    }

    Ok(HostDefinition {
        mode,
        user,
        hostname,
        port,
        ssh_command: None,
        slots: slots.unwrap_or(DEFAULT_REMOTE_SLOTS),
        protover,
        compression,
        cpp_where,
        is_up: true,
        spec: entry.to_string(),
    })
}
