use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use crate::connstring::Host;
use crate::error::Error::{self, ArgumentError};
use crate::error::Result;
use crate::settings::DEFAULT_HEARTBEAT_FREQUENCY;

use super::server::{ClusterId, ServerDescription, ServerId, ServerType};

/// The shape of the deployment as currently understood.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Default)]
pub enum ClusterType {
    #[default]
    Unknown,
    Standalone,
    ReplicaSet,
    Sharded,
    LoadBalanced,
}

impl ClusterType {
    fn for_server_type(server_type: ServerType) -> ClusterType {
        match server_type {
            ServerType::Unknown => ClusterType::Unknown,
            ServerType::Standalone => ClusterType::Standalone,
            ServerType::ShardRouter => ClusterType::Sharded,
            ServerType::LoadBalanced => ClusterType::LoadBalanced,
            _ => ClusterType::ReplicaSet,
        }
    }
}

impl FromStr for ClusterType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "Unknown" => ClusterType::Unknown,
            "Single" | "Standalone" => ClusterType::Standalone,
            "ReplicaSet" | "ReplicaSetNoPrimary" | "ReplicaSetWithPrimary" => ClusterType::ReplicaSet,
            "Sharded" => ClusterType::Sharded,
            "LoadBalanced" => ClusterType::LoadBalanced,
            _ => return Err(ArgumentError(format!("Unknown cluster type '{}'.", s))),
        })
    }
}

impl fmt::Display for ClusterType {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, fmt)
    }
}

/// How the cluster was told to treat its seed list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConnectionMode {
    /// Talk to the single seed only, whatever its role.
    Direct,
    /// Discover the deployment type from the seeds.
    #[default]
    Automatic,
    ReplicaSet,
    Sharded,
    Standalone,
}

impl FromStr for ConnectionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "direct" | "single" => ConnectionMode::Direct,
            "automatic" => ConnectionMode::Automatic,
            "replicaset" => ConnectionMode::ReplicaSet,
            "sharded" => ConnectionMode::Sharded,
            "standalone" => ConnectionMode::Standalone,
            _ => return Err(ArgumentError(format!("Unknown connection mode '{}'.", s))),
        })
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, fmt)
    }
}

/// An immutable snapshot of the whole cluster.
///
/// A new description is derived for every server update with `with_server_description`,
/// which applies the discovery rules for the current cluster type and connection mode. When
/// the cluster type is `ReplicaSet` at most one server is a primary.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterDescription {
    cluster_id: ClusterId,
    cluster_type: ClusterType,
    connection_mode: ConnectionMode,
    servers: Vec<ServerDescription>,
    set_name: Option<String>,
    max_set_version: Option<i32>,
    max_election_id: Option<ObjectId>,
    compatibility_error: Option<String>,
    logical_session_timeout: Option<Duration>,
    single_seed: bool,
    heartbeat_interval: Duration,
}

impl ClusterDescription {
    /// Creates a description holding the given servers.
    pub fn new(cluster_id: ClusterId, connection_mode: ConnectionMode, cluster_type: ClusterType,
               servers: Vec<ServerDescription>) -> ClusterDescription {
        let mut description = ClusterDescription {
            cluster_id,
            cluster_type,
            connection_mode,
            single_seed: servers.len() == 1,
            servers,
            set_name: None,
            max_set_version: None,
            max_election_id: None,
            compatibility_error: None,
            logical_session_timeout: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_FREQUENCY,
        };
        description.refresh_derived_state();
        description
    }

    /// Creates the description of a cluster that has not heard from any seed yet.
    pub fn from_seeds(cluster_id: ClusterId, connection_mode: ConnectionMode, seeds: &[Host],
                      set_name: Option<String>, heartbeat_interval: Duration) -> ClusterDescription {
        let cluster_type = match connection_mode {
            ConnectionMode::Direct | ConnectionMode::Automatic => ClusterType::Unknown,
            ConnectionMode::ReplicaSet => ClusterType::ReplicaSet,
            ConnectionMode::Sharded => ClusterType::Sharded,
            ConnectionMode::Standalone => ClusterType::Standalone,
        };

        let mut servers: Vec<ServerDescription> = Vec::new();
        for seed in seeds {
            if servers.iter().all(|server| server.address() != seed) {
                servers.push(
                    ServerDescription::new(ServerId::new(cluster_id, seed.clone()))
                        .with_heartbeat_interval(heartbeat_interval),
                );
            }
        }

        let mut description = ClusterDescription::new(cluster_id, connection_mode, cluster_type, servers);
        description.set_name = set_name;
        description.heartbeat_interval = heartbeat_interval;
        description
    }

    pub fn with_heartbeat_interval(&self, heartbeat_interval: Duration) -> ClusterDescription {
        ClusterDescription { heartbeat_interval, ..self.clone() }
    }

    /// Applies a new description of a member server. Descriptions of servers that are not
    /// members of the cluster are ignored.
    pub fn with_server_description(&self, server_description: ServerDescription) -> ClusterDescription {
        let mut next = self.clone();
        if next.position(server_description.address()).is_none() {
            return next;
        }

        next.apply(server_description);
        next.refresh_derived_state();
        next
    }

    /// Compares everything except the per-heartbeat health metrics of each server.
    pub fn is_equivalent_to(&self, other: &ClusterDescription) -> bool {
        self.cluster_type == other.cluster_type
            && self.set_name == other.set_name
            && self.compatibility_error == other.compatibility_error
            && self.servers.len() == other.servers.len()
            && self
                .servers
                .iter()
                .zip(other.servers.iter())
                .all(|(server, other)| server.is_equivalent_to(other))
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    pub fn cluster_type(&self) -> ClusterType {
        self.cluster_type
    }

    pub fn connection_mode(&self) -> ConnectionMode {
        self.connection_mode
    }

    /// Member servers in the order they joined the cluster.
    pub fn servers(&self) -> &[ServerDescription] {
        &self.servers
    }

    pub fn server(&self, address: &Host) -> Option<&ServerDescription> {
        self.servers.iter().find(|server| server.address() == address)
    }

    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    pub fn max_set_version(&self) -> Option<i32> {
        self.max_set_version
    }

    pub fn max_election_id(&self) -> Option<ObjectId> {
        self.max_election_id
    }

    /// Set when a member speaks a wire version range this driver cannot use.
    pub fn compatibility_error(&self) -> Option<&str> {
        self.compatibility_error.as_deref()
    }

    pub fn logical_session_timeout(&self) -> Option<Duration> {
        self.logical_session_timeout
    }

    /// The configured heartbeat interval, used when a server does not report its own.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn primary(&self) -> Option<&ServerDescription> {
        self.servers
            .iter()
            .find(|server| server.server_type() == ServerType::ReplicaSetPrimary)
    }

    pub fn has_primary(&self) -> bool {
        self.primary().is_some()
    }

    fn position(&self, address: &Host) -> Option<usize> {
        self.servers.iter().position(|server| server.address() == address)
    }

    fn replace(&mut self, server_description: ServerDescription) {
        match self.position(server_description.address()) {
            Some(idx) => self.servers[idx] = server_description,
            None => self.servers.push(server_description),
        }
    }

    fn remove(&mut self, address: &Host) {
        self.servers.retain(|server| server.address() != address);
    }

    fn reset_to_unknown(&mut self, address: &Host, reason: Option<Error>) {
        let unknown = ServerDescription::new(ServerId::new(self.cluster_id, address.clone()))
            .with_heartbeat_interval(self.heartbeat_interval);
        let unknown = match reason {
            Some(error) => unknown.with_error(&error),
            None => unknown,
        };
        self.replace(unknown);
    }

    fn add_new_servers<'a, I: IntoIterator<Item = &'a Host>>(&mut self, addresses: I) {
        for address in addresses {
            if self.position(address).is_none() {
                self.servers.push(
                    ServerDescription::new(ServerId::new(self.cluster_id, address.clone()))
                        .with_heartbeat_interval(self.heartbeat_interval),
                );
            }
        }
    }

    fn apply(&mut self, server_description: ServerDescription) {
        let had_primary = self.has_primary();
        let server_description = self.check_direct_set_name(server_description);
        self.replace(server_description.clone());

        if self.cluster_type == ClusterType::LoadBalanced {
            return;
        }

        match self.connection_mode {
            ConnectionMode::Direct => {
                self.cluster_type = ClusterType::for_server_type(server_description.server_type());
            }
            ConnectionMode::Standalone => {}
            _ => match self.cluster_type {
                ClusterType::Unknown => self.update_unknown(server_description),
                ClusterType::Sharded => self.update_sharded(server_description),
                ClusterType::ReplicaSet => self.update_replica_set(server_description, had_primary),
                ClusterType::Standalone | ClusterType::LoadBalanced => {}
            },
        }
    }

    // A directly connected server must still belong to the configured replica set.
    fn check_direct_set_name(&self, server_description: ServerDescription) -> ServerDescription {
        let expected = match (self.connection_mode, &self.set_name) {
            (ConnectionMode::Direct, Some(expected)) if server_description.is_available() => expected,
            _ => return server_description,
        };

        if server_description.set_name() == Some(expected.as_str()) {
            return server_description;
        }

        let error = ArgumentError(format!(
            "Connection string replicaSet name \"{}\" does not match actual name {:?}",
            expected,
            server_description.set_name()
        ));
        server_description.with_error(&error)
    }

    fn update_unknown(&mut self, server_description: ServerDescription) {
        match server_description.server_type() {
            ServerType::Unknown | ServerType::ReplicaSetGhost | ServerType::LoadBalanced => {}
            ServerType::Standalone => {
                if self.single_seed {
                    self.cluster_type = ClusterType::Standalone;
                } else {
                    self.remove(server_description.address());
                }
            }
            ServerType::ShardRouter => self.cluster_type = ClusterType::Sharded,
            ServerType::ReplicaSetPrimary => {
                self.cluster_type = ClusterType::ReplicaSet;
                self.update_from_primary(server_description);
            }
            ServerType::ReplicaSetSecondary
            | ServerType::ReplicaSetArbiter
            | ServerType::ReplicaSetOther => {
                self.cluster_type = ClusterType::ReplicaSet;
                self.update_without_primary(server_description);
            }
        }
    }

    fn update_sharded(&mut self, server_description: ServerDescription) {
        match server_description.server_type() {
            ServerType::Unknown | ServerType::ShardRouter => {}
            _ => self.remove(server_description.address()),
        }
    }

    fn update_replica_set(&mut self, server_description: ServerDescription, had_primary: bool) {
        match server_description.server_type() {
            ServerType::Unknown | ServerType::ReplicaSetGhost => {}
            ServerType::Standalone | ServerType::ShardRouter | ServerType::LoadBalanced => {
                self.remove(server_description.address());
            }
            ServerType::ReplicaSetPrimary => self.update_from_primary(server_description),
            ServerType::ReplicaSetSecondary
            | ServerType::ReplicaSetArbiter
            | ServerType::ReplicaSetOther => {
                if had_primary {
                    self.update_from_member_with_primary(server_description);
                } else {
                    self.update_without_primary(server_description);
                }
            }
        }
    }

    fn update_without_primary(&mut self, server_description: ServerDescription) {
        match self.set_name {
            None => self.set_name = server_description.set_name().map(str::to_owned),
            Some(ref set_name) if server_description.set_name() != Some(set_name.as_str()) => {
                self.remove(server_description.address());
                return;
            }
            Some(_) => {}
        }

        let known_hosts: Vec<Host> = server_description.known_hosts().cloned().collect();
        self.add_new_servers(&known_hosts);

        if server_description.has_mismatched_me() {
            self.remove(server_description.address());
        }
    }

    fn update_from_member_with_primary(&mut self, server_description: ServerDescription) {
        if self.set_name.as_deref() != server_description.set_name()
            || server_description.has_mismatched_me()
        {
            self.remove(server_description.address());
        }
    }

    fn update_from_primary(&mut self, server_description: ServerDescription) {
        let address = server_description.address().clone();

        match self.set_name {
            None => self.set_name = server_description.set_name().map(str::to_owned),
            Some(ref set_name) if server_description.set_name() != Some(set_name.as_str()) => {
                self.remove(&address);
                return;
            }
            Some(_) => {}
        }

        if let (Some(set_version), Some(election_id)) =
            (server_description.set_version(), server_description.election_id())
        {
            if let (Some(max_set_version), Some(max_election_id)) =
                (self.max_set_version, self.max_election_id)
            {
                if max_set_version > set_version
                    || (max_set_version == set_version && max_election_id > election_id)
                {
                    let stale = ArgumentError(format!(
                        "primary marked stale due to setVersion {} and electionId {} older than {} and {}",
                        set_version, election_id, max_set_version, max_election_id
                    ));
                    self.reset_to_unknown(&address, Some(stale));
                    return;
                }
            }
            self.max_election_id = Some(election_id);
        }

        if let Some(set_version) = server_description.set_version() {
            if self.max_set_version.map_or(true, |max| set_version > max) {
                self.max_set_version = Some(set_version);
            }
        }

        let stale_primaries: Vec<Host> = self
            .servers
            .iter()
            .filter(|server| {
                server.address() != &address && server.server_type() == ServerType::ReplicaSetPrimary
            })
            .map(|server| server.address().clone())
            .collect();
        for stale in &stale_primaries {
            self.reset_to_unknown(stale, None);
        }

        let known_hosts: Vec<Host> = server_description.known_hosts().cloned().collect();
        self.add_new_servers(&known_hosts);
        self.servers.retain(|server| known_hosts.contains(server.address()));
    }

    fn refresh_derived_state(&mut self) {
        self.compatibility_error = self
            .servers
            .iter()
            .find_map(ServerDescription::compatibility_error_message);

        // The session timeout is only known if every data-bearing server reports one.
        let mut timeout: Option<Duration> = None;
        for server in self.servers.iter().filter(|server| server.server_type().is_data_bearing()) {
            match server.logical_session_timeout() {
                Some(value) => timeout = Some(timeout.map_or(value, |current| current.min(value))),
                None => {
                    timeout = None;
                    break;
                }
            }
        }
        self.logical_session_timeout = timeout;
    }
}

impl fmt::Display for ClusterDescription {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "{{ ClusterId: {}, ConnectionMode: {}, Type: {}",
            self.cluster_id, self.connection_mode, self.cluster_type
        )?;
        if let Some(ref set_name) = self.set_name {
            write!(fmt, ", SetName: \"{}\"", set_name)?;
        }
        if let Some(ref error) = self.compatibility_error {
            write!(fmt, ", CompatibilityError: \"{}\"", error)?;
        }
        fmt.write_str(", Servers: [")?;
        for (i, server) in self.servers.iter().enumerate() {
            if i > 0 {
                fmt.write_str(", ")?;
            }
            write!(fmt, "{}", server)?;
        }
        fmt.write_str("] }")
    }
}
