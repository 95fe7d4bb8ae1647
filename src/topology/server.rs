use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bson::oid::ObjectId;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::apm::{Listener, SdamEvent, ServerDescriptionChangedEvent};
use crate::common::TagSet;
use crate::connstring::Host;
use crate::error::Error::{self, ArgumentError};
use crate::error::Result;
use crate::pool::{Connection, ConnectionFactory};
use crate::settings::DEFAULT_HEARTBEAT_FREQUENCY;

use super::monitor::{HelloResult, MonitorSettings, ServerMonitor};
use super::ClusterUpdater;

/// The lowest wire version this driver can speak.
pub const MIN_SUPPORTED_WIRE_VERSION: i32 = 6;
/// The highest wire version this driver can speak.
pub const MAX_SUPPORTED_WIRE_VERSION: i32 = 21;

static NEXT_CLUSTER_ID: AtomicU64 = AtomicU64::new(1);

/// Describes the server role within a cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Default)]
pub enum ServerType {
    /// Server type is currently unknown.
    #[default]
    Unknown,
    /// Standalone server.
    Standalone,
    /// Replica set primary.
    ReplicaSetPrimary,
    /// Replica set secondary.
    ReplicaSetSecondary,
    /// Replica set arbiter.
    ReplicaSetArbiter,
    /// Replica set member that has not been initiated yet.
    ReplicaSetGhost,
    /// Replica set member of some other type, e.g. hidden or recovering.
    ReplicaSetOther,
    /// Shard router.
    ShardRouter,
    /// A load balancer fronting the deployment.
    LoadBalanced,
}

impl ServerType {
    /// Whether servers of this type hold data that operations may read or write.
    pub fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::ReplicaSetPrimary
                | ServerType::ReplicaSetSecondary
                | ServerType::ShardRouter
                | ServerType::LoadBalanced
        )
    }

}

impl FromStr for ServerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "Unknown" | "PossiblePrimary" => ServerType::Unknown,
            "Standalone" => ServerType::Standalone,
            "ReplicaSetPrimary" | "RSPrimary" => ServerType::ReplicaSetPrimary,
            "ReplicaSetSecondary" | "RSSecondary" => ServerType::ReplicaSetSecondary,
            "ReplicaSetArbiter" | "RSArbiter" => ServerType::ReplicaSetArbiter,
            "ReplicaSetGhost" | "RSGhost" => ServerType::ReplicaSetGhost,
            "ReplicaSetOther" | "RSOther" => ServerType::ReplicaSetOther,
            "ShardRouter" | "Mongos" => ServerType::ShardRouter,
            "LoadBalanced" | "LoadBalancer" => ServerType::LoadBalanced,
            _ => return Err(ArgumentError(format!("Unknown server type '{}'.", s))),
        })
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, fmt)
    }
}

/// Whether the monitor currently holds a working connection to the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Default)]
pub enum ServerConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ServerConnectionState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, fmt)
    }
}

/// Identifies one cluster instance within the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClusterId(u64);

impl ClusterId {
    /// Allocates a process-unique cluster id.
    pub fn next() -> ClusterId {
        ClusterId(NEXT_CLUSTER_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

/// Identifies a server within a cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ServerId {
    pub cluster_id: ClusterId,
    pub address: Host,
}

impl ServerId {
    pub fn new(cluster_id: ClusterId, address: Host) -> ServerId {
        ServerId { cluster_id, address }
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}/{}", self.cluster_id, self.address)
    }
}

/// An immutable snapshot of what was last observed about one server.
///
/// Changes are made by building a new description with one of the `with_*` methods. A
/// description whose connection state is not `Connected` always has type `Unknown` and no
/// round trip time.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerDescription {
    server_id: ServerId,
    server_type: ServerType,
    state: ServerConnectionState,
    average_round_trip_time: Option<Duration>,
    wire_version_range: Option<(i32, i32)>,
    version: Option<Version>,
    tags: TagSet,
    heartbeat_interval: Duration,
    last_write_date: Option<DateTime<Utc>>,
    last_update_time: DateTime<Utc>,
    set_name: Option<String>,
    set_version: Option<i32>,
    election_id: Option<ObjectId>,
    primary: Option<Host>,
    me: Option<Host>,
    hosts: Vec<Host>,
    passives: Vec<Host>,
    arbiters: Vec<Host>,
    logical_session_timeout: Option<Duration>,
    error: Option<String>,
}

impl ServerDescription {
    /// Returns a default, unknown and disconnected server description.
    pub fn new(server_id: ServerId) -> ServerDescription {
        ServerDescription {
            server_id,
            server_type: ServerType::Unknown,
            state: ServerConnectionState::Disconnected,
            average_round_trip_time: None,
            wire_version_range: None,
            version: None,
            tags: TagSet::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_FREQUENCY,
            last_write_date: None,
            last_update_time: Utc::now(),
            set_name: None,
            set_version: None,
            election_id: None,
            primary: None,
            me: None,
            hosts: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
            logical_session_timeout: None,
            error: None,
        }
    }

    /// Builds a connected description from a successful handshake reply.
    pub fn from_hello(server_id: ServerId, hello: &HelloResult, average_round_trip_time: Duration,
                      heartbeat_interval: Duration) -> ServerDescription {
        ServerDescription {
            server_type: hello.server_type(),
            state: ServerConnectionState::Connected,
            average_round_trip_time: Some(average_round_trip_time),
            wire_version_range: Some((hello.min_wire_version, hello.max_wire_version)),
            version: hello.version.clone(),
            tags: hello.tags.clone(),
            heartbeat_interval,
            last_write_date: hello.last_write_date,
            last_update_time: Utc::now(),
            set_name: hello.set_name.clone(),
            set_version: hello.set_version,
            election_id: hello.election_id,
            primary: hello.primary.clone(),
            me: hello.me.clone(),
            hosts: hello.hosts.clone(),
            passives: hello.passives.clone(),
            arbiters: hello.arbiters.clone(),
            logical_session_timeout: hello.logical_session_timeout,
            error: None,
            ..ServerDescription::new(server_id)
        }
    }

    /// Returns an unknown, disconnected copy of this description recording the error.
    pub fn with_error(&self, error: &Error) -> ServerDescription {
        ServerDescription {
            error: Some(error.to_string()),
            heartbeat_interval: self.heartbeat_interval,
            last_update_time: Utc::now(),
            ..ServerDescription::new(self.server_id.clone())
        }
    }

    /// Returns a copy with the given connection state. Leaving `Connected` resets the
    /// observed role and health metrics.
    pub fn with_connection_state(&self, state: ServerConnectionState) -> ServerDescription {
        if state == ServerConnectionState::Connected {
            return ServerDescription { state, ..self.clone() };
        }

        ServerDescription {
            state,
            heartbeat_interval: self.heartbeat_interval,
            error: self.error.clone(),
            ..ServerDescription::new(self.server_id.clone())
        }
    }

    /// Returns a copy with the given type. Any known type implies a connected server.
    pub fn with_server_type(&self, server_type: ServerType) -> ServerDescription {
        let state = if server_type == ServerType::Unknown {
            self.state
        } else {
            ServerConnectionState::Connected
        };
        ServerDescription { server_type, state, ..self.clone() }
    }

    pub fn with_round_trip_time(&self, average_round_trip_time: Duration) -> ServerDescription {
        ServerDescription { average_round_trip_time: Some(average_round_trip_time), ..self.clone() }
    }

    pub fn with_tags(&self, tags: TagSet) -> ServerDescription {
        ServerDescription { tags, ..self.clone() }
    }

    pub fn with_heartbeat_interval(&self, heartbeat_interval: Duration) -> ServerDescription {
        ServerDescription { heartbeat_interval, ..self.clone() }
    }

    pub fn with_last_write_date(&self, last_write_date: DateTime<Utc>) -> ServerDescription {
        ServerDescription { last_write_date: Some(last_write_date), ..self.clone() }
    }

    pub fn with_last_update_time(&self, last_update_time: DateTime<Utc>) -> ServerDescription {
        ServerDescription { last_update_time, ..self.clone() }
    }

    pub fn with_wire_version_range(&self, min: i32, max: i32) -> ServerDescription {
        ServerDescription { wire_version_range: Some((min, max)), ..self.clone() }
    }

    pub fn with_set_name(&self, set_name: Option<String>) -> ServerDescription {
        ServerDescription { set_name, ..self.clone() }
    }

    /// Returns a copy reporting the given replica set members.
    pub fn with_hosts(&self, hosts: Vec<Host>) -> ServerDescription {
        ServerDescription { hosts, ..self.clone() }
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn address(&self) -> &Host {
        &self.server_id.address
    }

    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    pub fn state(&self) -> ServerConnectionState {
        self.state
    }

    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.average_round_trip_time
    }

    pub fn wire_version_range(&self) -> Option<(i32, i32)> {
        self.wire_version_range
    }

    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn last_write_date(&self) -> Option<DateTime<Utc>> {
        self.last_write_date
    }

    pub fn last_update_time(&self) -> DateTime<Utc> {
        self.last_update_time
    }

    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    pub fn set_version(&self) -> Option<i32> {
        self.set_version
    }

    pub fn election_id(&self) -> Option<ObjectId> {
        self.election_id
    }

    /// The server's opinion of who the primary is.
    pub fn primary(&self) -> Option<&Host> {
        self.primary.as_ref()
    }

    pub fn me(&self) -> Option<&Host> {
        self.me.as_ref()
    }

    pub fn logical_session_timeout(&self) -> Option<Duration> {
        self.logical_session_timeout
    }

    /// The message of the error that last made this server unknown.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// All replica set members reported by this server.
    pub fn known_hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.iter().chain(self.passives.iter()).chain(self.arbiters.iter())
    }

    /// Whether the server is connected with a known role.
    pub fn is_available(&self) -> bool {
        self.state == ServerConnectionState::Connected && self.server_type != ServerType::Unknown
    }

    /// Whether the server reported a `me` field that differs from the address it was
    /// reached at.
    pub fn has_mismatched_me(&self) -> bool {
        match self.me {
            Some(ref me) => me != self.address(),
            None => false,
        }
    }

    /// Compares everything except the health metrics refreshed by each heartbeat.
    pub fn is_equivalent_to(&self, other: &ServerDescription) -> bool {
        self.server_id == other.server_id
            && self.server_type == other.server_type
            && self.state == other.state
            && self.wire_version_range == other.wire_version_range
            && self.version == other.version
            && self.tags == other.tags
            && self.set_name == other.set_name
            && self.set_version == other.set_version
            && self.election_id == other.election_id
            && self.primary == other.primary
            && self.me == other.me
            && self.hosts == other.hosts
            && self.passives == other.passives
            && self.arbiters == other.arbiters
            && self.logical_session_timeout == other.logical_session_timeout
            && self.error == other.error
    }

    /// Describes why the driver cannot talk to this server, if the wire version ranges do
    /// not overlap.
    pub fn compatibility_error_message(&self) -> Option<String> {
        let (min, max) = match self.wire_version_range {
            Some(range) if self.is_available() => range,
            _ => return None,
        };

        if min > MAX_SUPPORTED_WIRE_VERSION {
            Some(format!(
                "Server at {} requires wire version {}, but this driver only supports up to {}",
                self.address(), min, MAX_SUPPORTED_WIRE_VERSION
            ))
        } else if max < MIN_SUPPORTED_WIRE_VERSION {
            Some(format!(
                "Server at {} reports wire version {}, but this driver requires at least {}",
                self.address(), max, MIN_SUPPORTED_WIRE_VERSION
            ))
        } else {
            None
        }
    }
}

impl fmt::Display for ServerDescription {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "{{ EndPoint: \"{}\", State: {}, Type: {}",
            self.address(), self.state, self.server_type
        )?;
        if let Some(rtt) = self.average_round_trip_time {
            write!(fmt, ", RoundTripTime: {}ms", rtt.as_millis())?;
        }
        if let Some(ref set_name) = self.set_name {
            write!(fmt, ", SetName: \"{}\"", set_name)?;
        }
        if !self.tags.is_empty() {
            write!(fmt, ", Tags: {}", self.tags)?;
        }
        if let Some((min, max)) = self.wire_version_range {
            write!(fmt, ", WireVersionRange: [{}, {}]", min, max)?;
        }
        if let Some(ref error) = self.error {
            write!(fmt, ", LastError: \"{}\"", error)?;
        }
        fmt.write_str(" }")
    }
}

/// A server registered with a cluster: its latest description, its monitor, and its
/// connection source.
///
/// Dropping or disposing the server stops its monitor.
pub struct ClusterableServer {
    id: ServerId,
    description: RwLock<ServerDescription>,
    factory: Arc<dyn ConnectionFactory>,
    listener: Arc<Listener>,
    updater: ClusterUpdater,
    // Incremented every time the pool for this server is invalidated.
    pool_generation: AtomicU32,
    // Wakes the monitor for an immediate check. Holds at most one pending wake.
    check_requested: Arc<Notify>,
    cancel: CancellationToken,
}

impl ClusterableServer {
    pub(crate) fn new(id: ServerId, factory: Arc<dyn ConnectionFactory>, listener: Arc<Listener>,
                      updater: ClusterUpdater, cancel: CancellationToken) -> Arc<ClusterableServer> {
        Arc::new(ClusterableServer {
            description: RwLock::new(ServerDescription::new(id.clone())),
            id,
            factory,
            listener,
            updater,
            pool_generation: AtomicU32::new(0),
            check_requested: Arc::new(Notify::new()),
            cancel,
        })
    }

    /// Spawns the heartbeat loop for this server.
    pub(crate) fn start_monitor(self: &Arc<Self>, runtime: &Handle, settings: MonitorSettings) {
        let connecting = self.description().with_connection_state(ServerConnectionState::Connecting);
        self.replace_description(connecting);

        let monitor = ServerMonitor::new(
            Arc::downgrade(self),
            self.id.clone(),
            self.factory.clone(),
            self.listener.clone(),
            self.check_requested.clone(),
            self.cancel.clone(),
            settings,
        );
        runtime.spawn(monitor.run());
    }

    pub fn id(&self) -> &ServerId {
        &self.id
    }

    pub fn address(&self) -> &Host {
        &self.id.address
    }

    /// The most recent description published for this server.
    pub fn description(&self) -> ServerDescription {
        match self.description.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn pool_generation(&self) -> u32 {
        self.pool_generation.load(Ordering::SeqCst)
    }

    /// Opens a connection to this server.
    pub async fn acquire_connection(&self) -> Result<Box<dyn Connection>> {
        if self.cancel.is_cancelled() {
            return Err(Error::OperationError(format!("Server {} has been closed.", self.address())));
        }
        self.factory.create_connection(self.address()).await
    }

    /// Asks the monitor to check the server now instead of waiting for the next heartbeat.
    /// Concurrent requests coalesce into one check.
    pub fn request_heartbeat(&self) {
        self.check_requested.notify_one();
    }

    /// Discards every pooled connection to this server.
    pub fn invalidate(&self) {
        self.pool_generation.fetch_add(1, Ordering::SeqCst);
        self.factory.invalidate(&self.id);
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn dispose(&self) {
        self.cancel.cancel();
    }

    /// Records a new description and forwards it to the cluster.
    pub(crate) fn publish(&self, new_description: ServerDescription) {
        if self.is_disposed() {
            return;
        }

        let previous = self.replace_description(new_description.clone());

        if !previous.is_equivalent_to(&new_description) {
            self.listener.publish(|| {
                SdamEvent::ServerDescriptionChanged(Box::new(ServerDescriptionChangedEvent {
                    address: self.address().clone(),
                    previous_description: previous.clone(),
                    new_description: new_description.clone(),
                }))
            });
        }

        self.updater.update(new_description);
    }

    pub(crate) fn replace_description(&self, new_description: ServerDescription) -> ServerDescription {
        let mut guard = match self.description.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, new_description)
    }
}

impl Drop for ClusterableServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for ClusterableServer {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("ClusterableServer")
            .field("id", &self.id)
            .field("pool_generation", &self.pool_generation())
            .finish()
    }
}
