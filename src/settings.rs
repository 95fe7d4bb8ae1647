//! Cluster configuration.
use std::time::Duration;

use serde::Deserialize;

use crate::common::{ReadMode, ReadPreference, TagSet};
use crate::connstring::{self, ConnectionString, Host};
use crate::error::Error::ArgumentError;
use crate::error::Result;
use crate::topology::{ClusterKind, ConnectionMode};

pub const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);
pub const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Everything a cluster needs to discover and monitor a deployment.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSettings {
    /// The seed list.
    pub hosts: Vec<Host>,
    pub connection_mode: ConnectionMode,
    /// Connect through a load balancer instead of monitoring the deployment.
    pub load_balanced: bool,
    /// The replica set every member must belong to.
    pub repl_set_name: Option<String>,
    #[serde(with = "duration_ms", rename = "heartbeatFrequencyMS")]
    pub heartbeat_frequency: Duration,
    /// The shortest time between two checks of the same server.
    #[serde(with = "duration_ms", rename = "minHeartbeatFrequencyMS")]
    pub min_heartbeat_frequency: Duration,
    /// Bounds opening a monitoring connection and each handshake.
    #[serde(with = "duration_ms", rename = "connectTimeoutMS")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_ms", rename = "serverSelectionTimeoutMS")]
    pub server_selection_timeout: Duration,
    /// Width of the latency window above the fastest eligible server.
    #[serde(with = "duration_ms", rename = "localThresholdMS")]
    pub local_threshold: Duration,
    /// Used for reads that do not name their own read preference; see
    /// `Cluster::default_read_selector`.
    pub read_preference: ReadPreference,
}

impl Default for ClusterSettings {
    fn default() -> ClusterSettings {
        ClusterSettings {
            hosts: vec![Host::default()],
            connection_mode: ConnectionMode::Automatic,
            load_balanced: false,
            repl_set_name: None,
            heartbeat_frequency: DEFAULT_HEARTBEAT_FREQUENCY,
            min_heartbeat_frequency: MIN_HEARTBEAT_FREQUENCY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            server_selection_timeout: DEFAULT_SERVER_SELECTION_TIMEOUT,
            local_threshold: DEFAULT_LOCAL_THRESHOLD,
            read_preference: ReadPreference::primary(),
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ArgumentError(format!("Option '{}' must be true or false, got '{}'.", name, value))),
    }
}

fn parse_millis(name: &str, value: &str) -> Result<Duration> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ArgumentError(format!("Option '{}' must be a non-negative integer, got '{}'.", name, value)))
}

impl ClusterSettings {
    /// Parses settings from a `mongodb://` connection string.
    pub fn parse(uri: &str) -> Result<ClusterSettings> {
        let connection_string = connstring::parse(uri)?;
        ClusterSettings::from_connection_string(&connection_string)
    }

    /// Builds validated settings from the seed list and options of a connection string.
    pub fn from_connection_string(connection_string: &ConnectionString) -> Result<ClusterSettings> {
        let options = &connection_string.options;
        let mut settings = ClusterSettings {
            hosts: connection_string.hosts.clone(),
            ..ClusterSettings::default()
        };

        if let Some(mode) = options.get("connect") {
            settings.connection_mode = mode.parse()?;
        }

        if let Some(direct) = options.get("directConnection") {
            if parse_bool("directConnection", direct)? {
                settings.connection_mode = ConnectionMode::Direct;
            } else if settings.connection_mode == ConnectionMode::Direct {
                settings.connection_mode = ConnectionMode::Automatic;
            }
        }

        if let Some(load_balanced) = options.get("loadBalanced") {
            settings.load_balanced = parse_bool("loadBalanced", load_balanced)?;
        }

        if let Some(set_name) = options.get("replicaSet") {
            settings.repl_set_name = Some(set_name.to_owned());
            if settings.connection_mode == ConnectionMode::Automatic {
                settings.connection_mode = ConnectionMode::ReplicaSet;
            }
        }

        if let Some(value) = options.get("heartbeatFrequencyMS") {
            settings.heartbeat_frequency = parse_millis("heartbeatFrequencyMS", value)?;
        }

        if let Some(value) = options.get("serverSelectionTimeoutMS") {
            settings.server_selection_timeout = parse_millis("serverSelectionTimeoutMS", value)?;
        }

        if let Some(value) = options.get("localThresholdMS") {
            settings.local_threshold = parse_millis("localThresholdMS", value)?;
        }

        if let Some(value) = options.get("connectTimeoutMS") {
            settings.connect_timeout = parse_millis("connectTimeoutMS", value)?;
        }

        settings.read_preference = read_preference_from_options(connection_string)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks that the settings describe a cluster that can be built.
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(ArgumentError("At least one host is required.".to_owned()));
        }

        if self.connection_mode == ConnectionMode::Direct && self.hosts.len() > 1 {
            return Err(ArgumentError("A direct connection requires exactly one host.".to_owned()));
        }

        if self.load_balanced {
            if self.hosts.len() > 1 {
                return Err(ArgumentError("A load balanced cluster requires exactly one host.".to_owned()));
            }
            if self.repl_set_name.is_some() {
                return Err(ArgumentError("loadBalanced cannot be combined with replicaSet.".to_owned()));
            }
            if self.connection_mode == ConnectionMode::Direct {
                return Err(ArgumentError(
                    "loadBalanced cannot be combined with directConnection.".to_owned(),
                ));
            }
        }

        if self.heartbeat_frequency < MIN_HEARTBEAT_FREQUENCY {
            return Err(ArgumentError(format!(
                "heartbeatFrequencyMS must be at least {} ms.",
                MIN_HEARTBEAT_FREQUENCY.as_millis()
            )));
        }

        Ok(())
    }

    /// The cluster variant these settings call for.
    pub fn cluster_kind(&self) -> ClusterKind {
        if self.load_balanced {
            ClusterKind::LoadBalanced
        } else if self.connection_mode == ConnectionMode::Direct {
            ClusterKind::Single
        } else {
            ClusterKind::MultiServer
        }
    }
}

fn read_preference_from_options(connection_string: &ConnectionString) -> Result<ReadPreference> {
    let options = &connection_string.options;

    let mode = match options.get("readPreference") {
        Some(mode) => mode.parse::<ReadMode>()?,
        None => ReadMode::Primary,
    };

    let tag_sets = options
        .read_pref_tags
        .iter()
        .map(|tags| tags.parse::<TagSet>())
        .collect::<Result<Vec<TagSet>>>()?;

    // -1 means no maximum.
    let max_staleness = match options.get("maxStalenessSeconds") {
        None => None,
        Some(value) => match value.parse::<i64>() {
            Ok(-1) => None,
            Ok(seconds) if seconds > 0 => Some(Duration::from_secs(seconds as u64)),
            _ => {
                return Err(ArgumentError(format!(
                    "maxStalenessSeconds must be -1 or a positive integer, got '{}'.",
                    value
                )))
            }
        },
    };

    ReadPreference::new(mode, tag_sets, max_staleness)
}
