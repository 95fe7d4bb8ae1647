//! Server selection strategies.
//!
//! A `ServerSelector` narrows a list of candidate servers for one operation. Selectors are
//! pure: an empty result means that no server is eligible right now, and the cluster waits for
//! the next topology change before trying again. Errors are reserved for selections that
//! waiting cannot fix, such as an unsatisfiable max staleness.
mod read_preference;
pub mod staleness;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::common::ReadPreference;
use crate::error::Result;
use crate::topology::{ClusterDescription, ServerDescription};

/// A user supplied selection function.
pub type SelectorFn = dyn for<'a> Fn(&ClusterDescription, Vec<&'a ServerDescription>) -> Vec<&'a ServerDescription>
    + Send
    + Sync;

#[derive(Clone)]
pub enum ServerSelector {
    /// Servers that accept writes.
    Writable,
    /// Servers allowed by a read preference.
    ReadPreference(ReadPreference),
    /// Servers whose average round trip time is within the window of the fastest candidate.
    LatencyLimiting(Duration),
    /// Each selector narrows the result of the previous one.
    Composite(Vec<ServerSelector>),
    /// An arbitrary filter.
    Delegate(Arc<SelectorFn>),
}

impl ServerSelector {
    /// Wraps a selection function.
    pub fn delegate<F>(f: F) -> ServerSelector
    where
        F: for<'a> Fn(&ClusterDescription, Vec<&'a ServerDescription>) -> Vec<&'a ServerDescription>
            + Send
            + Sync
            + 'static,
    {
        ServerSelector::Delegate(Arc::new(f))
    }

    /// Keeps the servers for which `predicate` holds.
    pub fn predicate<F>(predicate: F) -> ServerSelector
    where
        F: Fn(&ServerDescription) -> bool + Send + Sync + 'static,
    {
        ServerSelector::delegate(move |_, servers| {
            servers.into_iter().filter(|server| predicate(server)).collect()
        })
    }

    /// Narrows `servers` to the ones this selector allows.
    pub fn select_servers<'a>(&self, cluster: &ClusterDescription, servers: Vec<&'a ServerDescription>)
                              -> Result<Vec<&'a ServerDescription>> {
        match self {
            ServerSelector::Writable => Ok(read_preference::select_writable(cluster, servers)),
            ServerSelector::ReadPreference(read_preference) => {
                read_preference::select_readable(read_preference, cluster, servers)
            }
            ServerSelector::LatencyLimiting(window) => Ok(select_within_latency_window(*window, servers)),
            ServerSelector::Composite(selectors) => {
                let mut servers = servers;
                for selector in selectors {
                    servers = selector.select_servers(cluster, servers)?;
                    if servers.is_empty() {
                        break;
                    }
                }
                Ok(servers)
            }
            ServerSelector::Delegate(f) => Ok(f(cluster, servers)),
        }
    }
}

impl From<ReadPreference> for ServerSelector {
    fn from(read_preference: ReadPreference) -> ServerSelector {
        ServerSelector::ReadPreference(read_preference)
    }
}

fn select_within_latency_window(window: Duration, servers: Vec<&ServerDescription>) -> Vec<&ServerDescription> {
    let fastest = match servers.iter().filter_map(|server| server.average_round_trip_time()).min() {
        Some(fastest) => fastest,
        // Nothing has been measured yet, so nothing can be ruled out.
        None => return servers,
    };

    let limit = fastest + window;
    servers
        .into_iter()
        .filter(|server| server.average_round_trip_time().map_or(false, |rtt| rtt <= limit))
        .collect()
}

impl fmt::Debug for ServerSelector {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServerSelector::Writable => fmt.write_str("Writable"),
            ServerSelector::ReadPreference(rp) => fmt.debug_tuple("ReadPreference").field(rp).finish(),
            ServerSelector::LatencyLimiting(window) => fmt.debug_tuple("LatencyLimiting").field(window).finish(),
            ServerSelector::Composite(selectors) => fmt.debug_tuple("Composite").field(selectors).finish(),
            ServerSelector::Delegate(_) => fmt.write_str("Delegate(..)"),
        }
    }
}

impl fmt::Display for ServerSelector {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServerSelector::Writable => fmt.write_str("WritableServerSelector"),
            ServerSelector::ReadPreference(rp) => write!(fmt, "ReadPreferenceServerSelector {}", rp),
            ServerSelector::LatencyLimiting(window) => {
                write!(fmt, "LatencyLimitingServerSelector {{ window: {}ms }}", window.as_millis())
            }
            ServerSelector::Composite(selectors) => {
                fmt.write_str("CompositeServerSelector [")?;
                for (i, selector) in selectors.iter().enumerate() {
                    if i > 0 {
                        fmt.write_str(", ")?;
                    }
                    write!(fmt, "{}", selector)?;
                }
                fmt.write_str("]")
            }
            ServerSelector::Delegate(_) => fmt.write_str("DelegateServerSelector"),
        }
    }
}
