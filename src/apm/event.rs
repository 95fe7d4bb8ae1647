use std::fmt::{Display, Error, Formatter};
use std::sync::Arc;
use std::time::Duration;

use bson::Document;

use crate::connstring::Host;
use crate::topology::{ClusterDescription, ClusterId, ServerDescription};

pub struct ServerOpeningEvent {
    pub cluster_id: ClusterId,
    pub address: Host,
}

pub struct ServerClosedEvent {
    pub cluster_id: ClusterId,
    pub address: Host,
}

pub struct ServerDescriptionChangedEvent {
    pub address: Host,
    pub previous_description: ServerDescription,
    pub new_description: ServerDescription,
}

pub struct ClusterDescriptionChangedEvent {
    pub previous_description: Arc<ClusterDescription>,
    pub new_description: Arc<ClusterDescription>,
}

pub struct ServerHeartbeatStartedEvent {
    pub address: Host,
}

pub struct ServerHeartbeatSucceededEvent {
    pub address: Host,
    pub duration: Duration,
    pub reply: Document,
}

pub struct ServerHeartbeatFailedEvent {
    pub address: Host,
    pub duration: Duration,
    pub failure: String,
}

/// An event published while discovering and monitoring a cluster.
pub enum SdamEvent {
    ServerOpening(ServerOpeningEvent),
    ServerClosed(ServerClosedEvent),
    ServerDescriptionChanged(Box<ServerDescriptionChangedEvent>),
    ClusterDescriptionChanged(Box<ClusterDescriptionChangedEvent>),
    ServerHeartbeatStarted(ServerHeartbeatStartedEvent),
    ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent),
    ServerHeartbeatFailed(ServerHeartbeatFailedEvent),
}

impl Display for SdamEvent {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), Error> {
        match self {
            SdamEvent::ServerOpening(event) => {
                write!(fmt, "SERVER.OPENING {} (cluster {})", event.address, event.cluster_id)
            }
            SdamEvent::ServerClosed(event) => {
                write!(fmt, "SERVER.CLOSED {} (cluster {})", event.address, event.cluster_id)
            }
            SdamEvent::ServerDescriptionChanged(event) => write!(
                fmt,
                "SERVER.CHANGED {}: {} -> {}",
                event.address,
                event.previous_description.server_type(),
                event.new_description.server_type()
            ),
            SdamEvent::ClusterDescriptionChanged(event) => write!(
                fmt,
                "CLUSTER.CHANGED {}: {} -> {}",
                event.new_description.cluster_id(),
                event.previous_description.cluster_type(),
                event.new_description.cluster_type()
            ),
            SdamEvent::ServerHeartbeatStarted(event) => {
                write!(fmt, "HEARTBEAT {} STARTED", event.address)
            }
            SdamEvent::ServerHeartbeatSucceeded(event) => write!(
                fmt,
                "HEARTBEAT {} SUCCEEDED ({} ms)",
                event.address,
                event.duration.as_millis()
            ),
            SdamEvent::ServerHeartbeatFailed(event) => write!(
                fmt,
                "HEARTBEAT {} FAILED: {} ({} ms)",
                event.address,
                event.failure,
                event.duration.as_millis()
            ),
        }
    }
}
