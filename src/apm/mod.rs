//! Topology Monitoring
//!
//! The APM module provides an interface for observing the cluster while it is monitored.
//! Heartbeats, server openings and closings, and every material change to a server or to the
//! cluster description trigger the hooks registered on the cluster's `Listener`.
mod event;
mod listener;

pub use self::event::{
    ClusterDescriptionChangedEvent, SdamEvent, ServerClosedEvent,
    ServerDescriptionChangedEvent, ServerHeartbeatFailedEvent, ServerHeartbeatStartedEvent,
    ServerHeartbeatSucceededEvent, ServerOpeningEvent,
};
pub use self::listener::{Listener, SdamHook};
