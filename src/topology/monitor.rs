//! Asynchronous server discovery and monitoring using hello results.
use std::sync::{Arc, Weak};
use std::time::Duration;

use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use chrono::{DateTime, TimeZone, Utc};
use semver::Version;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::apm::{
    Listener, SdamEvent, ServerHeartbeatFailedEvent, ServerHeartbeatStartedEvent,
    ServerHeartbeatSucceededEvent,
};
use crate::common::TagSet;
use crate::connstring::Host;
use crate::error::Error::{self, CommandError, ResponseError};
use crate::error::Result;
use crate::pool::{Connection, ConnectionFactory};

use super::server::{ClusterableServer, ServerDescription, ServerId, ServerType};

// Weight given to the newest sample in the round trip time moving average.
const RTT_ALPHA: f64 = 0.2;

/// The result of a hello (or legacy isMaster) command.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct HelloResult {
    pub ok: bool,
    pub is_writable_primary: bool,
    pub hello_ok: bool,
    pub min_wire_version: i32,
    pub max_wire_version: i32,

    /// mongos instances add this field to the reply with the value "isdbgrid".
    pub msg: Option<String>,
    pub version: Option<Version>,
    pub logical_session_timeout: Option<Duration>,

    // Replica set members only
    pub is_replica_set: bool,
    pub is_secondary: bool,
    pub arbiter_only: bool,
    pub hidden: bool,
    pub set_name: Option<String>,
    pub set_version: Option<i32>,
    pub election_id: Option<ObjectId>,
    pub primary: Option<Host>,
    pub me: Option<Host>,
    pub hosts: Vec<Host>,
    pub passives: Vec<Host>,
    pub arbiters: Vec<Host>,
    pub tags: TagSet,
    pub last_write_date: Option<DateTime<Utc>>,
}

fn read_number(value: &Bson) -> Option<i64> {
    match *value {
        Bson::Int32(v) => Some(i64::from(v)),
        Bson::Int64(v) => Some(v),
        Bson::Double(v) => Some(v as i64),
        _ => None,
    }
}

fn read_i32(doc: &Document, key: &str) -> Result<Option<i32>> {
    match doc.get(key).and_then(read_number) {
        Some(v) => i32::try_from(v)
            .map(Some)
            .map_err(|_| ResponseError(format!("{} is out of range: {}", key, v))),
        None => Ok(None),
    }
}

fn read_bool(doc: &Document, key: &str) -> bool {
    match doc.get(key) {
        Some(&Bson::Boolean(b)) => b,
        Some(other) => read_number(other).map_or(false, |v| v != 0),
        None => false,
    }
}

fn read_string(doc: &Document, key: &str) -> Option<String> {
    match doc.get(key) {
        Some(Bson::String(s)) => Some(s.to_owned()),
        _ => None,
    }
}

fn read_hosts(doc: &Document, key: &str) -> Vec<Host> {
    match doc.get(key) {
        Some(Bson::Array(arr)) => arr
            .iter()
            .filter_map(|bson| match bson {
                Bson::String(s) => s.parse().ok(),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn read_date(value: &Bson) -> Option<DateTime<Utc>> {
    let millis = match value {
        Bson::DateTime(datetime) => datetime.timestamp_millis(),
        other => read_number(other)?,
    };
    Utc.timestamp_millis_opt(millis).single()
}

impl HelloResult {
    /// Parses a hello response document from the server.
    pub fn parse(doc: &Document) -> Result<HelloResult> {
        let ok = match doc.get("ok").and_then(read_number) {
            Some(v) => v != 0,
            None => return Err(ResponseError("hello result does not contain `ok`.".to_owned())),
        };

        let mut result = HelloResult {
            ok,
            is_writable_primary: read_bool(doc, "isWritablePrimary") || read_bool(doc, "ismaster"),
            hello_ok: read_bool(doc, "helloOk"),
            msg: read_string(doc, "msg"),
            is_replica_set: read_bool(doc, "isreplicaset"),
            is_secondary: read_bool(doc, "secondary"),
            arbiter_only: read_bool(doc, "arbiterOnly"),
            hidden: read_bool(doc, "hidden"),
            set_name: read_string(doc, "setName"),
            hosts: read_hosts(doc, "hosts"),
            passives: read_hosts(doc, "passives"),
            arbiters: read_hosts(doc, "arbiters"),
            ..HelloResult::default()
        };

        if let Some(v) = read_i32(doc, "minWireVersion")? {
            result.min_wire_version = v;
        }

        if let Some(v) = read_i32(doc, "maxWireVersion")? {
            result.max_wire_version = v;
        }

        result.set_version = read_i32(doc, "setVersion")?;

        if let Some(minutes) = doc.get("logicalSessionTimeoutMinutes").and_then(read_number) {
            let seconds = (minutes.max(0) as u64).checked_mul(60).ok_or_else(|| {
                ResponseError(format!("logicalSessionTimeoutMinutes is out of range: {}", minutes))
            })?;
            result.logical_session_timeout = Some(Duration::from_secs(seconds));
        }

        if let Some(version) = read_string(doc, "version") {
            result.version = Version::parse(&version).ok();
        }

        if let Some(me) = read_string(doc, "me") {
            result.me = Some(me.parse()?);
        }

        if let Some(primary) = read_string(doc, "primary") {
            result.primary = Some(primary.parse()?);
        }

        if let Some(Bson::Document(tags)) = doc.get("tags") {
            for (key, value) in tags {
                if let Bson::String(tag) = value {
                    result.tags.insert(key.as_str(), tag.as_str());
                }
            }
        }

        match doc.get("electionId") {
            Some(Bson::ObjectId(id)) => result.election_id = Some(*id),
            Some(Bson::Document(inner)) => {
                if let Some(Bson::String(s)) = inner.get("$oid") {
                    result.election_id = Some(ObjectId::parse_str(s).map_err(|err| {
                        ResponseError(format!("invalid electionId: {}", err))
                    })?);
                }
            }
            _ => (),
        }

        if let Some(Bson::Document(last_write)) = doc.get("lastWrite") {
            result.last_write_date = last_write.get("lastWriteDate").and_then(read_date);
        }

        Ok(result)
    }

    /// The server's role as implied by this reply.
    pub fn server_type(&self) -> ServerType {
        if !self.ok {
            ServerType::Unknown
        } else if self.is_replica_set && self.set_name.is_none() {
            ServerType::ReplicaSetGhost
        } else if self.msg.as_deref() == Some("isdbgrid") {
            ServerType::ShardRouter
        } else if self.set_name.is_some() {
            if self.hidden {
                ServerType::ReplicaSetOther
            } else if self.is_writable_primary {
                ServerType::ReplicaSetPrimary
            } else if self.is_secondary {
                ServerType::ReplicaSetSecondary
            } else if self.arbiter_only {
                ServerType::ReplicaSetArbiter
            } else {
                ServerType::ReplicaSetOther
            }
        } else {
            ServerType::Standalone
        }
    }
}

/// Timing knobs for one server monitor.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MonitorSettings {
    pub heartbeat_frequency: Duration,
    pub min_heartbeat_frequency: Duration,
    pub connect_timeout: Duration,
}

/// Periodically checks one server and publishes what it finds.
pub(crate) struct ServerMonitor {
    server: Weak<ClusterableServer>,
    server_id: ServerId,
    factory: Arc<dyn ConnectionFactory>,
    listener: Arc<Listener>,
    check_requested: Arc<Notify>,
    cancel: CancellationToken,
    settings: MonitorSettings,
    // Dedicated monitoring connection, reopened after any failure.
    connection: Option<Box<dyn Connection>>,
    hello_ok: bool,
    average_round_trip_time: Option<Duration>,
}

impl ServerMonitor {
    pub fn new(server: Weak<ClusterableServer>, server_id: ServerId,
               factory: Arc<dyn ConnectionFactory>, listener: Arc<Listener>,
               check_requested: Arc<Notify>, cancel: CancellationToken,
               settings: MonitorSettings) -> ServerMonitor {
        ServerMonitor {
            server,
            server_id,
            factory,
            listener,
            check_requested,
            cancel,
            settings,
            connection: None,
            hello_ok: false,
            average_round_trip_time: None,
        }
    }

    /// Runs heartbeats until the server is disposed.
    pub async fn run(mut self) {
        let cancel = self.cancel.clone();
        let check_requested = self.check_requested.clone();
        debug!(address = %self.server_id.address, "starting server monitor");

        loop {
            let server = match self.server.upgrade() {
                Some(server) => server,
                None => break,
            };

            let check_started = Instant::now();
            let description = tokio::select! {
                _ = cancel.cancelled() => break,
                description = self.check_server(&server) => description,
            };
            server.publish(description);
            drop(server);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = time::sleep_until(check_started + self.settings.heartbeat_frequency) => {}
                _ = check_requested.notified() => {
                    trace!(address = %self.server_id.address, "immediate check requested");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = time::sleep_until(check_started + self.settings.min_heartbeat_frequency) => {}
                    }
                }
            }
        }

        debug!(address = %self.server_id.address, "server monitor stopped");
    }

    // Checks the server, retrying once on a network error if it was previously known.
    async fn check_server(&mut self, server: &ClusterableServer) -> ServerDescription {
        let previous = server.description();

        let error = match self.check_once().await {
            Ok(description) => return description,
            Err(error) => error,
        };
        self.reset(server);

        let error = if previous.server_type() != ServerType::Unknown && error.is_network_error() {
            debug!(address = %self.server_id.address, %error, "heartbeat failed, retrying once");
            match self.check_once().await {
                Ok(description) => return description,
                Err(error) => {
                    self.reset(server);
                    error
                }
            }
        } else {
            error
        };

        warn!(address = %self.server_id.address, %error, "heartbeat failed");
        previous.with_error(&error)
    }

    fn reset(&mut self, server: &ClusterableServer) {
        self.connection = None;
        self.hello_ok = false;
        self.average_round_trip_time = None;
        server.invalidate();
    }

    async fn check_once(&mut self) -> Result<ServerDescription> {
        let address = self.server_id.address.clone();
        self.listener.publish(|| {
            SdamEvent::ServerHeartbeatStarted(ServerHeartbeatStartedEvent { address: address.clone() })
        });

        let start = Instant::now();
        let result = match time::timeout(self.settings.connect_timeout, self.run_hello()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("hello to {}", address))),
        };
        let duration = start.elapsed();

        let result = result.and_then(|reply| {
            let hello = HelloResult::parse(&reply)?;
            if hello.ok {
                Ok((reply, hello))
            } else {
                Err(command_error(&reply))
            }
        });
        let (reply, hello) = match result {
            Ok(pair) => pair,
            Err(error) => return self.heartbeat_failed(duration, error),
        };

        let average = next_round_trip_time(self.average_round_trip_time, duration);
        self.average_round_trip_time = Some(average);

        trace!(address = %address, rtt_ms = duration.as_millis() as u64, "heartbeat succeeded");
        self.listener.publish(|| {
            SdamEvent::ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent {
                address: address.clone(),
                duration,
                reply: reply.clone(),
            })
        });

        Ok(ServerDescription::from_hello(
            self.server_id.clone(),
            &hello,
            average,
            self.settings.heartbeat_frequency,
        ))
    }

    fn heartbeat_failed<T>(&self, duration: Duration, error: Error) -> Result<T> {
        self.listener.publish(|| {
            SdamEvent::ServerHeartbeatFailed(ServerHeartbeatFailedEvent {
                address: self.server_id.address.clone(),
                duration,
                failure: error.to_string(),
            })
        });
        Err(error)
    }

    // Opens the monitoring connection if needed and sends the handshake.
    async fn run_hello(&mut self) -> Result<Document> {
        if self.connection.is_none() {
            self.connection = Some(self.factory.create_connection(&self.server_id.address).await?);
            self.hello_ok = false;
        }

        let command = if self.hello_ok {
            doc! { "hello": 1 }
        } else {
            doc! { "isMaster": 1, "helloOk": true }
        };

        let connection = match self.connection.as_mut() {
            Some(connection) => connection,
            None => return Err(Error::OperationError("monitoring connection was closed.".to_owned())),
        };
        let reply = connection.run_command("admin", command).await?;

        if !self.hello_ok {
            self.hello_ok = read_bool(&reply, "helloOk");
        }
        Ok(reply)
    }
}

// Folds a new sample into the moving average. The first sample seeds it.
fn next_round_trip_time(average: Option<Duration>, sample: Duration) -> Duration {
    match average {
        Some(average) => average.mul_f64(1.0 - RTT_ALPHA) + sample.mul_f64(RTT_ALPHA),
        None => sample,
    }
}

fn command_error(reply: &Document) -> Error {
    let code = reply.get("code").and_then(read_number).unwrap_or(0) as i32;
    let message = read_string(reply, "errmsg").unwrap_or_else(|| "hello failed".to_owned());
    CommandError { code, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_replica_set_primary() {
        let oid = ObjectId::new();
        let reply = doc! {
            "ok": 1.0,
            "ismaster": true,
            "setName": "rs",
            "setVersion": 3,
            "electionId": oid,
            "hosts": ["A:27017", "b:27017"],
            "arbiters": ["c:27017"],
            "me": "a:27017",
            "tags": { "dc": "ny" },
            "minWireVersion": 0,
            "maxWireVersion": 21,
            "logicalSessionTimeoutMinutes": 30,
            "lastWrite": { "lastWriteDate": bson::DateTime::from_millis(1_000) },
        };

        let hello = HelloResult::parse(&reply).unwrap();
        assert_eq!(hello.server_type(), ServerType::ReplicaSetPrimary);
        assert_eq!(hello.set_version, Some(3));
        assert_eq!(hello.election_id, Some(oid));
        assert_eq!(hello.hosts, vec![Host::new("a", 27017), Host::new("b", 27017)]);
        assert_eq!(hello.arbiters.len(), 1);
        assert_eq!(hello.tags.get("dc"), Some("ny"));
        assert_eq!(hello.logical_session_timeout, Some(Duration::from_secs(1800)));
        assert_eq!(hello.last_write_date.map(|date| date.timestamp_millis()), Some(1_000));
    }

    #[test]
    fn derives_server_types() {
        let parse = |reply: Document| HelloResult::parse(&reply).unwrap().server_type();

        assert_eq!(parse(doc! { "ok": 0 }), ServerType::Unknown);
        assert_eq!(parse(doc! { "ok": 1, "isreplicaset": true }), ServerType::ReplicaSetGhost);
        assert_eq!(parse(doc! { "ok": 1, "msg": "isdbgrid" }), ServerType::ShardRouter);
        assert_eq!(parse(doc! { "ok": 1, "setName": "rs", "secondary": true }),
                   ServerType::ReplicaSetSecondary);
        assert_eq!(parse(doc! { "ok": 1, "setName": "rs", "arbiterOnly": true }),
                   ServerType::ReplicaSetArbiter);
        assert_eq!(parse(doc! { "ok": 1, "setName": "rs", "hidden": true, "secondary": true }),
                   ServerType::ReplicaSetOther);
        assert_eq!(parse(doc! { "ok": 1, "isWritablePrimary": true }), ServerType::Standalone);
    }

    #[test]
    fn missing_ok_is_an_error() {
        assert!(HelloResult::parse(&doc! { "ismaster": true }).is_err());
    }

    #[test]
    fn out_of_range_numbers_are_errors() {
        let reply = doc! { "ok": 1, "logicalSessionTimeoutMinutes": i64::MAX };
        match HelloResult::parse(&reply) {
            Err(ResponseError(message)) => assert!(message.contains("logicalSessionTimeoutMinutes")),
            other => panic!("expected a response error, got {:?}", other),
        }

        for key in &["minWireVersion", "maxWireVersion", "setVersion"] {
            let mut reply = doc! { "ok": 1 };
            reply.insert(*key, i64::from(i32::MAX) + 1);
            assert!(HelloResult::parse(&reply).is_err(), "{} was accepted", key);
        }

        let reply = doc! { "ok": 1, "logicalSessionTimeoutMinutes": -5 };
        assert_eq!(HelloResult::parse(&reply).unwrap().logical_session_timeout, Some(Duration::ZERO));
    }

    #[test]
    fn round_trip_time_is_a_moving_average() {
        let first = next_round_trip_time(None, Duration::from_millis(100));
        assert_eq!(first, Duration::from_millis(100));

        let second = next_round_trip_time(Some(first), Duration::from_millis(200));
        assert!((119_990..=120_010).contains(&second.as_micros()), "{:?}", second);

        let third = next_round_trip_time(Some(second), Duration::ZERO);
        assert!((95_990..=96_010).contains(&third.as_micros()), "{:?}", third);
    }
}
