use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use mongodb_cluster::common::TagSet;
use mongodb_cluster::connstring::{self, Host};
use mongodb_cluster::topology::{ClusterId, ServerDescription, ServerId, ServerType};
use serde_json::{Map, Value};

use super::read_preference::tag_set_from_json;

pub struct Server {
    pub host: Host,
    pub rtt: Option<Duration>,
    pub server_type: ServerType,
    pub tags: TagSet,
    pub last_update_time: Option<DateTime<Utc>>,
    pub last_write_date: Option<DateTime<Utc>>,
    pub max_wire_version: Option<i32>,
}

fn millis(value: &Value) -> Option<DateTime<Utc>> {
    let millis = match value {
        Value::Number(n) => n.as_i64()?,
        Value::Object(obj) => match obj.get("$numberLong") {
            Some(Value::String(s)) => s.parse().ok()?,
            _ => return None,
        },
        _ => return None,
    };
    Utc.timestamp_millis_opt(millis).single()
}

impl Server {
    pub fn from_json(object: &Map<String, Value>) -> Result<Server, String> {
        let host = val_or_err!(object.get("address"),
                               Some(Value::String(s)) => connstring::parse_host(s).map_err(|err| err.to_string())?,
                               "server must have an address.");

        let rtt = match object.get("avg_rtt_ms") {
            Some(Value::Number(n)) => n.as_u64().map(Duration::from_millis),
            _ => None,
        };

        let server_type = match object.get("type") {
            Some(Value::String(s)) => ServerType::from_str(s).map_err(|err| err.to_string())?,
            _ => ServerType::Unknown,
        };

        let tags = match object.get("tags") {
            Some(Value::Object(obj)) => tag_set_from_json(obj)?,
            _ => TagSet::new(),
        };

        let last_update_time = object.get("lastUpdateTime").and_then(millis);

        let last_write_date = match object.get("lastWrite") {
            Some(Value::Object(obj)) => obj.get("lastWriteDate").and_then(millis),
            _ => None,
        };

        let max_wire_version = match object.get("maxWireVersion") {
            Some(Value::Number(n)) => n.as_i64().map(|v| v as i32),
            _ => None,
        };

        Ok(Server {
            host,
            rtt,
            server_type,
            tags,
            last_update_time,
            last_write_date,
            max_wire_version,
        })
    }

    /// Builds the description a monitor would have published for this server.
    pub fn to_description(&self, cluster_id: ClusterId, heartbeat: Duration) -> ServerDescription {
        let mut description = ServerDescription::new(ServerId::new(cluster_id, self.host.clone()))
            .with_server_type(self.server_type)
            .with_tags(self.tags.clone())
            .with_heartbeat_interval(heartbeat);

        if let Some(rtt) = self.rtt {
            description = description.with_round_trip_time(rtt);
        }
        if let Some(time) = self.last_update_time {
            description = description.with_last_update_time(time);
        }
        if let Some(date) = self.last_write_date {
            description = description.with_last_write_date(date);
        }
        if let Some(max) = self.max_wire_version {
            description = description.with_wire_version_range(0, max);
        }
        description
    }
}
