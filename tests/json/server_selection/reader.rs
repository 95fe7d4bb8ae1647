use std::str::FromStr;
use std::time::Duration;

use mongodb_cluster::common::ReadPreference;
use mongodb_cluster::topology::ClusterType;
use serde_json::{Map, Value};

use super::read_preference;
use super::server::Server;
use crate::json::object_from_file;

pub struct TopologyDescription {
    pub cluster_type: ClusterType,
    pub heartbeat: Duration,
    pub servers: Vec<Server>,
}

pub struct Suite {
    pub write: bool,
    pub read_preference: Result<ReadPreference, String>,
    pub topology_description: TopologyDescription,
    pub suitable_servers: Vec<Server>,
    pub in_latency_window: Vec<Server>,
    pub error: bool,
}

fn get_server_array(object: &Map<String, Value>, key: &str) -> Result<Vec<Server>, String> {
    let array = match object.get(key) {
        Some(Value::Array(array)) => array,
        None => return Ok(Vec::new()),
        Some(_) => return Err(format!("`{}` must be an array of servers.", key)),
    };

    let mut servers = Vec::new();
    for json in array {
        let obj = val_or_err!(json,
                              Value::Object(obj) => obj,
                              "Some servers could not be parsed for topology");
        servers.push(Server::from_json(obj)?);
    }
    Ok(servers)
}

impl Suite {
    pub fn from_file(path: &str) -> Result<Suite, String> {
        let object = object_from_file(path)?;

        let write = match object.get("operation") {
            Some(Value::String(s)) => s == "write",
            _ => false,
        };

        let read_preference = match object.get("read_preference") {
            Some(Value::Object(obj)) => read_preference::from_json(obj)?,
            _ => Ok(ReadPreference::primary()),
        };

        let topology_obj = val_or_err!(object.get("topology_description"),
                                       Some(Value::Object(obj)) => obj,
                                       "suite requires a topology_description object.");

        let cluster_type = val_or_err!(topology_obj.get("type"),
                                       Some(Value::String(s)) =>
                                       ClusterType::from_str(s).map_err(|err| err.to_string())?,
                                       "topology requires a type");

        let heartbeat = match topology_obj.get("heartbeatFrequencyMS") {
            Some(Value::Number(n)) => Duration::from_millis(n.as_u64().unwrap_or(10_000)),
            _ => Duration::from_secs(10),
        };

        let error = match object.get("error") {
            Some(Value::Bool(b)) => *b,
            _ => false,
        };

        Ok(Suite {
            write,
            read_preference,
            topology_description: TopologyDescription {
                cluster_type,
                heartbeat,
                servers: get_server_array(topology_obj, "servers")?,
            },
            suitable_servers: get_server_array(&object, "suitable_servers")?,
            in_latency_window: get_server_array(&object, "in_latency_window")?,
            error,
        })
    }
}
