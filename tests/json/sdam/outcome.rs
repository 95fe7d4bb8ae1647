use std::collections::HashMap;
use std::str::FromStr;

use bson::oid::ObjectId;
use mongodb_cluster::connstring::{self, Host};
use mongodb_cluster::topology::ServerType;
use serde_json::{Map, Value};

pub struct Server {
    pub set_name: Option<String>,
    pub server_type: ServerType,
}

/// The expected cluster state after a phase.
pub struct Outcome {
    pub servers: HashMap<Host, Server>,
    pub set_name: Option<String>,
    /// Kept verbatim so that `ReplicaSetWithPrimary` and `ReplicaSetNoPrimary` can be told apart.
    pub topology_type: String,
    /// `None` when the phase does not check it, `Some(None)` when it must be unset.
    pub logical_session_timeout_minutes: Option<Option<u64>>,
    pub compatible: Option<bool>,
    pub max_set_version: Option<i32>,
    pub max_election_id: Option<ObjectId>,
}

fn optional_string(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key) {
        Some(Value::String(s)) => Some(s.to_owned()),
        _ => None,
    }
}

impl Outcome {
    pub fn from_json(object: &Map<String, Value>) -> Result<Outcome, String> {
        let mut servers = HashMap::new();

        let server_map = val_or_err!(object.get("servers"),
                                     Some(Value::Object(obj)) => obj,
                                     "`servers` must be an object map.");

        for (host, json) in server_map {
            let doc = val_or_err!(json,
                                  Value::Object(obj) => obj,
                                  "each server outcome must be an object.");

            let server_type = val_or_err!(doc.get("type"),
                                          Some(Value::String(s)) =>
                                          ServerType::from_str(s).map_err(|err| err.to_string())?,
                                          "`type` must be a string.");

            let server = Server {
                set_name: optional_string(doc, "setName"),
                server_type,
            };
            let host = connstring::parse_host(host).map_err(|err| err.to_string())?;
            servers.insert(host, server);
        }

        let topology_type = val_or_err!(object.get("topologyType"),
                                        Some(Value::String(s)) => s.to_owned(),
                                        "`topologyType` must be a string.");

        let logical_session_timeout_minutes = match object.get("logicalSessionTimeoutMinutes") {
            None => None,
            Some(Value::Null) => Some(None),
            Some(Value::Number(n)) => Some(n.as_u64()),
            Some(_) => return Err("`logicalSessionTimeoutMinutes` must be a number or null.".to_owned()),
        };

        let compatible = match object.get("compatible") {
            Some(Value::Bool(b)) => Some(*b),
            _ => None,
        };

        let max_set_version = match object.get("maxSetVersion") {
            Some(Value::Number(n)) => n.as_i64().map(|v| v as i32),
            _ => None,
        };

        let max_election_id = match object.get("maxElectionId") {
            Some(Value::Object(oid)) => match oid.get("$oid") {
                Some(Value::String(s)) => Some(ObjectId::parse_str(s).map_err(|err| err.to_string())?),
                _ => return Err("`maxElectionId` must be an $oid object.".to_owned()),
            },
            _ => None,
        };

        Ok(Outcome {
            servers,
            set_name: optional_string(object, "setName"),
            topology_type,
            logical_session_timeout_minutes,
            compatible,
            max_set_version,
            max_election_id,
        })
    }
}
