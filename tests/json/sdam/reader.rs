use serde_json::{Map, Value};

use super::outcome::Outcome;
use super::responses::Responses;
use crate::json::object_from_file;

pub struct Phase {
    pub responses: Responses,
    pub outcome: Outcome,
}

impl Phase {
    fn from_json(object: &Map<String, Value>) -> Result<Phase, String> {
        let responses = val_or_err!(object.get("responses"),
                                    Some(Value::Array(array)) => Responses::from_json(array)?,
                                    "No `responses` array found.");

        let outcome = val_or_err!(object.get("outcome"),
                                  Some(Value::Object(obj)) => Outcome::from_json(obj)?,
                                  "No `outcome` object found.");

        Ok(Phase { responses, outcome })
    }
}

/// A discovery scenario: a seed list and the replies that drive it.
pub struct Suite {
    pub description: String,
    pub uri: String,
    pub phases: Vec<Phase>,
}

impl Suite {
    pub fn from_file(path: &str) -> Result<Suite, String> {
        let object = object_from_file(path)?;

        let description = match object.get("description") {
            Some(Value::String(s)) => s.to_owned(),
            _ => path.to_owned(),
        };

        let uri = val_or_err!(object.get("uri"),
                              Some(Value::String(s)) => s.to_owned(),
                              "No `uri` string found.");

        let array = val_or_err!(object.get("phases"),
                                Some(Value::Array(array)) => array,
                                "No `phases` array found.");

        let mut phases = Vec::new();
        for json in array {
            let obj = val_or_err!(json,
                                  Value::Object(obj) => obj,
                                  "`phases` array must only contain objects.");
            phases.push(Phase::from_json(obj)?);
        }

        Ok(Suite { description, uri, phases })
    }
}
