use bson::Document;
use mongodb_cluster::connstring::{self, Host};
use serde_json::Value;

use crate::json::to_document;

/// The hello replies delivered in one phase. An empty reply stands for a network error.
pub struct Responses {
    pub data: Vec<(Host, Document)>,
}

impl Responses {
    pub fn from_json(array: &[Value]) -> Result<Responses, String> {
        let mut data = Vec::new();

        for json in array {
            let inner_array = val_or_err!(json,
                                          Value::Array(arr) => arr,
                                          "`responses` must be an array of arrays.");

            if inner_array.len() != 2 {
                return Err("Response item must contain the host string and hello object.".to_owned());
            }

            let host = val_or_err!(&inner_array[0],
                                   Value::String(s) => connstring::parse_host(s).map_err(|err| err.to_string())?,
                                   "Response item must contain the host string as the first argument.");

            let reply = val_or_err!(&inner_array[1],
                                    Value::Object(obj) => to_document(obj)?,
                                    "Response item must contain the hello object as the second argument.");

            data.push((host, reply));
        }

        Ok(Responses { data })
    }
}
