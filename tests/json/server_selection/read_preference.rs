use std::str::FromStr;
use std::time::Duration;

use mongodb_cluster::common::{ReadMode, ReadPreference, TagSet};
use serde_json::{Map, Value};

pub fn tag_set_from_json(object: &Map<String, Value>) -> Result<TagSet, String> {
    let mut tags = TagSet::new();
    for (key, json) in object {
        match json {
            Value::String(s) => tags.insert(key.as_str(), s.as_str()),
            _ => return Err("tags must be string => string maps.".to_owned()),
        }
    }
    Ok(tags)
}

/// Reads a read preference. A preference the crate rejects is returned as the inner error.
pub fn from_json(object: &Map<String, Value>) -> Result<Result<ReadPreference, String>, String> {
    let mode = match object.get("mode") {
        Some(Value::String(s)) => ReadMode::from_str(s).map_err(|err| err.to_string())?,
        None => ReadMode::Primary,
        _ => return Err("read preference mode must be a string.".to_owned()),
    };

    let mut tag_sets = Vec::new();
    if let Some(json) = object.get("tag_sets") {
        let array = val_or_err!(json,
                                Value::Array(arr) => arr,
                                "read preference tag sets must be an array.");
        for json in array {
            let obj = val_or_err!(json,
                                  Value::Object(obj) => obj,
                                  "tags must be document objects.");
            tag_sets.push(tag_set_from_json(obj)?);
        }
    }

    let max_staleness = match object.get("maxStalenessSeconds") {
        None => None,
        Some(Value::Number(n)) => match n.as_i64() {
            Some(-1) => None,
            Some(seconds) if seconds > 0 => Some(Duration::from_secs(seconds as u64)),
            _ => return Ok(Err(format!("invalid maxStalenessSeconds {}", n))),
        },
        Some(_) => return Err("maxStalenessSeconds must be a number.".to_owned()),
    };

    Ok(ReadPreference::new(mode, tag_sets, max_staleness).map_err(|err| err.to_string()))
}
