#[macro_use]
mod macros;

pub mod sdam;
pub mod server_selection;

use std::fs::File;

use bson::Document;
use serde_json::{Map, Value};

/// Reads a JSON test file into its top level object.
pub fn object_from_file(path: &str) -> Result<Map<String, Value>, String> {
    let file = File::open(path).map_err(|err| format!("Unable to open {}: {}", path, err))?;
    let value: Value = serde_json::from_reader(file).map_err(|err| format!("Invalid JSON in {}: {}", path, err))?;
    match value {
        Value::Object(object) => Ok(object),
        _ => Err(format!("{} must hold a JSON object", path)),
    }
}

pub fn to_document(object: &Map<String, Value>) -> Result<Document, String> {
    bson::to_document(object).map_err(|err| err.to_string())
}

/// Every `.json` file directly under `dir`, sorted by name.
pub fn json_files(dir: &str) -> Vec<String> {
    let mut files: Vec<String> = std::fs::read_dir(dir)
        .unwrap_or_else(|err| panic!("unable to read {}: {}", dir, err))
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().map_or(false, |ext| ext == "json"))
        .map(|path| path.to_string_lossy().into_owned())
        .collect();
    files.sort();
    files
}
