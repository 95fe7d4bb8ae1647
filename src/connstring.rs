//! Connection string parsing and server endpoints.
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error::{self, ArgumentError};
use crate::error::Result;

pub const DEFAULT_PORT: u16 = 27017;
pub const URI_SCHEME: &str = "mongodb://";

/// Encapsulates the hostname and port of a server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Host {
    pub host_name: String,
    pub port: u16,
}

impl Host {
    /// Creates a new host. The name is lowercased.
    pub fn new(host_name: &str, port: u16) -> Host {
        Host {
            host_name: host_name.to_ascii_lowercase(),
            port,
        }
    }
}

impl Default for Host {
    fn default() -> Host {
        Host::new("localhost", DEFAULT_PORT)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.host_name.contains(':') {
            write!(fmt, "[{}]:{}", self.host_name, self.port)
        } else {
            write!(fmt, "{}:{}", self.host_name, self.port)
        }
    }
}

impl FromStr for Host {
    type Err = Error;

    fn from_str(s: &str) -> Result<Host> {
        parse_host(s)
    }
}

impl Serialize for Host {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Host {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Host, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_host(&s).map_err(serde::de::Error::custom)
    }
}

/// Encapsulates the options and read preference tags of a connection string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Options keyed by their lowercased names.
    pub options: BTreeMap<String, String>,
    pub read_pref_tags: Vec<String>,
}

impl ConnectionOptions {
    /// Retrieves an option by name, ignoring case.
    pub fn get(&self, key: &str) -> Option<&String> {
        self.options.get(&key.to_ascii_lowercase())
    }
}

/// The seed list and options of a cluster connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub hosts: Vec<Host>,
    pub options: ConnectionOptions,
}

impl FromStr for ConnectionString {
    type Err = Error;

    fn from_str(s: &str) -> Result<ConnectionString> {
        parse(s)
    }
}

/// Parses a MongoDB connection string URI of the form
/// `mongodb://[user:pass@]host1[:port1][,host2[:port2]...][/[database][?options]]`.
///
/// Credentials and the database path are accepted but not retained; only the seed list
/// and options are meaningful to cluster monitoring.
pub fn parse(address: &str) -> Result<ConnectionString> {
    let addr = address.strip_prefix(URI_SCHEME).ok_or_else(|| {
        ArgumentError("MongoDB connection string must start with 'mongodb://'.".to_owned())
    })?;

    let (host_str, path_str) = partition(addr, "/");

    if path_str.is_empty() && host_str.contains('?') {
        return Err(ArgumentError(
            "A '/' is required between the host list and any options.".to_owned(),
        ));
    }

    let hosts = if host_str.contains('@') {
        let (_, host_string) = rpartition(host_str, "@");
        split_hosts(host_string)?
    } else {
        split_hosts(host_str)?
    };

    let (_, opts) = partition(path_str, "?");
    let options = if opts.is_empty() {
        ConnectionOptions::default()
    } else {
        split_options(opts)?
    };

    Ok(ConnectionString { hosts, options })
}

// Parses a literal IPv6 host entity of the form [host] or [host]:port
fn parse_ipv6_literal_host(entity: &str) -> Result<Host> {
    match entity.find("]:") {
        Some(idx) => match entity[idx + 2..].parse::<u16>() {
            Ok(port) => Ok(Host::new(&entity[1..idx], port)),
            Err(_) => Err(ArgumentError("Port must be an integer.".to_owned())),
        },
        None if entity.ends_with(']') => Ok(Host::new(&entity[1..entity.len() - 1], DEFAULT_PORT)),
        None => Err(ArgumentError(
            "An IPv6 address must be enclosed in '[' and ']' according to RFC 2732.".to_owned(),
        )),
    }
}

/// Parses a host entity of the form `host` or `host:port`. IPv6 literals must be bracketed.
/// All host names are lowercased.
pub fn parse_host(entity: &str) -> Result<Host> {
    if entity.is_empty() {
        return Err(ArgumentError("Empty host name.".to_owned()));
    }

    if entity.starts_with('[') {
        return parse_ipv6_literal_host(entity);
    }

    let (host, port) = partition(entity, ":");
    if port.is_empty() {
        return Ok(Host::new(host, DEFAULT_PORT));
    }

    if port.contains(':') {
        return Err(ArgumentError(
            "Reserved characters such as ':' must be escaped according to RFC 2396. \
             An IPv6 address literal must be enclosed in '[' and ']' according to RFC 2732."
                .to_owned(),
        ));
    }

    match port.parse::<u16>() {
        Ok(val) if val > 0 => Ok(Host::new(host, val)),
        _ => Err(ArgumentError(format!("Invalid port in host '{}'.", entity))),
    }
}

// Splits and parses comma-separated hosts.
fn split_hosts(host_str: &str) -> Result<Vec<Host>> {
    host_str
        .split(',')
        .map(|entity| {
            if entity.is_empty() {
                Err(ArgumentError("Empty host, or extra comma in host list.".to_owned()))
            } else {
                parse_host(entity)
            }
        })
        .collect()
}

// Parses the delimited option string into its options and read preference tags.
fn split_options(opts: &str) -> Result<ConnectionOptions> {
    if opts.contains('&') && opts.contains(';') {
        return Err(ArgumentError("Cannot mix '&' and ';' for option separators.".to_owned()));
    }

    let delim = if opts.contains(';') { ';' } else { '&' };
    let mut options = ConnectionOptions::default();

    for opt in opts.split(delim).filter(|opt| !opt.is_empty()) {
        let (key, val) = partition(opt, "=");
        if !opt.contains('=') {
            return Err(ArgumentError(format!(
                "InvalidURI: options are key=value pairs, found '{}'.",
                opt
            )));
        }

        let key = key.to_ascii_lowercase();
        if key == "readpreferencetags" {
            options.read_pref_tags.push(val.to_owned());
        } else {
            options.options.insert(key, val.to_owned());
        }
    }

    Ok(options)
}

// Partitions a string around the left-most occurrence of the separator, if it exists.
fn partition<'a>(string: &'a str, sep: &str) -> (&'a str, &'a str) {
    match string.find(sep) {
        Some(idx) => (&string[..idx], &string[idx + sep.len()..]),
        None => (string, ""),
    }
}

// Partitions a string around the right-most occurrence of the separator, if it exists.
fn rpartition<'a>(string: &'a str, sep: &str) -> (&'a str, &'a str) {
    match string.rfind(sep) {
        Some(idx) => (&string[..idx], &string[idx + sep.len()..]),
        None => (string, ""),
    }
}
