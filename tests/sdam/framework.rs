use std::io;
use std::str::FromStr;
use std::time::Duration;

use mongodb_cluster::settings::ClusterSettings;
use mongodb_cluster::topology::{
    ClusterDescription, ClusterId, ClusterKind, ClusterType, ConnectionMode, HelloResult, ServerDescription,
    ServerId,
};
use mongodb_cluster::Error;

use crate::json::json_files;
use crate::json::sdam::outcome::Outcome;
use crate::json::sdam::reader::Suite;

pub fn run_suite(file: &str) {
    let suite = Suite::from_file(file).unwrap();
    let settings = ClusterSettings::parse(&suite.uri).unwrap();
    let connection_mode = match settings.cluster_kind() {
        ClusterKind::Single => ConnectionMode::Direct,
        _ => settings.connection_mode,
    };

    let cluster_id = ClusterId::next();
    let mut description = ClusterDescription::from_seeds(
        cluster_id,
        connection_mode,
        &settings.hosts,
        settings.repl_set_name.clone(),
        settings.heartbeat_frequency,
    );

    for (i, phase) in suite.phases.iter().enumerate() {
        for (host, reply) in &phase.responses.data {
            let server_id = ServerId::new(cluster_id, host.clone());

            // An empty reply replays a network error.
            let server_description = if reply.is_empty() {
                let error = Error::from(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"));
                ServerDescription::new(server_id).with_error(&error)
            } else {
                let hello = HelloResult::parse(reply).unwrap();
                ServerDescription::from_hello(server_id, &hello, Duration::from_millis(5),
                                              settings.heartbeat_frequency)
            };

            description = description.with_server_description(server_description);
        }

        let context = format!("{} (phase {})", suite.description, i);
        check_outcome(&context, &description, &phase.outcome);
    }
}

fn check_outcome(context: &str, description: &ClusterDescription, outcome: &Outcome) {
    assert_eq!(description.servers().len(), outcome.servers.len(), "{}: {}", context, description);

    for (host, expected) in &outcome.servers {
        let server = description
            .server(host)
            .unwrap_or_else(|| panic!("{}: missing server {}", context, host));
        assert_eq!(server.server_type(), expected.server_type, "{}: type of {}", context, host);
        assert_eq!(server.set_name(), expected.set_name.as_deref(), "{}: setName of {}", context, host);
    }

    match outcome.topology_type.as_str() {
        "ReplicaSetWithPrimary" => {
            assert_eq!(description.cluster_type(), ClusterType::ReplicaSet, "{}", context);
            assert!(description.has_primary(), "{}: expected a primary", context);
        }
        "ReplicaSetNoPrimary" => {
            assert_eq!(description.cluster_type(), ClusterType::ReplicaSet, "{}", context);
            assert!(!description.has_primary(), "{}: expected no primary", context);
        }
        other => {
            assert_eq!(description.cluster_type(), ClusterType::from_str(other).unwrap(), "{}", context);
        }
    }

    assert_eq!(description.set_name(), outcome.set_name.as_deref(), "{}: setName", context);

    if let Some(expected) = outcome.logical_session_timeout_minutes {
        let actual = description.logical_session_timeout().map(|timeout| timeout.as_secs() / 60);
        assert_eq!(actual, expected, "{}: logicalSessionTimeoutMinutes", context);
    }

    if let Some(compatible) = outcome.compatible {
        assert_eq!(description.compatibility_error().is_none(), compatible, "{}: compatible", context);
    }

    if let Some(max_set_version) = outcome.max_set_version {
        assert_eq!(description.max_set_version(), Some(max_set_version), "{}: maxSetVersion", context);
    }

    if let Some(max_election_id) = outcome.max_election_id {
        assert_eq!(description.max_election_id(), Some(max_election_id), "{}: maxElectionId", context);
    }
}

pub fn run_dir(dir: &str) {
    let files = json_files(dir);
    assert!(!files.is_empty(), "no test files in {}", dir);
    for file in files {
        println!("running suite {}", file);
        run_suite(&file);
    }
}
