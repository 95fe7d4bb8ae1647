use std::collections::HashSet;
use std::time::Duration;

use mongodb_cluster::connstring::Host;
use mongodb_cluster::selection::ServerSelector;
use mongodb_cluster::topology::{ClusterDescription, ClusterId, ConnectionMode, ServerDescription};

use crate::json::json_files;
use crate::json::server_selection::reader::Suite;
use crate::json::server_selection::server::Server;

fn addresses(servers: &[&ServerDescription]) -> HashSet<Host> {
    servers.iter().map(|server| server.address().clone()).collect()
}

fn expected(servers: &[Server]) -> HashSet<Host> {
    servers.iter().map(|server| server.host.clone()).collect()
}

pub fn run_suite(file: &str) {
    let suite = Suite::from_file(file).unwrap();

    let read_preference = match suite.read_preference {
        Ok(read_preference) => read_preference,
        Err(err) => {
            assert!(suite.error, "{}: unexpected read preference error: {}", file, err);
            return;
        }
    };

    let cluster_id = ClusterId::next();
    let topology = &suite.topology_description;
    let servers = topology
        .servers
        .iter()
        .map(|server| server.to_description(cluster_id, topology.heartbeat))
        .collect();
    let description = ClusterDescription::new(cluster_id, ConnectionMode::Automatic, topology.cluster_type, servers)
        .with_heartbeat_interval(topology.heartbeat);

    let selector = if suite.write {
        ServerSelector::Writable
    } else {
        ServerSelector::from(read_preference)
    };

    let available = || {
        description
            .servers()
            .iter()
            .filter(|server| server.is_available())
            .collect::<Vec<_>>()
    };

    let suitable = match selector.select_servers(&description, available()) {
        Ok(suitable) => {
            assert!(!suite.error, "{}: expected selection to fail", file);
            suitable
        }
        Err(err) => {
            assert!(suite.error, "{}: unexpected selection error: {}", file, err);
            assert!(err.is_server_selection_error(), "{}: {}", file, err);
            return;
        }
    };
    assert_eq!(addresses(&suitable), expected(&suite.suitable_servers), "{}: suitable servers", file);

    let in_window = ServerSelector::LatencyLimiting(Duration::from_millis(15))
        .select_servers(&description, suitable)
        .unwrap();
    assert_eq!(addresses(&in_window), expected(&suite.in_latency_window), "{}: latency window", file);

    // Selection never mutates the snapshot it reads.
    let rendered = description.to_string();
    let again = selector.select_servers(&description, available()).unwrap();
    assert_eq!(addresses(&again), expected(&suite.suitable_servers), "{}: repeated selection", file);
    assert_eq!(description.to_string(), rendered);
}

pub fn run_dir(dir: &str) {
    let files = json_files(dir);
    assert!(!files.is_empty(), "no test files in {}", dir);
    for file in files {
        println!("running suite {}", file);
        run_suite(&file);
    }
}
