use crate::common::{ReadMode, ReadPreference, TagSet};
use crate::error::Result;
use crate::topology::{ClusterDescription, ClusterType, ConnectionMode, ServerDescription, ServerType};

use super::staleness;

fn of_type<'a>(servers: Vec<&'a ServerDescription>, server_type: ServerType) -> Vec<&'a ServerDescription> {
    servers.into_iter().filter(|server| server.server_type() == server_type).collect()
}

/// Servers able to take writes.
pub(super) fn select_writable<'a>(cluster: &ClusterDescription, servers: Vec<&'a ServerDescription>)
                                  -> Vec<&'a ServerDescription> {
    match cluster.cluster_type() {
        ClusterType::Unknown => Vec::new(),
        _ if cluster.connection_mode() == ConnectionMode::Direct => servers,
        ClusterType::ReplicaSet => of_type(servers, ServerType::ReplicaSetPrimary),
        ClusterType::Standalone => of_type(servers, ServerType::Standalone),
        ClusterType::Sharded => of_type(servers, ServerType::ShardRouter),
        ClusterType::LoadBalanced => of_type(servers, ServerType::LoadBalanced),
    }
}

/// Servers able to serve a read with the given preference.
pub(super) fn select_readable<'a>(read_preference: &ReadPreference, cluster: &ClusterDescription,
                                  servers: Vec<&'a ServerDescription>) -> Result<Vec<&'a ServerDescription>> {
    Ok(match cluster.cluster_type() {
        ClusterType::Unknown => Vec::new(),
        _ if cluster.connection_mode() == ConnectionMode::Direct => servers,
        ClusterType::ReplicaSet => select_from_replica_set(read_preference, cluster, servers)?,
        ClusterType::Standalone => of_type(servers, ServerType::Standalone),
        // Routers apply the read preference themselves.
        ClusterType::Sharded => of_type(servers, ServerType::ShardRouter),
        ClusterType::LoadBalanced => of_type(servers, ServerType::LoadBalanced),
    })
}

fn select_from_replica_set<'a>(read_preference: &ReadPreference, cluster: &ClusterDescription,
                               servers: Vec<&'a ServerDescription>) -> Result<Vec<&'a ServerDescription>> {
    let primary: Vec<&ServerDescription> = servers
        .iter()
        .cloned()
        .filter(|server| server.server_type() == ServerType::ReplicaSetPrimary)
        .take(1)
        .collect();

    if read_preference.mode() == ReadMode::Primary {
        return Ok(primary);
    }

    if read_preference.mode() == ReadMode::PrimaryPreferred && !primary.is_empty() {
        return Ok(primary);
    }

    let wanted_types: &[ServerType] = match read_preference.mode() {
        ReadMode::Nearest => &[ServerType::ReplicaSetPrimary, ServerType::ReplicaSetSecondary],
        _ => &[ServerType::ReplicaSetSecondary],
    };
    let candidates: Vec<&ServerDescription> = servers
        .into_iter()
        .filter(|server| wanted_types.contains(&server.server_type()))
        .collect();

    let candidates = match read_preference.max_staleness() {
        Some(max_staleness) => staleness::filter_stale(cluster, max_staleness, candidates)?,
        None => candidates,
    };

    let matching = select_by_tag_sets(read_preference.tag_sets(), candidates);

    if matching.is_empty() && read_preference.mode() == ReadMode::SecondaryPreferred {
        return Ok(primary);
    }
    Ok(matching)
}

/// Returns the servers matching the first tag set that matches any server. No tag sets means
/// every server matches.
pub(super) fn select_by_tag_sets<'a>(tag_sets: &[TagSet], servers: Vec<&'a ServerDescription>)
                                     -> Vec<&'a ServerDescription> {
    if tag_sets.is_empty() {
        return servers;
    }

    for tag_set in tag_sets {
        let matching: Vec<&ServerDescription> = servers
            .iter()
            .cloned()
            .filter(|server| tag_set.matches(server.tags()))
            .collect();
        if !matching.is_empty() {
            return matching;
        }
    }

    Vec::new()
}
