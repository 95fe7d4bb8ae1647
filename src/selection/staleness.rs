//! Replication lag estimates used by max staleness read preferences.
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Error::ServerSelectionError;
use crate::error::Result;
use crate::topology::{ClusterDescription, ServerDescription, ServerType};

fn millis_between(later: DateTime<Utc>, earlier: DateTime<Utc>) -> i64 {
    (later - earlier).num_milliseconds()
}

/// Estimates how far `server` lags behind the most recent known write.
///
/// With a primary the estimate compares how long ago each server last wrote, as of its own
/// last check. Without one the secondary with the newest write stands in as the reference.
/// Either way the server's heartbeat interval is added to cover the time since its last
/// check. Returns `None` when a needed write date is unknown.
pub fn estimated_staleness(server: &ServerDescription, primary: Option<&ServerDescription>,
                           freshest_secondary: Option<&ServerDescription>) -> Option<Duration> {
    let last_write = server.last_write_date()?;
    let heartbeat = server.heartbeat_interval().as_millis() as i64;

    let staleness = match primary {
        Some(primary) => {
            let primary_write = primary.last_write_date()?;
            millis_between(server.last_update_time(), last_write)
                - millis_between(primary.last_update_time(), primary_write)
                + heartbeat
        }
        None => {
            let freshest_write = freshest_secondary?.last_write_date()?;
            millis_between(freshest_write, last_write) + heartbeat
        }
    };

    Some(Duration::from_millis(staleness.max(0) as u64))
}

/// Rejects a max staleness shorter than twice the smallest heartbeat interval among the
/// candidates, since such a bound cannot be met by waiting.
pub fn validate_max_staleness(max_staleness: Duration, servers: &[&ServerDescription],
                              default_heartbeat: Duration) -> Result<()> {
    let heartbeat = servers
        .iter()
        .map(|server| server.heartbeat_interval())
        .min()
        .unwrap_or(default_heartbeat);

    if max_staleness < heartbeat * 2 {
        return Err(ServerSelectionError(format!(
            "max staleness ({} s) must be at least twice the heartbeat interval ({} ms)",
            max_staleness.as_secs(),
            heartbeat.as_millis()
        )));
    }
    Ok(())
}

/// Drops secondaries estimated to lag by more than `max_staleness`, along with secondaries
/// whose lag cannot be estimated. Other server types are kept.
pub(crate) fn filter_stale<'a>(cluster: &ClusterDescription, max_staleness: Duration,
                               servers: Vec<&'a ServerDescription>) -> Result<Vec<&'a ServerDescription>> {
    validate_max_staleness(max_staleness, &servers, cluster.heartbeat_interval())?;

    let primary = cluster.primary();
    let freshest_secondary = cluster
        .servers()
        .iter()
        .filter(|server| server.server_type() == ServerType::ReplicaSetSecondary)
        .filter(|server| server.last_write_date().is_some())
        .max_by_key(|server| server.last_write_date());

    Ok(servers
        .into_iter()
        .filter(|server| {
            if server.server_type() != ServerType::ReplicaSetSecondary {
                return true;
            }
            match estimated_staleness(server, primary, freshest_secondary) {
                Some(staleness) => staleness <= max_staleness,
                None => false,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{ClusterId, ServerId};
    use chrono::Duration as ChronoDuration;

    fn server(address: &str, server_type: ServerType, update: DateTime<Utc>, write_ago_ms: i64)
              -> ServerDescription {
        ServerDescription::new(ServerId::new(ClusterId::next(), address.parse().unwrap()))
            .with_server_type(server_type)
            .with_heartbeat_interval(Duration::from_secs(10))
            .with_last_update_time(update)
            .with_last_write_date(update - ChronoDuration::milliseconds(write_ago_ms))
    }

    #[test]
    fn staleness_relative_to_the_primary() {
        let now = Utc::now();
        let primary = server("a:27017", ServerType::ReplicaSetPrimary, now, 1_000);
        let secondary = server("b:27017", ServerType::ReplicaSetSecondary, now, 61_000);

        let staleness = estimated_staleness(&secondary, Some(&primary), None).unwrap();
        assert_eq!(staleness, Duration::from_secs(70));
    }

    #[test]
    fn staleness_without_a_primary_uses_the_freshest_secondary() {
        let now = Utc::now();
        let freshest = server("a:27017", ServerType::ReplicaSetSecondary, now, 0);
        let lagging = server("b:27017", ServerType::ReplicaSetSecondary, now, 100_000);

        assert_eq!(estimated_staleness(&freshest, None, Some(&freshest)), Some(Duration::from_secs(10)));
        assert_eq!(estimated_staleness(&lagging, None, Some(&freshest)), Some(Duration::from_secs(110)));
    }

    #[test]
    fn max_staleness_must_cover_two_heartbeats() {
        let now = Utc::now();
        let secondary = server("b:27017", ServerType::ReplicaSetSecondary, now, 0);
        let default = Duration::from_secs(10);

        assert!(validate_max_staleness(Duration::from_secs(15), &[&secondary], default).is_err());
        assert!(validate_max_staleness(Duration::from_secs(20), &[&secondary], default).is_ok());
        assert!(validate_max_staleness(Duration::from_secs(15), &[], default).is_err());
    }
}
