//! Cluster discovery, monitoring and server selection.
//!
//! A `Cluster` owns one `ClusterableServer` per known member. Each server runs a monitor task
//! that publishes a new `ServerDescription` after every heartbeat; the cluster folds it into a
//! new immutable `ClusterDescription`, swaps the snapshot, and wakes every pending selection.
mod description;
mod monitor;
mod server;

pub use self::description::{ClusterDescription, ClusterType, ConnectionMode};
pub use self::monitor::HelloResult;
pub use self::server::{
    ClusterId, ClusterableServer, ServerConnectionState, ServerDescription, ServerId, ServerType,
    MAX_SUPPORTED_WIRE_VERSION, MIN_SUPPORTED_WIRE_VERSION,
};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::apm::{
    ClusterDescriptionChangedEvent, Listener, SdamEvent, ServerClosedEvent, ServerOpeningEvent,
};
use crate::connstring::Host;
use crate::error::Error::{self, Cancelled, ClusterDisposed, OperationError, ServerSelectionError};
use crate::error::Result;
use crate::pool::ConnectionFactory;
use crate::selection::ServerSelector;
use crate::settings::ClusterSettings;

use self::monitor::MonitorSettings;

/// The cluster variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClusterKind {
    /// One fixed server reached directly. Membership never changes.
    Single,
    /// A replica set, sharded cluster or standalone found through discovery.
    MultiServer,
    /// A load balancer in front of the deployment. Nothing is monitored.
    LoadBalanced,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ClusterState {
    Uninitialized,
    Initialized,
    Disposed,
}

/// A server chosen by server selection, with the description it was chosen by.
#[derive(Clone, Debug)]
pub struct SelectedServer {
    server: Arc<ClusterableServer>,
    description: ServerDescription,
}

impl SelectedServer {
    pub fn server(&self) -> &Arc<ClusterableServer> {
        &self.server
    }

    pub fn description(&self) -> &ServerDescription {
        &self.description
    }

    pub fn address(&self) -> &Host {
        self.description.address()
    }
}

#[derive(Default)]
struct MembershipChanges {
    opened: Vec<Arc<ClusterableServer>>,
    closed: Vec<Arc<ClusterableServer>>,
}

/// Forwards server descriptions from a server back to its cluster.
pub(crate) struct ClusterUpdater(Weak<ClusterInner>);

impl ClusterUpdater {
    pub(crate) fn update(&self, server_description: ServerDescription) {
        if let Some(inner) = self.0.upgrade() {
            inner.apply_server_description(server_description);
        }
    }
}

struct ClusterInner {
    id: ClusterId,
    kind: ClusterKind,
    settings: ClusterSettings,
    factory: Arc<dyn ConnectionFactory>,
    listener: Arc<Listener>,
    runtime: Handle,
    // Held for every description rebuild.
    state: Mutex<ClusterState>,
    servers: RwLock<HashMap<Host, Arc<ClusterableServer>>>,
    description: watch::Sender<Arc<ClusterDescription>>,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ClusterInner {
    fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            heartbeat_frequency: self.settings.heartbeat_frequency,
            min_heartbeat_frequency: self.settings.min_heartbeat_frequency,
            connect_timeout: self.settings.connect_timeout,
        }
    }

    fn current(&self) -> Arc<ClusterDescription> {
        self.description.borrow().clone()
    }

    fn create_server(self: &Arc<Self>, address: Host) -> Arc<ClusterableServer> {
        info!(cluster_id = %self.id, address = %address, "adding server");
        ClusterableServer::new(
            ServerId::new(self.id, address),
            self.factory.clone(),
            self.listener.clone(),
            ClusterUpdater(Arc::downgrade(self)),
            self.shutdown.child_token(),
        )
    }

    fn close_server(&self, server: &ClusterableServer) {
        server.dispose();
        info!(cluster_id = %self.id, address = %server.address(), "removing server");
    }

    // Runs the opening and closing hooks. Called with the server map unlocked so hooks can
    // look servers up.
    fn announce(&self, changes: &MembershipChanges) {
        for server in &changes.opened {
            self.listener.publish(|| {
                SdamEvent::ServerOpening(ServerOpeningEvent {
                    cluster_id: self.id,
                    address: server.address().clone(),
                })
            });
        }
        for server in &changes.closed {
            self.listener.publish(|| {
                SdamEvent::ServerClosed(ServerClosedEvent {
                    cluster_id: self.id,
                    address: server.address().clone(),
                })
            });
        }
    }

    fn apply_server_description(self: &Arc<Self>, server_description: ServerDescription) {
        let state = lock(&self.state);
        if *state != ClusterState::Initialized {
            return;
        }

        let previous = self.current();
        if let Some(old) = previous.server(server_description.address()) {
            if old.server_type() != server_description.server_type() {
                info!(
                    cluster_id = %self.id,
                    address = %server_description.address(),
                    from = %old.server_type(),
                    to = %server_description.server_type(),
                    "server type changed"
                );
            }
        }

        let next = previous.with_server_description(server_description);
        self.publish_description(&state, previous, next);
    }

    // Swaps in a new snapshot and starts or stops servers to match its membership.
    // `_state` is only there to prove the caller holds the update lock.
    fn publish_description(self: &Arc<Self>, _state: &MutexGuard<ClusterState>,
                           previous: Arc<ClusterDescription>, next: ClusterDescription) {
        let next = Arc::new(next);
        let changes = self.sync_servers(&next);

        let equivalent = previous.is_equivalent_to(&next);
        self.description.send_replace(next.clone());
        self.announce(&changes);
        self.start_monitors(&changes);

        if !equivalent {
            debug!(cluster_id = %self.id, description = %next, "cluster description changed");
            self.listener.publish(|| {
                SdamEvent::ClusterDescriptionChanged(Box::new(ClusterDescriptionChangedEvent {
                    previous_description: previous.clone(),
                    new_description: next.clone(),
                }))
            });
        }
    }

    fn sync_servers(self: &Arc<Self>, description: &ClusterDescription) -> MembershipChanges {
        let mut changes = MembershipChanges::default();
        {
            let mut servers = match self.servers.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            for server_description in description.servers() {
                let address = server_description.address();
                if !servers.contains_key(address) {
                    let server = self.create_server(address.clone());
                    servers.insert(address.clone(), server.clone());
                    changes.opened.push(server);
                }
            }

            servers.retain(|address, server| {
                if description.server(address).is_some() {
                    return true;
                }
                self.close_server(server);
                changes.closed.push(server.clone());
                false
            });
        }
        changes
    }

    fn start_monitors(&self, changes: &MembershipChanges) {
        for server in &changes.opened {
            server.start_monitor(&self.runtime, self.monitor_settings());
        }
    }

    fn get_server(&self, address: &Host) -> Option<Arc<ClusterableServer>> {
        let servers = match self.servers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        servers.get(address).cloned()
    }
}

impl Drop for ClusterInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A monitored deployment that can select servers for operations.
///
/// Cloning a cluster is cheap and every clone shares the same servers and monitors. The
/// monitors stop when the cluster is disposed or when the last clone is dropped.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    /// Creates a cluster on the tokio runtime of the calling context.
    pub fn new(settings: ClusterSettings, factory: Arc<dyn ConnectionFactory>) -> Result<Cluster> {
        let runtime = Handle::try_current().map_err(|_| {
            OperationError("A cluster must be created from within a tokio runtime.".to_owned())
        })?;
        Cluster::with_runtime(settings, factory, runtime)
    }

    /// Creates a cluster whose monitors run on the given runtime.
    pub fn with_runtime(settings: ClusterSettings, factory: Arc<dyn ConnectionFactory>, runtime: Handle)
                        -> Result<Cluster> {
        settings.validate()?;

        let id = ClusterId::next();
        let kind = settings.cluster_kind();
        let connection_mode = match kind {
            ClusterKind::Single => ConnectionMode::Direct,
            _ => settings.connection_mode,
        };
        let initial = ClusterDescription::from_seeds(
            id,
            connection_mode,
            &settings.hosts,
            settings.repl_set_name.clone(),
            settings.heartbeat_frequency,
        );
        let (description, _) = watch::channel(Arc::new(initial));

        Ok(Cluster {
            inner: Arc::new(ClusterInner {
                id,
                kind,
                settings,
                factory,
                listener: Arc::new(Listener::new()),
                runtime,
                state: Mutex::new(ClusterState::Uninitialized),
                servers: RwLock::new(HashMap::new()),
                description,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn id(&self) -> ClusterId {
        self.inner.id
    }

    pub fn kind(&self) -> ClusterKind {
        self.inner.kind
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.inner.settings
    }

    /// A selector for reads that follows the configured read preference.
    pub fn default_read_selector(&self) -> ServerSelector {
        ServerSelector::from(self.inner.settings.read_preference.clone())
    }

    /// The hooks notified of topology events. Register hooks before `initialize` to see the
    /// first events.
    pub fn listener(&self) -> &Listener {
        &self.inner.listener
    }

    /// Starts monitoring the seeds. Calling it again has no effect.
    pub fn initialize(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock()?;
        match *state {
            ClusterState::Initialized => return Ok(()),
            ClusterState::Disposed => return Err(ClusterDisposed),
            ClusterState::Uninitialized => {}
        }
        *state = ClusterState::Initialized;
        info!(cluster_id = %inner.id, kind = ?inner.kind, "initializing cluster");

        if inner.kind == ClusterKind::LoadBalanced {
            let address = inner.settings.hosts.first().cloned().ok_or_else(|| {
                Error::ArgumentError("A load balanced cluster requires a host.".to_owned())
            })?;
            let server = inner.create_server(address.clone());
            let description = ServerDescription::new(server.id().clone())
                .with_server_type(ServerType::LoadBalanced);
            server.replace_description(description.clone());
            inner.servers.write()?.insert(address, server.clone());
            inner.announce(&MembershipChanges { opened: vec![server], closed: Vec::new() });

            let previous = inner.current();
            let next = ClusterDescription::new(
                inner.id,
                previous.connection_mode(),
                ClusterType::LoadBalanced,
                vec![description],
            );
            inner.publish_description(&state, previous, next);
        } else {
            let current = inner.current();
            let changes = inner.sync_servers(&current);
            inner.announce(&changes);
            inner.start_monitors(&changes);
        }

        Ok(())
    }

    /// The current snapshot of the cluster.
    pub fn description(&self) -> Arc<ClusterDescription> {
        self.inner.current()
    }

    /// Subscribes to every new snapshot of the cluster.
    pub fn watch(&self) -> watch::Receiver<Arc<ClusterDescription>> {
        self.inner.description.subscribe()
    }

    pub fn get_server(&self, address: &Host) -> Option<Arc<ClusterableServer>> {
        self.inner.get_server(address)
    }

    /// Asks every monitor for an immediate check.
    pub fn request_heartbeat(&self) {
        let servers = match self.inner.servers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for server in servers.values() {
            server.request_heartbeat();
        }
    }

    /// Reacts to an error an operation saw on `address`.
    ///
    /// Network errors clear the server's pool and mark it unknown. "Not primary" and
    /// "node is recovering" errors mark it unknown and trigger an immediate check.
    pub fn handle_application_error(&self, address: &Host, error: &Error) {
        let server = match self.get_server(address) {
            Some(server) => server,
            None => return,
        };

        if error.is_state_change_error() {
            debug!(address = %address, %error, "server reported a state change");
            server.publish(server.description().with_error(error));
            server.request_heartbeat();
        } else if error.is_network_error() {
            debug!(address = %address, %error, "network error on application connection");
            server.invalidate();
            server.publish(server.description().with_error(error));
        }
    }

    /// Stops every monitor and fails pending selections with `ClusterDisposed`.
    pub fn dispose(&self) {
        let inner = &self.inner;
        let mut state = lock(&inner.state);
        if *state == ClusterState::Disposed {
            return;
        }
        *state = ClusterState::Disposed;
        inner.shutdown.cancel();

        let servers: Vec<Arc<ClusterableServer>> = match inner.servers.write() {
            Ok(mut guard) => guard.drain().map(|(_, server)| server).collect(),
            Err(poisoned) => poisoned.into_inner().drain().map(|(_, server)| server).collect(),
        };
        for server in &servers {
            inner.close_server(server);
        }
        inner.announce(&MembershipChanges { opened: Vec::new(), closed: servers });
        info!(cluster_id = %inner.id, "cluster disposed");
    }

    /// Selects a server, blocking the calling thread until one matches, the timeout
    /// elapses, or `cancel` fires.
    ///
    /// Must not be called from within an async context; use `select_server_async` there.
    pub fn select_server(&self, selector: &ServerSelector, timeout: Option<Duration>,
                         cancel: &CancellationToken) -> Result<SelectedServer> {
        if Handle::try_current().is_ok() {
            return Err(OperationError(
                "select_server cannot block inside an async context; use select_server_async.".to_owned(),
            ));
        }
        self.inner.runtime.block_on(self.select_server_async(selector, timeout, cancel))
    }

    /// Selects a server, waiting for topology changes until one matches, the timeout
    /// elapses, or `cancel` fires. `None` uses the configured server selection timeout.
    pub async fn select_server_async(&self, selector: &ServerSelector, timeout: Option<Duration>,
                                     cancel: &CancellationToken) -> Result<SelectedServer> {
        let state = *self.inner.state.lock()?;
        match state {
            ClusterState::Uninitialized => {
                return Err(OperationError("The cluster has not been initialized.".to_owned()))
            }
            ClusterState::Disposed => return Err(ClusterDisposed),
            ClusterState::Initialized => {}
        }

        let timeout = timeout.unwrap_or(self.inner.settings.server_selection_timeout);
        let deadline = Instant::now() + timeout;
        let selector = ServerSelector::Composite(vec![
            selector.clone(),
            ServerSelector::LatencyLimiting(self.inner.settings.local_threshold),
        ]);
        let mut receiver = self.inner.description.subscribe();

        loop {
            let description = receiver.borrow_and_update().clone();
            if self.inner.shutdown.is_cancelled() {
                return Err(ClusterDisposed);
            }

            if let Some(error) = description.compatibility_error() {
                return Err(ServerSelectionError(error.to_owned()));
            }

            if let Some(selected) = self.try_select(&selector, &description)? {
                trace!(address = %selected.address(), selector = %selector, "selected server");
                return Ok(selected);
            }

            trace!(selector = %selector, "no suitable server, waiting for a topology change");
            self.request_heartbeat();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled),
                _ = self.inner.shutdown.cancelled() => return Err(ClusterDisposed),
                _ = time::sleep_until(deadline) => {
                    let latest = self.inner.current();
                    warn!(cluster_id = %self.inner.id, selector = %selector, "server selection timed out");
                    return Err(Error::ServerSelectionTimeout {
                        message: format!(
                            "A timeout occurred after {}ms selecting a server using {}",
                            timeout.as_millis(),
                            selector
                        ),
                        cluster: latest.to_string(),
                    });
                }
                changed = receiver.changed() => {
                    if changed.is_err() {
                        return Err(ClusterDisposed);
                    }
                }
            }
        }
    }

    fn try_select(&self, selector: &ServerSelector, description: &ClusterDescription)
                  -> Result<Option<SelectedServer>> {
        let available: Vec<&ServerDescription> = description
            .servers()
            .iter()
            .filter(|server| server.is_available())
            .collect();

        let candidates = selector.select_servers(description, available)?;
        let chosen = match candidates.choose(&mut rand::thread_rng()) {
            Some(chosen) => *chosen,
            None => return Ok(None),
        };

        Ok(self.get_server(chosen.address()).map(|server| SelectedServer {
            server,
            description: chosen.clone(),
        }))
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Cluster")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .finish()
    }
}
