//! Cluster topology monitoring and server selection for MongoDB deployments.
//!
//! A [`Cluster`](topology::Cluster) keeps a live model of a standalone server, replica set,
//! sharded cluster or load balanced deployment. One monitor task per server runs periodic
//! `hello` handshakes through a caller supplied [`ConnectionFactory`](pool::ConnectionFactory),
//! and every result is folded into an immutable [`ClusterDescription`](topology::ClusterDescription)
//! snapshot.
//!
//! Operations pick a server with a [`ServerSelector`](selection::ServerSelector):
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use mongodb_cluster::pool::ConnectionFactory;
//! use mongodb_cluster::common::{ReadMode, ReadPreference};
//! use mongodb_cluster::selection::ServerSelector;
//! use mongodb_cluster::settings::ClusterSettings;
//! use mongodb_cluster::topology::Cluster;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(factory: Arc<dyn ConnectionFactory>) -> mongodb_cluster::Result<()> {
//! let settings = ClusterSettings::parse("mongodb://a:27017,b:27017/?replicaSet=rs")?;
//! let cluster = Cluster::new(settings, factory)?;
//! cluster.initialize()?;
//!
//! let selector = ServerSelector::from(ReadPreference::with_mode(ReadMode::Nearest));
//! let selected = cluster
//!     .select_server_async(&selector, None, &CancellationToken::new())
//!     .await?;
//! println!("reading from {}", selected.address());
//! # Ok(())
//! # }
//! ```
pub mod apm;
pub mod common;
pub mod connstring;
pub mod error;
pub mod pool;
pub mod selection;
pub mod settings;
pub mod topology;

pub use crate::error::{Error, Result};
pub use crate::selection::ServerSelector;
pub use crate::settings::ClusterSettings;
pub use crate::topology::{Cluster, ClusterDescription, SelectedServer, ServerDescription};
