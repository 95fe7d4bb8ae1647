//! The connection boundary used by server monitoring.
//!
//! Pooling itself lives outside this crate. Monitors only need to open a dedicated
//! connection to a server and to discard every pooled connection to a server once it is
//! known to be down or to have changed role.
use async_trait::async_trait;
use bson::Document;

use crate::connstring::Host;
use crate::error::Result;
use crate::topology::ServerId;

/// A single established connection to a server.
#[async_trait]
pub trait Connection: Send {
    /// Runs a command against the given database and returns the server's reply.
    ///
    /// Replies with `ok: 0` are returned as documents; only transport-level failures are
    /// errors.
    async fn run_command(&mut self, db: &str, command: Document) -> Result<Document>;
}

/// Opens connections to servers and owns their pools.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Opens a new connection to `address`.
    async fn create_connection(&self, address: &Host) -> Result<Box<dyn Connection>>;

    /// Discards every pooled connection to the server.
    fn invalidate(&self, server_id: &ServerId);
}
