//! The seam between the reliable delivery pipeline and whatever actually
//! durably persists an event — in this crate, [`crate::storage::StorageWriter`].

use async_trait::async_trait;

use crate::audit::event::AuditEvent;
use crate::error::Result;

/// Processes one audit event to completion. `Err` triggers the retry/
/// dead-letter machinery in [`crate::jobs::executor::ReliableProcessor`];
/// implementations should not retry internally.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, event: &AuditEvent) -> Result<()>;
}
