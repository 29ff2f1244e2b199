//! Client sessions and scoped transactions

use crate::error::MigrateResult;
use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

/// A driver session.
///
/// Reads and writes that pass a session while it has an open transaction
/// participate in that transaction.
#[async_trait]
pub trait ClientSession: Send + Sync {
    fn id(&self) -> Uuid;

    /// Whether a transaction is currently open on this session
    fn in_transaction(&self) -> bool;

    async fn start_transaction(&self) -> MigrateResult<()>;

    async fn commit_transaction(&self) -> MigrateResult<()>;

    async fn abort_transaction(&self) -> MigrateResult<()>;

    /// Discard any open transaction without waiting on the server.
    ///
    /// Called from drop paths, so it must not block or fail.
    fn abandon(&self);
}

/// A transaction held open on an owned session.
///
/// Finishing is explicit: [`Transaction::commit`], [`Transaction::abort`] or
/// [`Transaction::finish`]. A transaction dropped before it is finished is
/// abandoned, so an early return or panic never leaves writes committed.
pub struct Transaction {
    session: Box<dyn ClientSession>,
    finished: bool,
}

impl Transaction {
    /// Start a transaction on `session`
    pub async fn begin(session: Box<dyn ClientSession>) -> MigrateResult<Self> {
        session.start_transaction().await?;
        debug!(session = %session.id(), "Transaction started");
        Ok(Self {
            session,
            finished: false,
        })
    }

    /// Session to pass to reads and writes that belong to this transaction
    pub fn session(&self) -> &dyn ClientSession {
        self.session.as_ref()
    }

    pub async fn commit(mut self) -> MigrateResult<()> {
        self.finished = true;
        if let Err(e) = self.session.commit_transaction().await {
            self.session.abandon();
            return Err(e);
        }
        debug!(session = %self.session.id(), "Transaction committed");
        Ok(())
    }

    pub async fn abort(mut self) -> MigrateResult<()> {
        self.finished = true;
        self.session.abort_transaction().await?;
        debug!(session = %self.session.id(), "Transaction aborted");
        Ok(())
    }

    /// Commit when `result` is `Ok`, abort when it is `Err`.
    ///
    /// The body's error wins over an abort failure, which is only logged.
    pub async fn finish<T>(self, result: MigrateResult<T>) -> MigrateResult<T> {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = self.abort().await {
                    warn!("Abort after failure also failed: {}", abort_err);
                }
                Err(e)
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            warn!(session = %self.session.id(), "Transaction dropped before completion, abandoning");
            self.session.abandon();
        }
    }
}
