//! Fan-out exchange: one publish, every bound queue
//!
//! ## Atomicity
//!
//! `publish` stages the batch in a transaction on each bound target. If any
//! begin or stage fails, every transaction begun so far is rolled back and
//! no target receives the batch. Only once all targets staged successfully
//! are the transactions committed, detached from the publisher's
//! cancellation so a deadline cannot split the batch. Blocking targets are
//! awaited after every target has committed; a cancelled wait leaves the
//! batch on all of them.

use crate::queue::Queue;
use memport_core::{Context, Error, OnePhaseCommitProtocol, Publisher, Purger, QueueOptions, Result};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Blocks until a committed batch was handled by its target
pub type DeliveryWait<'a> = Box<dyn FnOnce(&Context) -> Result<()> + 'a>;

/// Anything an exchange can fan out to
pub trait ExchangeTarget<V>: Publisher<V> + Purger + OnePhaseCommitProtocol {
    /// Commit a staged transaction regardless of the publisher's cancellation
    ///
    /// The returned wait blocks until the batch is handled; targets that never
    /// block return one that succeeds at once.
    fn commit_staged(&self, tx: &Context) -> Result<DeliveryWait<'_>> {
        self.commit_tx(&tx.detached())?;
        Ok(Box::new(|_: &Context| Ok(())))
    }
}

impl<V: Send + Sync + 'static> ExchangeTarget<V> for Queue<V> {
    fn commit_staged(&self, tx: &Context) -> Result<DeliveryWait<'_>> {
        let published: HashSet<u64> = self.commit_detached(tx)?;
        Ok(Box::new(move |ctx: &Context| self.await_consumed(ctx, &published)))
    }
}

/// Broadcasts every published batch to all bound targets
pub struct FanOutExchange<V> {
    targets: RwLock<Vec<Arc<dyn ExchangeTarget<V>>>>,
    options: QueueOptions,
}

impl<V: Clone + Send + Sync + 'static> FanOutExchange<V> {
    /// Exchange whose queues use default options
    pub fn new() -> Self {
        Self::with_options(QueueOptions::default())
    }

    /// Exchange whose queues from [`make_queue`](Self::make_queue) use `options`
    pub fn with_options(options: QueueOptions) -> Self {
        Self {
            targets: RwLock::new(Vec::new()),
            options,
        }
    }

    /// Create a queue and bind it
    pub fn make_queue(&self) -> Queue<V> {
        let queue = Queue::with_options(self.options.clone());
        self.bind(Arc::new(queue.clone()));
        queue
    }

    /// Bind an existing target
    pub fn bind(&self, target: Arc<dyn ExchangeTarget<V>>) {
        let mut targets = self.targets.write();
        targets.push(target);
        debug!(targets = targets.len(), "target bound to exchange");
    }

    /// Number of bound targets
    pub fn len(&self) -> usize {
        self.targets.read().len()
    }

    /// Whether nothing is bound
    pub fn is_empty(&self) -> bool {
        self.targets.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn ExchangeTarget<V>>> {
        self.targets.read().clone()
    }
}

impl<V: Clone + Send + Sync + 'static> Default for FanOutExchange<V> {
    fn default() -> Self {
        Self::new()
    }
}

fn stage<V>(target: &dyn ExchangeTarget<V>, ctx: &Context, values: Vec<V>) -> Result<Context> {
    let tx = target.begin_tx(ctx)?;
    if let Err(err) = target.publish(&tx, values) {
        return Err(match target.rollback_tx(&tx) {
            Ok(()) => err,
            Err(rollback) => err.join(rollback),
        });
    }
    Ok(tx)
}

impl<V: Clone + Send + Sync + 'static> Publisher<V> for FanOutExchange<V> {
    fn publish(&self, ctx: &Context, values: Vec<V>) -> Result<()> {
        ctx.check()?;
        let targets = self.snapshot();
        let mut staged: Vec<(&Arc<dyn ExchangeTarget<V>>, Context)> = Vec::with_capacity(targets.len());

        for target in &targets {
            match stage(target.as_ref(), ctx, values.clone()) {
                Ok(tx) => staged.push((target, tx)),
                Err(err) => {
                    warn!(error = %err, staged = staged.len(), "fan-out publish aborted");
                    return Err(staged
                        .iter()
                        .filter_map(|(target, tx)| target.rollback_tx(tx).err())
                        .fold(err, Error::join));
                }
            }
        }

        let mut waits = Vec::with_capacity(staged.len());
        let mut failures = Vec::new();
        for (target, tx) in &staged {
            match target.commit_staged(tx) {
                Ok(wait) => waits.push(wait),
                Err(err) => failures.push(err),
            }
        }
        debug!(targets = targets.len(), failed = failures.len(), "fan-out publish committed");
        memport_core::merge_results(failures)?;

        for wait in waits {
            wait(ctx)?;
        }
        Ok(())
    }
}

impl<V: Clone + Send + Sync + 'static> Purger for FanOutExchange<V> {
    fn purge(&self, ctx: &Context) -> Result<()> {
        let failures: Vec<Error> = self
            .snapshot()
            .iter()
            .filter_map(|target| target.purge(ctx).err())
            .collect();
        memport_core::merge_results(failures)
    }
}

impl<V> fmt::Debug for FanOutExchange<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanOutExchange")
            .field("targets", &self.targets.read().len())
            .field("options", &self.options)
            .finish()
    }
}
