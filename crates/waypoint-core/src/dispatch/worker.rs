//! Fixed pool of worker threads
//!
//! Work travels to the workers over one bounded channel and completions come
//! back over another. Both are sized to the total token budget: every
//! assignment holds a token, so neither channel can fill up.

use super::work::{Completion, StageContext, WorkAssignment};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::hash::{Cleaner, SegmentedHashTable, SpillStore};
use crossbeam_channel::{Receiver, Sender, bounded};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Resources every worker shares
pub(crate) struct SharedResources {
    pub(crate) table: Arc<SegmentedHashTable>,
    pub(crate) cleaner: Arc<Cleaner>,
    pub(crate) spill: Arc<SpillStore>,
    pub(crate) config: Arc<EngineConfig>,
}

pub(crate) struct WorkerPool {
    sender: Option<Sender<WorkAssignment>>,
    completions: Receiver<Completion>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(threads: usize, capacity: usize, shared: Arc<SharedResources>) -> Result<Self> {
        if threads == 0 {
            return Err(Error::config("worker pool needs at least one thread"));
        }
        let (sender, receiver) = bounded::<WorkAssignment>(capacity.max(1));
        let (done_tx, completions) = bounded::<Completion>(capacity.max(1));

        let mut handles = Vec::with_capacity(threads);
        for worker_id in 0..threads {
            let receiver = receiver.clone();
            let done_tx = done_tx.clone();
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("waypoint-worker-{worker_id}"))
                .spawn(move || Self::worker_thread(worker_id, receiver, done_tx, &shared))?;
            handles.push(handle);
        }
        tracing::debug!(threads, capacity, "worker pool started");

        Ok(Self {
            sender: Some(sender),
            completions,
            handles,
        })
    }

    fn worker_thread(
        worker_id: usize,
        receiver: Receiver<WorkAssignment>,
        done_tx: Sender<Completion>,
        shared: &SharedResources,
    ) {
        for assignment in receiver.iter() {
            let WorkAssignment {
                waypoint,
                runner,
                token,
                query_exits,
                payload,
            } = assignment;
            let stage = payload.tag();
            let started = Instant::now();
            let ctx = StageContext {
                worker_id,
                table: &shared.table,
                cleaner: &shared.cleaner,
                spill: &shared.spill,
                config: &shared.config,
                token: &token,
            };
            let result = catch_unwind(AssertUnwindSafe(|| runner.run(payload, &ctx)))
                .unwrap_or_else(|_| {
                    Err(Error::internal(format!(
                        "{stage:?} stage of {waypoint} panicked on worker {worker_id}"
                    )))
                });
            let completion = Completion {
                waypoint,
                worker_id,
                elapsed: started.elapsed(),
                token,
                query_exits,
                stage,
                result,
            };
            if done_tx.send(completion).is_err() {
                break;
            }
        }
        tracing::trace!(worker_id, "worker exiting");
    }

    pub(crate) fn submit(&self, assignment: WorkAssignment) -> Result<()> {
        self.sender
            .as_ref()
            .ok_or_else(|| Error::dispatch("worker pool is shut down"))?
            .send(assignment)
            .map_err(|_| Error::dispatch("worker channel closed"))
    }

    pub(crate) fn recv(&self) -> Result<Completion> {
        self.completions
            .recv()
            .map_err(|_| Error::dispatch("every worker exited"))
    }

    /// Stop accepting work and join the threads
    pub(crate) fn shutdown(&mut self) -> Result<()> {
        self.sender.take();
        let mut panicked = 0;
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(Error::internal(format!("{panicked} worker threads panicked")));
        }
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "worker pool shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Chunk, Column, QueryIdSet, WaypointId};
    use crate::dispatch::work::{ExecEngineData, NextStage, StageRunner, StageTag, WorkDescription};
    use crate::hash::SegmentGeometry;
    use crate::tokens::{TokenKind, TokenPool};

    struct Echo;

    impl StageRunner for Echo {
        fn run(&self, work: WorkDescription, ctx: &StageContext<'_>) -> Result<(ExecEngineData, NextStage)> {
            match work {
                WorkDescription::JoinLhsChunk { chunk } => {
                    if chunk.is_empty() {
                        panic!("empty chunk on worker {}", ctx.worker_id);
                    }
                    Ok((ExecEngineData::Chunk(chunk), NextStage::Process))
                }
                _ => Err(Error::dispatch("echo only probes")),
            }
        }
    }

    fn pool() -> (WorkerPool, TokenPool) {
        let config = EngineConfig::default();
        let tokens = TokenPool::new(&config.tokens).unwrap();
        let shared = Arc::new(SharedResources {
            table: Arc::new(SegmentedHashTable::new(SegmentGeometry::new(2, 4).unwrap())),
            cleaner: Arc::new(Cleaner::new(0.5, tokens.clone(), 1)),
            spill: Arc::new(SpillStore::new()),
            config: Arc::new(config),
        });
        (WorkerPool::new(2, 8, shared).unwrap(), tokens)
    }

    fn assignment(tokens: &TokenPool, chunk: Chunk) -> WorkAssignment {
        WorkAssignment {
            waypoint: WaypointId(3),
            runner: Arc::new(Echo),
            token: tokens.acquire(TokenKind::Cpu, 0).unwrap(),
            query_exits: Vec::new(),
            payload: WorkDescription::JoinLhsChunk { chunk },
        }
    }

    #[test]
    fn test_completion_carries_token_back() {
        let (mut pool, tokens) = pool();
        let chunk = Chunk::uniform(vec![(0, Column::from(vec![1i64, 2]))], QueryIdSet::first_n(1)).unwrap();
        pool.submit(assignment(&tokens, chunk)).unwrap();
        let done = pool.recv().unwrap();
        assert_eq!(done.waypoint, WaypointId(3));
        assert_eq!(done.stage, StageTag::JoinProbe);
        assert_eq!(tokens.stats(TokenKind::Cpu).outstanding, 1);
        drop(done);
        assert_eq!(tokens.stats(TokenKind::Cpu).outstanding, 0);
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_panicking_stage_becomes_error() {
        let (pool, tokens) = pool();
        pool.submit(assignment(&tokens, Chunk::default())).unwrap();
        let done = pool.recv().unwrap();
        assert!(matches!(done.result, Err(Error::Internal(_))));
    }
}
