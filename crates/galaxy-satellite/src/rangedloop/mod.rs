//! The ranged loop.
//!
//! A parallel scan over the whole segment catalog feeding a set of
//! observers. The uuid space of stream ids is split into disjoint ranges;
//! one worker per range pages through its segments and hands each batch to
//! a per-worker fork of every observer. When the workers are done, forks are
//! merged back into their parent observers one at a time, and `finish` runs
//! exactly once.
//!
//! The observer contract:
//!
//! ```text
//! start(start_time)
//!   fork() -> Partial        one per worker
//!     Partial::process(batch)   repeatedly, single-owner
//!   join(Partial)            under mutual exclusion on the parent
//! finish()
//! ```
//!
//! Observers may not retain references to segments past `process`. The
//! first worker error cancels the sibling workers and fails the iteration;
//! an empty catalog still runs `start` through `finish`.

pub mod provider;

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use galaxy_metabase::Segment;
use tokio::task::JoinSet;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use self::provider::SegmentProvider;

/// Per-worker state owned by exactly one worker between fork and join.
#[async_trait]
pub trait Partial: Send {
    async fn process(&mut self, segments: &[Segment]) -> Result<()>;

    /// Downcast support for `Observer::join`.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

#[async_trait]
pub trait Observer: Send {
    async fn start(&mut self, start_time: DateTime<Utc>) -> Result<()>;
    async fn fork(&mut self) -> Result<Box<dyn Partial>>;
    async fn join(&mut self, partial: Box<dyn Partial>) -> Result<()>;
    async fn finish(&mut self) -> Result<()>;
}

/// Half-open range of the stream id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UuidRange {
    /// Inclusive start; None means the beginning of the space.
    pub start: Option<Uuid>,
    /// Exclusive end; None means the end of the space.
    pub end: Option<Uuid>,
}

/// Split the uuid space into `count` roughly equal disjoint ranges.
pub fn split_uuid_space(count: usize) -> Vec<UuidRange> {
    let count = count.max(1);
    let step = u128::MAX / count as u128;
    (0..count)
        .map(|i| UuidRange {
            start: if i == 0 {
                None
            } else {
                Some(Uuid::from_u128(step * i as u128))
            },
            end: if i == count - 1 {
                None
            } else {
                Some(Uuid::from_u128(step * (i + 1) as u128))
            },
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct Config {
    pub parallelism: usize,
    pub batch_size: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            parallelism: 4,
            batch_size: 2500,
        }
    }
}

pub struct RangedLoopService {
    provider: Arc<dyn SegmentProvider>,
    observers: Vec<Box<dyn Observer>>,
    config: Config,
}

impl RangedLoopService {
    pub fn new(
        provider: Arc<dyn SegmentProvider>,
        observers: Vec<Box<dyn Observer>>,
        config: Config,
    ) -> Self {
        Self {
            provider,
            observers,
            config,
        }
    }

    /// Access an observer after a run, for wiring and tests.
    pub fn observer(&self, index: usize) -> &dyn Observer {
        self.observers[index].as_ref()
    }

    /// Run one full iteration over the catalog.
    pub async fn run_once(&mut self, start_time: DateTime<Utc>) -> Result<()> {
        info!(
            observers = self.observers.len(),
            parallelism = self.config.parallelism,
            "ranged loop iteration starting"
        );

        for observer in &mut self.observers {
            observer.start(start_time).await?;
        }

        let ranges = split_uuid_space(self.config.parallelism);
        let mut workers: JoinSet<Result<(usize, Vec<Box<dyn Partial>>)>> = JoinSet::new();

        for (worker_index, range) in ranges.into_iter().enumerate() {
            let mut partials = Vec::with_capacity(self.observers.len());
            for observer in &mut self.observers {
                partials.push(observer.fork().await?);
            }
            let provider = self.provider.clone();
            let batch_size = self.config.batch_size;
            workers.spawn(async move {
                run_range(provider, range, batch_size, &mut partials).await?;
                Ok((worker_index, partials))
            });
        }

        // first error wins and cancels the siblings
        let mut finished: Vec<(usize, Vec<Box<dyn Partial>>)> = Vec::new();
        let mut failure: Option<Error> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(result)) => finished.push(result),
                Ok(Err(err)) => {
                    error!(error = %err, "ranged loop worker failed");
                    failure = Some(err);
                    workers.abort_all();
                }
                Err(join_err) => {
                    if !join_err.is_cancelled() {
                        failure = Some(Error::WorkerPanicked);
                    }
                    workers.abort_all();
                }
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }

        // deterministic join order regardless of worker completion order
        finished.sort_by_key(|(index, _)| *index);
        for (_, partials) in finished {
            for (observer, partial) in self.observers.iter_mut().zip(partials) {
                observer.join(partial).await?;
            }
        }

        for observer in &mut self.observers {
            observer.finish().await?;
        }

        info!("ranged loop iteration finished");
        Ok(())
    }
}

async fn run_range(
    provider: Arc<dyn SegmentProvider>,
    range: UuidRange,
    batch_size: i64,
    partials: &mut [Box<dyn Partial>],
) -> Result<()> {
    let mut cursor = None;
    loop {
        let batch = provider.next_batch(&range, cursor, batch_size).await?;
        if batch.is_empty() {
            return Ok(());
        }
        let last = batch.last().expect("non-empty");
        cursor = Some((last.stream_id, last.position.encode()));

        debug!(segments = batch.len(), "processing batch");
        for partial in partials.iter_mut() {
            partial.process(&batch).await?;
        }

        if (batch.len() as i64) < batch_size {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::provider::MetabaseSegmentProvider;
    use galaxy_core::{PieceId, PlacementConstraint, RedundancyScheme};
    use galaxy_metabase::{Metabase, Piece, SegmentPosition, SqliteAdapter};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_split_uuid_space_disjoint_and_ordered() {
        for count in [1usize, 2, 3, 8] {
            let ranges = split_uuid_space(count);
            assert_eq!(ranges.len(), count);
            assert!(ranges[0].start.is_none());
            assert!(ranges[count - 1].end.is_none());
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
            }
        }
    }

    /// Counts process calls and segments; records lifecycle ordering.
    struct CountingObserver {
        seen: Arc<AtomicUsize>,
        forks: Arc<AtomicUsize>,
        joins: Arc<AtomicUsize>,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    struct CountingPartial {
        seen: usize,
        parent: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Partial for CountingPartial {
        async fn process(&mut self, segments: &[Segment]) -> Result<()> {
            self.seen += segments.len();
            Ok(())
        }

        fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
            self
        }
    }

    #[async_trait]
    impl Observer for CountingObserver {
        async fn start(&mut self, _start_time: DateTime<Utc>) -> Result<()> {
            self.log.lock().unwrap().push("start");
            Ok(())
        }

        async fn fork(&mut self) -> Result<Box<dyn Partial>> {
            self.forks.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingPartial {
                seen: 0,
                parent: self.seen.clone(),
            }))
        }

        async fn join(&mut self, partial: Box<dyn Partial>) -> Result<()> {
            self.joins.fetch_add(1, Ordering::SeqCst);
            let partial = partial
                .into_any()
                .downcast::<CountingPartial>()
                .expect("counting partial");
            partial.parent.fetch_add(partial.seen, Ordering::SeqCst);
            Ok(())
        }

        async fn finish(&mut self) -> Result<()> {
            self.log.lock().unwrap().push("finish");
            Ok(())
        }
    }

    async fn metabase_with_segments(count: u32) -> Arc<Metabase> {
        let adapter = SqliteAdapter::open_in_memory().await.unwrap();
        let mb = Arc::new(Metabase::new(vec![Arc::new(adapter)]));
        let nodes: Vec<galaxy_core::NodeId> =
            (1..=4u8).map(|i| galaxy_core::NodeId([i; 32])).collect();
        for i in 0..count {
            let segment = galaxy_metabase::Segment {
                stream_id: Uuid::new_v4(),
                position: SegmentPosition { part: 0, index: i },
                created_at: Utc::now(),
                repaired_at: None,
                expires_at: None,
                root_piece_id: PieceId([1u8; 32]),
                encrypted_key_nonce: vec![1; 24],
                encrypted_key: vec![2; 32],
                encrypted_size: 256,
                plain_size: 200,
                plain_offset: 0,
                encrypted_etag: vec![],
                redundancy: RedundancyScheme::new(2, 3, 4, 6),
                inline_data: None,
                pieces: nodes
                    .iter()
                    .enumerate()
                    .map(|(n, id)| Piece {
                        number: n as u16,
                        storage_node: *id,
                    })
                    .collect(),
                placement: PlacementConstraint::EveryCountry,
            };
            mb.commit_segment(segment).await.unwrap();
        }
        mb
    }

    #[tokio::test]
    async fn test_loop_processes_every_segment_once() {
        let mb = metabase_with_segments(57).await;
        let seen = Arc::new(AtomicUsize::new(0));
        let forks = Arc::new(AtomicUsize::new(0));
        let joins = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));

        let observer = CountingObserver {
            seen: seen.clone(),
            forks: forks.clone(),
            joins: joins.clone(),
            log: log.clone(),
        };
        let mut service = RangedLoopService::new(
            Arc::new(MetabaseSegmentProvider::new(mb)),
            vec![Box::new(observer)],
            Config {
                parallelism: 4,
                batch_size: 10,
            },
        );

        service.run_once(Utc::now()).await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 57);
        assert_eq!(forks.load(Ordering::SeqCst), 4);
        assert_eq!(joins.load(Ordering::SeqCst), 4);
        assert_eq!(*log.lock().unwrap(), vec!["start", "finish"]);
    }

    #[tokio::test]
    async fn test_loop_with_empty_catalog_still_runs_lifecycle() {
        let mb = metabase_with_segments(0).await;
        let seen = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));

        let observer = CountingObserver {
            seen: seen.clone(),
            forks: Arc::new(AtomicUsize::new(0)),
            joins: Arc::new(AtomicUsize::new(0)),
            log: log.clone(),
        };
        let mut service = RangedLoopService::new(
            Arc::new(MetabaseSegmentProvider::new(mb)),
            vec![Box::new(observer)],
            Config::default(),
        );

        service.run_once(Utc::now()).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(*log.lock().unwrap(), vec!["start", "finish"]);
    }

    /// An observer whose partials fail on the first batch.
    struct FailingObserver;
    struct FailingPartial;

    #[async_trait]
    impl Partial for FailingPartial {
        async fn process(&mut self, _segments: &[Segment]) -> Result<()> {
            Err(Error::Observer("deliberate failure".to_string()))
        }

        fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
            self
        }
    }

    #[async_trait]
    impl Observer for FailingObserver {
        async fn start(&mut self, _start_time: DateTime<Utc>) -> Result<()> {
            Ok(())
        }

        async fn fork(&mut self) -> Result<Box<dyn Partial>> {
            Ok(Box::new(FailingPartial))
        }

        async fn join(&mut self, _partial: Box<dyn Partial>) -> Result<()> {
            Ok(())
        }

        async fn finish(&mut self) -> Result<()> {
            panic!("finish must not run after a worker failure");
        }
    }

    #[tokio::test]
    async fn test_first_error_aborts_iteration() {
        let mb = metabase_with_segments(20).await;
        let mut service = RangedLoopService::new(
            Arc::new(MetabaseSegmentProvider::new(mb)),
            vec![Box::new(FailingObserver)],
            Config {
                parallelism: 2,
                batch_size: 5,
            },
        );

        let err = service.run_once(Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::Observer(_)));
    }
}
