//! The repair checker observer.
//!
//! Classifies every remote segment's pieces against a snapshot of the node
//! fleet, computes a health score, and queues injured segments for repair.
//! A segment is queued when `healthy <= repair_threshold` and
//! `healthy < success_threshold`, or when any piece forces repair (placement
//! violations do). After the iteration, queue entries that were not re-seen
//! are cleaned out as healed.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use galaxy_core::{Clock, NodeId};
use galaxy_metabase::Segment;
use galaxy_overlay::Service as OverlayService;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::rangedloop::{Observer, Partial};
use crate::repair::classify::{classify_pieces, segment_health, ClassifyOptions, NodeSummary};
use crate::repair::queue::{InjuredSegment, InsertBuffer, RepairQueue};

#[derive(Debug, Clone)]
pub struct CheckerConfig {
    pub node_failure_rate: f64,
    pub queue_insert_batch_size: usize,
    pub repair_excluded_countries: Vec<String>,
    pub do_declumping: bool,
    pub do_placement_check: bool,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            node_failure_rate: 0.00005435,
            queue_insert_batch_size: 100,
            repair_excluded_countries: Vec::new(),
            do_declumping: true,
            do_placement_check: true,
        }
    }
}

/// Counters merged across forks and reported at finish.
#[derive(Debug, Default, Clone)]
pub struct AggregateStats {
    pub objects_checked: u64,
    pub remote_segments_checked: u64,
    pub remote_segments_needing_repair: u64,
    pub new_remote_segments_needing_repair: u64,
    pub remote_segments_lost: u64,
    pub objects_lost: Vec<Uuid>,
    /// Segments sitting 1..=5 pieces above the repair threshold.
    pub over_threshold: [u64; 5],
}

impl AggregateStats {
    fn combine(&mut self, other: &AggregateStats) {
        self.objects_checked += other.objects_checked;
        self.remote_segments_checked += other.remote_segments_checked;
        self.remote_segments_needing_repair += other.remote_segments_needing_repair;
        self.new_remote_segments_needing_repair += other.new_remote_segments_needing_repair;
        self.remote_segments_lost += other.remote_segments_lost;
        for stream_id in &other.objects_lost {
            if !self.objects_lost.contains(stream_id) {
                self.objects_lost.push(*stream_id);
            }
        }
        for (mine, theirs) in self.over_threshold.iter_mut().zip(other.over_threshold) {
            *mine += theirs;
        }
    }
}

pub struct CheckerObserver {
    queue: Arc<RepairQueue>,
    overlay: Arc<OverlayService>,
    config: CheckerConfig,
    clock: Arc<dyn Clock>,

    start_time: DateTime<Utc>,
    nodes: Arc<HashMap<NodeId, NodeSummary>>,
    total: AggregateStats,
    per_scheme: HashMap<String, AggregateStats>,
}

impl CheckerObserver {
    pub fn new(
        queue: Arc<RepairQueue>,
        overlay: Arc<OverlayService>,
        config: CheckerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            overlay,
            config,
            clock,
            start_time: DateTime::<Utc>::MIN_UTC,
            nodes: Arc::new(HashMap::new()),
            total: AggregateStats::default(),
            per_scheme: HashMap::new(),
        }
    }

    pub fn total_stats(&self) -> &AggregateStats {
        &self.total
    }

    pub fn scheme_stats(&self, key: &str) -> Option<&AggregateStats> {
        self.per_scheme.get(key)
    }

    fn classify_options(&self) -> ClassifyOptions {
        ClassifyOptions {
            do_declumping: self.config.do_declumping,
            do_placement_check: self.config.do_placement_check,
            excluded_countries: self
                .config
                .repair_excluded_countries
                .iter()
                .map(|c| c.to_ascii_uppercase())
                .collect(),
        }
    }
}

#[async_trait]
impl Observer for CheckerObserver {
    async fn start(&mut self, start_time: DateTime<Utc>) -> Result<()> {
        self.start_time = start_time;
        self.total = AggregateStats::default();
        self.per_scheme.clear();

        // snapshot the fleet once per iteration; every fork shares it
        let mut nodes = HashMap::new();
        for dossier in self.overlay.all_nodes().await? {
            nodes.insert(
                dossier.node_id,
                NodeSummary {
                    online: dossier.is_online(),
                    disqualified: dossier.disqualified.is_some(),
                    exiting: dossier.is_exiting(),
                    last_net: dossier.last_net.clone(),
                    country_code: dossier.country_code.clone(),
                },
            );
        }
        if nodes.is_empty() {
            return Err(Error::Observer(
                "segment health is meaningless: there are no nodes".to_string(),
            ));
        }
        self.nodes = Arc::new(nodes);
        Ok(())
    }

    async fn fork(&mut self) -> Result<Box<dyn Partial>> {
        Ok(Box::new(CheckerFork {
            queue: self.queue.clone(),
            buffer: InsertBuffer::new(self.config.queue_insert_batch_size),
            nodes: self.nodes.clone(),
            options: self.classify_options(),
            node_failure_rate: self.config.node_failure_rate,
            clock: self.clock.clone(),
            last_stream_id: Uuid::nil(),
            total: AggregateStats::default(),
            per_scheme: HashMap::new(),
        }))
    }

    async fn join(&mut self, partial: Box<dyn Partial>) -> Result<()> {
        let mut fork = partial
            .into_any()
            .downcast::<CheckerFork>()
            .map_err(|_| Error::Observer("expected checker fork".to_string()))?;

        fork.buffer.flush(&self.queue, self.clock.now()).await?;
        fork.total.new_remote_segments_needing_repair = fork.buffer.newly_inserted();

        self.total.combine(&fork.total);
        for (scheme, stats) in &fork.per_scheme {
            self.per_scheme
                .entry(scheme.clone())
                .or_default()
                .combine(stats);
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let healed = self.queue.clean(self.start_time).await?;

        let checked = self.total.remote_segments_checked;
        let unhealthy = self.total.remote_segments_needing_repair;
        info!(
            objects_checked = self.total.objects_checked,
            remote_segments_checked = checked,
            remote_segments_needing_repair = unhealthy,
            new_remote_segments_needing_repair = self.total.new_remote_segments_needing_repair,
            remote_segments_lost = self.total.remote_segments_lost,
            objects_lost = self.total.objects_lost.len(),
            healthy_segments_removed_from_queue = healed,
            "repair checker iteration done"
        );
        Ok(())
    }
}

struct CheckerFork {
    queue: Arc<RepairQueue>,
    buffer: InsertBuffer,
    nodes: Arc<HashMap<NodeId, NodeSummary>>,
    options: ClassifyOptions,
    node_failure_rate: f64,
    clock: Arc<dyn Clock>,
    last_stream_id: Uuid,
    total: AggregateStats,
    per_scheme: HashMap<String, AggregateStats>,
}

impl CheckerFork {
    async fn process_segment(&mut self, segment: &Segment) -> Result<()> {
        if segment.is_inline() {
            if self.last_stream_id != segment.stream_id {
                self.last_stream_id = segment.stream_id;
                self.total.objects_checked += 1;
            }
            return Ok(());
        }

        let now = self.clock.now();
        if segment.expired(now) {
            return Ok(());
        }

        let scheme_key = segment.redundancy.key();
        if self.last_stream_id != segment.stream_id {
            self.last_stream_id = segment.stream_id;
            self.total.objects_checked += 1;
            self.per_scheme
                .entry(scheme_key.clone())
                .or_default()
                .objects_checked += 1;
        }
        self.total.remote_segments_checked += 1;
        self.per_scheme
            .entry(scheme_key.clone())
            .or_default()
            .remote_segments_checked += 1;

        if segment.pieces.is_empty() {
            return Ok(());
        }

        let check = classify_pieces(
            &segment.pieces,
            &self.nodes,
            segment.placement,
            &self.options,
        );

        let required = segment.redundancy.required as usize;
        let repair_threshold = segment.redundancy.repair as usize;
        let success_threshold = segment.redundancy.optimal as usize;
        let healthy = check.healthy.len();

        let health = segment_health(
            healthy,
            required,
            self.nodes.len(),
            self.node_failure_rate,
        );

        let needs_repair = (healthy <= repair_threshold && healthy < success_threshold)
            || !check.forcing_repair.is_empty();

        if needs_repair {
            self.total.remote_segments_needing_repair += 1;
            self.per_scheme
                .entry(scheme_key.clone())
                .or_default()
                .remote_segments_needing_repair += 1;

            self.buffer
                .insert(
                    &self.queue,
                    InjuredSegment {
                        stream_id: segment.stream_id,
                        position: segment.position.encode(),
                        placement: segment.placement.as_u16(),
                        segment_health: health,
                    },
                    now,
                )
                .await?;

            if check.retrievable.len() < required {
                self.total.remote_segments_lost += 1;
                if !self.total.objects_lost.contains(&segment.stream_id) {
                    self.total.objects_lost.push(segment.stream_id);
                }
                let missing_nodes: Vec<String> = segment
                    .pieces
                    .iter()
                    .filter(|p| check.missing.contains(&p.number))
                    .map(|p| p.storage_node.to_string())
                    .collect();
                warn!(
                    stream_id = %segment.stream_id,
                    position = segment.position.encode(),
                    total_pieces = segment.pieces.len(),
                    min_required = required,
                    unavailable_nodes = missing_nodes.join(","),
                    "checker found irreparable segment"
                );
            } else if !check.clumped.is_empty()
                && healthy + check.clumped.len() > repair_threshold
                && check.forcing_repair.is_empty()
            {
                // repair caused by clumping alone: report which subnets are
                // over-represented
                let mut net_counts: HashMap<&str, usize> = HashMap::new();
                for piece in &segment.pieces {
                    if let Some(node) = self.nodes.get(&piece.storage_node) {
                        if !node.last_net.is_empty() {
                            *net_counts.entry(node.last_net.as_str()).or_default() += 1;
                        }
                    }
                }
                let clumped_nets: Vec<String> = net_counts
                    .iter()
                    .filter(|(_, count)| **count > 1)
                    .map(|(net, count)| format!("[{net}]: {count}"))
                    .collect();
                info!(
                    stream_id = %segment.stream_id,
                    position = segment.position.encode(),
                    clumping = clumped_nets.join(", "),
                    "segment needs repair only because of clumping"
                );
            }
        } else if healthy > repair_threshold
            && healthy <= repair_threshold + self.total.over_threshold.len()
        {
            let bucket = healthy - repair_threshold - 1;
            self.total.over_threshold[bucket] += 1;
            self.per_scheme
                .entry(scheme_key)
                .or_default()
                .over_threshold[bucket] += 1;
        }

        Ok(())
    }
}

#[async_trait]
impl Partial for CheckerFork {
    async fn process(&mut self, segments: &[Segment]) -> Result<()> {
        for segment in segments {
            self.process_segment(segment).await?;
        }
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rangedloop::provider::StaticSegmentProvider;
    use crate::rangedloop::{Config as LoopConfig, RangedLoopService};
    use galaxy_core::{PieceId, PlacementConstraint, RedundancyScheme, SystemClock};
    use galaxy_metabase::{Piece, SegmentPosition};
    use galaxy_overlay::{
        Config as OverlayConfig, NodeCheckIn, OverlayDb, ReputationStatus,
    };

    async fn overlay_with_nodes(count: u8) -> Arc<OverlayService> {
        let db = Arc::new(OverlayDb::open_in_memory().await.unwrap());
        let service = Arc::new(OverlayService::new(
            db,
            OverlayConfig::default(),
            Arc::new(SystemClock),
        ));
        for i in 1..=count {
            service
                .check_in(NodeCheckIn {
                    node_id: NodeId([i; 32]),
                    address: "node.example:7777".into(),
                    last_ip_port: format!("10.0.{i}.1:7777"),
                    last_net: format!("10.0.{i}"),
                    country_code: "US".into(),
                    version: "1.0.0".into(),
                    free_disk: 1 << 30,
                    operator_email: None,
                    is_up: true,
                })
                .await
                .unwrap();
        }
        service
    }

    async fn disqualify(overlay: &OverlayService, ids: &[u8]) {
        for id in ids {
            overlay
                .update_reputation(
                    NodeId([*id; 32]),
                    None,
                    ReputationStatus {
                        disqualified: Some(Utc::now()),
                        ..Default::default()
                    },
                    vec![],
                )
                .await
                .unwrap();
        }
    }

    fn segment_on(nodes: &[u8], rs: RedundancyScheme) -> Segment {
        Segment {
            stream_id: Uuid::new_v4(),
            position: SegmentPosition { part: 0, index: 0 },
            created_at: Utc::now(),
            repaired_at: None,
            expires_at: None,
            root_piece_id: PieceId([1u8; 32]),
            encrypted_key_nonce: vec![1; 24],
            encrypted_key: vec![2; 32],
            encrypted_size: 4096,
            plain_size: 4000,
            plain_offset: 0,
            encrypted_etag: vec![],
            redundancy: rs,
            inline_data: None,
            pieces: nodes
                .iter()
                .enumerate()
                .map(|(i, id)| Piece {
                    number: i as u16,
                    storage_node: NodeId([*id; 32]),
                })
                .collect(),
            placement: PlacementConstraint::EveryCountry,
        }
    }

    async fn run_checker(
        overlay: Arc<OverlayService>,
        queue: Arc<RepairQueue>,
        segments: Vec<Segment>,
    ) {
        let checker = CheckerObserver::new(
            queue,
            overlay,
            CheckerConfig::default(),
            Arc::new(SystemClock),
        );
        let mut service = RangedLoopService::new(
            Arc::new(StaticSegmentProvider::new(segments)),
            vec![Box::new(checker)],
            LoopConfig {
                parallelism: 2,
                batch_size: 100,
            },
        );
        service.run_once(Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn test_injured_segment_gets_queued() {
        // redundancy 2/3/4/6 on six nodes; four disqualified leaves two
        // healthy, which is at the repair threshold and below success
        let overlay = overlay_with_nodes(6).await;
        disqualify(&overlay, &[3, 4, 5, 6]).await;
        let queue = Arc::new(RepairQueue::open_in_memory().await.unwrap());

        let segment = segment_on(&[1, 2, 3, 4, 5, 6], RedundancyScheme::new(2, 3, 4, 6));
        let stream_id = segment.stream_id;
        run_checker(overlay, queue.clone(), vec![segment]).await;

        let queued = queue.select_n(10).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].stream_id, stream_id);
        let expected = segment_health(2, 2, 6, CheckerConfig::default().node_failure_rate);
        assert!((queued[0].segment_health - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_healthy_segment_not_queued() {
        let overlay = overlay_with_nodes(6).await;
        let queue = Arc::new(RepairQueue::open_in_memory().await.unwrap());

        let segment = segment_on(&[1, 2, 3, 4, 5, 6], RedundancyScheme::new(2, 3, 4, 6));
        run_checker(overlay, queue.clone(), vec![segment]).await;

        assert_eq!(queue.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_finish_cleans_healed_entries() {
        let overlay = overlay_with_nodes(6).await;
        let queue = Arc::new(RepairQueue::open_in_memory().await.unwrap());

        // an old entry from a previous iteration for a now-healthy segment
        let stale = InjuredSegment {
            stream_id: Uuid::from_bytes([9u8; 16]),
            position: 0,
            placement: 0,
            segment_health: 0.1,
        };
        queue
            .insert(&stale, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();

        let segment = segment_on(&[1, 2, 3, 4, 5, 6], RedundancyScheme::new(2, 3, 4, 6));
        run_checker(overlay, queue.clone(), vec![segment]).await;

        assert_eq!(queue.count().await.unwrap(), 0, "healed entry swept");
    }

    #[tokio::test]
    async fn test_placement_violation_forces_queue_insert() {
        let overlay = overlay_with_nodes(6).await;
        let queue = Arc::new(RepairQueue::open_in_memory().await.unwrap());

        // plenty of healthy pieces, but the segment demands Germany and the
        // nodes sit in the US
        let mut segment = segment_on(&[1, 2, 3, 4, 5, 6], RedundancyScheme::new(2, 3, 4, 6));
        segment.placement = PlacementConstraint::De;
        run_checker(overlay, queue.clone(), vec![segment]).await;

        assert_eq!(queue.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_inline_segments_are_skipped() {
        let overlay = overlay_with_nodes(2).await;
        let queue = Arc::new(RepairQueue::open_in_memory().await.unwrap());

        let mut segment = segment_on(&[], RedundancyScheme::new(2, 3, 4, 6));
        segment.inline_data = Some(vec![1, 2, 3]);
        run_checker(overlay, queue.clone(), vec![segment]).await;

        assert_eq!(queue.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_irreparable_segment_counted() {
        // only one retrievable piece with required = 2
        let overlay = overlay_with_nodes(6).await;
        disqualify(&overlay, &[2, 3, 4, 5, 6]).await;
        let queue = Arc::new(RepairQueue::open_in_memory().await.unwrap());

        let checker = CheckerObserver::new(
            queue.clone(),
            overlay.clone(),
            CheckerConfig::default(),
            Arc::new(SystemClock),
        );
        let segment = segment_on(&[1, 2, 3, 4, 5, 6], RedundancyScheme::new(2, 3, 4, 6));
        let mut service = RangedLoopService::new(
            Arc::new(StaticSegmentProvider::new(vec![segment])),
            vec![Box::new(checker)],
            LoopConfig {
                parallelism: 1,
                batch_size: 100,
            },
        );
        service.run_once(Utc::now()).await.unwrap();

        assert_eq!(queue.count().await.unwrap(), 1, "still queued for repair");
    }

    #[tokio::test]
    async fn test_no_nodes_fails_iteration() {
        let db = Arc::new(OverlayDb::open_in_memory().await.unwrap());
        let overlay = Arc::new(OverlayService::new(
            db,
            OverlayConfig::default(),
            Arc::new(SystemClock),
        ));
        let queue = Arc::new(RepairQueue::open_in_memory().await.unwrap());

        let checker = CheckerObserver::new(
            queue,
            overlay,
            CheckerConfig::default(),
            Arc::new(SystemClock),
        );
        let segment = segment_on(&[1, 2], RedundancyScheme::new(2, 3, 4, 6));
        let mut service = RangedLoopService::new(
            Arc::new(StaticSegmentProvider::new(vec![segment])),
            vec![Box::new(checker)],
            LoopConfig::default(),
        );
        assert!(service.run_once(Utc::now()).await.is_err());
    }
}
