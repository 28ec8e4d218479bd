//! Graceful exit end to end: the observer materializes the transfer queue
//! from a real metabase pass, then the worker drains it and finalizes the
//! node's exit status.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use galaxy_core::clock::ManualClock;
use galaxy_core::{Clock, NodeId, PieceId, PlacementConstraint, RedundancyScheme};
use galaxy_metabase::{Metabase, Piece, Segment, SegmentPosition, SqliteAdapter};
use galaxy_overlay::{
    Config as OverlayConfig, ExitStatusRequest, NodeCheckIn, OverlayDb,
    Service as OverlayService,
};
use galaxy_satellite::gracefulexit::queue::{TransferItem, TransferQueue};
use galaxy_satellite::gracefulexit::{
    ExitConfig, ExitWorker, GracefulExitObserver, PieceTransfer, TransferError,
};
use galaxy_satellite::rangedloop::provider::MetabaseSegmentProvider;
use galaxy_satellite::rangedloop::{Config as LoopConfig, RangedLoopService};
use uuid::Uuid;

struct RecordingTransfer {
    transferred: std::sync::Mutex<Vec<TransferItem>>,
}

#[async_trait]
impl PieceTransfer for RecordingTransfer {
    async fn transfer(&self, item: &TransferItem) -> Result<(), TransferError> {
        self.transferred.lock().unwrap().push(item.clone());
        Ok(())
    }
}

async fn overlay_with_nodes(clock: Arc<dyn Clock>, count: u8) -> Arc<OverlayService> {
    let db = Arc::new(OverlayDb::open_in_memory().await.unwrap());
    let service = Arc::new(OverlayService::new(db, OverlayConfig::default(), clock));
    for i in 1..=count {
        service
            .check_in(NodeCheckIn {
                node_id: NodeId([i; 32]),
                address: format!("node{i}.example:7777"),
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

fn segment_on(nodes: &[u8], index: u32) -> Segment {
    Segment {
        stream_id: Uuid::new_v4(),
        position: SegmentPosition { part: 0, index },
        created_at: Utc::now(),
        repaired_at: None,
        expires_at: None,
        root_piece_id: PieceId([7u8; 32]),
        encrypted_key_nonce: vec![1; 24],
        encrypted_key: vec![2; 32],
        encrypted_size: 1024,
        plain_size: 1000,
        plain_offset: 0,
        encrypted_etag: vec![],
        redundancy: RedundancyScheme::new(2, 3, 4, 4),
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

#[tokio::test]
async fn test_exit_pipeline_observer_then_worker() {
    let manual = ManualClock::new(Utc::now());
    let clock: Arc<dyn Clock> = Arc::new(manual.clone());
    let overlay = overlay_with_nodes(clock.clone(), 4).await;

    let adapter = SqliteAdapter::open_in_memory().await.unwrap();
    let metabase = Arc::new(Metabase::new(vec![Arc::new(adapter)]));
    for (i, nodes) in [
        [1u8, 2, 3, 4],
        [1, 2, 3, 4],
        [2, 3, 4, 1],
    ]
    .iter()
    .enumerate()
    {
        metabase
            .commit_segment(segment_on(nodes, i as u32))
            .await
            .unwrap();
    }

    // node 1 is old enough to exit and signals intent
    manual.advance(Duration::days(400));
    let exiting = NodeId([1u8; 32]);
    overlay
        .update_exit_status(ExitStatusRequest {
            node_id: exiting,
            exit_initiated_at: Some(manual.now()),
            exit_finished_at: None,
            exit_success: false,
        })
        .await
        .unwrap();

    // the next loop pass builds the transfer queue
    let queue = Arc::new(TransferQueue::open_in_memory().await.unwrap());
    let observer = GracefulExitObserver::new(overlay.clone(), queue.clone());
    let mut service = RangedLoopService::new(
        Arc::new(MetabaseSegmentProvider::new(metabase)),
        vec![Box::new(observer)],
        LoopConfig {
            parallelism: 2,
            batch_size: 2,
        },
    );
    service.run_once(manual.now()).await.unwrap();
    assert_eq!(queue.incomplete_count(exiting).await.unwrap(), 3);

    // the worker drains it and the exit succeeds
    let transfer = Arc::new(RecordingTransfer {
        transferred: std::sync::Mutex::new(Vec::new()),
    });
    let worker = ExitWorker::new(
        overlay.clone(),
        queue.clone(),
        transfer.clone(),
        ExitConfig::default(),
        clock,
    );
    let success = worker.run(exiting).await.unwrap();
    assert!(success);
    assert_eq!(transfer.transferred.lock().unwrap().len(), 3);
    assert_eq!(queue.incomplete_count(exiting).await.unwrap(), 0);

    let dossier = overlay.get(&exiting).await.unwrap();
    assert!(dossier.exit_success);
    assert!(dossier.exit_finished_at.is_some());

    // a finished exit shields the node from disqualification
    let dossier = overlay
        .update_reputation(
            exiting,
            None,
            galaxy_overlay::ReputationStatus {
                disqualified: Some(manual.now()),
                ..Default::default()
            },
            vec![galaxy_overlay::NodeEventKind::Disqualified],
        )
        .await
        .unwrap();
    assert!(dossier.disqualified.is_none());
}
