//! Full-protocol round trips: a real storage node endpoint served over
//! gRPC on a loopback socket, driven by the uplink client.

use std::sync::Arc;

use chrono::Utc;
use ed25519_dalek::SigningKey;
use galaxy_core::id::{IdVersion, NodeIdentity};
use galaxy_core::{Action, NodeId, OrderLimit, PieceHashAlgorithm, PieceId, SerialNumber};
use galaxy_proto::piecestore::piecestore_server::PiecestoreServer;
use galaxy_storagenode::{
    BloomFilterManager, Config, Endpoint, HashStoreBackend, PiecestoreService,
    RestoreTimeManager, SpaceMonitor, TrustedSatellites,
};
use galaxy_uplink::{Error, PiecestoreClient};
use rand::rngs::OsRng;
use rand::RngCore;
use tempfile::TempDir;

struct TestNode {
    client: PiecestoreClient,
    satellite_key: SigningKey,
    satellite_id: NodeId,
    node_id: NodeId,
    node_key: ed25519_dalek::VerifyingKey,
    uplink_key: SigningKey,
    _dir: TempDir,
}

async fn start_node() -> TestNode {
    let dir = TempDir::new().unwrap();
    let identity = Arc::new(NodeIdentity::generate(IdVersion::V0));
    let node_id = identity.id;
    let node_key = identity.public_key();

    let satellite_key = SigningKey::generate(&mut OsRng);
    let satellite_id = NodeId::from_public_key(&satellite_key.verifying_key());
    let mut trust = TrustedSatellites::default();
    trust.insert(satellite_id, satellite_key.verifying_key());

    let backend = Arc::new(HashStoreBackend::new(
        dir.path().join("pieces"),
        Arc::new(BloomFilterManager::default()),
        Arc::new(RestoreTimeManager::default()),
    ));
    let monitor = SpaceMonitor::new(1 << 30, backend.clone());
    let endpoint = Arc::new(Endpoint::new(
        identity,
        backend,
        Arc::new(trust),
        monitor,
        Config::default(),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(PiecestoreServer::new(PiecestoreService::new(endpoint)))
            .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener)),
    );

    let client = PiecestoreClient::connect(format!("http://{addr}"))
        .await
        .unwrap();

    TestNode {
        client,
        satellite_key,
        satellite_id,
        node_id,
        node_key,
        uplink_key: SigningKey::generate(&mut OsRng),
        _dir: dir,
    }
}

impl TestNode {
    fn limit(&self, piece: PieceId, action: Action, bytes: u64) -> OrderLimit {
        let mut limit = OrderLimit {
            satellite_id: self.satellite_id,
            uplink_public_key: self.uplink_key.verifying_key().to_bytes(),
            storage_node_id: self.node_id,
            piece_id: piece,
            action,
            serial_number: SerialNumber::random(),
            order_creation: Utc::now(),
            order_expiration: Utc::now() + chrono::Duration::hours(1),
            piece_expiration: None,
            limit: bytes,
            satellite_signature: Vec::new(),
        };
        limit.sign(&self.satellite_key);
        limit
    }
}

#[tokio::test]
async fn test_upload_download_roundtrip_over_grpc() {
    let mut node = start_node().await;
    let piece = PieceId([1u8; 32]);
    let mut data = vec![0u8; 100 * 1024];
    rand::thread_rng().fill_bytes(&mut data);

    let put = node.limit(piece, Action::Put, data.len() as u64 + 1024);
    let uplink_key = node.uplink_key.clone();
    let node_hash = node
        .client
        .upload(
            &put,
            &uplink_key,
            &node.node_key,
            PieceHashAlgorithm::Sha256,
            &data,
        )
        .await
        .unwrap();
    assert_eq!(node_hash.piece_size, data.len() as u64);

    let get = node.limit(piece, Action::Get, u64::MAX);
    let downloaded = node.client.download(&get, 0, 0).await.unwrap();
    assert_eq!(downloaded.data, data);
    assert!(!downloaded.trash);
    assert!(downloaded.hash.is_none(), "plain GET carries no provenance");
}

#[tokio::test]
async fn test_ranged_download() {
    let mut node = start_node().await;
    let piece = PieceId([2u8; 32]);
    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

    let put = node.limit(piece, Action::Put, data.len() as u64 + 1024);
    let uplink_key = node.uplink_key.clone();
    node.client
        .upload(
            &put,
            &uplink_key,
            &node.node_key,
            PieceHashAlgorithm::Sha256,
            &data,
        )
        .await
        .unwrap();

    let get = node.limit(piece, Action::Get, u64::MAX);
    let downloaded = node.client.download(&get, 1_000, 50_000).await.unwrap();
    assert_eq!(downloaded.data, &data[1_000..51_000]);
}

#[tokio::test]
async fn test_repair_download_verifies_provenance() {
    let mut node = start_node().await;
    let piece = PieceId([3u8; 32]);
    let data = b"repairable piece data".to_vec();

    let put = node.limit(piece, Action::Put, 1 << 20);
    let uplink_key = node.uplink_key.clone();
    node.client
        .upload(
            &put,
            &uplink_key,
            &node.node_key,
            PieceHashAlgorithm::Sha256,
            &data,
        )
        .await
        .unwrap();

    let repair = node.limit(piece, Action::GetRepair, u64::MAX);
    let downloaded = node.client.download(&repair, 0, 0).await.unwrap();
    assert_eq!(downloaded.data, data);
    assert!(downloaded.hash.is_some());
    assert!(downloaded.limit.is_some());
    PiecestoreClient::verify_provenance(&downloaded).unwrap();
}

#[tokio::test]
async fn test_delete_then_download_not_found() {
    let mut node = start_node().await;
    let piece = PieceId([4u8; 32]);

    let put = node.limit(piece, Action::Put, 1 << 20);
    let uplink_key = node.uplink_key.clone();
    node.client
        .upload(
            &put,
            &uplink_key,
            &node.node_key,
            PieceHashAlgorithm::Sha256,
            b"short lived",
        )
        .await
        .unwrap();

    let del = node.limit(piece, Action::Delete, 0);
    node.client.delete(&del).await.unwrap();
    // the deleter is asynchronous
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let get = node.limit(piece, Action::Get, u64::MAX);
    match node.client.download(&get, 0, 0).await {
        Err(Error::Rpc(status)) => assert_eq!(status.code(), tonic::Code::NotFound),
        other => panic!("expected NotFound, got {other:?}"),
    }

    // deleting again is still success
    let del = node.limit(piece, Action::Delete, 0);
    node.client.delete(&del).await.unwrap();
}

#[tokio::test]
async fn test_upload_with_undersized_limit_fails() {
    let mut node = start_node().await;
    let piece = PieceId([5u8; 32]);
    let data = vec![7u8; 100 * 1024];

    let put = node.limit(piece, Action::Put, 10 * 1024);
    let uplink_key = node.uplink_key.clone();
    let err = node
        .client
        .upload(
            &put,
            &uplink_key,
            &node.node_key,
            PieceHashAlgorithm::Sha256,
            &data,
        )
        .await
        .unwrap_err();
    match err {
        Error::Rpc(status) => assert_eq!(status.code(), tonic::Code::FailedPrecondition),
        other => panic!("expected rpc status, got {other:?}"),
    }
}
