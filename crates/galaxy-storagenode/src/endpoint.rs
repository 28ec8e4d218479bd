//! The piecestore endpoint.
//!
//! Streaming upload and download of pieces between uplinks, the satellite,
//! and this node, with order-limit enforcement on every chunk.
//!
//! The gRPC service impl is a thin shell: the actual protocol logic lives in
//! `handle_*` functions generic over a request stream, so tests drive them
//! directly without sockets.
//!
//! ## Authorization
//!
//! Uplink-facing operations carry a satellite-signed order limit inside the
//! request. Satellite-only operations (DeletePieces, Exists, RestoreTrash)
//! authenticate the caller through the `galaxy-satellite-id` request
//! metadata, standing in for the transport's peer identity, checked against
//! the node's trusted satellite set.
//!
//! ## Concurrency
//!
//! A fixed cap bounds live requests. Excess requests fail immediately with
//! `Unavailable` rather than queueing, so uplinks can fail over to another
//! node without waiting.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use ed25519_dalek::VerifyingKey;
use futures::Stream;
use futures::StreamExt;
use galaxy_core::id::NodeIdentity;
use galaxy_core::{NodeId, OrderLimit, PieceHash, PieceHashAlgorithm, PieceId};
use galaxy_proto::piecestore as pb;
use galaxy_proto::piecestore::piecestore_server::Piecestore;
use tokio::sync::{mpsc, Semaphore};
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::backend::{HashStoreBackend, PieceWriter};
use galaxy_proto::convert;
use crate::error::{Error, Result};
use crate::monitor::SpaceMonitor;

const DOWNLOAD_CHUNK_SIZE: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// Live request cap; excess requests get `Unavailable`.
    pub max_concurrent_requests: usize,
    /// Minimum acceptable upload rate in bytes per second. Zero disables.
    pub min_upload_speed: u64,
    /// How long an upload may run before the speed watchdog applies.
    pub speed_grace: std::time::Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 512,
            min_upload_speed: 0,
            speed_grace: std::time::Duration::from_secs(10),
        }
    }
}

/// Satellites this node stores data for, with their signing keys.
#[derive(Default)]
pub struct TrustedSatellites {
    keys: std::collections::HashMap<NodeId, VerifyingKey>,
}

impl TrustedSatellites {
    pub fn insert(&mut self, id: NodeId, key: VerifyingKey) {
        self.keys.insert(id, key);
    }

    pub fn key(&self, id: &NodeId) -> Result<&VerifyingKey> {
        self.keys
            .get(id)
            .ok_or_else(|| Error::UntrustedSatellite(id.to_string()))
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.keys.contains_key(id)
    }
}

/// Background piece deleter: deletes are acknowledged once enqueued.
pub struct Deleter {
    tx: mpsc::UnboundedSender<(NodeId, PieceId)>,
}

impl Deleter {
    pub fn spawn(backend: Arc<HashStoreBackend>) -> Deleter {
        let (tx, mut rx) = mpsc::unbounded_channel::<(NodeId, PieceId)>();
        tokio::spawn(async move {
            while let Some((satellite, piece)) = rx.recv().await {
                if let Err(err) = backend.delete(satellite, piece) {
                    warn!(piece = %piece, error = %err, "background delete failed");
                }
            }
        });
        Deleter { tx }
    }

    pub fn enqueue(&self, satellite: NodeId, piece: PieceId) {
        let _ = self.tx.send((satellite, piece));
    }
}

pub struct Endpoint {
    identity: Arc<NodeIdentity>,
    backend: Arc<HashStoreBackend>,
    trust: Arc<TrustedSatellites>,
    monitor: SpaceMonitor,
    deleter: Deleter,
    live: Arc<Semaphore>,
    config: Config,
}

impl Endpoint {
    pub fn new(
        identity: Arc<NodeIdentity>,
        backend: Arc<HashStoreBackend>,
        trust: Arc<TrustedSatellites>,
        monitor: SpaceMonitor,
        config: Config,
    ) -> Endpoint {
        let deleter = Deleter::spawn(backend.clone());
        Endpoint {
            identity,
            backend,
            trust,
            monitor,
            deleter,
            live: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            config,
        }
    }

    fn acquire_slot(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        self.live
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::TooManyRequests)
    }

    /// Verify an order limit is addressed to us, signed by a satellite we
    /// trust, not expired, and authorizes one of `expected` actions.
    fn verify_limit(
        &self,
        limit: &OrderLimit,
        expect_put: bool,
        expect_get: bool,
        expect_delete: bool,
    ) -> Result<()> {
        let key = self.trust.key(&limit.satellite_id)?;
        limit
            .verify(key)
            .map_err(|_| Error::BadOrderLimitSignature)?;
        if limit.expired(Utc::now()) {
            return Err(Error::OrderLimitExpired);
        }
        if expect_put && !limit.action.is_put() {
            return Err(Error::ExpectedPut(limit.action));
        }
        if expect_get && !limit.action.is_get() {
            return Err(Error::ExpectedGet(limit.action));
        }
        if expect_delete && limit.action != galaxy_core::Action::Delete {
            return Err(Error::ExpectedDelete(limit.action));
        }
        Ok(())
    }

    fn satellite_from_metadata(&self, metadata: &MetadataMap) -> Result<NodeId> {
        let value = metadata
            .get("galaxy-satellite-id")
            .ok_or_else(|| Error::UntrustedSatellite("unidentified caller".to_string()))?;
        let hex = value
            .to_str()
            .map_err(|_| Error::InvalidMessage("bad satellite id metadata".to_string()))?;
        let bytes =
            hex::decode(hex).map_err(|_| Error::InvalidMessage("bad satellite id hex".to_string()))?;
        let id = NodeId::from_bytes(&bytes)
            .map_err(|_| Error::InvalidMessage("bad satellite id length".to_string()))?;
        if !self.trust.contains(&id) {
            return Err(Error::UntrustedSatellite(id.to_string()));
        }
        Ok(id)
    }

    fn sign_piece_hash(
        &self,
        piece_id: PieceId,
        hash: Vec<u8>,
        algorithm: PieceHashAlgorithm,
        size: u64,
    ) -> PieceHash {
        let mut piece_hash = PieceHash {
            piece_id,
            hash,
            hash_algorithm: algorithm,
            piece_size: size,
            timestamp: Utc::now(),
            signature: Vec::new(),
        };
        piece_hash.sign(&self.identity.signing_key);
        piece_hash
    }

    /// Upload protocol: verify the limit from the first message, stream
    /// chunks into the piece writer enforcing the byte limit, the order
    /// chain, and the minimum speed, then on the client's `done` verify the
    /// hash, commit with the footer header, and return our signed hash.
    pub async fn handle_upload<S>(
        &self,
        first: pb::PieceUploadRequest,
        mut rest: S,
    ) -> Result<pb::PieceUploadResponse>
    where
        S: Stream<Item = std::result::Result<pb::PieceUploadRequest, Status>> + Unpin,
    {
        let _slot = self.acquire_slot()?;

        let limit_proto = first.limit.ok_or(Error::MissingPieceId)?;
        let limit = convert::order_limit_from_proto(&limit_proto)?;
        self.verify_limit(&limit, true, false, false)?;

        let available = self.monitor.available();
        if available < limit.limit {
            return Err(Error::OutOfSpace {
                have: available,
                need: limit.limit,
            });
        }

        let algorithm = PieceHashAlgorithm::from_i32(first.hash_algorithm)
            .map_err(|_| Error::InvalidMessage("bad hash algorithm".to_string()))?;
        let mut writer = Some(self.backend.writer(
            limit.satellite_id,
            limit.piece_id,
            algorithm,
            limit.piece_expiration,
        )?);

        let result = self
            .upload_loop(&limit, writer.as_mut().expect("just set"), first.chunk, &mut rest)
            .await;

        let done = match result {
            Ok(done) => done,
            Err(err) => {
                if let Some(writer) = writer.take() {
                    writer.cancel();
                }
                return Err(err);
            }
        };

        let writer = writer.take().expect("not cancelled");
        let size = writer.size();
        let computed_hash = writer.hash();

        let client_hash = convert::piece_hash_from_proto(&done)?;
        if client_hash.hash != computed_hash || client_hash.piece_id != limit.piece_id {
            writer.cancel();
            return Err(Error::HashMismatch);
        }

        let header = pb::PieceHeader {
            hash_algorithm: algorithm as i32,
            hash: computed_hash.clone(),
            creation_time: convert::timestamp_to_micros(client_hash.timestamp),
            order_limit: Some(limit_proto),
            signature: client_hash.signature.clone(),
        };
        writer.commit(&header)?;

        info!(piece = %limit.piece_id, size, "piece uploaded");

        let signed = self.sign_piece_hash(limit.piece_id, computed_hash, algorithm, size);
        Ok(pb::PieceUploadResponse {
            done: Some(convert::piece_hash_to_proto(&signed)),
            node_id: self.identity.id.to_vec(),
        })
    }

    async fn upload_loop<S>(
        &self,
        limit: &OrderLimit,
        writer: &mut PieceWriter,
        first_chunk: Option<pb::piece_upload_request::Chunk>,
        rest: &mut S,
    ) -> Result<pb::PieceHash>
    where
        S: Stream<Item = std::result::Result<pb::PieceUploadRequest, Status>> + Unpin,
    {
        let started = Instant::now();
        let mut largest_order = 0u64;

        let mut write_chunk = |writer: &mut PieceWriter,
                               chunk: pb::piece_upload_request::Chunk|
         -> Result<()> {
            let used = writer.size() + chunk.data.len() as u64;
            if used > limit.limit {
                return Err(Error::OrderLimitExceeded {
                    used,
                    limit: limit.limit,
                });
            }
            writer.write(&chunk.data)
        };

        if let Some(chunk) = first_chunk {
            write_chunk(writer, chunk)?;
        }

        loop {
            let message = match rest.next().await {
                Some(message) => {
                    message.map_err(|status| Error::InvalidMessage(status.to_string()))?
                }
                None => return Err(Error::InvalidMessage("upload ended without done".to_string())),
            };

            if let Some(order) = &message.order {
                let order = convert::order_from_proto(order)?;
                if order.serial_number != limit.serial_number {
                    return Err(Error::BadOrderSignature);
                }
                if order.amount < largest_order || order.amount > limit.limit {
                    return Err(Error::OrderNotAscending);
                }
                order
                    .verify(&limit.uplink_public_key)
                    .map_err(|_| Error::BadOrderSignature)?;
                largest_order = order.amount;
            }

            if let Some(chunk) = message.chunk {
                write_chunk(writer, chunk)?;

                let elapsed = started.elapsed();
                if self.config.min_upload_speed > 0 && elapsed > self.config.speed_grace {
                    let rate = writer.size() / elapsed.as_secs().max(1);
                    if rate < self.config.min_upload_speed {
                        return Err(Error::SpeedTooLow {
                            rate,
                            minimum: self.config.min_upload_speed,
                        });
                    }
                }
            }

            if let Some(done) = message.done {
                return Ok(done);
            }
        }
    }

    /// Download protocol: verify a GET-class limit, locate the piece (the
    /// backend transparently tries a trash restore), and stream the
    /// requested range. Repair and audit downloads also get the original
    /// upload's hash and order limit out of the piece footer.
    pub fn handle_download(
        &self,
        request: pb::PieceDownloadRequest,
    ) -> Result<mpsc::Receiver<std::result::Result<pb::PieceDownloadResponse, Status>>> {
        let slot = self.acquire_slot()?;

        let limit_proto = request.limit.ok_or(Error::MissingPieceId)?;
        let limit = convert::order_limit_from_proto(&limit_proto)?;
        self.verify_limit(&limit, false, true, false)?;

        let reader = self
            .backend
            .reader(limit.satellite_id, limit.piece_id)?
            .ok_or(Error::NotFound)?;

        let size = reader.size();
        let (offset, length) = match request.chunk {
            Some(chunk) => (chunk.offset, chunk.chunk_size.min(size.saturating_sub(chunk.offset))),
            None => (0, size),
        };

        let provenance = if matches!(
            limit.action,
            galaxy_core::Action::GetRepair | galaxy_core::Action::GetAudit
        ) {
            let header = reader.header()?;
            Some((
                pb::PieceHash {
                    piece_id: limit.piece_id.to_vec(),
                    hash: header.hash.clone(),
                    hash_algorithm: header.hash_algorithm,
                    piece_size: size,
                    timestamp: header.creation_time,
                    signature: header.signature.clone(),
                },
                header.order_limit.unwrap_or_default(),
            ))
        } else {
            None
        };

        let trash = reader.trash();
        if trash {
            debug!(piece = %limit.piece_id, "serving piece restored from trash");
        }

        let (tx, rx) = mpsc::channel(4);
        tokio::task::spawn_blocking(move || {
            let _slot = slot;
            let mut sent_first = false;
            let mut position = offset;
            let end = offset + length;
            while position < end || !sent_first {
                let want = (end - position).min(DOWNLOAD_CHUNK_SIZE) as usize;
                let mut data = vec![0u8; want];
                let n = match reader.read_at(&mut data, position) {
                    Ok(n) => n,
                    Err(err) => {
                        let _ = tx.blocking_send(Err(Status::from(err)));
                        return;
                    }
                };
                data.truncate(n);

                let response = pb::PieceDownloadResponse {
                    chunk: Some(pb::piece_download_response::Chunk {
                        offset: position,
                        data: data.into(),
                    }),
                    hash: if sent_first {
                        None
                    } else {
                        provenance.as_ref().map(|(hash, _)| hash.clone())
                    },
                    limit: if sent_first {
                        None
                    } else {
                        provenance.as_ref().map(|(_, limit)| limit.clone())
                    },
                    trash,
                };
                sent_first = true;
                position += n as u64;
                if tx.blocking_send(Ok(response)).is_err() {
                    return;
                }
                if n == 0 {
                    return;
                }
            }
        });

        Ok(rx)
    }

    /// Single-piece delete authorized by a DELETE order limit. Not-found is
    /// success, and the actual removal happens in the background.
    pub fn handle_delete(&self, request: pb::PieceDeleteRequest) -> Result<()> {
        let _slot = self.acquire_slot()?;
        let limit_proto = request.limit.ok_or(Error::MissingPieceId)?;
        let limit = convert::order_limit_from_proto(&limit_proto)?;
        self.verify_limit(&limit, false, false, true)?;
        self.deleter.enqueue(limit.satellite_id, limit.piece_id);
        Ok(())
    }

    /// Satellite-only batch delete; unknown piece ids are ignored.
    pub fn handle_delete_pieces(
        &self,
        satellite: NodeId,
        request: pb::PieceDeletePiecesRequest,
    ) -> Result<()> {
        for bytes in &request.piece_ids {
            if let Ok(piece) = PieceId::from_bytes(bytes) {
                self.deleter.enqueue(satellite, piece);
            }
        }
        Ok(())
    }

    /// Satellite-only existence check: returns the indices, within this
    /// request, of pieces this node does not have.
    pub fn handle_exists(
        &self,
        satellite: NodeId,
        request: pb::ExistsRequest,
    ) -> Result<pb::ExistsResponse> {
        let mut missing = Vec::new();
        for (index, bytes) in request.piece_ids.iter().enumerate() {
            let piece = match PieceId::from_bytes(bytes) {
                Ok(piece) => piece,
                Err(_) => {
                    missing.push(index as u32);
                    continue;
                }
            };
            if !self.backend.exists(satellite, piece)? {
                missing.push(index as u32);
            }
        }
        Ok(pb::ExistsResponse { missing })
    }

    /// Satellite-only: open the namespace's lazy-restore window.
    pub fn handle_restore_trash(&self, satellite: NodeId) -> Result<()> {
        self.backend.start_restore(satellite)
    }
}

/// Thin gRPC shell over the endpoint logic.
pub struct PiecestoreService {
    endpoint: Arc<Endpoint>,
}

impl PiecestoreService {
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        Self { endpoint }
    }
}

#[tonic::async_trait]
impl Piecestore for PiecestoreService {
    async fn upload(
        &self,
        request: Request<Streaming<pb::PieceUploadRequest>>,
    ) -> std::result::Result<Response<pb::PieceUploadResponse>, Status> {
        let mut stream = request.into_inner();
        let first = stream
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("empty upload stream"))?;
        let response = self.endpoint.handle_upload(first, stream).await?;
        Ok(Response::new(response))
    }

    type DownloadStream =
        Pin<Box<dyn Stream<Item = std::result::Result<pb::PieceDownloadResponse, Status>> + Send>>;

    async fn download(
        &self,
        request: Request<pb::PieceDownloadRequest>,
    ) -> std::result::Result<Response<Self::DownloadStream>, Status> {
        let rx = self.endpoint.handle_download(request.into_inner())?;
        let stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn delete(
        &self,
        request: Request<pb::PieceDeleteRequest>,
    ) -> std::result::Result<Response<pb::PieceDeleteResponse>, Status> {
        self.endpoint.handle_delete(request.into_inner())?;
        Ok(Response::new(pb::PieceDeleteResponse {}))
    }

    async fn delete_pieces(
        &self,
        request: Request<pb::PieceDeletePiecesRequest>,
    ) -> std::result::Result<Response<pb::PieceDeletePiecesResponse>, Status> {
        let satellite = self.endpoint.satellite_from_metadata(request.metadata())?;
        self.endpoint
            .handle_delete_pieces(satellite, request.into_inner())?;
        Ok(Response::new(pb::PieceDeletePiecesResponse {}))
    }

    async fn exists(
        &self,
        request: Request<pb::ExistsRequest>,
    ) -> std::result::Result<Response<pb::ExistsResponse>, Status> {
        let satellite = self.endpoint.satellite_from_metadata(request.metadata())?;
        let response = self.endpoint.handle_exists(satellite, request.into_inner())?;
        Ok(Response::new(response))
    }

    async fn restore_trash(
        &self,
        request: Request<pb::RestoreTrashRequest>,
    ) -> std::result::Result<Response<pb::RestoreTrashResponse>, Status> {
        let satellite = self.endpoint.satellite_from_metadata(request.metadata())?;
        self.endpoint.handle_restore_trash(satellite)?;
        Ok(Response::new(pb::RestoreTrashResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retain::{BloomFilterManager, RestoreTimeManager};
    use ed25519_dalek::SigningKey;
    use futures::stream;
    use galaxy_core::id::IdVersion;
    use galaxy_core::{Action, Order, SerialNumber};
    use rand::rngs::OsRng;
    use rand::RngCore;
    use tempfile::TempDir;

    struct Harness {
        endpoint: Endpoint,
        satellite_key: SigningKey,
        satellite_id: NodeId,
        uplink_key: SigningKey,
        node_identity_key: VerifyingKey,
        node_id: NodeId,
        _dir: TempDir,
    }

    fn harness(config: Config) -> Harness {
        let dir = TempDir::new().unwrap();
        let identity = Arc::new(NodeIdentity::generate(IdVersion::V0));
        let node_identity_key = identity.public_key();
        let node_id = identity.id;

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

        Harness {
            endpoint: Endpoint::new(identity, backend, Arc::new(trust), monitor, config),
            satellite_key,
            satellite_id,
            uplink_key: SigningKey::generate(&mut OsRng),
            node_identity_key,
            node_id,
            _dir: dir,
        }
    }

    impl Harness {
        fn limit(&self, piece: PieceId, action: Action, limit_bytes: u64) -> OrderLimit {
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
                limit: limit_bytes,
                satellite_signature: Vec::new(),
            };
            limit.sign(&self.satellite_key);
            limit
        }

        fn upload_requests(
            &self,
            limit: &OrderLimit,
            data: &[u8],
        ) -> (pb::PieceUploadRequest, Vec<pb::PieceUploadRequest>) {
            let first = pb::PieceUploadRequest {
                limit: Some(convert::order_limit_to_proto(limit)),
                chunk: None,
                order: None,
                done: None,
                hash_algorithm: PieceHashAlgorithm::Sha256 as i32,
            };

            let mut rest = Vec::new();
            for (i, chunk) in data.chunks(32 * 1024).enumerate() {
                let sent = (i * 32 * 1024 + chunk.len()) as u64;
                let order = Order::sign(limit.serial_number, sent, &self.uplink_key);
                rest.push(pb::PieceUploadRequest {
                    limit: None,
                    chunk: Some(pb::piece_upload_request::Chunk {
                        offset: (i * 32 * 1024) as u64,
                        data: chunk.to_vec().into(),
                    }),
                    order: Some(pb::Order {
                        serial_number: order.serial_number.0.to_vec(),
                        amount: order.amount,
                        uplink_signature: order.uplink_signature,
                    }),
                    done: None,
                    hash_algorithm: 0,
                });
            }

            use sha2::Digest;
            let hash = sha2::Sha256::digest(data).to_vec();
            rest.push(pb::PieceUploadRequest {
                limit: None,
                chunk: None,
                order: None,
                done: Some(pb::PieceHash {
                    piece_id: limit.piece_id.to_vec(),
                    hash,
                    hash_algorithm: PieceHashAlgorithm::Sha256 as i32,
                    piece_size: data.len() as u64,
                    timestamp: convert::timestamp_to_micros(Utc::now()),
                    signature: vec![1; 64],
                }),
                hash_algorithm: 0,
            });
            (first, rest)
        }

        async fn upload(&self, piece: PieceId, data: &[u8]) -> Result<pb::PieceUploadResponse> {
            let limit = self.limit(piece, Action::Put, data.len() as u64 + 1024);
            let (first, rest) = self.upload_requests(&limit, data);
            self.endpoint
                .handle_upload(first, stream::iter(rest.into_iter().map(Ok)))
                .await
        }

        async fn download(&self, piece: PieceId, action: Action) -> Result<Vec<u8>> {
            let limit = self.limit(piece, action, u64::MAX);
            let mut rx = self.endpoint.handle_download(pb::PieceDownloadRequest {
                limit: Some(convert::order_limit_to_proto(&limit)),
                chunk: None,
            })?;
            let mut data = Vec::new();
            while let Some(message) = rx.recv().await {
                let response = message.map_err(|s| Error::InvalidMessage(s.to_string()))?;
                if let Some(chunk) = response.chunk {
                    data.extend_from_slice(&chunk.data);
                }
            }
            Ok(data)
        }
    }

    #[tokio::test]
    async fn test_upload_download_roundtrip() {
        let h = harness(Config::default());
        let piece = PieceId([1u8; 32]);
        let mut data = vec![0u8; 100 * 1024];
        rand::thread_rng().fill_bytes(&mut data);

        let response = h.upload(piece, &data).await.unwrap();

        // the node-signed hash verifies under the node identity
        let signed = convert::piece_hash_from_proto(&response.done.unwrap()).unwrap();
        assert_eq!(signed.piece_size, data.len() as u64);
        signed.verify(&h.node_identity_key).unwrap();

        let downloaded = h.download(piece, Action::Get).await.unwrap();
        assert_eq!(downloaded, data);
    }

    #[tokio::test]
    async fn test_repair_download_includes_provenance() {
        let h = harness(Config::default());
        let piece = PieceId([2u8; 32]);
        h.upload(piece, b"repair me").await.unwrap();

        let limit = h.limit(piece, Action::GetRepair, u64::MAX);
        let mut rx = h
            .endpoint
            .handle_download(pb::PieceDownloadRequest {
                limit: Some(convert::order_limit_to_proto(&limit)),
                chunk: None,
            })
            .unwrap();
        let first = rx.recv().await.unwrap().unwrap();
        assert!(first.hash.is_some(), "repair download carries the hash");
        assert!(first.limit.is_some(), "repair download carries the limit");
        assert!(!first.trash);
    }

    #[tokio::test]
    async fn test_upload_requires_limit() {
        let h = harness(Config::default());
        let first = pb::PieceUploadRequest {
            limit: None,
            chunk: None,
            order: None,
            done: None,
            hash_algorithm: 0,
        };
        let err = h
            .endpoint
            .handle_upload(first, stream::iter(Vec::new().into_iter().map(Ok)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingPieceId));
    }

    #[tokio::test]
    async fn test_upload_rejects_get_action() {
        let h = harness(Config::default());
        let limit = h.limit(PieceId([3u8; 32]), Action::Get, 1024);
        let (first, rest) = h.upload_requests(&limit, b"data");
        let err = h
            .endpoint
            .handle_upload(first, stream::iter(rest.into_iter().map(Ok)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExpectedPut(Action::Get)));
    }

    #[tokio::test]
    async fn test_upload_enforces_byte_limit() {
        let h = harness(Config::default());
        let piece = PieceId([4u8; 32]);
        let data = vec![7u8; 10_000];
        let limit = h.limit(piece, Action::Put, 1_000);
        let (first, rest) = h.upload_requests(&limit, &data);
        let err = h
            .endpoint
            .handle_upload(first, stream::iter(rest.into_iter().map(Ok)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OrderLimitExceeded { .. }));

        // no partial piece is observable
        assert!(h.download(piece, Action::Get).await.is_err());
    }

    #[tokio::test]
    async fn test_upload_rejects_tampered_limit() {
        let h = harness(Config::default());
        let mut limit = h.limit(PieceId([5u8; 32]), Action::Put, 1024);
        limit.limit = 1 << 40;
        let (first, rest) = h.upload_requests(&limit, b"data");
        let err = h
            .endpoint
            .handle_upload(first, stream::iter(rest.into_iter().map(Ok)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadOrderLimitSignature));
    }

    #[tokio::test]
    async fn test_upload_rejects_wrong_hash() {
        let h = harness(Config::default());
        let limit = h.limit(PieceId([6u8; 32]), Action::Put, 1 << 20);
        let (first, mut rest) = h.upload_requests(&limit, b"the real data");
        // corrupt the client hash
        if let Some(done) = rest.last_mut().and_then(|m| m.done.as_mut()) {
            done.hash[0] ^= 0xFF;
        }
        let err = h
            .endpoint
            .handle_upload(first, stream::iter(rest.into_iter().map(Ok)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HashMismatch));
    }

    #[tokio::test]
    async fn test_out_of_space() {
        let dir = TempDir::new().unwrap();
        let identity = Arc::new(NodeIdentity::generate(IdVersion::V0));
        let satellite_key = SigningKey::generate(&mut OsRng);
        let satellite_id = NodeId::from_public_key(&satellite_key.verifying_key());
        let mut trust = TrustedSatellites::default();
        trust.insert(satellite_id, satellite_key.verifying_key());
        let backend = Arc::new(HashStoreBackend::new(
            dir.path().join("pieces"),
            Arc::new(BloomFilterManager::default()),
            Arc::new(RestoreTimeManager::default()),
        ));
        // a 100-byte allocation cannot hold a 1 KiB limit
        let monitor = SpaceMonitor::new(100, backend.clone());
        let endpoint = Endpoint::new(
            identity,
            backend,
            Arc::new(trust),
            monitor,
            Config::default(),
        );

        let uplink = SigningKey::generate(&mut OsRng);
        let mut limit = OrderLimit {
            satellite_id,
            uplink_public_key: uplink.verifying_key().to_bytes(),
            storage_node_id: NodeId([0u8; 32]),
            piece_id: PieceId([7u8; 32]),
            action: Action::Put,
            serial_number: SerialNumber::random(),
            order_creation: Utc::now(),
            order_expiration: Utc::now() + chrono::Duration::hours(1),
            piece_expiration: None,
            limit: 1024,
            satellite_signature: Vec::new(),
        };
        limit.sign(&satellite_key);

        let first = pb::PieceUploadRequest {
            limit: Some(convert::order_limit_to_proto(&limit)),
            chunk: None,
            order: None,
            done: None,
            hash_algorithm: 0,
        };
        let err = endpoint
            .handle_upload(first, stream::iter(Vec::new().into_iter().map(Ok)))
            .await
            .unwrap_err();
        match err {
            Error::OutOfSpace { have, need } => {
                assert_eq!(have, 100);
                assert_eq!(need, 1024);
            }
            other => panic!("expected OutOfSpace, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let h = harness(Config {
            max_concurrent_requests: 0,
            ..Config::default()
        });
        let err = h.upload(PieceId([8u8; 32]), b"data").await.unwrap_err();
        assert!(matches!(err, Error::TooManyRequests));
    }

    #[tokio::test]
    async fn test_delete_then_download_not_found_then_delete_ok() {
        let h = harness(Config::default());
        let piece = PieceId([9u8; 32]);
        h.upload(piece, b"delete me").await.unwrap();

        let limit = h.limit(piece, Action::Delete, 0);
        h.endpoint
            .handle_delete(pb::PieceDeleteRequest {
                limit: Some(convert::order_limit_to_proto(&limit)),
            })
            .unwrap();

        // the deleter is asynchronous; give it a moment
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let err = h.download(piece, Action::Get).await.unwrap_err();
        assert!(matches!(err, Error::NotFound));

        // deleting again is still success
        let limit = h.limit(piece, Action::Delete, 0);
        h.endpoint
            .handle_delete(pb::PieceDeleteRequest {
                limit: Some(convert::order_limit_to_proto(&limit)),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_exists_returns_missing_indices() {
        let h = harness(Config::default());
        let have = PieceId([10u8; 32]);
        let missing_a = PieceId([11u8; 32]);
        let missing_b = PieceId([12u8; 32]);
        h.upload(have, b"present").await.unwrap();

        let response = h
            .endpoint
            .handle_exists(
                h.satellite_id,
                pb::ExistsRequest {
                    piece_ids: vec![
                        missing_a.to_vec(),
                        have.to_vec(),
                        missing_b.to_vec(),
                    ],
                },
            )
            .unwrap();
        assert_eq!(response.missing, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_speed_too_low() {
        let h = harness(Config {
            min_upload_speed: u64::MAX,
            speed_grace: std::time::Duration::ZERO,
            ..Config::default()
        });
        let err = h
            .upload(PieceId([13u8; 32]), &vec![1u8; 64 * 1024])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SpeedTooLow { .. }));
    }
}
