//! Piecestore client.
//!
//! Drives the upload and download streams against one storage node. Uploads
//! chunk the piece, sign an ascending order per chunk with the uplink's
//! piece key, finish with the client-computed hash, and verify the node's
//! signed receipt. Downloads reassemble the chunk stream and, for audit and
//! repair limits, hand back the provenance carried in the first response.
//!
//! Retries are the caller's responsibility; the node never retries.

use chrono::Utc;
use ed25519_dalek::{SigningKey, VerifyingKey};
use futures::stream;
use galaxy_core::{Order, OrderLimit, PieceHash, PieceHashAlgorithm};
use galaxy_proto::convert;
use galaxy_proto::piecestore as pb;
use galaxy_proto::piecestore::piecestore_client::PiecestoreClient as GrpcClient;
use sha2::Digest as _;
use tonic::transport::Channel;
use tracing::debug;

use crate::error::{Error, Result};

const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// A download result: the bytes plus whatever provenance the node attached.
#[derive(Debug)]
pub struct DownloadedPiece {
    pub data: Vec<u8>,
    /// Original upload hash, present for audit and repair downloads.
    pub hash: Option<PieceHash>,
    /// Original upload order limit, present for audit and repair downloads.
    pub limit: Option<OrderLimit>,
    /// Whether the node served the piece out of its trash.
    pub trash: bool,
}

pub struct PiecestoreClient {
    client: GrpcClient<Channel>,
}

impl PiecestoreClient {
    pub async fn connect(addr: String) -> Result<PiecestoreClient> {
        let client = GrpcClient::connect(addr).await?;
        Ok(PiecestoreClient { client })
    }

    pub fn from_channel(channel: Channel) -> PiecestoreClient {
        PiecestoreClient {
            client: GrpcClient::new(channel),
        }
    }

    fn compute_hash(algorithm: PieceHashAlgorithm, data: &[u8]) -> Vec<u8> {
        match algorithm {
            PieceHashAlgorithm::Sha256 => sha2::Sha256::digest(data).to_vec(),
            PieceHashAlgorithm::Sha3_256 => sha3::Sha3_256::digest(data).to_vec(),
        }
    }

    /// Upload one piece under the given limit. Returns the node's signed
    /// hash after verifying it covers our data and carries a valid
    /// signature from `node_key`.
    pub async fn upload(
        &mut self,
        limit: &OrderLimit,
        piece_key: &SigningKey,
        node_key: &VerifyingKey,
        algorithm: PieceHashAlgorithm,
        data: &[u8],
    ) -> Result<PieceHash> {
        let mut requests = Vec::with_capacity(data.len() / UPLOAD_CHUNK_SIZE + 2);
        requests.push(pb::PieceUploadRequest {
            limit: Some(convert::order_limit_to_proto(limit)),
            chunk: None,
            order: None,
            done: None,
            hash_algorithm: algorithm as i32,
        });

        let mut sent = 0u64;
        for chunk in data.chunks(UPLOAD_CHUNK_SIZE) {
            let offset = sent;
            sent += chunk.len() as u64;
            let order = Order::sign(limit.serial_number, sent, piece_key);
            requests.push(pb::PieceUploadRequest {
                limit: None,
                chunk: Some(pb::piece_upload_request::Chunk {
                    offset,
                    data: chunk.to_vec(),
                }),
                order: Some(pb::Order {
                    serial_number: order.serial_number.0.to_vec(),
                    amount: order.amount,
                    uplink_signature: order.uplink_signature,
                }),
                done: None,
                hash_algorithm: algorithm as i32,
            });
        }

        let expected_hash = Self::compute_hash(algorithm, data);
        let mut client_hash = PieceHash {
            piece_id: limit.piece_id,
            hash: expected_hash.clone(),
            hash_algorithm: algorithm,
            piece_size: data.len() as u64,
            timestamp: Utc::now(),
            signature: Vec::new(),
        };
        client_hash.sign(piece_key);
        requests.push(pb::PieceUploadRequest {
            limit: None,
            chunk: None,
            order: None,
            done: Some(convert::piece_hash_to_proto(&client_hash)),
            hash_algorithm: algorithm as i32,
        });

        debug!(piece = %limit.piece_id, bytes = data.len(), "uploading piece");
        let response = self
            .client
            .upload(stream::iter(requests))
            .await?
            .into_inner();

        let node_hash =
            convert::piece_hash_from_proto(&response.done.ok_or(Error::MissingNodeHash)?)?;
        if node_hash.hash != expected_hash || node_hash.piece_size != data.len() as u64 {
            return Err(Error::NodeHashMismatch);
        }
        node_hash
            .verify(node_key)
            .map_err(|_| Error::BadNodeSignature)?;
        Ok(node_hash)
    }

    /// Download `[offset, offset + length)` of a piece. Passing length 0
    /// fetches the whole piece.
    pub async fn download(
        &mut self,
        limit: &OrderLimit,
        offset: u64,
        length: u64,
    ) -> Result<DownloadedPiece> {
        let request = pb::PieceDownloadRequest {
            limit: Some(convert::order_limit_to_proto(limit)),
            chunk: if length == 0 {
                None
            } else {
                Some(pb::piece_download_request::Chunk {
                    offset,
                    chunk_size: length,
                })
            },
        };

        let mut stream = self.client.download(request).await?.into_inner();
        let mut piece = DownloadedPiece {
            data: Vec::new(),
            hash: None,
            limit: None,
            trash: false,
        };
        while let Some(response) = stream.message().await? {
            if let Some(hash) = &response.hash {
                piece.hash = Some(convert::piece_hash_from_proto(hash)?);
            }
            if let Some(proto_limit) = &response.limit {
                piece.limit = Some(convert::order_limit_from_proto(proto_limit)?);
            }
            piece.trash |= response.trash;
            if let Some(chunk) = response.chunk {
                piece.data.extend_from_slice(&chunk.data);
            }
        }
        Ok(piece)
    }

    /// Verify downloaded bytes against the original upload hash carried in
    /// an audit or repair download.
    pub fn verify_provenance(piece: &DownloadedPiece) -> Result<()> {
        let Some(hash) = &piece.hash else {
            return Err(Error::MissingNodeHash);
        };
        let computed = Self::compute_hash(hash.hash_algorithm, &piece.data);
        if computed != hash.hash {
            return Err(Error::DownloadHashMismatch);
        }
        Ok(())
    }

    /// Delete one piece. Success covers the not-found case.
    pub async fn delete(&mut self, limit: &OrderLimit) -> Result<()> {
        self.client
            .delete(pb::PieceDeleteRequest {
                limit: Some(convert::order_limit_to_proto(limit)),
            })
            .await?;
        Ok(())
    }
}
