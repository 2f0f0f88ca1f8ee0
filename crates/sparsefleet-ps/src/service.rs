//! The free-standing gRPC surface over a shard.
//!
//! [`ShardService`] wraps an [`AnyShard`] behind the `ParamServer` service:
//! batched push/pull with the transport filters applied, model save, and a
//! cooperative shutdown that lets in-flight batches finish. The same shard
//! type can be driven embedded by calling it directly; this service is the
//! default deployment surface.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tonic::{Request, Response, Status};

use sparsefleet_core::{FeaId, Progress};
use sparsefleet_proto::{
    KeyChunk, ParamServerServer, Phase, PullRequest, PullResponse, PushRequest, PushResponse,
    SaveModelRequest, SaveModelResponse, ShutdownRequest, ShutdownResponse,
};

use crate::codec;
use crate::reporter::TimeReporter;
use crate::shard::AnyShard;

const KEY_CACHE_CAP: usize = 1024;

/// Per-client cache of previously seen key vectors, addressed by signature.
#[derive(Default)]
struct ClientKeyCache {
    map: HashMap<u64, Arc<Vec<FeaId>>>,
    order: VecDeque<u64>,
}

impl ClientKeyCache {
    fn insert(&mut self, signature: u64, keys: Arc<Vec<FeaId>>) {
        if self.map.insert(signature, keys).is_none() {
            self.order.push_back(signature);
            if self.order.len() > KEY_CACHE_CAP {
                if let Some(evicted) = self.order.pop_front() {
                    self.map.remove(&evicted);
                }
            }
        }
    }

    fn get(&self, signature: u64) -> Option<Arc<Vec<FeaId>>> {
        self.map.get(&signature).cloned()
    }
}

/// One parameter-server shard behind the gRPC surface.
pub struct ShardService {
    shard: Mutex<AnyShard>,
    shard_id: u32,
    key_cache: Mutex<HashMap<String, ClientKeyCache>>,
    reporter: Option<TimeReporter>,
    shutdown: Notify,
}

impl ShardService {
    /// Wraps `shard`. When `reporter` is set, nnz deltas emitted by the
    /// handler `finish` hook flow to the monitor.
    pub fn new(shard: AnyShard, shard_id: u32, reporter: Option<TimeReporter>) -> Arc<Self> {
        Arc::new(Self {
            shard: Mutex::new(shard),
            shard_id,
            key_cache: Mutex::new(HashMap::new()),
            reporter,
            shutdown: Notify::new(),
        })
    }

    /// The shard index, used in saved-model file names.
    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    /// Completes once a shutdown command arrives.
    pub async fn wait_shutdown(&self) {
        self.shutdown.notified().await;
    }

    /// Resolves a key chunk to the actual key vector, consulting and
    /// maintaining this client's cache.
    fn resolve_keys(&self, client_id: &str, chunk: &KeyChunk) -> Result<Arc<Vec<FeaId>>, Status> {
        if chunk.use_cache {
            let cache = self.key_cache.lock();
            return cache
                .get(client_id)
                .and_then(|c| c.get(chunk.signature))
                .ok_or_else(|| Status::failed_precondition("unknown key signature"));
        }

        let keys = Arc::new(chunk.keys.clone());
        if !client_id.is_empty() {
            let signature = if chunk.signature != 0 {
                chunk.signature
            } else {
                codec::key_signature(&keys)
            };
            self.key_cache
                .lock()
                .entry(client_id.to_string())
                .or_default()
                .insert(signature, keys.clone());
        }
        Ok(keys)
    }

    async fn report_progress(&self, delta: Progress) {
        if let Some(reporter) = &self.reporter {
            if let Err(e) = reporter.report(Phase::Train, &delta).await {
                tracing::warn!(shard = self.shard_id, "progress report failed: {e}");
            }
        }
    }
}

/// Newtype over `Arc<ShardService>`; the service trait cannot be
/// implemented on the foreign `Arc` type directly.
#[derive(Clone)]
pub struct ShardHandle(pub Arc<ShardService>);

impl std::ops::Deref for ShardHandle {
    type Target = ShardService;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[tonic::async_trait]
impl sparsefleet_proto::ParamServer for ShardHandle {
    async fn push(
        &self,
        request: Request<PushRequest>,
    ) -> Result<Response<PushResponse>, Status> {
        let req = request.into_inner();
        let key_chunk = req
            .keys
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("push without keys"))?;
        let keys = self.resolve_keys(&req.client_id, key_chunk)?;
        let grad_chunk = req
            .grads
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("push without gradients"))?;
        let grads = codec::decode_values(grad_chunk)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let delta = {
            let mut shard = self.shard.lock();
            shard
                .push(&keys, &grads)
                .map_err(|e| Status::invalid_argument(e.to_string()))?;
            shard.take_progress()
        };
        self.report_progress(delta).await;

        Ok(Response::new(PushResponse {}))
    }

    async fn pull(
        &self,
        request: Request<PullRequest>,
    ) -> Result<Response<PullResponse>, Status> {
        let req = request.into_inner();
        let key_chunk = req
            .keys
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("pull without keys"))?;
        let keys = self.resolve_keys(&req.client_id, key_chunk)?;

        let weights = {
            let mut shard = self.shard.lock();
            shard.pull(&keys)
        };
        let chunk = codec::encode_values(&weights, req.fixed_bytes, req.compressed)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        Ok(Response::new(PullResponse {
            weights: Some(chunk),
        }))
    }

    async fn save_model(
        &self,
        request: Request<SaveModelRequest>,
    ) -> Result<Response<SaveModelResponse>, Status> {
        let req = request.into_inner();
        let entries = {
            let shard = self.shard.lock();
            shard
                .save(std::path::Path::new(&req.dir), self.shard_id)
                .map_err(|e| Status::internal(e.to_string()))?
        };
        tracing::info!(
            shard = self.shard_id,
            entries,
            dir = %req.dir,
            "model shard saved"
        );
        Ok(Response::new(SaveModelResponse { entries }))
    }

    async fn shutdown(
        &self,
        _request: Request<ShutdownRequest>,
    ) -> Result<Response<ShutdownResponse>, Status> {
        tracing::info!(shard = self.shard_id, "shutdown requested");
        self.shutdown.notify_one();
        Ok(Response::new(ShutdownResponse {}))
    }
}

/// Serves `service` on `addr` until a shutdown command arrives. In-flight
/// batches run to completion.
pub async fn serve_shard(
    service: Arc<ShardService>,
    addr: SocketAddr,
) -> Result<(), tonic::transport::Error> {
    let signal = service.clone();
    tonic::transport::Server::builder()
        .add_service(ParamServerServer::new(ShardHandle(service)))
        .serve_with_shutdown(addr, async move { signal.wait_shutdown().await })
        .await
}
