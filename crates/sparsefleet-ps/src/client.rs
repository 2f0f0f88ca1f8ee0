//! Worker-side key-value client over the parameter-server group.
//!
//! Keys arrive ascending and unique (the localizer guarantees it); the
//! client slices the vector at shard range boundaries, fans requests out to
//! every involved shard concurrently, and reassembles pulled weights in key
//! order. Transient transport failures are retried; a server that lost a
//! cached key vector gets it resent in full.

use std::collections::HashSet;
use std::time::Duration;

use futures::future::try_join_all;
use parking_lot::Mutex;
use tonic::transport::Channel;
use tonic::Code;

use sparsefleet_core::fid::range_start;
use sparsefleet_core::{Error, FeaId, Result};
use sparsefleet_proto::{
    KeyChunk, ParamServerClient, PullRequest, PushRequest, SaveModelRequest, ShutdownRequest,
};

use crate::codec;

const RPC_ATTEMPTS: usize = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(100);
const SENT_SIG_CAP: usize = 4096;

/// The transport filter switches, one per configuration knob.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportOpts {
    /// Fixed-point quantization width for values; 0 sends raw f32.
    pub fixed_bytes: u32,
    /// Replace previously sent key vectors by their signature.
    pub key_cache: bool,
    /// Compress value payloads.
    pub msg_compression: bool,
}

/// Client over all parameter-server shards.
pub struct KvClient {
    clients: Vec<ParamServerClient<Channel>>,
    client_id: String,
    opts: TransportOpts,
    /// Signatures already sent per shard; resending those keys is skipped
    /// when the key cache is on.
    sent_sigs: Vec<Mutex<HashSet<u64>>>,
}

impl KvClient {
    /// Connects to every shard address in order; index in `addrs` is the
    /// shard index.
    pub async fn connect(
        addrs: &[String],
        client_id: impl Into<String>,
        opts: TransportOpts,
    ) -> Result<Self> {
        if addrs.is_empty() {
            return Err(Error::config("at least one server address is required"));
        }
        let mut clients = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let endpoint = if addr.contains("://") {
                addr.clone()
            } else {
                format!("http://{addr}")
            };
            let client = ParamServerClient::connect(endpoint)
                .await
                .map_err(|e| Error::Transport(format!("connect {addr}: {e}")))?;
            clients.push(client);
        }
        let sent_sigs = (0..clients.len()).map(|_| Mutex::new(HashSet::new())).collect();
        Ok(Self {
            clients,
            client_id: client_id.into(),
            opts,
            sent_sigs,
        })
    }

    /// Number of shards in the group.
    pub fn num_shards(&self) -> usize {
        self.clients.len()
    }

    /// Splits an ascending key vector into one contiguous range per shard.
    fn shard_ranges(&self, keys: &[FeaId]) -> Vec<std::ops::Range<usize>> {
        let n = self.clients.len();
        let mut ranges = Vec::with_capacity(n);
        let mut start = 0usize;
        for shard in 0..n {
            let end = if shard + 1 == n {
                keys.len()
            } else {
                let bound = range_start(shard + 1, n);
                start + keys[start..].partition_point(|&k| k < bound)
            };
            ranges.push(start..end);
            start = end;
        }
        ranges
    }

    fn make_key_chunk(&self, shard: usize, keys: &[FeaId]) -> KeyChunk {
        let signature = codec::key_signature(keys);
        if self.opts.key_cache {
            let mut sigs = self.sent_sigs[shard].lock();
            if sigs.contains(&signature) {
                return KeyChunk {
                    keys: Vec::new(),
                    signature,
                    use_cache: true,
                };
            }
            if sigs.len() >= SENT_SIG_CAP {
                sigs.clear();
            }
            sigs.insert(signature);
        }
        KeyChunk {
            keys: keys.to_vec(),
            signature,
            use_cache: false,
        }
    }

    fn full_key_chunk(keys: &[FeaId]) -> KeyChunk {
        KeyChunk {
            keys: keys.to_vec(),
            signature: codec::key_signature(keys),
            use_cache: false,
        }
    }

    /// Pulls one weight per key, in matching order. Keys must be ascending
    /// and unique.
    pub async fn pull(&self, keys: &[FeaId]) -> Result<Vec<f32>> {
        debug_assert!(keys.windows(2).all(|w| w[0] < w[1]));
        let ranges = self.shard_ranges(keys);
        let mut out = vec![0.0f32; keys.len()];

        let calls = ranges
            .into_iter()
            .enumerate()
            .filter(|(_, r)| !r.is_empty())
            .map(|(shard, r)| {
                let slice = &keys[r.clone()];
                async move {
                    let weights = self.pull_shard(shard, slice).await?;
                    Ok::<_, Error>((r, weights))
                }
            });

        for (r, weights) in try_join_all(calls).await? {
            if weights.len() != r.len() {
                return Err(Error::LengthMismatch {
                    expected: r.len(),
                    actual: weights.len(),
                });
            }
            out[r].copy_from_slice(&weights);
        }
        Ok(out)
    }

    /// Pushes one gradient per key. Keys must be ascending and unique,
    /// aligned with `grads`.
    pub async fn push(&self, keys: &[FeaId], grads: &[f32]) -> Result<()> {
        if keys.len() != grads.len() {
            return Err(Error::LengthMismatch {
                expected: keys.len(),
                actual: grads.len(),
            });
        }
        let ranges = self.shard_ranges(keys);

        let calls = ranges
            .into_iter()
            .enumerate()
            .filter(|(_, r)| !r.is_empty())
            .map(|(shard, r)| {
                let key_slice = &keys[r.clone()];
                let grad_slice = &grads[r];
                async move { self.push_shard(shard, key_slice, grad_slice).await }
            });

        try_join_all(calls).await?;
        Ok(())
    }

    async fn pull_shard(&self, shard: usize, keys: &[FeaId]) -> Result<Vec<f32>> {
        let mut chunk = self.make_key_chunk(shard, keys);
        let mut attempt = 0;
        loop {
            let request = PullRequest {
                client_id: self.client_id.clone(),
                keys: Some(chunk.clone()),
                fixed_bytes: self.opts.fixed_bytes,
                compressed: self.opts.msg_compression,
            };
            let mut client = self.clients[shard].clone();
            match client.pull(request).await {
                Ok(resp) => {
                    let weights = resp
                        .into_inner()
                        .weights
                        .ok_or_else(|| Error::Transport("pull response without values".into()))?;
                    return codec::decode_values(&weights);
                }
                Err(status) if status.code() == Code::FailedPrecondition && chunk.use_cache => {
                    // The server evicted this key vector; resend it in full.
                    chunk = Self::full_key_chunk(keys);
                }
                Err(status) => {
                    attempt += 1;
                    if attempt >= RPC_ATTEMPTS || !is_transient(&status) {
                        return Err(Error::Transport(format!("pull shard {shard}: {status}")));
                    }
                    tokio::time::sleep(RETRY_BACKOFF * attempt as u32).await;
                }
            }
        }
    }

    async fn push_shard(&self, shard: usize, keys: &[FeaId], grads: &[f32]) -> Result<()> {
        let encoded =
            codec::encode_values(grads, self.opts.fixed_bytes, self.opts.msg_compression)?;
        let mut chunk = self.make_key_chunk(shard, keys);
        let mut attempt = 0;
        loop {
            let request = PushRequest {
                client_id: self.client_id.clone(),
                keys: Some(chunk.clone()),
                grads: Some(encoded.clone()),
            };
            let mut client = self.clients[shard].clone();
            match client.push(request).await {
                Ok(_) => return Ok(()),
                Err(status) if status.code() == Code::FailedPrecondition && chunk.use_cache => {
                    chunk = Self::full_key_chunk(keys);
                }
                Err(status) => {
                    attempt += 1;
                    if attempt >= RPC_ATTEMPTS || !is_transient(&status) {
                        return Err(Error::Transport(format!("push shard {shard}: {status}")));
                    }
                    tokio::time::sleep(RETRY_BACKOFF * attempt as u32).await;
                }
            }
        }
    }

    /// Broadcasts a save command to every shard and returns the total
    /// number of entries written.
    pub async fn save_model(&self, dir: &str) -> Result<u64> {
        let calls = self.clients.iter().cloned().map(|mut client| {
            let dir = dir.to_string();
            async move {
                let resp = client
                    .save_model(SaveModelRequest { dir })
                    .await
                    .map_err(|e| Error::Save(e.to_string()))?;
                Ok::<_, Error>(resp.into_inner().entries)
            }
        });
        let counts = try_join_all(calls).await?;
        Ok(counts.into_iter().sum())
    }

    /// Broadcasts shutdown to every shard, best effort.
    pub async fn shutdown_all(&self) {
        for client in &self.clients {
            let mut client = client.clone();
            if let Err(e) = client.shutdown(ShutdownRequest {}).await {
                tracing::warn!("server shutdown rpc failed: {e}");
            }
        }
    }
}

/// Whether an RPC failure is worth retrying at this layer.
fn is_transient(status: &tonic::Status) -> bool {
    matches!(
        status.code(),
        Code::Unavailable | Code::Unknown | Code::DeadlineExceeded | Code::ResourceExhausted
    )
}
