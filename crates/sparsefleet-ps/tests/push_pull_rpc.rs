//! End-to-end push/pull over real gRPC: a two-shard server group and a
//! `KvClient` with each transport filter combination.

use std::sync::Arc;

use tokio_stream::wrappers::TcpListenerStream;

use sparsefleet_core::config::Algo;
use sparsefleet_core::fid::range_start;
use sparsefleet_optimizer::L1L2;
use sparsefleet_proto::ParamServerServer;
use sparsefleet_ps::{AnyShard, KvClient, ShardHandle, ShardService, TransportOpts};

async fn spawn_shard(shard_id: u32, algo: Algo) -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shard = AnyShard::from_algo(algo, 1.0, 1.0, L1L2::new(0.0, 0.0));
    let service = ShardService::new(shard, shard_id, None);
    let signal = service.clone();
    let handle = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(ParamServerServer::new(ShardHandle(service)))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                signal.wait_shutdown().await;
            })
            .await
            .unwrap();
    });
    (addr.to_string(), handle)
}

async fn spawn_group(
    num_shards: u32,
    algo: Algo,
) -> (Vec<String>, Vec<tokio::task::JoinHandle<()>>) {
    let mut addrs = Vec::new();
    let mut handles = Vec::new();
    for shard_id in 0..num_shards {
        let (addr, handle) = spawn_shard(shard_id, algo).await;
        addrs.push(addr);
        handles.push(handle);
    }
    (addrs, handles)
}

/// Keys straddling both shard ranges, ascending.
fn spread_keys() -> Vec<u64> {
    let hi = range_start(1, 2);
    vec![1, 2, 100, hi, hi + 7, u64::MAX - 1]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn push_pull_round_trip_across_shards() {
    let (addrs, handles) = spawn_group(2, Algo::Adagrad).await;
    let client = KvClient::connect(&addrs, "w0", TransportOpts::default())
        .await
        .unwrap();

    let keys = spread_keys();
    // Untouched keys pull the handler zero.
    let zeros = client.pull(&keys).await.unwrap();
    assert_eq!(zeros, vec![0.0; keys.len()]);

    let grads = vec![0.5f32, -0.5, 1.0, 0.25, -0.25, 2.0];
    client.push(&keys, &grads).await.unwrap();

    let weights = client.pull(&keys).await.unwrap();
    assert_eq!(weights.len(), keys.len());
    for (g, w) in grads.iter().zip(&weights) {
        // AdaGrad's first step moves opposite the gradient.
        assert!(g * w < 0.0, "grad {g} -> weight {w}");
    }

    client.shutdown_all().await;
    for h in handles {
        h.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn key_cache_and_compression_filters() {
    let (addrs, handles) = spawn_group(2, Algo::Adagrad).await;
    let opts = TransportOpts {
        fixed_bytes: 0,
        key_cache: true,
        msg_compression: true,
    };
    let client = KvClient::connect(&addrs, "w0", opts).await.unwrap();

    let keys = spread_keys();
    let grads = vec![0.1f32; keys.len()];

    // Same key vector three times: the second and third ride the cache.
    client.push(&keys, &grads).await.unwrap();
    client.push(&keys, &grads).await.unwrap();
    let weights = client.pull(&keys).await.unwrap();
    assert!(weights.iter().all(|&w| w < 0.0));

    client.shutdown_all().await;
    for h in handles {
        h.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quantized_values_arrive_within_scale() {
    let (addrs, handles) = spawn_group(1, Algo::Sgd).await;
    let opts = TransportOpts {
        fixed_bytes: 2,
        key_cache: false,
        msg_compression: false,
    };
    let client = KvClient::connect(&addrs, "w0", opts).await.unwrap();

    let keys = vec![10u64, 20, 30];
    let grads = vec![1.0f32, -0.5, 0.25];
    client.push(&keys, &grads).await.unwrap();

    // SGD first batch: eta = 2, w = -g / 2; quantization error is bounded
    // by the 16-bit scale of each hop.
    let weights = client.pull(&keys).await.unwrap();
    for (g, w) in grads.iter().zip(&weights) {
        assert!((w + g / 2.0).abs() < 1e-3, "grad {g} -> weight {w}");
    }

    client.shutdown_all().await;
    for h in handles {
        h.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn save_model_broadcast_counts_all_shards() {
    let dir = tempfile::tempdir().unwrap();
    let (addrs, handles) = spawn_group(2, Algo::Sgd).await;
    let client = KvClient::connect(&addrs, "w0", TransportOpts::default())
        .await
        .unwrap();

    let keys = spread_keys();
    let grads = vec![1.0f32; keys.len()];
    client.push(&keys, &grads).await.unwrap();

    let entries = client
        .save_model(&dir.path().display().to_string())
        .await
        .unwrap();
    assert_eq!(entries, keys.len() as u64);
    assert!(dir.path().join("part-0.jsonl").exists());
    assert!(dir.path().join("part-1.jsonl").exists());

    client.shutdown_all().await;
    for h in handles {
        h.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pushes_keep_accumulator_consistent() {
    let (addrs, handles) = spawn_group(1, Algo::Adagrad).await;
    let client = Arc::new(
        KvClient::connect(&addrs, "w0", TransportOpts::default())
            .await
            .unwrap(),
    );

    // 16 concurrent unit-gradient pushes on one key; per-key updates are
    // serialized by the shard, so the accumulator sees all of them.
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client.push(&[99], &[1.0]).await.unwrap();
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    // AdaGrad with 16 unit grads: sq_cum_grad = 4, last eta = 5. The exact
    // weight depends on interleaving, but it must be strictly negative and
    // finite.
    let w = client.pull(&[99]).await.unwrap()[0];
    assert!(w < 0.0 && w.is_finite());

    client.shutdown_all().await;
    for h in handles {
        h.await.unwrap();
    }
}
