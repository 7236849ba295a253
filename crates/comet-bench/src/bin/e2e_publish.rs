//! End-to-end publish benchmark for Comet.
//!
//! Each client subscribes to its own key over WebSocket, then publishes to
//! that key over RPC as fast as the node answers. Measures publish calls and
//! delivered frames per second with real network I/O.

use comet_protocol::{PushFrame, ResultCode, RpcClient};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const RPC_ADDR: &str = "127.0.0.1:8070";
const SUBSCRIBE_URL: &str = "ws://127.0.0.1:8080/sub";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    failed: AtomicU64,
    delivered: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.published.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        self.delivered.store(0, Ordering::SeqCst);
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);

    println!("Comet end-to-end publish benchmark");
    println!("Make sure the node is running: cargo run --release --bin comet");
    println!();

    run_publish_benchmark(num_clients).await;
}

async fn run_publish_benchmark(num_clients: usize) {
    println!("Clients: {}", num_clients);
    println!("Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let counters = Arc::new(Counters::default());
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();
    for client_id in 0..num_clients {
        let counters = Arc::clone(&counters);
        let barrier = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(client_id, counters, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        }));
    }

    // Wait for all clients to subscribe
    barrier.wait().await;
    println!("All {} clients subscribed", num_clients);

    println!("Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    counters.reset();
    let start = Instant::now();

    println!("Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed().as_secs_f64();
    let published = counters.published.load(Ordering::SeqCst);
    let failed = counters.failed.load(Ordering::SeqCst);
    let delivered = counters.delivered.load(Ordering::SeqCst);

    println!();
    println!("Duration:        {:>12.2}s", elapsed);
    println!("Publish calls:   {:>12}", published);
    println!("Publish errors:  {:>12}", failed);
    println!("Delivered:       {:>12}", delivered);
    println!("Publish rate:    {:>12.0} calls/s", published as f64 / elapsed);
    println!("Delivery rate:   {:>12.0} msg/s", delivered as f64 / elapsed);

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    counters: Arc<Counters>,
    barrier: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let key = format!("bench:{}", client_id);

    // Subscribing creates the key's channel on the node.
    let (ws, _) = connect_async(format!("{}?key={}", SUBSCRIBE_URL, key)).await?;
    let (_sink, mut receiver) = ws.split();
    let mut rpc = RpcClient::connect(RPC_ADDR).await?;

    barrier.wait().await;

    let recv_counters = Arc::clone(&counters);
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            if let Ok(Message::Text(text)) = result {
                if serde_json::from_str::<PushFrame>(&text).is_ok() {
                    recv_counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    });

    let mut seq = 0u64;
    let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = loop {
        seq += 1;
        match rpc.publish(key.as_str(), "hello", 0, seq.to_string()).await {
            Ok(ResultCode::Ok) => counters.published.fetch_add(1, Ordering::Relaxed),
            Ok(_) => counters.failed.fetch_add(1, Ordering::Relaxed),
            Err(e) => break Err(e.into()),
        };
    };

    recv_task.abort();
    result
}
