use clap::Parser;
use hdrhistogram::Histogram;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use uuid::Uuid;

use graphraft::command::{EntityType, MutationBatch};
use graphraft::pb::store_service_client::StoreServiceClient;
use graphraft::pb::{ResultCode, StoreKind, SubmitCommandRequest};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of concurrent clients
    #[arg(short, long, default_value = "1")]
    concurrency: usize,

    /// INTERVAL ms
    #[arg(short, long, default_value = "100")]
    interval: u64,

    /// Duration of the benchmark in seconds
    #[arg(short, long, default_value = "30")]
    duration: u64,

    /// Vertices inserted per batch
    #[arg(short, long, default_value = "10")]
    batch_size: usize,

    /// Address of the group leader
    #[arg(short, long, default_value = "http://127.0.0.1:8281")]
    server: String,
}

fn insert_batch(size: usize) -> Result<Vec<u8>, graphraft::Error> {
    let mut batch = MutationBatch::new();
    for _ in 0..size {
        batch.insert(
            EntityType::Vertex,
            Uuid::new_v4().to_string(),
            b"{\"label\":\"person\"}".to_vec(),
        );
    }
    batch.encode()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let server_addr = args.server.clone();
    let histogram = Arc::new(Mutex::new(Histogram::<u64>::new(3)?));
    let total_requests = Arc::new(Mutex::new(0u64));
    let failed_requests = Arc::new(Mutex::new(0u64));

    println!(
        "Starting benchmark with {} concurrent clients, target INTERVAL: {}",
        args.concurrency, args.interval
    );

    // Spawn client tasks
    let mut handles = vec![];
    for _ in 0..args.concurrency {
        let server_addr = server_addr.clone();
        let histogram = histogram.clone();
        let total_requests = total_requests.clone();
        let failed_requests = failed_requests.clone();
        let batch_size = args.batch_size;
        let interval = args.interval;

        let handle = tokio::spawn(async move {
            let mut client = match StoreServiceClient::connect(server_addr).await {
                Ok(client) => client,
                Err(e) => {
                    eprintln!("Failed to connect to server: {}", e);
                    return;
                }
            };

            loop {
                let batch = match insert_batch(batch_size) {
                    Ok(batch) => batch,
                    Err(e) => {
                        eprintln!("Failed to encode batch: {}", e);
                        return;
                    }
                };
                let mut request = SubmitCommandRequest {
                    batch,
                    ..Default::default()
                };
                request.set_store(StoreKind::Graph);

                let start = Instant::now();
                match client.submit_command(request).await {
                    Ok(response) if response.get_ref().code() == ResultCode::Ok => {
                        let duration = start.elapsed();
                        let mut hist = histogram.lock().await;
                        if let Err(e) = hist.record(duration.as_micros() as u64) {
                            eprintln!("Failed to record latency: {}", e);
                        }
                        *total_requests.lock().await += 1;
                    }
                    Ok(response) => {
                        let response = response.into_inner();
                        eprintln!(
                            "Request rejected: {:?} {} (leader {})",
                            response.code(),
                            response.message,
                            response.leader
                        );
                        *failed_requests.lock().await += 1;
                    }
                    Err(e) => {
                        eprintln!("Request failed: {}", e);
                        *failed_requests.lock().await += 1;
                    }
                }

                sleep(Duration::from_millis(interval)).await;
            }
        });

        handles.push(handle);
    }

    // Run for specified duration
    sleep(Duration::from_secs(args.duration)).await;

    // Cancel all tasks
    for handle in handles {
        handle.abort();
    }

    // Print statistics
    let total = *total_requests.lock().await;
    let failed = *failed_requests.lock().await;
    let hist = histogram.lock().await;

    println!("\nBenchmark Results:");
    println!("Total Requests: {}", total);
    println!("Failed Requests: {}", failed);
    println!("Average TPS: {:.2}", total as f64 / args.duration as f64);
    println!(
        "Average vertices/s: {:.2}",
        (total * args.batch_size as u64) as f64 / args.duration as f64
    );
    println!("\nLatency Distribution (microseconds):");
    println!("p50: {}", hist.value_at_percentile(50.0));
    println!("p90: {}", hist.value_at_percentile(90.0));
    println!("p95: {}", hist.value_at_percentile(95.0));
    println!("p99: {}", hist.value_at_percentile(99.0));
    println!("p99.9: {}", hist.value_at_percentile(99.9));

    Ok(())
}
