/// Benchmark for page throughput through the local exchange transport
///
/// Producers push fixed-size pages into their output buffers while a single
/// client pulls them under different byte budgets.

use pagerelay::{
    ExchangeClient, ExchangeConfig, ExchangeContext, MemoryPool, OutputBufferManager,
    SerializedPage,
};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

const PAGE_SIZE: usize = 16 * 1024;
const PAGES_PER_PRODUCER: usize = 2000;

async fn produce(manager: Arc<OutputBufferManager>, task_id: String) {
    for _ in 0..PAGES_PER_PRODUCER {
        let blocked = manager
            .enqueue(&task_id, 0, SerializedPage::zeroed(PAGE_SIZE))
            .expect("Failed to enqueue page");
        if let Some(future) = blocked {
            future.await.expect("Producer was aborted");
        }
    }
    manager.no_more_data(&task_id).expect("Failed to finish producer");
}

/// Returns (pages, elapsed, peak queued bytes, acknowledge requests)
async fn run(config: ExchangeConfig, producers: usize, budget: u64) -> (u64, Duration, u64, u64) {
    let manager = Arc::new(OutputBufferManager::new(8 * PAGE_SIZE as u64));
    let ctx = ExchangeContext::local(manager.clone(), config).expect("Failed to create context");
    let client = ExchangeClient::new("bench", 0, budget, MemoryPool::unlimited("bench"), &ctx)
        .expect("Failed to create client");

    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..producers {
        let task_id = format!("bench-producer-{}", i);
        manager
            .initialize_task(&task_id, 1, None)
            .expect("Failed to initialize producer");
        client
            .add_remote_task_id(&format!("local://{}", task_id))
            .expect("Failed to add source");
        handles.push(tokio::spawn(produce(manager.clone(), task_id)));
    }
    client.no_more_remote_tasks();

    let mut pages = 0u64;
    loop {
        let batch = client.next(1024 * 1024).expect("Exchange failed");
        pages += batch.pages.len() as u64;
        if batch.at_end {
            break;
        }
        if let Some(future) = batch.future {
            future.await.expect("Exchange failed");
        }
    }
    let elapsed = start.elapsed();

    for handle in handles {
        handle.await.expect("Producer panicked");
    }
    let stats = client.stats();
    client.close();
    (pages, elapsed, stats.peak_bytes, stats.num_acknowledge_requests)
}

fn main() {
    println!("=== Exchange Throughput Benchmark ===\n");

    // Load the configuration from disk the way deployments do
    let mut config_file = NamedTempFile::new().expect("Failed to create config file");
    let json = serde_json::to_string(&ExchangeConfig::low_latency())
        .expect("Failed to serialize config");
    config_file
        .write_all(json.as_bytes())
        .expect("Failed to write config file");
    let config = ExchangeConfig::from_file(config_file.path()).expect("Failed to load config");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    let mut results = Vec::new();
    for &producers in &[1usize, 4, 16] {
        for &budget_pages in &[2u64, 32] {
            let budget = budget_pages * PAGE_SIZE as u64;
            println!(
                "📊 {} producers, budget {} pages:",
                producers, budget_pages
            );
            let (pages, elapsed, peak, acks) =
                runtime.block_on(run(config.clone(), producers, budget));
            let pages_per_sec = pages as f64 / elapsed.as_secs_f64();
            let mib_per_sec = pages_per_sec * PAGE_SIZE as f64 / (1024.0 * 1024.0);
            println!("  Pages: {}", pages);
            println!("  Time: {:?}", elapsed);
            println!("  Throughput: {:.0} pages/sec ({:.1} MiB/sec)", pages_per_sec, mib_per_sec);
            println!("  Peak queued: {} bytes (budget {})", peak, budget);
            println!("  Acknowledge requests: {}", acks);
            println!();
            results.push((producers, budget_pages, pages_per_sec));
        }
    }

    println!("=== Summary ===");
    for (producers, budget_pages, pages_per_sec) in results {
        println!(
            "  {:>2} producers, {:>2} page budget: {:.0} pages/sec",
            producers, budget_pages, pages_per_sec
        );
    }
}
