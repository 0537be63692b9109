// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! In-process exchange simulation

use super::commands::SimulateArgs;
use super::output;
use pagerelay::{
    ExchangeClient, ExchangeConfig, ExchangeContext, ExchangeError, ExchangeResult,
    ExchangeStats, MemoryPool, MemoryStats, OutputBufferManager, SerializedPage,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of one simulation run
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub producers: u32,
    pub pages: u64,
    pub bytes: u64,
    pub budget_bytes: u64,
    pub elapsed: Duration,
    pub stats: ExchangeStats,
    pub pool: MemoryStats,
}

impl SimulationReport {
    pub fn pages_per_sec(&self) -> f64 {
        self.pages as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }

    pub fn bytes_per_sec(&self) -> f64 {
        self.bytes as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }
}

pub fn handle_simulate(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => ExchangeConfig::from_file(path)?,
        None => ExchangeConfig::default(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(run_simulation(&args, config))?;

    print!("{}", output::format_report(&report, args.format));
    Ok(())
}

async fn run_simulation(
    args: &SimulateArgs,
    config: ExchangeConfig,
) -> ExchangeResult<SimulationReport> {
    let producer_buffer_bytes = args
        .producer_buffer_pages
        .map(|pages| pages.saturating_mul(args.page_size as u64))
        .unwrap_or(config.max_queued_bytes);
    let manager = Arc::new(OutputBufferManager::new(producer_buffer_bytes.max(1)));
    let ctx = ExchangeContext::local(manager.clone(), config)?;

    let budget_bytes = ((args.budget_pages * args.page_size as f64) as u64).max(1);
    let pool = MemoryPool::unlimited("simulate");
    let client = ExchangeClient::new(
        format!("simulate-{}", uuid::Uuid::new_v4()),
        0,
        budget_bytes,
        pool.clone(),
        &ctx,
    )?;
    log::info!(
        "Simulating {} producers x {} pages of {} bytes with a {} byte budget",
        args.producers,
        args.pages_per_producer,
        args.page_size,
        budget_bytes
    );

    let start = Instant::now();
    let mut producers = Vec::with_capacity(args.producers as usize);
    for i in 0..args.producers {
        let task_id = format!("producer-{}", i);
        manager.initialize_task(&task_id, 1, None)?;
        client.add_remote_task_id(&format!("local://{}", task_id))?;
        producers.push(tokio::spawn(produce(
            manager.clone(),
            task_id,
            args.pages_per_producer,
            args.page_size,
        )));
    }
    client.no_more_remote_tasks();

    let (pages, bytes) = consume(&client, args.batch_bytes).await?;
    let elapsed = start.elapsed();

    for producer in producers {
        producer
            .await
            .map_err(|e| ExchangeError::InvalidState(format!("producer task failed: {}", e)))??;
    }

    let stats = client.stats();
    client.close();
    Ok(SimulationReport {
        producers: args.producers,
        pages,
        bytes,
        budget_bytes,
        elapsed,
        stats,
        pool: pool.stats(),
    })
}

/// Push `pages` pages, waiting whenever the output buffer is full
async fn produce(
    manager: Arc<OutputBufferManager>,
    task_id: String,
    pages: u32,
    page_size: usize,
) -> ExchangeResult<()> {
    for _ in 0..pages {
        if let Some(blocked) = manager.enqueue(&task_id, 0, SerializedPage::zeroed(page_size))? {
            blocked.await?;
        }
    }
    manager.no_more_data(&task_id)
}

/// Pull until at-end; returns pages and bytes received
async fn consume(client: &ExchangeClient, batch_bytes: u64) -> ExchangeResult<(u64, u64)> {
    let mut pages = 0u64;
    let mut bytes = 0u64;
    loop {
        let batch = client.next(batch_bytes)?;
        pages += batch.pages.len() as u64;
        bytes += batch.total_bytes();
        if batch.at_end {
            return Ok((pages, bytes));
        }
        if let Some(future) = batch.future {
            future.await?;
        }
    }
}
