// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Command-line arguments

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pagerelay", version, about = "Flow-controlled page exchange")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<log::Level>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run producers and one consumer in-process and report exchange statistics
    Simulate(SimulateArgs),

    /// Show version information
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of producing tasks
    #[arg(long, default_value_t = 4)]
    pub producers: u32,

    /// Pages each producer sends
    #[arg(long, default_value_t = 32)]
    pub pages_per_producer: u32,

    /// Size of every page in bytes
    #[arg(long, default_value_t = 64 * 1024)]
    pub page_size: usize,

    /// Client budget in pages
    #[arg(long, default_value_t = 8.0)]
    pub budget_pages: f64,

    /// Bytes the consumer pulls per call
    #[arg(long, default_value_t = 1024 * 1024)]
    pub batch_bytes: u64,

    /// Producer output buffer capacity in pages (default: exchange config budget)
    #[arg(long)]
    pub producer_buffer_pages: Option<u64>,

    /// JSON exchange configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}
