// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Report formatting for CLI output

use super::commands::OutputFormat;
use super::simulate::SimulationReport;
use colored::*;
use comfy_table::{presets::UTF8_FULL, Cell, Color, Table};
use pagerelay::memory::format_bytes;

/// Format a simulation report in the requested format
pub fn format_report(report: &SimulationReport, format: OutputFormat) -> String {
    match format {
        OutputFormat::Table => format_table(report),
        OutputFormat::Json => format_json(report),
    }
}

fn format_table(report: &SimulationReport) -> String {
    let mut output = String::new();
    output.push_str(&format!("{}\n", "Exchange Simulation".bold().green()));
    output.push_str(&format!(
        "Received {} pages ({}) from {} producers in {:?}\n",
        report.pages,
        format_bytes(report.bytes),
        report.producers,
        report.elapsed
    ));
    output.push_str(&format!(
        "Throughput: {:.0} pages/sec, {}/sec\n\n",
        report.pages_per_sec(),
        format_bytes(report.bytes_per_sec() as u64)
    ));

    let stats = &report.stats;
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec![
        Cell::new("Metric").fg(Color::Green),
        Cell::new("Value").fg(Color::Green),
    ]);
    table.add_row(vec!["Budget".to_string(), format_bytes(report.budget_bytes)]);
    table.add_row(vec!["Peak queued".to_string(), format_bytes(stats.peak_bytes)]);
    table.add_row(vec![
        "Received pages".to_string(),
        stats.num_received_pages.to_string(),
    ]);
    table.add_row(vec![
        "Average page".to_string(),
        format_bytes(stats.average_received_page_bytes),
    ]);
    table.add_row(vec![
        "Acknowledge requests".to_string(),
        stats.num_acknowledge_requests.to_string(),
    ]);
    table.add_row(vec!["Memory".to_string(), report.pool.format_human_readable()]);
    output.push_str(&table.to_string());
    output.push('\n');

    if !stats.source_metrics.is_empty() {
        let mut sources = Table::new();
        sources.load_preset(UTF8_FULL);
        sources.set_header(
            ["Source metric", "Sum", "Count", "Min", "Max"]
                .into_iter()
                .map(|name| Cell::new(name).fg(Color::Green))
                .collect::<Vec<_>>(),
        );
        for (name, metric) in &stats.source_metrics {
            sources.add_row(vec![
                name.clone(),
                metric.sum.to_string(),
                metric.count.to_string(),
                metric.min.to_string(),
                metric.max.to_string(),
            ]);
        }
        output.push_str(&format!("\n{}\n", sources));
    }

    if stats.peak_bytes > report.budget_bytes {
        output.push_str(&format!(
            "\n{}\n",
            "Peak exceeded the budget: pages are larger than the budget".yellow()
        ));
    }
    output
}

fn format_json(report: &SimulationReport) -> String {
    let json = serde_json::json!({
        "producers": report.producers,
        "pages": report.pages,
        "bytes": report.bytes,
        "budget_bytes": report.budget_bytes,
        "elapsed_ms": report.elapsed.as_millis() as u64,
        "pages_per_sec": report.pages_per_sec(),
        "stats": report.stats,
        "memory": {
            "allocated": report.pool.allocated,
            "peak": report.pool.peak,
        },
    });
    let mut text = serde_json::to_string_pretty(&json).unwrap_or_else(|_| {
        "{\"status\": \"error\", \"error\": \"Could not serialize report to JSON\"}".to_string()
    });
    text.push('\n');
    text
}
