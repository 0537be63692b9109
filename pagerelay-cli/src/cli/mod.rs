// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! CLI module for PageRelay
//!
//! Runs in-process exchange simulations: N producers push pages into their
//! output buffers while one client pulls them under a byte budget.

pub mod commands;
pub mod output;
pub mod simulate;

pub use commands::{Cli, Commands};
pub use simulate::handle_simulate;
