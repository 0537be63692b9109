// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! In-process producer side of the exchange
//!
//! Producing tasks push serialized pages into per-destination buffers; the
//! `local://` transport pulls from them with sequence-numbered reads.

pub mod manager;
pub mod output_buffer;

pub use manager::OutputBufferManager;
pub use output_buffer::{BufferRead, DataBatch, OutputBuffer};
