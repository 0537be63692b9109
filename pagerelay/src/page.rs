// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Serialized pages moved across the exchange

use crate::memory::MemoryReservation;
use bytes::Bytes;

/// One opaque, immutable unit of exchanged data
///
/// The payload is reference counted, so handing the same bytes from a
/// producer buffer to a consumer does not copy them. A page may carry a
/// reservation against the consumer's memory pool, released when the page is
/// dropped.
#[derive(Debug)]
pub struct SerializedPage {
    data: Bytes,
    num_rows: Option<u64>,
    reservation: Option<MemoryReservation>,
}

impl SerializedPage {
    pub fn new(data: Bytes, num_rows: Option<u64>) -> Self {
        Self {
            data,
            num_rows,
            reservation: None,
        }
    }

    /// Page whose bytes are accounted against a memory pool
    pub fn with_reservation(
        data: Bytes,
        num_rows: Option<u64>,
        reservation: MemoryReservation,
    ) -> Self {
        Self {
            data,
            num_rows,
            reservation: Some(reservation),
        }
    }

    /// Page of `size` zero bytes
    pub fn zeroed(size: usize) -> Self {
        Self::new(Bytes::from(vec![0u8; size]), None)
    }

    /// Size of the payload in bytes
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn num_rows(&self) -> Option<u64> {
        self.num_rows
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn is_accounted(&self) -> bool {
        self.reservation.is_some()
    }

    /// Unaccounted page sharing this page's payload
    pub fn share(&self) -> SerializedPage {
        SerializedPage::new(self.data.clone(), self.num_rows)
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}
