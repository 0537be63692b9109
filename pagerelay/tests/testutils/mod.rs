//! Test utilities for PageRelay integration tests
//!
//! - ExchangeFixture: in-process producers plus a client factory
//! - sources: scripted transports for failure scenarios

#![allow(dead_code)]

pub mod exchange_fixture;
pub mod sources;
