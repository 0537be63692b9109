// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! One-shot completion signals
//!
//! A [`ContinueFuture`] is handed to a consumer that has to wait; the matching
//! [`ContinuePromise`] is kept by whoever will produce the event. Promises are
//! always fulfilled after the lock guarding their owner has been released.

use crate::error::{ExchangeError, ExchangeResult};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

/// Create a connected promise/future pair
pub fn make_continue_future() -> (ContinuePromise, ContinueFuture) {
    let (tx, rx) = oneshot::channel();
    (
        ContinuePromise { tx },
        ContinueFuture {
            rx,
            ready: None,
        },
    )
}

/// Producer side of a one-shot signal
#[derive(Debug)]
pub struct ContinuePromise {
    tx: oneshot::Sender<ExchangeResult<()>>,
}

impl ContinuePromise {
    pub fn set_value(self) {
        // The waiter may have given up; nothing to do then.
        let _ = self.tx.send(Ok(()));
    }

    pub fn set_error(self, error: ExchangeError) {
        let _ = self.tx.send(Err(error));
    }

    /// The matching future was dropped
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side of a one-shot signal
///
/// Resolves to `Ok(())` when the promise is fulfilled or dropped, and to the
/// error passed to [`ContinuePromise::set_error`] otherwise.
#[derive(Debug)]
pub struct ContinueFuture {
    rx: oneshot::Receiver<ExchangeResult<()>>,
    ready: Option<ExchangeResult<()>>,
}

impl ContinueFuture {
    /// Check for completion without consuming the future
    pub fn is_ready(&mut self) -> bool {
        if self.ready.is_some() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(result) => {
                self.ready = Some(result);
                true
            }
            Err(TryRecvError::Closed) => {
                self.ready = Some(Ok(()));
                true
            }
            Err(TryRecvError::Empty) => false,
        }
    }
}

impl Future for ContinueFuture {
    type Output = ExchangeResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.ready.take() {
            return Poll::Ready(result);
        }
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Promise dropped unfulfilled
            Poll::Ready(Err(_)) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}
