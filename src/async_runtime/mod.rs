//! Abstraction over the async runtime backing the engine's worker tasks.
//!
//! The transports never block a caller: queue-full fallback pushes and the
//! on-chain block-watch loop run as detached tasks spawned here.

#[cfg(feature = "async_runtime_tokio")]
mod tokio;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context as Cntx, Poll};
use std::time::Duration;

use anyhow::Context;

use crate::error::*;
use crate::globals::Global;

#[cfg(feature = "async_runtime_tokio")]
static mut RUNTIME: Global<tokio::Runtime> = Global::new();

macro_rules! runtime {
    () => {
        match unsafe { RUNTIME.get() } {
            Some(ref rt) => rt,
            None => panic!("Async runtime wasn't initialized"),
        }
    };
}

/// A `JoinHandle` represents a spawned task that can be awaited on.
///
/// It resolves to a value of `T` when the underlying async task completes.
pub struct JoinHandle<T> {
    #[cfg(feature = "async_runtime_tokio")]
    inner: tokio::JoinHandle<T>,
}

/// This function initializes the async runtime.
///
/// It should be called once, before the engine starts executing.
///
/// # Safety
/// This is safe when it's the first called function and when it's only called once
pub unsafe fn init(num_threads: usize) -> Result<()> {
    #[cfg(feature = "async_runtime_tokio")]
    {
        tokio::init(num_threads).map(|rt| RUNTIME.set(rt))
    }
}

/// This function drops the async runtime.
///
/// # Safety
/// Safe when called after [init()]
pub unsafe fn drop() -> Result<()> {
    if let Some(rt) = RUNTIME.drop() {
        rt.shutdown_timeout(Duration::from_secs(1));
    }

    Ok(())
}

/// Spawns a new task `F` into the async runtime's thread pool.
///
/// A handle to the future `JoinHandle` is returned, which can be
/// awaited on, to resolve the value returned by `F`.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let inner = runtime!().spawn(future);
    JoinHandle { inner }
}

/// Blocks on a future `F` until it completes.
pub fn block_on<F: Future>(future: F) -> F::Output {
    runtime!().block_on(future)
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Cntx<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner)
            .poll(cx)
            .map(|result| result.context("Failed to join handle"))
    }
}
