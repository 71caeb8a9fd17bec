use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;

use crate::error::*;

pub type JoinHandle<T> = ::tokio::task::JoinHandle<T>;

pub type Runtime = ::tokio::runtime::Runtime;

pub fn init(num_threads: usize) -> Result<Runtime> {
    ::tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_threads)
        .thread_name_fn(|| {
            static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);

            let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);

            format!("DKG-IO-Worker-{}", id)
        })
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")
}
