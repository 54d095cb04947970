// Thin layer over tokio so every long-lived task goes through one place
// and carries a name in logs.

pub use tokio::{select, sync, task, time};

use std::future::Future;

use log::{error, trace};
use tokio::task::JoinHandle;

// Spawn a named task and log its termination
pub fn spawn_task<F, T>(name: &'static str, future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    trace!("spawning task {}", name);
    tokio::spawn(async move {
        let result = future.await;
        trace!("task {} has exited", name);
        result
    })
}

// Spawn a named task whose panic must not go unnoticed
pub fn spawn_critical_task<F>(name: &'static str, future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let handle = tokio::spawn(future);
        if let Err(e) = handle.await {
            error!("critical task {} aborted: {}", name, e);
        }
    })
}
