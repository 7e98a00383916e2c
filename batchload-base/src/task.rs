// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
Abstractions over tasks that can be used natively or on the Web.
 */

use std::future::Future;

#[cfg(not(web))]
mod implementation {
    use super::*;

    /// The type of a future awaiting another task.
    pub type NonBlockingFuture<R> = tokio::task::JoinHandle<R>;

    /// Spawns a new task on the ambient Tokio runtime.
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn spawn<F: Future<Output: Send> + Send + 'static>(
        future: F,
    ) -> NonBlockingFuture<F::Output> {
        tokio::task::spawn(future)
    }
}

#[cfg(web)]
mod implementation {
    use futures::channel::oneshot;

    use super::*;

    /// The type of a future awaiting another task.
    pub type NonBlockingFuture<R> = oneshot::Receiver<R>;

    /// Spawns a new task on the current thread.
    pub fn spawn<F: Future + 'static>(future: F) -> NonBlockingFuture<F::Output> {
        let (send, recv) = oneshot::channel();
        wasm_bindgen_futures::spawn_local(async {
            let _ = send.send(future.await);
        });
        recv
    }
}

pub use implementation::*;

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[tokio::test]
    async fn spawned_task_runs_to_completion() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = super::spawn({
            let counter = counter.clone();
            async move { counter.fetch_add(1, Ordering::SeqCst) + 1 }
        });
        assert_eq!(handle.await.unwrap(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
