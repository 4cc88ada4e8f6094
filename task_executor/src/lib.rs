// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::future::Future;

use futures::future::FutureExt;
use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinHandle};

///
/// A thin handle to the tokio Runtime driving this process, used to spawn work with an
/// explicit choice between the async and blocking pools. Filesystem mutation belongs on the
/// blocking pool, so that no async task holds a filesystem resource across a suspension
/// point.
///
#[derive(Clone, Debug)]
pub struct Executor {
    handle: Handle,
}

impl Executor {
    ///
    /// Creates an Executor for the current tokio::Runtime (generally provided by tokio's
    /// macros). The Runtime must outlive all clones of the returned Executor.
    ///
    pub fn new() -> Executor {
        Executor {
            handle: Handle::current(),
        }
    }

    ///
    /// Run a Future on the Runtime as a new Task.
    ///
    /// If the background Task exits abnormally, the given closure will be called to recover:
    /// usually it should convert the resulting Error to a relevant error type.
    ///
    pub fn spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
        &self,
        future: F,
        rescue_join_error: impl FnOnce(JoinError) -> O,
    ) -> impl Future<Output = O> {
        self.native_spawn(future).map(|res| match res {
            Ok(o) => o,
            Err(e) => rescue_join_error(e),
        })
    }

    ///
    /// Run a Future on the Runtime as a new Task, and return a JoinHandle.
    ///
    pub fn native_spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
        &self,
        future: F,
    ) -> JoinHandle<O> {
        self.handle.spawn(future)
    }

    ///
    /// Run a closure on the threadpool reserved for blocking tasks.
    ///
    /// If the background Task exits abnormally, the given closure will be called to recover:
    /// usually it should convert the resulting Error to a relevant error type.
    ///
    pub fn spawn_blocking<F: FnOnce() -> R + Send + 'static, R: Send + 'static>(
        &self,
        f: F,
        rescue_join_error: impl FnOnce(JoinError) -> R,
    ) -> impl Future<Output = R> {
        self.native_spawn_blocking(f).map(|res| match res {
            Ok(o) => o,
            Err(e) => rescue_join_error(e),
        })
    }

    ///
    /// Run a closure on the threadpool reserved for blocking tasks, and return a JoinHandle.
    ///
    pub fn native_spawn_blocking<F: FnOnce() -> R + Send + 'static, R: Send + 'static>(
        &self,
        f: F,
    ) -> JoinHandle<R> {
        self.handle.spawn_blocking(f)
    }

    /// Return a reference to this executor's runtime handle.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}
