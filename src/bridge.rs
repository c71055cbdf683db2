//! Adapters from the library's futures to callback and handle styles.
//!
//! Every adapter relays exactly one outcome, unchanged. A promise dropped
//! without an outcome resolves its completion to `Canceled`, so no outcome
//! is lost silently.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::Config;
use crate::datasource::{DataSource, TransactionalDataSource};
use crate::error::{Error, Result};
use crate::row::Row;
use crate::statement::Statement;

/// Returned by a second `Promise::complete`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("promise already completed")]
pub struct AlreadyCompleted;

/// Create a single-fire promise and the completion it resolves.
pub fn promise<T>() -> (Promise<T>, Completion<T>) {
    let (sender, receiver) = oneshot::channel();
    (
        Promise {
            sender: Some(sender),
        },
        Completion { receiver },
    )
}

/// Write side of a single-fire relay.
#[derive(Debug)]
pub struct Promise<T> {
    sender: Option<oneshot::Sender<Result<T>>>,
}

impl<T> Promise<T> {
    /// Deliver the outcome. Only the first call takes effect.
    pub fn complete(&mut self, outcome: Result<T>) -> std::result::Result<(), AlreadyCompleted> {
        match self.sender.take() {
            Some(sender) => {
                // A dropped completion means nobody is listening.
                let _ = sender.send(outcome);
                Ok(())
            }
            None => {
                warn!("promise completed twice; second outcome discarded");
                Err(AlreadyCompleted)
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        self.sender.is_none()
    }
}

/// Read side of a single-fire relay.
///
/// Resolves to the promised outcome, or to `Err(Canceled)` if the promise
/// was dropped unfulfilled.
#[derive(Debug)]
#[must_use = "a completion does nothing unless awaited"]
pub struct Completion<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::Canceled)))
    }
}

/// Run `future` on the tokio runtime and expose its outcome as a
/// `Completion`. The work proceeds whether or not the completion is polled.
pub fn bridge<T, F>(future: F) -> Completion<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let (mut promise, completion) = promise();
    tokio::spawn(async move {
        let outcome = future.await;
        let _ = promise.complete(outcome);
    });
    completion
}

/// Run `future` and hand its outcome to exactly one of the callbacks.
pub fn on_complete<T, F, S, E>(future: F, on_success: S, on_failure: E) -> JoinHandle<()>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
    S: FnOnce(T) + Send + 'static,
    E: FnOnce(Error) + Send + 'static,
{
    tokio::spawn(async move {
        match future.await {
            Ok(value) => on_success(value),
            Err(err) => on_failure(err),
        }
    })
}

// ============================================================================
// Completion-style data sources
// ============================================================================

/// `DataSource` whose calls start immediately and return a `Completion`.
#[derive(Clone)]
pub struct CompletionDataSource {
    inner: DataSource,
}

impl CompletionDataSource {
    pub fn create(source: DataSource) -> Self {
        Self { inner: source }
    }

    pub fn query(&self, statement: impl Into<Statement>) -> Completion<Vec<Row>> {
        let source = self.inner.clone();
        let statement = statement.into();
        bridge(async move { source.query(statement).await })
    }

    pub fn execute(&self, statement: impl Into<Statement>) -> Completion<u64> {
        let source = self.inner.clone();
        let statement = statement.into();
        bridge(async move { source.execute(statement).await })
    }

    /// Must be called within a tokio runtime.
    pub fn transactional(&self) -> CompletionTransactionalDataSource {
        CompletionTransactionalDataSource::new(self.inner.transactional())
    }

    pub fn close(&self) -> Completion<()> {
        let source = self.inner.clone();
        bridge(async move {
            source.close().await;
            Ok(())
        })
    }

    pub fn config(&self) -> &Config {
        self.inner.config()
    }

    pub fn inner(&self) -> &DataSource {
        &self.inner
    }
}

/// `TransactionalDataSource` whose calls return a `Completion`.
///
/// Calls run one at a time in the order they were made, whether or not the
/// caller awaits in between. Clones share the queue.
#[derive(Clone)]
pub struct CompletionTransactionalDataSource {
    inner: TransactionalDataSource,
    jobs: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl CompletionTransactionalDataSource {
    /// Must be called within a tokio runtime; the queue worker is spawned
    /// here and stops once every clone is dropped.
    fn new(inner: TransactionalDataSource) -> Self {
        let (jobs, mut queue) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        tokio::spawn(async move {
            while let Some(job) = queue.recv().await {
                job.await;
            }
        });
        Self { inner, jobs }
    }

    pub fn begin(&self) -> Completion<()> {
        let tx = self.inner.clone();
        self.submit(async move { tx.begin().await })
    }

    pub fn commit(&self) -> Completion<()> {
        let tx = self.inner.clone();
        self.submit(async move { tx.commit().await })
    }

    pub fn rollback(&self) -> Completion<()> {
        let tx = self.inner.clone();
        self.submit(async move { tx.rollback().await })
    }

    pub fn query(&self, statement: impl Into<Statement>) -> Completion<Vec<Row>> {
        let tx = self.inner.clone();
        let statement = statement.into();
        self.submit(async move { tx.query(statement).await })
    }

    pub fn execute(&self, statement: impl Into<Statement>) -> Completion<u64> {
        let tx = self.inner.clone();
        let statement = statement.into();
        self.submit(async move { tx.execute(statement).await })
    }

    pub fn inner(&self) -> &TransactionalDataSource {
        &self.inner
    }

    /// Queue `future` behind every earlier call on this handle.
    fn submit<T, F>(&self, future: F) -> Completion<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (mut promise, completion) = promise();
        let job = async move {
            let outcome = future.await;
            let _ = promise.complete(outcome);
        };
        if self.jobs.send(job.boxed()).is_err() {
            // The worker is gone; the dropped job cancels its completion.
            warn!("transaction queue closed; call canceled");
        }
        completion
    }
}
