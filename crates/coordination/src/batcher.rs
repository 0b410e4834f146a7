//! Coalescing of concurrent requests into batched upstream calls.
//!
//! A [Batcher] owns a single coordinating task. Submissions are sent to it
//! over a bounded inbox and collected into a pending batch keyed by input,
//! so identical inputs are executed once. The batch is flushed when it
//! holds `max_entries` distinct inputs, or `max_delay` after its first
//! input arrived, whichever comes first.
//!
//! Every flush runs on its own task, so a slow upstream call never stalls
//! intake. Two flushes may therefore overlap and complete in any order.

use futures::{
  future::{self, BoxFuture},
  FutureExt, TryFutureExt,
};
use smallvec::SmallVec;
use std::{
  collections::HashMap,
  error::Error as StdError,
  fmt,
  future::Future,
  hash::Hash,
  num::NonZeroUsize,
  sync::{Arc, Mutex, PoisonError},
  time::Duration,
};
use thiserror::Error;
use tokio::{
  sync::mpsc,
  task::{JoinError, JoinHandle, JoinSet},
  time::{self, Instant},
};
use tracing::{debug, error, info, Instrument};

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The outcome of one submission. `Ok(None)` means the batch succeeded but
/// produced no output for this input.
pub type BatchResult<R> = Result<Option<R>, BatchError>;

type ExecuteFn<I, R> =
  Arc<dyn Fn(Vec<I>) -> BoxFuture<'static, Result<HashMap<I, R>, BoxError>> + Send + Sync>;

type Waiters<R> = SmallVec<[mpsc::Sender<BatchResult<R>>; 1]>;
type PendingBatch<I, R> = HashMap<I, Waiters<R>>;

#[non_exhaustive]
#[derive(Debug, Clone, Error)]
pub enum BatchError {
  /// The batcher no longer accepts submissions.
  #[error("batcher is closed")]
  Closed,

  /// The batch was dropped before it produced a result.
  #[error("batch was abandoned before completing")]
  Abandoned,

  /// The execute function failed. Applies to every input of the batch.
  #[error("batch execution failed: {0}")]
  Execute(#[source] Arc<dyn StdError + Send + Sync>),
}

struct Task<I, R> {
  input: I,
  result_tx: mpsc::Sender<BatchResult<R>>,
}

enum Message<I, R> {
  Task(Task<I, R>),
  Close,
}

pub struct Batcher<I, R> {
  inbox: mpsc::Sender<Message<I, R>>,
  coordinator: Mutex<Option<JoinHandle<()>>>,
  max_entries: NonZeroUsize,
  max_delay: Duration,
}

impl<I, R> Batcher<I, R>
where
  I: Eq + Hash + Clone + Send + 'static,
  R: Clone + Send + 'static,
{
  /// Starts a batcher. Must be called from within a tokio runtime.
  ///
  /// `execute` receives the distinct inputs of one batch and returns the
  /// output for each of them. It may be called again before a previous
  /// call has completed.
  pub fn new<F, Fut, E>(max_entries: NonZeroUsize, max_delay: Duration, execute: F) -> Self
  where
    F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HashMap<I, R>, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
  {
    let execute: ExecuteFn<I, R> = Arc::new(
      move |inputs: Vec<I>| -> BoxFuture<'static, Result<HashMap<I, R>, BoxError>> {
        execute(inputs).map_err(Into::into).boxed()
      },
    );
    let (inbox, receiver) = mpsc::channel(max_entries.get());

    let coordinator = Coordinator {
      inbox: receiver,
      max_entries: max_entries.get(),
      max_delay,
      execute,
      pending: HashMap::new(),
      deadline: None,
      flights: JoinSet::new(),
    };

    info!(
      max_entries = max_entries.get(),
      ?max_delay,
      "batcher started"
    );
    let coordinator = tokio::spawn(coordinator.run().in_current_span());

    Self {
      inbox,
      coordinator: Mutex::new(Some(coordinator)),
      max_entries,
      max_delay,
    }
  }

  #[inline]
  pub fn max_entries(&self) -> NonZeroUsize {
    self.max_entries
  }

  #[inline]
  pub fn max_delay(&self) -> Duration {
    self.max_delay
  }

  /// Queues `input` for the next batch. The result is delivered to
  /// `result_tx` without blocking: if it has no free capacity, or the
  /// receiver is gone, the result is dropped.
  ///
  /// Waits while the inbox is full.
  pub async fn add_task(
    &self,
    input: I,
    result_tx: mpsc::Sender<BatchResult<R>>,
  ) -> Result<(), BatchError> {
    self
      .inbox
      .send(Message::Task(Task { input, result_tx }))
      .await
      .map_err(|_| BatchError::Closed)
  }

  /// Queues `input` and waits for its result.
  pub async fn execute(&self, input: I) -> BatchResult<R> {
    let (result_tx, mut result_rx) = mpsc::channel(1);
    self.add_task(input, result_tx).await?;

    match result_rx.recv().await {
      Some(result) => result,
      None => Err(BatchError::Abandoned),
    }
  }

  /// Stops accepting submissions, flushes everything already submitted and
  /// waits until every batch has delivered its results.
  pub async fn close(&self) {
    let coordinator = self
      .coordinator
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();

    let coordinator = match coordinator {
      None => return,
      Some(v) => v,
    };

    // an error means the coordinator is already gone
    let _ = self.inbox.send(Message::Close).await;
    if let Err(e) = coordinator.await {
      error!("batcher coordinator failed: {}", e);
    }
  }
}

impl<I, R> fmt::Debug for Batcher<I, R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Batcher")
      .field("max_entries", &self.max_entries)
      .field("max_delay", &self.max_delay)
      .field("closed", &self.inbox.is_closed())
      .finish()
  }
}

struct Coordinator<I, R> {
  inbox: mpsc::Receiver<Message<I, R>>,
  max_entries: usize,
  max_delay: Duration,
  execute: ExecuteFn<I, R>,
  pending: PendingBatch<I, R>,
  deadline: Option<Instant>,
  flights: JoinSet<()>,
}

impl<I, R> Coordinator<I, R>
where
  I: Eq + Hash + Clone + Send + 'static,
  R: Clone + Send + 'static,
{
  async fn run(mut self) {
    loop {
      let deadline = self.deadline;

      tokio::select! {
        msg = self.inbox.recv() => match msg {
          Some(Message::Task(task)) => self.add(task),
          Some(Message::Close) | None => break,
        },

        () = expired(deadline) => {
          debug!("max delay elapsed");
          self.flush();
        }

        Some(joined) = self.flights.join_next(), if !self.flights.is_empty() => {
          log_flight(joined);
        }
      }
    }

    // Submissions that raced with closing are still part of the last batch.
    self.inbox.close();
    while let Ok(msg) = self.inbox.try_recv() {
      if let Message::Task(task) = msg {
        self.add(task);
      }
    }

    self.flush();
    while let Some(joined) = self.flights.join_next().await {
      log_flight(joined);
    }

    info!("batcher closed");
  }

  fn add(&mut self, task: Task<I, R>) {
    let Task { input, result_tx } = task;
    if self.pending.is_empty() {
      self.deadline = Some(Instant::now() + self.max_delay);
    }

    self.pending.entry(input).or_default().push(result_tx);
    if self.pending.len() >= self.max_entries {
      debug!("batch full");
      self.flush();
    }
  }

  fn flush(&mut self) {
    self.deadline = None;
    if self.pending.is_empty() {
      return;
    }

    let batch = std::mem::take(&mut self.pending);
    let execute = self.execute.clone();
    self
      .flights
      .spawn(execute_batch(execute, batch).in_current_span());
  }
}

async fn expired(deadline: Option<Instant>) {
  match deadline {
    Some(deadline) => time::sleep_until(deadline).await,
    None => future::pending().await,
  }
}

fn log_flight(joined: Result<(), JoinError>) {
  if let Err(e) = joined {
    error!("batch execution task failed: {}", e);
  }
}

async fn execute_batch<I, R>(execute: ExecuteFn<I, R>, batch: PendingBatch<I, R>)
where
  I: Eq + Hash + Clone,
  R: Clone,
{
  let inputs = batch.keys().cloned().collect::<Vec<_>>();
  debug!(inputs = inputs.len(), "executing batch");

  match execute(inputs).await {
    Ok(mut outputs) => {
      for (input, waiters) in batch {
        let output = outputs.remove(&input);
        deliver(waiters, Ok(output));
      }
    }
    Err(e) => {
      let e = BatchError::Execute(Arc::from(e));
      debug!("batch failed: {}", e);
      for (_, waiters) in batch {
        deliver(waiters, Err(e.clone()));
      }
    }
  }
}

fn deliver<R: Clone>(waiters: Waiters<R>, result: BatchResult<R>) {
  for result_tx in waiters {
    if result_tx.try_send(result.clone()).is_err() {
      debug!("caller is not listening, dropping batch result");
    }
  }
}
