//! In-process host for a background context.
//!
//! Fetches and messages arrive on two separate streams; activation on a
//! third. Every event is spawned as its own task, so a slow storage call on
//! one request never holds up dispatch of the next.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::cache::StoredResponse;
use crate::interceptor::Request;
use crate::protocol::{Propagation, ReplyTarget};
use crate::worker::{BackgroundContext, InboundMessage, MessageDisposition};

/// Result of routing a request through the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
  /// A shadow response replaced the network
  Substituted(StoredResponse),
  /// Nothing to substitute; the caller goes to the network
  Passthrough,
}

/// Another consumer of the message transport.
pub type MessageListener = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

struct FetchEvent {
  request: Request,
  respond: oneshot::Sender<FetchOutcome>,
}

struct MessageEvent {
  message: InboundMessage,
  reply_to: Arc<dyn ReplyTarget>,
}

enum LifecycleEvent {
  Activate(oneshot::Sender<Result<()>>),
}

/// Drives a [`BackgroundContext`] from event streams.
pub struct WorkerHost<C: BackgroundContext> {
  context: Arc<C>,
  listeners: Vec<MessageListener>,
}

impl<C: BackgroundContext> WorkerHost<C> {
  pub fn new(context: C) -> Self {
    Self {
      context: Arc::new(context),
      listeners: Vec::new(),
    }
  }

  /// Register a listener that sees messages the context does not claim.
  pub fn with_listener(
    mut self,
    listener: impl Fn(&InboundMessage) + Send + Sync + 'static,
  ) -> Self {
    self.listeners.push(Arc::new(listener));
    self
  }

  /// Start the event loop. It runs until every handle is dropped.
  pub fn spawn(self) -> HostHandle {
    let (fetch_tx, mut fetch_rx) = mpsc::unbounded_channel::<FetchEvent>();
    let (message_tx, mut message_rx) = mpsc::unbounded_channel::<MessageEvent>();
    let (lifecycle_tx, mut lifecycle_rx) = mpsc::unbounded_channel::<LifecycleEvent>();

    tokio::spawn(async move {
      loop {
        tokio::select! {
          Some(event) = fetch_rx.recv() => self.dispatch_fetch(event),
          Some(event) = message_rx.recv() => self.dispatch_message(event),
          Some(event) = lifecycle_rx.recv() => self.dispatch_lifecycle(event),
          else => break,
        }
      }
      debug!("Worker host stopped");
    });

    HostHandle {
      fetch_tx,
      message_tx,
      lifecycle_tx,
    }
  }

  fn dispatch_fetch(&self, event: FetchEvent) {
    let context = Arc::clone(&self.context);
    tokio::spawn(async move {
      let outcome = match context.on_request(&event.request).await {
        Ok(Some(response)) => FetchOutcome::Substituted(response),
        Ok(None) => FetchOutcome::Passthrough,
        Err(e) => {
          warn!(url = %event.request.url, error = %e, "Interception failed, passing through");
          FetchOutcome::Passthrough
        }
      };
      // The requester may have given up; nothing to do then.
      let _ = event.respond.send(outcome);
    });
  }

  fn dispatch_message(&self, event: MessageEvent) {
    let disposition = self.context.on_message(&event.message, event.reply_to);
    if disposition.propagation() == Propagation::Continue {
      for listener in &self.listeners {
        listener(&event.message);
      }
    }
    if let MessageDisposition::Handled(work) = disposition {
      tokio::spawn(work);
    }
  }

  fn dispatch_lifecycle(&self, event: LifecycleEvent) {
    let context = Arc::clone(&self.context);
    match event {
      LifecycleEvent::Activate(done) => {
        tokio::spawn(async move {
          let _ = done.send(context.on_activate().await);
        });
      }
    }
  }
}

/// Cloneable handle used to feed events into a running host.
#[derive(Clone)]
pub struct HostHandle {
  fetch_tx: mpsc::UnboundedSender<FetchEvent>,
  message_tx: mpsc::UnboundedSender<MessageEvent>,
  lifecycle_tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl HostHandle {
  /// Route `request` through the context and wait for its decision.
  pub async fn fetch(&self, request: Request) -> Result<FetchOutcome> {
    let (respond, decision) = oneshot::channel();
    self
      .fetch_tx
      .send(FetchEvent { request, respond })
      .map_err(|_| eyre!("Worker host is not running"))?;
    decision
      .await
      .map_err(|_| eyre!("Worker host dropped the request"))
  }

  /// Deliver a message. Any reply goes to `reply_to`.
  pub fn post_message(
    &self,
    message: InboundMessage,
    reply_to: Arc<dyn ReplyTarget>,
  ) -> Result<()> {
    self
      .message_tx
      .send(MessageEvent { message, reply_to })
      .map_err(|_| eyre!("Worker host is not running"))
  }

  /// Activate the context and wait for activation to finish.
  pub async fn activate(&self) -> Result<()> {
    let (done, finished) = oneshot::channel();
    self
      .lifecycle_tx
      .send(LifecycleEvent::Activate(done))
      .map_err(|_| eyre!("Worker host is not running"))?;
    finished
      .await
      .map_err(|_| eyre!("Worker host dropped activation"))?
  }
}
