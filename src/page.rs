//! Foreground side of the protocol: sends commands and awaits their replies.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;
use url::Url;

use crate::cache::Tier;
use crate::host::HostHandle;
use crate::protocol::{self, Command, PageMessage, ReplyTarget, Status};
use crate::worker::InboundMessage;

type Pending = Mutex<HashMap<String, oneshot::Sender<Status>>>;

/// Reply endpoint owned by one page. Routes worker replies to the command
/// that is waiting on the same id and ignores everything else.
struct PagePort {
  pending: Pending,
}

impl ReplyTarget for PagePort {
  fn post_message(&self, message: Value) -> Result<()> {
    let reply = match protocol::accept_worker_message(&message) {
      Ok(reply) => reply,
      Err(rejection) => {
        debug!(%rejection, "Page ignoring message");
        return Ok(());
      }
    };

    let waiter = self
      .pending
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .remove(&reply.id);

    match waiter {
      Some(waiter) => {
        // The caller may have timed out already.
        let _ = waiter.send(reply.status);
      }
      None => debug!(id = %reply.id, "Reply for unknown command"),
    }
    Ok(())
  }
}

/// Issues shadow file commands to a worker on behalf of one origin.
pub struct PageClient {
  host: HostHandle,
  origin: Url,
  port: Arc<PagePort>,
  next_id: AtomicU64,
  reply_timeout: Duration,
}

impl PageClient {
  pub fn new(host: HostHandle, origin: Url, reply_timeout: Duration) -> Self {
    Self {
      host,
      origin,
      port: Arc::new(PagePort {
        pending: Mutex::new(HashMap::new()),
      }),
      next_id: AtomicU64::new(1),
      reply_timeout,
    }
  }

  /// The endpoint replies to this page are delivered to.
  pub fn reply_target(&self) -> Arc<dyn ReplyTarget> {
    self.port.clone()
  }

  /// Create or replace the shadow file at `path`.
  ///
  /// `tier: None` leaves the choice to the worker's configured update tier.
  pub async fn update(
    &self,
    path: &str,
    body: Vec<u8>,
    headers: BTreeMap<String, String>,
    tier: Option<Tier>,
  ) -> Result<Status> {
    self
      .send(Command::Update {
        path: path.to_string(),
        headers,
        body,
        tier,
      })
      .await
  }

  /// Remove `path` from `tier`, or from every tier.
  pub async fn delete(&self, path: &str, tier: Option<Tier>) -> Result<Status> {
    self
      .send(Command::Delete {
        path: path.to_string(),
        tier,
      })
      .await
  }

  pub async fn exists(&self, path: &str) -> Result<bool> {
    let status = self
      .send(Command::Exists {
        path: path.to_string(),
      })
      .await?;
    Ok(status == Status::Success)
  }

  async fn send(&self, command: Command) -> Result<Status> {
    let id = format!("sf-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
    let (waiter, reply) = oneshot::channel();
    self
      .port
      .pending
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .insert(id.clone(), waiter);

    let data = serde_json::to_value(PageMessage::new(id.clone(), command))
      .map_err(|e| eyre!("Failed to encode command {}: {}", id, e))?;
    let message = InboundMessage {
      data,
      origin: self.origin.clone(),
    };
    if let Err(e) = self.host.post_message(message, self.reply_target()) {
      self.forget(&id);
      return Err(e);
    }

    match tokio::time::timeout(self.reply_timeout, reply).await {
      Ok(Ok(status)) => Ok(status),
      Ok(Err(_)) => Err(eyre!("Worker dropped command {} without replying", id)),
      Err(_) => {
        self.forget(&id);
        Err(eyre!(
          "No reply to command {} within {:?}",
          id,
          self.reply_timeout
        ))
      }
    }
  }

  fn forget(&self, id: &str) {
    if let Ok(mut pending) = self.port.pending.lock() {
      pending.remove(id);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::protocol::WorkerMessage;
  use serde_json::json;

  fn port() -> PagePort {
    PagePort {
      pending: Mutex::new(HashMap::new()),
    }
  }

  #[tokio::test]
  async fn test_port_routes_reply_by_id() {
    let port = port();
    let (tx, rx) = oneshot::channel();
    port.pending.lock().unwrap().insert("sf-1".to_string(), tx);

    let reply = serde_json::to_value(WorkerMessage::new("sf-1", Status::Fail)).unwrap();
    port.post_message(reply).unwrap();

    assert_eq!(rx.await.unwrap(), Status::Fail);
    assert!(port.pending.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_port_ignores_foreign_and_unknown_replies() {
    let port = port();
    let (tx, mut rx) = oneshot::channel();
    port.pending.lock().unwrap().insert("sf-1".to_string(), tx);

    port.post_message(json!({ "id": "sf-1", "status": "success" })).unwrap();
    let other = serde_json::to_value(WorkerMessage::new("sf-2", Status::Success)).unwrap();
    port.post_message(other).unwrap();

    assert!(rx.try_recv().is_err());
    assert_eq!(port.pending.lock().unwrap().len(), 1);
  }
}
