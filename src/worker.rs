//! The background context: activation, request interception and commands.

use async_trait::async_trait;
use color_eyre::Result;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, StoredResponse, Tier, TierManager};
use crate::controller::ShadowStoreController;
use crate::interceptor::{Interceptor, Request};
use crate::protocol::{self, Propagation, ReplyTarget};

/// A structured message as delivered by the transport.
#[derive(Debug, Clone)]
pub struct InboundMessage {
  pub data: Value,
  /// Origin of the sender; command paths resolve against it
  pub origin: Url,
}

/// What a background context did with an inbound message.
pub enum MessageDisposition {
  /// Not ours. Other listeners should see it.
  Ignored,
  /// Ours but unusable. Dropped without a reply.
  Rejected,
  /// Ours. The future performs the command and sends the reply.
  Handled(BoxFuture<'static, ()>),
}

impl MessageDisposition {
  pub fn propagation(&self) -> Propagation {
    match self {
      MessageDisposition::Ignored => Propagation::Continue,
      MessageDisposition::Rejected | MessageDisposition::Handled(_) => Propagation::Stop,
    }
  }
}

/// Hooks a host environment drives. One implementation per binding.
#[async_trait]
pub trait BackgroundContext: Send + Sync + 'static {
  /// Called once when this generation of the context becomes active.
  async fn on_activate(&self) -> Result<()>;

  /// Decide whether to substitute `request`. `Ok(None)` falls through.
  async fn on_request(&self, request: &Request) -> Result<Option<StoredResponse>>;

  /// Validate a message synchronously. Accepted messages are handled by the
  /// returned future, which replies to `reply_to`.
  fn on_message(
    &self,
    message: &InboundMessage,
    reply_to: Arc<dyn ReplyTarget>,
  ) -> MessageDisposition;
}

/// The shadow file worker.
pub struct ShadowWorker<S: CacheStorage> {
  tiers: TierManager<S>,
  interceptor: Interceptor<S>,
  controller: ShadowStoreController<S>,
}

impl<S: CacheStorage + 'static> ShadowWorker<S> {
  /// `update_tier` is where `update` commands land when they name no tier.
  pub fn new(storage: S, update_tier: Tier) -> Self {
    let tiers = TierManager::new(storage);
    Self {
      interceptor: Interceptor::new(tiers.clone()),
      controller: ShadowStoreController::new(tiers.clone(), update_tier),
      tiers,
    }
  }

  pub fn tiers(&self) -> &TierManager<S> {
    &self.tiers
  }
}

#[async_trait]
impl<S: CacheStorage + 'static> BackgroundContext for ShadowWorker<S> {
  async fn on_activate(&self) -> Result<()> {
    // Ephemeral shadow files do not survive a new generation.
    self.tiers.purge(Tier::Ephemeral).await?;
    let reclaimed = self.tiers.reclaim_orphans().await?;
    info!(
      reclaimed = reclaimed.len(),
      update_tier = %self.controller.update_tier(),
      "Shadow worker activated"
    );
    Ok(())
  }

  async fn on_request(&self, request: &Request) -> Result<Option<StoredResponse>> {
    self.interceptor.intercept(request).await
  }

  fn on_message(
    &self,
    message: &InboundMessage,
    reply_to: Arc<dyn ReplyTarget>,
  ) -> MessageDisposition {
    let page_message = match protocol::accept_page_message(&message.data) {
      Ok(page_message) => page_message,
      Err(rejection) if rejection.is_foreign() => {
        debug!(%rejection, "Ignoring foreign message");
        return MessageDisposition::Ignored;
      }
      Err(rejection) => {
        debug!(%rejection, "Dropping malformed message");
        return MessageDisposition::Rejected;
      }
    };

    let controller = self.controller.clone();
    let origin = message.origin.clone();
    MessageDisposition::Handled(Box::pin(async move {
      let status = controller.handle(&origin, &page_message.command).await;
      if let Err(e) = protocol::reply(reply_to.as_ref(), &page_message.id, status) {
        warn!(id = %page_message.id, error = %e, "Failed to deliver reply");
      }
    }))
  }
}
