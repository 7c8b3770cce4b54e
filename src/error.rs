//! Errors surfaced to callers of the client facade.

use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
  /// The host cannot run a background context at all.
  #[error("background workers are not supported in this environment")]
  Unsupported,

  /// A worker is already registered at this exact scope. Unregister first.
  #[error("a shadow worker is already registered at {0}")]
  AlreadyRegistered(Url),

  /// `ready()` was called on a facade that never started a registration.
  #[error("ready() called before register()")]
  NotRegistered,

  #[error("invalid scope or script url: {0}")]
  InvalidUrl(#[from] url::ParseError),

  /// The registration facility itself failed.
  #[error("registration failed: {0}")]
  Registration(String),
}
