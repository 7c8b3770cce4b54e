//! Client facade: registers the background context and exposes readiness.

use async_trait::async_trait;
use color_eyre::Result;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::info;
use url::Url;

use crate::error::ClientError;

/// Lifecycle state of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Installing,
  Active,
}

impl WorkerState {
  pub fn as_str(self) -> &'static str {
    match self {
      WorkerState::Installing => "installing",
      WorkerState::Active => "active",
    }
  }
}

/// A worker registration as reported by the registration facility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
  pub scope: Url,
  pub script_url: Url,
  pub state: WorkerState,
}

/// Platform facility that registers and activates background contexts.
#[async_trait]
pub trait Registrar: Send + Sync {
  fn is_supported(&self) -> bool;

  /// Registration controlling `url`, if any.
  async fn get_registration(&self, url: &Url) -> Result<Option<Registration>>;

  async fn get_registrations(&self) -> Result<Vec<Registration>>;

  async fn register(&self, script_url: &Url, scope: &Url) -> Result<Registration>;

  /// Resolves once `registration` has reached [`WorkerState::Active`].
  async fn wait_active(&self, registration: &Registration) -> Result<()>;

  /// Returns whether a registration existed at `scope`.
  async fn unregister(&self, scope: &Url) -> Result<bool>;
}

/// Options for [`ShadowFiles::register`].
#[derive(Debug, Clone)]
pub struct RegisterOptions {
  /// Worker script, relative to the page origin or absolute
  pub script_url: String,
  /// Defaults to `/`
  pub scope: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
  Pending,
  Active,
  Failed(String),
}

/// Foreground entry point. Each instance owns its own readiness signal.
pub struct ShadowFiles<R: Registrar> {
  registrar: R,
  origin: Url,
  /// Unset until the first `register` call
  ready: Mutex<Option<Arc<watch::Sender<Readiness>>>>,
}

impl<R: Registrar> ShadowFiles<R> {
  pub fn new(registrar: R, origin: Url) -> Self {
    Self {
      registrar,
      origin,
      ready: Mutex::new(None),
    }
  }

  pub fn registrar(&self) -> &R {
    &self.registrar
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  /// Resolve a possibly relative scope against the origin. Empty means `/`.
  pub fn normalize_scope(&self, scope: Option<&str>) -> Result<Url, ClientError> {
    let scope = match scope {
      Some(s) if !s.trim().is_empty() => s.trim(),
      _ => "/",
    };
    Ok(self.origin.join(scope)?)
  }

  /// Register the worker script at `options.scope` and wait for activation.
  ///
  /// Fails without touching the platform when the environment has no
  /// support, or when a registration already exists at the same scope.
  pub async fn register(&self, options: RegisterOptions) -> Result<Registration, ClientError> {
    if !self.registrar.is_supported() {
      return Err(ClientError::Unsupported);
    }

    let scope = self.normalize_scope(options.scope.as_deref())?;
    let script_url = self.origin.join(&options.script_url)?;

    // A facade that is already ready stays ready; only a fresh or
    // previously failed signal takes this attempt's result.
    let claim = self.claim_signal();
    let outcome = self.activate(&script_url, &scope).await;
    claim.settle(match &outcome {
      Ok(_) => Readiness::Active,
      Err(e) => Readiness::Failed(e.to_string()),
    });

    let registration = outcome?;
    info!(scope = %registration.scope, script = %registration.script_url, "Worker active");
    Ok(registration)
  }

  fn claim_signal(&self) -> Claim {
    let mut slot = self.ready.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(existing) = slot.as_ref() {
      if !matches!(*existing.borrow(), Readiness::Failed(_)) {
        return Claim { signal: None };
      }
    }
    let (signal, _) = watch::channel(Readiness::Pending);
    let signal = Arc::new(signal);
    *slot = Some(Arc::clone(&signal));
    Claim {
      signal: Some(signal),
    }
  }

  async fn activate(&self, script_url: &Url, scope: &Url) -> Result<Registration, ClientError> {
    if let Some(existing) = self
      .registrar
      .get_registration(scope)
      .await
      .map_err(platform)?
    {
      if &existing.scope == scope {
        return Err(ClientError::AlreadyRegistered(scope.clone()));
      }
    }

    let registrations = self.registrar.get_registrations().await.map_err(platform)?;
    if registrations.iter().any(|r| &r.scope == scope) {
      return Err(ClientError::AlreadyRegistered(scope.clone()));
    }

    let registration = self
      .registrar
      .register(script_url, scope)
      .await
      .map_err(platform)?;
    self
      .registrar
      .wait_active(&registration)
      .await
      .map_err(platform)?;

    Ok(Registration {
      state: WorkerState::Active,
      ..registration
    })
  }

  /// Resolves once the registration started by [`register`](Self::register)
  /// is active.
  ///
  /// Fails immediately if `register` was never called on this instance,
  /// and with the registration's error if it did not succeed.
  pub async fn ready(&self) -> Result<(), ClientError> {
    let mut ready = self
      .ready
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .as_ref()
      .map(|signal| signal.subscribe())
      .ok_or(ClientError::NotRegistered)?;

    let outcome = ready
      .wait_for(|state| *state != Readiness::Pending)
      .await
      .map(|state| (*state).clone())
      .map_err(|_| ClientError::Registration("registration was abandoned".to_string()))?;

    match outcome {
      Readiness::Failed(reason) => Err(ClientError::Registration(reason)),
      _ => Ok(()),
    }
  }
}

/// A readiness signal owned by one `register` call. If the call is dropped
/// before settling it, waiters see the registration as abandoned.
struct Claim {
  signal: Option<Arc<watch::Sender<Readiness>>>,
}

impl Claim {
  fn settle(mut self, readiness: Readiness) {
    if let Some(signal) = self.signal.take() {
      signal.send_replace(readiness);
    }
  }
}

impl Drop for Claim {
  fn drop(&mut self) {
    if let Some(signal) = self.signal.take() {
      signal.send_replace(Readiness::Failed(
        "registration was abandoned".to_string(),
      ));
    }
  }
}

fn platform(e: color_eyre::Report) -> ClientError {
  ClientError::Registration(format!("{:#}", e))
}
