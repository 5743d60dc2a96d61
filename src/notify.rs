//! Dispatch target abstractions and notifier backends.
//!
//! This module defines a Tower-compatible layer used to submit a
//! [`DispatchJob`] to the notification provider. It is built around
//! Tower's `Service` abstraction, enabling middleware composition while
//! keeping notifier implementations backend-agnostic.
//!
//! Every failure that comes out of this layer is already classified as
//! either **retryable** (the provider answered with a server-side error,
//! or the call never completed: network error, timeout) or **fatal**
//! (anything else, typically a client-side rejection that retrying cannot
//! fix). No outcome leaves this layer unclassified.
//!
//! ## Key components
//!
//! - [`Notify`]: public-facing wrapper implementing `tower::Service`
//! - [`NotifierService`]: adapter from a [`Notifier`] to a Tower service
//! - [`Notifier`]: trait implemented by concrete notifier backends
//! - [`DispatchError`]: classified error type with tracing context

pub mod inmemory;

#[cfg(feature = "http")]
pub mod http;

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use tower::Service;
use tracing_error::SpanTrace;

use crate::job::DispatchJob;

pub use inmemory::InMemoryNotifier;

/// What the provider said on the success path.
///
/// The body is only consulted for informational logging; the status code
/// is retained for the same purpose.
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub status: u16,
    pub body: serde_json::Value,
}

impl Receipt {
    /// A bare 2xx acknowledgement with no body.
    pub fn accepted() -> Self {
        Self {
            status: 200,
            body: serde_json::Value::Null,
        }
    }
}

/// Classification of a failed dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Worth trying again after a backoff delay.
    Retryable,
    /// Retrying is wasted work; the job goes straight to the dead set.
    Fatal,
}

/// Error returned by a dispatch attempt.
///
/// Carries the classified [`Outcome`], the underlying cause, and a
/// tracing span backtrace for diagnostics.
#[derive(Debug)]
pub struct DispatchError {
    context: SpanTrace,
    outcome: Outcome,
    source: tower::BoxError,
}

impl DispatchError {
    /// A failure the backoff policy may recover from.
    pub fn retryable(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            outcome: Outcome::Retryable,
            source: err.into(),
        }
    }

    /// A failure retrying cannot fix.
    pub fn fatal(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            outcome: Outcome::Fatal,
            source: err.into(),
        }
    }

    /// The classified outcome of this failure.
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Normalize an error coming out of the service stack.
    ///
    /// A [`DispatchError`] produced by the notifier passes through with
    /// its classification intact. Anything else originates from the stack
    /// itself (a middleware timeout, a broken connection before the
    /// request completed) and classifies as retryable: the call never
    /// reached a verdict from the provider.
    fn normalize(err: tower::BoxError) -> Self {
        match err.downcast::<DispatchError>() {
            Ok(err) => *err,
            Err(err) => Self::retryable(err),
        }
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.outcome {
            Outcome::Retryable => write!(f, "retryable dispatch failure: {}", self.source),
            Outcome::Fatal => write!(f, "fatal dispatch failure: {}", self.source),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

impl DispatchError {
    /// Span backtrace captured where the error was classified.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.context
    }
}

/// Generic Tower-compatible dispatch wrapper.
///
/// `Notify` is the worker's entry point for submitting jobs. It wraps an
/// underlying Tower `Service`, normalizes all errors into
/// [`DispatchError`], and supports middleware via [`Notify::layer`].
#[derive(Clone)]
pub struct Notify<S> {
    service: S,
}

impl<D> Notify<NotifierService<D>> {
    /// Create a dispatch wrapper from a concrete notifier backend.
    pub fn new(notifier: D) -> Self {
        Self {
            service: NotifierService::new(notifier),
        }
    }
}

impl<S> Notify<S> {
    /// Apply a Tower layer to the dispatch stack.
    pub fn layer<L>(self, layer: L) -> Notify<L::Service>
    where
        L: tower::Layer<S>,
    {
        Notify {
            service: layer.layer(self.service),
        }
    }

    /// Submit one job and wait for its classified outcome.
    pub async fn send(&mut self, job: DispatchJob) -> Result<Receipt, DispatchError>
    where
        S: Service<DispatchJob, Response = Receipt> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
    {
        let mut service = self.service.clone();
        service
            .call(job)
            .await
            .map_err(|e| DispatchError::normalize(e.into()))
    }
}

/// `tower::Service` implementation for `Notify`.
impl<S> Service<DispatchJob> for Notify<S>
where
    S: Service<DispatchJob, Response = Receipt> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
{
    type Response = Receipt;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<Receipt, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service
            .poll_ready(cx)
            .map_err(|e| DispatchError::normalize(e.into()))
    }

    fn call(&mut self, req: DispatchJob) -> Self::Future {
        let mut service = self.service.clone();
        Box::pin(async move {
            service
                .call(req)
                .await
                .map_err(|e| DispatchError::normalize(e.into()))
        })
    }
}

/// Tower service adapter for a [`Notifier`] backend.
#[derive(Clone)]
pub struct NotifierService<D> {
    notifier: D,
}

impl<D> NotifierService<D> {
    /// Create a new notifier service from a backend.
    pub fn new(notifier: D) -> Self {
        Self { notifier }
    }
}

/// `tower::Service` implementation delegating to a [`Notifier`].
impl<D> Service<DispatchJob> for NotifierService<D>
where
    D: Notifier + Clone + Send + 'static,
{
    type Response = Receipt;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<Receipt, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: DispatchJob) -> Self::Future {
        let mut notifier = self.notifier.clone();
        Box::pin(async move { notifier.dispatch(req).await.map_err(Into::into) })
    }
}

/// Trait implemented by concrete notifier backends.
///
/// A notifier submits one job to the provider and reports a classified
/// result. Every error it returns must convert into [`DispatchError`],
/// which is where the retryable/fatal decision is made.
#[async_trait::async_trait]
pub trait Notifier {
    /// Backend-specific error type.
    type Error: Into<DispatchError> + Send;

    /// Submit one job's payload to the provider.
    async fn dispatch(&mut self, job: DispatchJob) -> Result<Receipt, Self::Error>;
}
