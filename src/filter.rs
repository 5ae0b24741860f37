//! Per-call filter pipeline.
//!
//! A [`Filter`] transforms metadata, messages, and trailers as they pass
//! through a call. Every transform is asynchronous and defaults to the
//! identity. A [`FilterStack`] composes filters so the send direction runs
//! them front to back and the receive direction back to front, awaiting each
//! transform before handing its output to the next filter.

use crate::call::WriteObject;
use crate::metadata::Metadata;
use crate::status::Status;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Async transform applied to call data in both directions.
///
/// A transform that returns `Err` terminates the call with `INTERNAL` and
/// the error's details. Trailer transforms are infallible; a replacement
/// status is their only means of influence.
///
/// The send and receive directions of a call run concurrently over the
/// same filter instances, so transforms take `&self`; stateful filters
/// manage their own interior mutability.
#[async_trait]
pub trait Filter: Send + Sync {
    async fn send_metadata(&self, metadata: Metadata) -> Result<Metadata, Status> {
        Ok(metadata)
    }

    async fn send_message(&self, message: WriteObject) -> Result<WriteObject, Status> {
        Ok(message)
    }

    async fn receive_metadata(&self, metadata: Metadata) -> Result<Metadata, Status> {
        Ok(metadata)
    }

    async fn receive_message(&self, message: Bytes) -> Result<Bytes, Status> {
        Ok(message)
    }

    async fn receive_trailers(&self, status: Status) -> Status {
        status
    }
}

/// Produces one [`Filter`] per call. Factories are registered on the
/// channel; registration order fixes the stack order for every call.
pub trait FilterFactory: Send + Sync {
    fn create_filter(&self) -> Box<dyn Filter>;
}

/// Ordered composition of filters bound to a single call.
#[derive(Default)]
pub struct FilterStack {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_factories(factories: &[Arc<dyn FilterFactory>]) -> Self {
        Self {
            filters: factories.iter().map(|f| f.create_filter()).collect(),
        }
    }

    pub fn push(&mut self, filter: Box<dyn Filter>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

// The stack is itself a filter, so nesting composes.
#[async_trait]
impl Filter for FilterStack {
    async fn send_metadata(&self, mut metadata: Metadata) -> Result<Metadata, Status> {
        for filter in self.filters.iter() {
            metadata = filter.send_metadata(metadata).await?;
        }
        Ok(metadata)
    }

    async fn send_message(&self, mut message: WriteObject) -> Result<WriteObject, Status> {
        for filter in self.filters.iter() {
            message = filter.send_message(message).await?;
        }
        Ok(message)
    }

    async fn receive_metadata(&self, mut metadata: Metadata) -> Result<Metadata, Status> {
        for filter in self.filters.iter().rev() {
            metadata = filter.receive_metadata(metadata).await?;
        }
        Ok(metadata)
    }

    async fn receive_message(&self, mut message: Bytes) -> Result<Bytes, Status> {
        for filter in self.filters.iter().rev() {
            message = filter.receive_message(message).await?;
        }
        Ok(message)
    }

    async fn receive_trailers(&self, mut status: Status) -> Status {
        for filter in self.filters.iter().rev() {
            status = filter.receive_trailers(status).await;
        }
        status
    }
}
