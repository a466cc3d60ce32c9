//! Job factories: payload -> runnable job.
//!
//! `TypedFactory<J>` で型付き Job を type erasure して、
//! `HashMap<JobKind, Arc<dyn JobFactory>>` に格納できるようにする。

use std::marker::PhantomData;
use std::sync::Arc;

use super::{Job, TypedJob};
use crate::domain::{JobFailure, Payload};

/// Builds a job instance from its payload alone.
pub trait JobFactory: Send + Sync {
    fn build(&self, payload: &Payload) -> Result<Arc<dyn Job>, JobFailure>;
}

/// Deserializes the payload into `J`.
pub struct TypedFactory<J: TypedJob> {
    _marker: PhantomData<fn() -> J>,
}

impl<J: TypedJob> TypedFactory<J> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<J: TypedJob> Default for TypedFactory<J> {
    fn default() -> Self {
        Self::new()
    }
}

impl<J: TypedJob> JobFactory for TypedFactory<J> {
    fn build(&self, payload: &Payload) -> Result<Arc<dyn Job>, JobFailure> {
        let job: J = serde_json::from_value(serde_json::Value::Object(payload.clone()))
            .map_err(|e| JobFailure::new(format!("payload decode for {}: {e}", J::KIND)))?;
        Ok(Arc::new(job))
    }
}

/// Closure-backed factory, for jobs that need host resources (a mailer, a
/// pool, ...) captured at registration time.
pub struct FnFactory<F> {
    f: F,
}

impl<F> FnFactory<F>
where
    F: Fn(&Payload) -> Result<Arc<dyn Job>, JobFailure> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> JobFactory for FnFactory<F>
where
    F: Fn(&Payload) -> Result<Arc<dyn Job>, JobFailure> + Send + Sync,
{
    fn build(&self, payload: &Payload) -> Result<Arc<dyn Job>, JobFailure> {
        (self.f)(payload)
    }
}
