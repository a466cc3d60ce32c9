//! JobRegistry - job kind -> factory の対応表
//!
//! プロセス全体の暗黙のテーブルではなく、host application が起動時に組み立てて
//! `JobManager` に渡す明示的なオブジェクト。

use std::collections::HashMap;
use std::sync::Arc;

use super::factory::{FnFactory, JobFactory, TypedFactory};
use super::{Job, TypedJob};
use crate::domain::{JobFailure, JobKind, JobRecord, Payload};

/// Capability table: which kinds this process can run, and how to build them.
#[derive(Default, Clone)]
pub struct JobRegistry {
    factories: HashMap<JobKind, Arc<dyn JobFactory>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("factory for job kind '{0}' is already registered")]
    AlreadyRegistered(JobKind),

    #[error("no factory registered for job kind '{0}'")]
    UnknownKind(JobKind),

    #[error("could not build job kind '{kind}': {cause}")]
    Build { kind: JobKind, cause: JobFailure },
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a typed job; its payload is decoded with serde.
    pub fn register<J: TypedJob>(&mut self) -> Result<&mut Self, RegistryError> {
        self.register_factory(J::kind(), TypedFactory::<J>::new())
    }

    /// Register a closure that builds the job from its payload.
    pub fn register_fn<F>(&mut self, kind: impl Into<JobKind>, f: F) -> Result<&mut Self, RegistryError>
    where
        F: Fn(&Payload) -> Result<Arc<dyn Job>, JobFailure> + Send + Sync + 'static,
    {
        self.register_factory(kind.into(), FnFactory::new(f))
    }

    pub fn register_factory<F: JobFactory + 'static>(
        &mut self,
        kind: JobKind,
        factory: F,
    ) -> Result<&mut Self, RegistryError> {
        if self.factories.contains_key(&kind) {
            return Err(RegistryError::AlreadyRegistered(kind));
        }
        self.factories.insert(kind, Arc::new(factory));
        Ok(self)
    }

    pub fn contains(&self, kind: &JobKind) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Instantiate the job described by `record`.
    pub fn build(&self, record: &JobRecord) -> Result<Arc<dyn Job>, RegistryError> {
        let factory = self
            .factories
            .get(&record.kind)
            .ok_or_else(|| RegistryError::UnknownKind(record.kind.clone()))?;

        factory
            .build(&record.payload)
            .map_err(|cause| RegistryError::Build {
                kind: record.kind.clone(),
                cause,
            })
    }
}
