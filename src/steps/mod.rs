//! Named migration steps and the static registry that orders them.
//!
//! A step maps one legacy source collection onto one target collection. The
//! registry is built once at startup; the CLI selects steps from it by name.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::error::codes;
use crate::AppError;

pub mod catalogue;
pub mod field_map;

pub use catalogue::default_registry;
pub use field_map::FieldMapStep;

/// A decoded source document handed to a step.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub id: String,
    pub body: Value,
}

impl SourceDocument {
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }
}

/// Why a single document could not be transformed or keyed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("document body is not a JSON object")]
    NotAnObject,
    #[error("required field `{0}` is missing")]
    MissingField(String),
    #[error("field `{field}` must be {expected}")]
    InvalidField {
        field: String,
        expected: &'static str,
    },
    #[error("{0}")]
    Other(String),
}

/// One named, independently executable unit of the pipeline.
pub trait MigrationStep: Send + Sync {
    /// Unique name used for `--step` selection and checkpoint keying.
    fn name(&self) -> &str;

    fn source_collection(&self) -> &str;

    fn target_collection(&self) -> &str;

    /// Collections dropped by `--drop-old` once every requested step completed.
    fn legacy_collections(&self) -> Vec<String> {
        vec![self.source_collection().to_string()]
    }

    /// Deterministic target id for `doc`; duplicate detection compares on it.
    fn natural_key(&self, doc: &SourceDocument) -> Result<String, TransformError>;

    /// Map `doc` to its target shape. `Ok(None)` skips the document.
    fn transform(&self, doc: &SourceDocument) -> Result<Option<Value>, TransformError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("step name must not be empty")]
    EmptyName,
    #[error("step `{0}` is registered twice")]
    DuplicateName(String),
    #[error("unknown step `{name}` (known steps: {known})")]
    UnknownStep { name: String, known: String },
}

impl From<RegistryError> for AppError {
    fn from(error: RegistryError) -> Self {
        match &error {
            RegistryError::UnknownStep { name, .. } => {
                AppError::new(codes::CONFIG_UNKNOWN_STEP, error.to_string())
                    .with_context("step", name.clone())
            }
            RegistryError::EmptyName | RegistryError::DuplicateName(_) => {
                AppError::new("STEP/INVALID_DEFINITION", error.to_string())
            }
        }
    }
}

pub type StepRef = Arc<dyn MigrationStep>;

/// Ordered list of steps, indexable by name.
#[derive(Default, Clone)]
pub struct StepRegistry {
    steps: Vec<StepRef>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S>(&mut self, step: S) -> Result<&mut Self, RegistryError>
    where
        S: MigrationStep + 'static,
    {
        self.register_arc(Arc::new(step))
    }

    pub fn register_arc(&mut self, step: StepRef) -> Result<&mut Self, RegistryError> {
        let name = step.name();
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.get(name).is_some() {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        self.steps.push(step);
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&StepRef> {
        self.steps.iter().find(|step| step.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepRef> {
        self.steps.iter()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Every step in declared order, or just `only` when given.
    pub fn select(&self, only: Option<&str>) -> Result<Vec<StepRef>, RegistryError> {
        match only {
            Some(name) => self.resolve(&[name]),
            None => Ok(self.steps.clone()),
        }
    }

    /// Look up `names` in the order given. Repeated names run once.
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<StepRef>, RegistryError> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let step = self.get(name).ok_or_else(|| RegistryError::UnknownStep {
                name: name.to_string(),
                known: self.names().join(", "),
            })?;
            if seen.insert(name) {
                out.push(step.clone());
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.names())
            .finish()
    }
}
