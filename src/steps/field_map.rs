use serde_json::{Map, Value};

use super::{MigrationStep, SourceDocument, TransformError};

/// Declarative step: copy the legacy object, rename and drop fields, and
/// record the legacy id. Documents matching any skip rule are left behind.
#[derive(Debug, Clone)]
pub struct FieldMapStep {
    name: String,
    source: String,
    target: String,
    legacy: Vec<String>,
    renames: Vec<(String, String)>,
    dropped: Vec<String>,
    required: Vec<String>,
    skip_rules: Vec<(String, Value)>,
}

impl FieldMapStep {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        let source = source.into();
        Self {
            name: name.into(),
            legacy: vec![source.clone()],
            source,
            target: target.into(),
            renames: Vec::new(),
            dropped: Vec::new(),
            required: Vec::new(),
            skip_rules: Vec::new(),
        }
    }

    pub fn rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.renames.push((from.into(), to.into()));
        self
    }

    pub fn drop_field(mut self, field: impl Into<String>) -> Self {
        self.dropped.push(field.into());
        self
    }

    /// Fail the document (counted as an error) when `field` is absent or null.
    pub fn require(mut self, field: impl Into<String>) -> Self {
        self.required.push(field.into());
        self
    }

    pub fn skip_when(mut self, field: impl Into<String>, equals: Value) -> Self {
        self.skip_rules.push((field.into(), equals));
        self
    }

    /// Another legacy collection to remove on cleanup besides the source.
    pub fn also_drop(mut self, collection: impl Into<String>) -> Self {
        self.legacy.push(collection.into());
        self
    }

    fn object<'a>(&self, doc: &'a SourceDocument) -> Result<&'a Map<String, Value>, TransformError> {
        doc.body.as_object().ok_or(TransformError::NotAnObject)
    }
}

impl MigrationStep for FieldMapStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_collection(&self) -> &str {
        &self.source
    }

    fn target_collection(&self) -> &str {
        &self.target
    }

    fn legacy_collections(&self) -> Vec<String> {
        self.legacy.clone()
    }

    fn natural_key(&self, doc: &SourceDocument) -> Result<String, TransformError> {
        if doc.id.trim().is_empty() {
            return Err(TransformError::MissingField("id".into()));
        }
        Ok(format!("{}:{}", self.name, doc.id))
    }

    fn transform(&self, doc: &SourceDocument) -> Result<Option<Value>, TransformError> {
        let source = self.object(doc)?;

        if self
            .skip_rules
            .iter()
            .any(|(field, equals)| source.get(field) == Some(equals))
        {
            return Ok(None);
        }

        for field in &self.required {
            match source.get(field) {
                None | Some(Value::Null) => {
                    return Err(TransformError::MissingField(field.clone()))
                }
                Some(_) => {}
            }
        }

        let mut out = source.clone();
        out.remove("_id");
        for field in &self.dropped {
            out.remove(field);
        }
        for (from, to) in &self.renames {
            if let Some(value) = out.remove(from) {
                out.insert(to.clone(), value);
            }
        }
        out.insert("legacy_id".into(), Value::String(doc.id.clone()));
        Ok(Some(Value::Object(out)))
    }
}
