//! Attribute converters: bidirectional transforms between a model value and
//! a database-storable scalar.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use crate::{StashResult, StorageError, UsageError, Value};

/// Converts one property between its in-memory and its stored form.
///
/// Converters must be pure: the same input always produces the same output.
pub trait AttributeConverter: Send + Sync {
    fn name(&self) -> &str;

    /// In-memory value to stored value. Only called with non-null values.
    fn to_db(&self, value: &Value, property: &str) -> StashResult<Value>;

    /// Stored value to in-memory value.
    fn to_entity(&self, stored: &Value, property: &str) -> StashResult<Value>;
}

type ConverterFactory = Arc<dyn Fn() -> Arc<dyn AttributeConverter> + Send + Sync>;

// =============================================================================
// BUILT-IN JSON CONVERTERS
// =============================================================================

fn json_to_text(value: &Value, property: &str) -> StashResult<Value> {
    match value {
        Value::Json(json) => Ok(Value::Text(serde_json::to_string(json)?)),
        Value::Text(_) | Value::Null => Ok(value.clone()),
        other => Err(UsageError::TypeMismatch {
            property: property.to_string(),
            expected: "Json".to_string(),
            got: other.type_name().to_string(),
        }
        .into()),
    }
}

fn text_to_json(
    stored: &Value,
    property: &str,
    empty: serde_json::Value,
) -> StashResult<serde_json::Value> {
    let text = match stored {
        Value::Null => return Ok(empty),
        Value::Json(json) => return Ok(json.clone()),
        Value::Text(text) => text,
        other => {
            return Err(StorageError::Conversion {
                column: property.to_string(),
                reason: format!("expected text, got {}", other.type_name()),
            }
            .into())
        }
    };
    if text.trim().is_empty() {
        return Ok(empty);
    }
    serde_json::from_str(text).map_err(|e| {
        StorageError::Conversion {
            column: property.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Stores a JSON object as text. Empty text reads back as `{}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonMapConverter;

impl AttributeConverter for JsonMapConverter {
    fn name(&self) -> &str {
        "JsonMapConverter"
    }

    fn to_db(&self, value: &Value, property: &str) -> StashResult<Value> {
        json_to_text(value, property)
    }

    fn to_entity(&self, stored: &Value, property: &str) -> StashResult<Value> {
        let empty = serde_json::Value::Object(serde_json::Map::new());
        text_to_json(stored, property, empty).map(Value::Json)
    }
}

/// Stores a JSON array as text. Empty text reads back as `[]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonListConverter;

impl AttributeConverter for JsonListConverter {
    fn name(&self) -> &str {
        "JsonListConverter"
    }

    fn to_db(&self, value: &Value, property: &str) -> StashResult<Value> {
        json_to_text(value, property)
    }

    fn to_entity(&self, stored: &Value, property: &str) -> StashResult<Value> {
        text_to_json(stored, property, serde_json::Value::Array(Vec::new())).map(Value::Json)
    }
}

/// Like [`JsonListConverter`] but drops duplicate elements on write,
/// keeping the first occurrence.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSetConverter;

impl AttributeConverter for JsonSetConverter {
    fn name(&self) -> &str {
        "JsonSetConverter"
    }

    fn to_db(&self, value: &Value, property: &str) -> StashResult<Value> {
        if let Value::Json(serde_json::Value::Array(items)) = value {
            let mut unique: Vec<serde_json::Value> = Vec::with_capacity(items.len());
            for item in items {
                if !unique.contains(item) {
                    unique.push(item.clone());
                }
            }
            return Ok(Value::Text(serde_json::to_string(&unique)?));
        }
        json_to_text(value, property)
    }

    fn to_entity(&self, stored: &Value, property: &str) -> StashResult<Value> {
        text_to_json(stored, property, serde_json::Value::Array(Vec::new())).map(Value::Json)
    }
}

/// Stores any JSON value as text. Empty text reads back as null.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonObjectConverter;

impl AttributeConverter for JsonObjectConverter {
    fn name(&self) -> &str {
        "JsonObjectConverter"
    }

    fn to_db(&self, value: &Value, property: &str) -> StashResult<Value> {
        json_to_text(value, property)
    }

    fn to_entity(&self, stored: &Value, property: &str) -> StashResult<Value> {
        let json = text_to_json(stored, property, serde_json::Value::Null)?;
        Ok(if json.is_null() {
            Value::Null
        } else {
            Value::Json(json)
        })
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Name to converter registry.
///
/// Factories are registered up front; each converter is instantiated on first
/// use and cached by name for the life of the registry.
pub struct ConverterRegistry {
    factories: DashMap<String, ConverterFactory>,
    instances: DashMap<String, Arc<dyn AttributeConverter>>,
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterRegistry")
            .field("factories", &self.factories.len())
            .field("instances", &self.instances.len())
            .finish()
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ConverterRegistry {
    /// An empty registry with no converters at all.
    pub fn empty() -> Self {
        Self {
            factories: DashMap::new(),
            instances: DashMap::new(),
        }
    }

    /// A registry preloaded with the JSON converters.
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        registry.register("JsonMapConverter", || JsonMapConverter);
        registry.register("JsonListConverter", || JsonListConverter);
        registry.register("JsonSetConverter", || JsonSetConverter);
        registry.register("JsonObjectConverter", || JsonObjectConverter);
        registry
    }

    /// Register a factory under `name`. A cached instance of the same name is dropped.
    pub fn register<C, F>(&self, name: impl Into<String>, factory: F)
    where
        C: AttributeConverter + 'static,
        F: Fn() -> C + Send + Sync + 'static,
    {
        let name = name.into();
        self.instances.remove(&name);
        self.factories.insert(
            name,
            Arc::new(move || Arc::new(factory()) as Arc<dyn AttributeConverter>),
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn get(&self, name: &str) -> StashResult<Arc<dyn AttributeConverter>> {
        if let Some(instance) = self.instances.get(name) {
            return Ok(instance.value().clone());
        }
        let factory = self
            .factories
            .get(name)
            .map(|f| f.value().clone())
            .ok_or_else(|| UsageError::ConverterNotFound {
                name: name.to_string(),
            })?;
        let instance = self
            .instances
            .entry(name.to_string())
            .or_insert_with(|| factory())
            .value()
            .clone();
        tracing::trace!(converter = name, "Instantiated converter");
        Ok(instance)
    }
}
