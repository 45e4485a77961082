//! Schema Mapper: turns a model's declared metadata into a table schema.

use std::any::TypeId;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::model::{Accessor, FieldSource, Model, ModelDefinition, SortDirection};
use crate::{ConfigError, StashResult, UsageError, Value, ValueKind};

/// Name of the surrogate primary key column present on every managed table.
pub const ID_COLUMN: &str = "id";

/// Server-maintained update timestamp present on every managed table.
pub const ROW_UPDATED_AT: &str = "row_updated_at";

/// Default length for string columns with no explicit bound.
const DEFAULT_VARCHAR_LENGTH: u32 = 250;

// =============================================================================
// COLUMN
// =============================================================================

/// One persisted field of a schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Col {
    /// Database column name.
    pub name: String,
    /// Model property the column reads from and writes to.
    pub property: String,
    pub kind: ValueKind,
    /// Explicit database type. Inferred from `kind` when unset.
    pub db_type: Option<String>,
    pub nullable: bool,
    pub unique_key: bool,
    pub alternative_key: bool,
    pub updateable: bool,
    pub insertable: bool,
    pub converter: Option<String>,
    /// Used for DDL and for backfilling null properties on insert and read.
    pub default_value: Option<Value>,
    /// 0 means unset.
    pub length: u32,
}

impl Col {
    /// A nullable, insertable, updateable column named after its property.
    pub fn new(property: impl Into<String>, kind: ValueKind) -> Self {
        let property = property.into();
        Self {
            name: property.to_lowercase(),
            property,
            kind,
            db_type: None,
            nullable: true,
            unique_key: false,
            alternative_key: false,
            updateable: true,
            insertable: true,
            converter: None,
            default_value: None,
            length: 0,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_db_type(mut self, db_type: impl Into<String>) -> Self {
        self.db_type = Some(db_type.into());
        self
    }

    pub fn not_null(mut self, default_value: impl Into<Value>) -> Self {
        self.nullable = false;
        self.default_value = Some(default_value.into());
        self
    }

    pub fn with_converter(mut self, name: impl Into<String>) -> Self {
        self.converter = Some(name.into());
        self
    }

    pub fn with_length(mut self, length: u32) -> Self {
        self.length = length;
        self
    }

    pub fn alternative_key(mut self) -> Self {
        self.alternative_key = true;
        self
    }

    pub fn unique_key(mut self) -> Self {
        self.unique_key = true;
        self
    }

    pub fn is_key(&self) -> bool {
        self.alternative_key || self.unique_key
    }

    /// Database type in the canonical (MySQL-style) vocabulary.
    ///
    /// An explicit type gets `(length)` appended when a length is set and the
    /// type carries neither parentheses nor a text type.
    pub fn db_type(&self) -> StashResult<String> {
        if let Some(explicit) = self.db_type.as_deref().filter(|t| !t.trim().is_empty()) {
            if self.length > 0 && !explicit.contains('(') && !explicit.contains("text") {
                return Ok(format!("{}({})", explicit, self.length));
            }
            return Ok(explicit.to_string());
        }
        let inferred = match self.kind {
            ValueKind::String => {
                let length = if self.length < 1 {
                    DEFAULT_VARCHAR_LENGTH
                } else {
                    self.length
                };
                format!("varchar({})", length)
            }
            ValueKind::Bool => "bit(1)".to_string(),
            ValueKind::Long => "bigint(20)".to_string(),
            ValueKind::Int => "int".to_string(),
            ValueKind::Float => "float".to_string(),
            ValueKind::Double => "double".to_string(),
            ValueKind::ZonedDateTime | ValueKind::LocalDateTime => "datetime".to_string(),
            ValueKind::LocalDate => "date".to_string(),
            ValueKind::List | ValueKind::Map => "longtext".to_string(),
            // Arbitrary objects only persist through a converter.
            ValueKind::Object if self.converter.is_some() => "longtext".to_string(),
            ValueKind::Enum => "varchar(30)".to_string(),
            ValueKind::Object => {
                return Err(UsageError::UnsupportedColumnType {
                    column: self.name.clone(),
                }
                .into())
            }
        };
        Ok(inferred)
    }
}

// =============================================================================
// SCHEMA
// =============================================================================

/// The relational projection of a model type.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    /// Table name, also the cache and stash bucket.
    pub name: String,
    pub model: String,
    pub columns: Vec<Col>,
    /// Columns usable for lookups and sorts.
    pub key_names: BTreeSet<String>,
    pub extra_key_definitions: Vec<String>,
    pub default_sort: Option<(String, SortDirection)>,
}

impl Schema {
    pub fn bucket(&self) -> &str {
        &self.name
    }

    pub fn column(&self, name: &str) -> Option<&Col> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_for_property(&self, property: &str) -> Option<&Col> {
        self.columns.iter().find(|c| c.property == property)
    }

    /// True for declared columns and the implicit `id`/`row_updated_at`.
    pub fn has_column(&self, name: &str) -> bool {
        name == ID_COLUMN || name == ROW_UPDATED_AT || self.column(name).is_some()
    }

    pub fn insertable_columns(&self) -> impl Iterator<Item = &Col> {
        self.columns.iter().filter(|c| c.insertable)
    }

    pub fn updateable_columns(&self) -> impl Iterator<Item = &Col> {
        self.columns.iter().filter(|c| c.updateable)
    }

    /// Sorting is only allowed on indexed columns.
    pub fn is_sortable(&self, field: &str) -> bool {
        field == ID_COLUMN || field == ROW_UPDATED_AT || self.key_names.contains(field)
    }
}

/// Build a schema for `M` from its declared definition.
///
/// Not-null columns take their default from `M::default()`; every column
/// must resolve to a property of `M`.
pub fn model_to_schema<M: Model>() -> StashResult<Schema> {
    let prototype = M::default();
    let schema = schema_from_definition(M::model_name(), M::definition(), |property| {
        prototype.property(property)
    })?;
    Ok(schema)
}

/// Build a schema from a definition, using `lookup` to read prototype values.
///
/// `lookup` returns `None` when the property does not exist.
pub fn schema_from_definition<F>(
    model: &str,
    definition: ModelDefinition,
    lookup: F,
) -> StashResult<Schema>
where
    F: Fn(&str) -> Option<Value>,
{
    if definition.table.trim().is_empty() {
        return Err(ConfigError::MissingTableName {
            model: model.to_string(),
        }
        .into());
    }

    let mut schema = Schema {
        name: definition.table.clone(),
        model: model.to_string(),
        columns: Vec::new(),
        key_names: BTreeSet::new(),
        extra_key_definitions: definition.extra_key_definitions.clone(),
        default_sort: definition.default_sort.clone(),
    };

    let columns = match definition.fields {
        FieldSource::Prebuilt(columns) => columns,
        FieldSource::Annotated(fields) => {
            let mut columns = Vec::with_capacity(fields.len());
            for field in fields {
                if field.accessor == Accessor::Is && field.kind != ValueKind::Bool {
                    continue;
                }
                let Some(attrs) = field.column else {
                    continue;
                };
                let name = attrs
                    .name
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| field.property.to_lowercase());
                columns.push(Col {
                    name,
                    property: field.property,
                    kind: field.kind,
                    db_type: attrs.db_type,
                    nullable: attrs.nullable,
                    unique_key: field.unique_key || attrs.unique,
                    alternative_key: field.alternative_key,
                    updateable: attrs.updateable,
                    insertable: attrs.insertable,
                    converter: field.converter,
                    default_value: None,
                    length: attrs.length,
                });
            }
            columns
        }
    };

    for mut col in columns {
        if col.name == ID_COLUMN || col.name == ROW_UPDATED_AT {
            continue;
        }
        let Some(current) = lookup(&col.property) else {
            return Err(ConfigError::UnresolvedProperty {
                model: model.to_string(),
                property: col.property.clone(),
            }
            .into());
        };
        if !col.nullable && col.default_value.is_none() {
            if current.is_null() {
                return Err(ConfigError::InvalidValue {
                    field: format!("{}.{}", schema.name, col.name),
                    value: "null".to_string(),
                    reason: "a NOT NULL column needs a non-null default".to_string(),
                }
                .into());
            }
            col.default_value = Some(current);
        }
        if col.is_key() {
            schema.key_names.insert(col.name.clone());
        }
        schema.columns.push(col);
    }

    tracing::debug!(
        table = %schema.name,
        columns = schema.columns.len(),
        "Built schema"
    );
    Ok(schema)
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Model type to schema mapping.
///
/// Populated during startup through `&mut self`, then shared behind an `Arc`
/// so lookups take no lock.
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    by_type: HashMap<TypeId, Arc<Schema>>,
    by_name: HashMap<String, Arc<Schema>>,
    order: Vec<Arc<Schema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and register the schema for `M`. Re-registering replaces the entry.
    pub fn register<M: Model>(&mut self) -> StashResult<Arc<Schema>> {
        let schema = Arc::new(model_to_schema::<M>()?);
        self.by_type.insert(TypeId::of::<M>(), schema.clone());
        self.insert_named(schema.clone());
        Ok(schema)
    }

    /// Register a schema that has no static model type (looked up by table name).
    pub fn register_schema(&mut self, schema: Schema) -> Arc<Schema> {
        let schema = Arc::new(schema);
        self.insert_named(schema.clone());
        schema
    }

    fn insert_named(&mut self, schema: Arc<Schema>) {
        self.order.retain(|s| s.name != schema.name);
        self.order.push(schema.clone());
        self.by_name.insert(schema.name.clone(), schema);
    }

    pub fn get<M: Model>(&self) -> StashResult<Arc<Schema>> {
        self.by_type.get(&TypeId::of::<M>()).cloned().ok_or_else(|| {
            UsageError::SchemaNotFound {
                model: M::model_name().to_string(),
            }
            .into()
        })
    }

    pub fn contains<M: Model>(&self) -> bool {
        self.by_type.contains_key(&TypeId::of::<M>())
    }

    pub fn by_name(&self, table: &str) -> Option<Arc<Schema>> {
        self.by_name.get(table).cloned()
    }

    /// Schemas in registration order.
    pub fn schemas(&self) -> impl Iterator<Item = &Arc<Schema>> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
