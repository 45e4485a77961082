//! Model trait and the declared metadata each model supplies.
//!
//! A model describes itself with a [`ModelDefinition`]: either a list of
//! annotated fields (the usual case) or a pre-built column list. The Schema
//! Mapper turns that definition into a [`crate::Schema`] once at registration.

use serde::{de::DeserializeOwned, Serialize};

use crate::schema::Col;
use crate::{StashResult, Value, ValueKind};

/// Sort direction for ordered fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }

    /// Parse a direction case-insensitively. Returns `None` for anything
    /// other than `asc`/`desc`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "ASC" => Some(SortDirection::Asc),
            "DESC" => Some(SortDirection::Desc),
            _ => None,
        }
    }
}

/// An application entity persisted by the CRUD Engine.
///
/// Implementations expose their properties by name through [`Model::property`]
/// and [`Model::set_property`]; the set of names is fixed by
/// [`Model::definition`].
pub trait Model: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Declared metadata used to build the table schema.
    fn definition() -> ModelDefinition;

    fn id(&self) -> Option<i64>;

    fn set_id(&mut self, id: i64);

    /// Whether the model was given an id up front and still needs its first insert.
    fn is_new_insert(&self) -> bool {
        false
    }

    fn set_new_insert(&mut self, _new_insert: bool) {}

    fn is_deleted(&self) -> bool;

    fn set_deleted(&mut self, deleted: bool);

    fn last_modified_millis(&self) -> i64 {
        0
    }

    fn set_last_modified_millis(&mut self, _millis: i64) {}

    /// Read a property. `None` means the model has no property of that name;
    /// an unset property is `Some(Value::Null)`.
    fn property(&self, name: &str) -> Option<Value>;

    /// Write a property. Unknown names and incompatible values are usage errors.
    fn set_property(&mut self, name: &str, value: Value) -> StashResult<()>;

    /// Name used in error messages and as the registry key.
    fn model_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// How a property is exposed on the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Accessor {
    /// A regular getter.
    #[default]
    Get,
    /// A boolean-style accessor (`is_active`). Only valid on `Bool` properties.
    Is,
}

/// Column attributes attached to a persisted property.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnAttrs {
    /// Explicit column name; defaults to the lowercased property name.
    pub name: Option<String>,
    /// Explicit database type; otherwise inferred from the property kind.
    pub db_type: Option<String>,
    pub nullable: bool,
    pub unique: bool,
    pub updateable: bool,
    pub insertable: bool,
    /// Length bound for string columns; 0 means unset.
    pub length: u32,
}

impl Default for ColumnAttrs {
    fn default() -> Self {
        Self {
            name: None,
            db_type: None,
            nullable: true,
            unique: false,
            updateable: true,
            insertable: true,
            length: 0,
        }
    }
}

/// One declared property of a model.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub property: String,
    pub kind: ValueKind,
    pub accessor: Accessor,
    /// `None` marks a property that is not persisted.
    pub column: Option<ColumnAttrs>,
    pub converter: Option<String>,
    pub alternative_key: bool,
    pub unique_key: bool,
}

impl FieldDef {
    /// A persisted column with default attributes.
    pub fn column(property: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            property: property.into(),
            kind,
            accessor: Accessor::Get,
            column: Some(ColumnAttrs::default()),
            converter: None,
            alternative_key: false,
            unique_key: false,
        }
    }

    /// A boolean-style persisted column.
    pub fn flag(property: impl Into<String>) -> Self {
        Self {
            accessor: Accessor::Is,
            ..Self::column(property, ValueKind::Bool)
        }
    }

    /// A property that exists on the model but is not persisted.
    pub fn transient(property: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            column: None,
            ..Self::column(property, kind)
        }
    }

    pub fn with_accessor(mut self, accessor: Accessor) -> Self {
        self.accessor = accessor;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.attrs_mut().name = Some(name.into());
        self
    }

    pub fn db_type(mut self, db_type: impl Into<String>) -> Self {
        self.attrs_mut().db_type = Some(db_type.into());
        self
    }

    pub fn not_null(mut self) -> Self {
        self.attrs_mut().nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.attrs_mut().unique = true;
        self
    }

    pub fn length(mut self, length: u32) -> Self {
        self.attrs_mut().length = length;
        self
    }

    pub fn read_only(mut self) -> Self {
        let attrs = self.attrs_mut();
        attrs.updateable = false;
        attrs.insertable = false;
        self
    }

    pub fn updateable(mut self, updateable: bool) -> Self {
        self.attrs_mut().updateable = updateable;
        self
    }

    pub fn insertable(mut self, insertable: bool) -> Self {
        self.attrs_mut().insertable = insertable;
        self
    }

    pub fn converter(mut self, name: impl Into<String>) -> Self {
        self.converter = Some(name.into());
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

    fn attrs_mut(&mut self) -> &mut ColumnAttrs {
        self.column.get_or_insert_with(ColumnAttrs::default)
    }
}

/// Field metadata: per-property annotations or a pre-built column list.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldSource {
    Annotated(Vec<FieldDef>),
    Prebuilt(Vec<Col>),
}

/// Everything a model declares about its table.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDefinition {
    pub table: String,
    pub fields: FieldSource,
    /// Raw key clauses appended to generated `CREATE TABLE` statements.
    pub extra_key_definitions: Vec<String>,
    pub default_sort: Option<(String, SortDirection)>,
}

impl ModelDefinition {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            fields: FieldSource::Annotated(Vec::new()),
            extra_key_definitions: Vec::new(),
            default_sort: None,
        }
    }

    pub fn prebuilt(table: impl Into<String>, columns: Vec<Col>) -> Self {
        Self {
            fields: FieldSource::Prebuilt(columns),
            ..Self::table(table)
        }
    }

    /// Append an annotated field. Ignored for pre-built definitions.
    pub fn field(mut self, field: FieldDef) -> Self {
        if let FieldSource::Annotated(fields) = &mut self.fields {
            fields.push(field);
        }
        self
    }

    pub fn extra_key(mut self, definition: impl Into<String>) -> Self {
        self.extra_key_definitions.push(definition.into());
        self
    }

    pub fn default_sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.default_sort = Some((field.into(), direction));
        self
    }
}
