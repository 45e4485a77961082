//! Per-column conversion between model properties and bound/stored values.

use crate::{
    ConverterRegistry, Model, Schema, StashResult, StorageError, UsageError, Value, ValueKind,
};
use crate::schema::Col;

fn read_property<M: Model>(model: &M, col: &Col) -> StashResult<Value> {
    model.property(&col.property).ok_or_else(|| {
        UsageError::UnknownProperty {
            model: M::model_name().to_string(),
            property: col.property.clone(),
        }
        .into()
    })
}

/// Write each insertable column's default onto the model where the
/// property is currently null.
pub fn backfill_defaults<M: Model>(model: &mut M, schema: &Schema) -> StashResult<()> {
    for col in schema.insertable_columns() {
        let Some(default) = &col.default_value else {
            continue;
        };
        if read_property(model, col)?.is_null() {
            model.set_property(&col.property, default.clone())?;
        }
    }
    Ok(())
}

/// Convert a model property into the value bound for its column.
///
/// Order: default backfill for null values, then the column's converter
/// (non-null values only), then timestamp and enum coercion.
pub fn convert_column_arg<M: Model>(
    model: &M,
    col: &Col,
    converters: &ConverterRegistry,
) -> StashResult<Value> {
    let mut arg = read_property(model, col)?;
    if arg.is_null() {
        if let Some(default) = &col.default_value {
            arg = default.clone();
        }
    }
    if let Some(name) = &col.converter {
        if !arg.is_null() {
            return converters.get(name)?.to_db(&arg, &col.property);
        }
        return Ok(arg);
    }
    let converted = match arg {
        Value::LocalDateTime(naive) => Value::Timestamp(naive.and_utc()),
        Value::Enum(variant) => Value::Text(variant),
        // Collections without a converter are stored as JSON text.
        Value::Json(json) if col.kind.is_collection() => {
            Value::Text(serde_json::to_string(&json)?)
        }
        other => other,
    };
    Ok(converted)
}

/// Apply a stored column value onto a model.
///
/// Runs the converter's entity side, substitutes the column default for
/// NULL, and coerces text and timestamps to the property's declared kind.
pub fn apply_column<M: Model>(
    model: &mut M,
    col: &Col,
    stored: Value,
    converters: &ConverterRegistry,
) -> StashResult<()> {
    let mut value = match &col.converter {
        Some(name) => converters.get(name)?.to_entity(&stored, &col.property)?,
        None => stored,
    };
    if value.is_null() {
        if let Some(default) = &col.default_value {
            value = default.clone();
        }
    }
    let value = match (col.kind, value) {
        (ValueKind::Enum, Value::Text(s)) => Value::Enum(s),
        (ValueKind::LocalDateTime, Value::Timestamp(t)) => Value::LocalDateTime(t.naive_utc()),
        (ValueKind::ZonedDateTime, Value::LocalDateTime(t)) => Value::Timestamp(t.and_utc()),
        (ValueKind::Long, Value::Int(i)) => Value::BigInt(i64::from(i)),
        (ValueKind::Bool, Value::Int(i)) => Value::Bool(i != 0),
        (kind, Value::Text(text)) if kind.is_collection() && col.converter.is_none() => {
            if text.trim().is_empty() {
                Value::Null
            } else {
                let json = serde_json::from_str(&text).map_err(|e| StorageError::Conversion {
                    column: col.name.clone(),
                    reason: e.to_string(),
                })?;
                Value::Json(json)
            }
        }
        (_, other) => other,
    };
    let is_enum = col.kind == ValueKind::Enum;
    match model.set_property(&col.property, value) {
        Err(err) if is_enum && err.is_usage() => {
            tracing::warn!(
                column = %col.name,
                error = %err,
                "Illegal enum value; leaving property unset"
            );
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldDef, ModelDefinition};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: Option<i64>,
        body: Option<String>,
        state: String,
        meta: serde_json::Value,
        deleted: bool,
    }

    impl Model for Note {
        fn definition() -> ModelDefinition {
            ModelDefinition::table("notes")
                .field(FieldDef::column("body", ValueKind::String))
                .field(FieldDef::column("state", ValueKind::Enum))
                .field(FieldDef::column("meta", ValueKind::Map).converter("JsonMapConverter"))
        }

        fn id(&self) -> Option<i64> {
            self.id
        }

        fn set_id(&mut self, id: i64) {
            self.id = Some(id);
        }

        fn is_deleted(&self) -> bool {
            self.deleted
        }

        fn set_deleted(&mut self, deleted: bool) {
            self.deleted = deleted;
        }

        fn property(&self, name: &str) -> Option<Value> {
            match name {
                "body" => Some(self.body.clone().into()),
                "state" => Some(Value::Enum(self.state.clone())),
                "meta" => Some(if self.meta.is_null() {
                    Value::Null
                } else {
                    Value::Json(self.meta.clone())
                }),
                _ => None,
            }
        }

        fn set_property(&mut self, name: &str, value: Value) -> StashResult<()> {
            match (name, value) {
                ("body", Value::Null) => self.body = None,
                ("body", Value::Text(s)) => self.body = Some(s),
                ("state", Value::Enum(s)) if s == "DRAFT" || s == "LIVE" => self.state = s,
                ("meta", Value::Json(v)) => self.meta = v,
                ("meta", Value::Null) => self.meta = serde_json::Value::Null,
                (property, value) => {
                    return Err(UsageError::TypeMismatch {
                        property: property.to_string(),
                        expected: "known value".to_string(),
                        got: value.type_name().to_string(),
                    }
                    .into())
                }
            }
            Ok(())
        }
    }

    fn body_with_default() -> Col {
        Col::new("body", ValueKind::String).not_null("(empty)")
    }

    #[test]
    fn test_convert_applies_default_then_passes_through() {
        let note = Note::default();
        let converters = ConverterRegistry::with_builtins();
        let arg = convert_column_arg(&note, &body_with_default(), &converters).unwrap();
        assert_eq!(arg, Value::Text("(empty)".to_string()));
    }

    #[test]
    fn test_convert_enum_to_text_and_converter() {
        let note = Note {
            state: "LIVE".to_string(),
            meta: json!({"k": 1}),
            ..Note::default()
        };
        let converters = ConverterRegistry::with_builtins();
        let state = Col::new("state", ValueKind::Enum);
        assert_eq!(
            convert_column_arg(&note, &state, &converters).unwrap(),
            Value::Text("LIVE".to_string())
        );
        let meta = Col::new("meta", ValueKind::Map).with_converter("JsonMapConverter");
        assert_eq!(
            convert_column_arg(&note, &meta, &converters).unwrap(),
            Value::Text("{\"k\":1}".to_string())
        );
    }

    #[test]
    fn test_convert_null_skips_converter() {
        let note = Note::default();
        let converters = ConverterRegistry::empty();
        let meta = Col::new("meta", ValueKind::Map).with_converter("Missing");
        assert_eq!(
            convert_column_arg(&note, &meta, &converters).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_backfill_defaults_writes_model() {
        let mut note = Note::default();
        let schema = crate::Schema {
            name: "notes".to_string(),
            model: "Note".to_string(),
            columns: vec![body_with_default()],
            key_names: Default::default(),
            extra_key_definitions: vec![],
            default_sort: None,
        };
        backfill_defaults(&mut note, &schema).unwrap();
        assert_eq!(note.body.as_deref(), Some("(empty)"));
    }

    #[test]
    fn test_apply_column_default_and_enum() {
        let converters = ConverterRegistry::with_builtins();
        let mut note = Note::default();
        apply_column(&mut note, &body_with_default(), Value::Null, &converters).unwrap();
        assert_eq!(note.body.as_deref(), Some("(empty)"));

        let state = Col::new("state", ValueKind::Enum);
        apply_column(&mut note, &state, Value::Text("DRAFT".into()), &converters).unwrap();
        assert_eq!(note.state, "DRAFT");

        // Unknown variants are logged and skipped.
        apply_column(&mut note, &state, Value::Text("BOGUS".into()), &converters).unwrap();
        assert_eq!(note.state, "DRAFT");
    }

    #[test]
    fn test_apply_column_runs_converter() {
        let converters = ConverterRegistry::with_builtins();
        let mut note = Note::default();
        let meta = Col::new("meta", ValueKind::Map).with_converter("JsonMapConverter");
        apply_column(&mut note, &meta, Value::Text("{\"a\":[1,2]}".into()), &converters).unwrap();
        assert_eq!(note.meta, json!({"a": [1, 2]}));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn round_trip(source: &Note, col: &Col, converters: &ConverterRegistry) -> Note {
            let stored = convert_column_arg(source, col, converters).unwrap();
            let mut target = Note::default();
            apply_column(&mut target, col, stored, converters).unwrap();
            target
        }

        proptest! {
            #[test]
            fn prop_text_column_round_trips(body in proptest::option::of(".{0,40}")) {
                let converters = ConverterRegistry::empty();
                let note = Note { body: body.clone(), ..Note::default() };
                let col = Col::new("body", ValueKind::String);
                prop_assert_eq!(round_trip(&note, &col, &converters).body, body);
            }

            #[test]
            fn prop_enum_column_round_trips(state in prop::sample::select(vec!["DRAFT", "LIVE"])) {
                let converters = ConverterRegistry::empty();
                let note = Note { state: state.to_string(), ..Note::default() };
                let col = Col::new("state", ValueKind::Enum);
                let stored = convert_column_arg(&note, &col, &converters).unwrap();
                prop_assert_eq!(&stored, &Value::Text(state.to_string()));
                prop_assert_eq!(round_trip(&note, &col, &converters).state, state);
            }

            #[test]
            fn prop_converted_map_round_trips(
                entries in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 1..6),
            ) {
                let converters = ConverterRegistry::with_builtins();
                let meta: serde_json::Map<String, serde_json::Value> =
                    entries.into_iter().map(|(k, v)| (k, json!(v))).collect();
                let note = Note { meta: serde_json::Value::Object(meta), ..Note::default() };
                let col = Col::new("meta", ValueKind::Map).with_converter("JsonMapConverter");
                let stored = convert_column_arg(&note, &col, &converters).unwrap();
                prop_assert!(matches!(stored, Value::Text(_)));
                prop_assert_eq!(round_trip(&note, &col, &converters).meta, note.meta);
            }
        }
    }
}
