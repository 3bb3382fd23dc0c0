//! Named transformation function registry.
//!
//! Mapping rules refer to transforms by name. Unknown names are a single
//! controlled code path in the engine (warn and pass through), so the
//! registry itself only answers lookups.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::models::record::Record;

/// Single-value transform, applied to one resolved source value.
pub type TransformFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Multi-field derivation, reading the whole source record.
pub type CalculatedFn = Arc<dyn Fn(&Record) -> Value + Send + Sync>;

pub struct TransformRegistry {
    transforms: HashMap<String, TransformFn>,
    calculated: HashMap<String, CalculatedFn>,
}

impl TransformRegistry {
    /// Registry pre-loaded with the built-in functions.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            transforms: HashMap::new(),
            calculated: HashMap::new(),
        };

        registry.register_transform("trim", |value| match value.as_str() {
            Some(s) => Value::String(s.trim().to_string()),
            None => value.clone(),
        });
        registry.register_transform("uppercase", |value| match value.as_str() {
            Some(s) => Value::String(s.to_uppercase()),
            None => value.clone(),
        });
        registry.register_transform("lowercase", |value| match value.as_str() {
            Some(s) => Value::String(s.to_lowercase()),
            None => value.clone(),
        });
        // Monetary amounts cross the wire as integer cents on some vendors.
        registry.register_transform("amount_to_cents", |value| match value.as_f64() {
            Some(amount) => Value::from((amount * 100.0).round() as i64),
            None => value.clone(),
        });
        registry.register_transform("cents_to_amount", |value| match value.as_i64() {
            Some(cents) => Value::from(cents as f64 / 100.0),
            None => value.clone(),
        });

        registry.register_calculated("full_name", |record| {
            let first = record.get("first_name").and_then(Value::as_str).unwrap_or("");
            let last = record.get("last_name").and_then(Value::as_str).unwrap_or("");
            Value::String(format!("{first} {last}").trim().to_string())
        });

        registry
    }

    pub fn register_transform<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.transforms.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_calculated<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Record) -> Value + Send + Sync + 'static,
    {
        self.calculated.insert(name.to_string(), Arc::new(f));
    }

    pub fn transform(&self, name: &str) -> Option<&TransformFn> {
        self.transforms.get(name)
    }

    pub fn calculated(&self, name: &str) -> Option<&CalculatedFn> {
        self.calculated.get(name)
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_transforms() {
        let registry = TransformRegistry::with_builtins();

        let trim = registry.transform("trim").expect("trim");
        assert_eq!(trim(&json!("  hi  ")), json!("hi"));

        let to_cents = registry.transform("amount_to_cents").expect("to_cents");
        assert_eq!(to_cents(&json!(1500.00)), json!(150000));

        let from_cents = registry.transform("cents_to_amount").expect("from_cents");
        assert_eq!(from_cents(&json!(150000)), json!(1500.0));
    }

    #[test]
    fn transforms_pass_through_wrong_types() {
        let registry = TransformRegistry::with_builtins();
        let upper = registry.transform("uppercase").expect("uppercase");
        assert_eq!(upper(&json!(42)), json!(42));
    }

    #[test]
    fn full_name_joins_and_trims() {
        let registry = TransformRegistry::with_builtins();
        let full_name = registry.calculated("full_name").expect("full_name");

        let record = json!({"first_name": "Ada", "last_name": "Lovelace"});
        assert_eq!(
            full_name(record.as_object().expect("object")),
            json!("Ada Lovelace")
        );

        let partial = json!({"first_name": "Ada"});
        assert_eq!(full_name(partial.as_object().expect("object")), json!("Ada"));
    }

    #[test]
    fn unknown_names_return_none() {
        let registry = TransformRegistry::with_builtins();
        assert!(registry.transform("does_not_exist").is_none());
        assert!(registry.calculated("does_not_exist").is_none());
    }
}
