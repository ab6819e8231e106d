//! Composable response transformations.
//!
//! Transformations operate on the decoded value tree and run in the order
//! configured on the route. Unknown kinds pass through untouched.

use serde_json::Value;

#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Transformation {
    /// Delete keys from a structured object. Scalars and arrays are left
    /// alone.
    RemoveFields(Vec<String>),
    /// Set keys on a structured object; existing keys are overwritten.
    AddFields(serde_json::Map<String, Value>),
}

impl Transformation {
    pub fn remove(fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Transformation::RemoveFields(fields.into_iter().map(Into::into).collect())
    }

    pub fn add(fields: impl IntoIterator<Item = (impl Into<String>, Value)>) -> Self {
        Transformation::AddFields(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    fn apply(&self, value: &mut Value) {
        match self {
            Transformation::RemoveFields(fields) => {
                if let Value::Object(object) = value {
                    for field in fields {
                        object.remove(field);
                    }
                }
            }
            Transformation::AddFields(fields) => {
                if let Value::Object(object) = value {
                    for (key, v) in fields {
                        object.insert(key.clone(), v.clone());
                    }
                }
            }
        }
    }
}

/// Run every transformation, in order.
pub fn apply_all(transformations: &[Transformation], value: &mut Value) {
    for transformation in transformations {
        transformation.apply(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remove_deletes_keys_from_objects() {
        let mut value = json!({"id": "p-1", "cost": 10, "internal": true});
        apply_all(&[Transformation::remove(["cost", "internal"])], &mut value);
        assert_eq!(value, json!({"id": "p-1"}));
    }

    #[test]
    fn remove_leaves_scalars_and_arrays_alone() {
        let mut value = json!([{"cost": 1}, 2]);
        apply_all(&[Transformation::remove(["cost"])], &mut value);
        assert_eq!(value, json!([{"cost": 1}, 2]));

        let mut value = json!("scalar");
        apply_all(&[Transformation::remove(["cost"])], &mut value);
        assert_eq!(value, json!("scalar"));
    }

    #[test]
    fn add_overwrites_existing_keys() {
        let mut value = json!({"id": "p-1", "source": "db"});
        apply_all(
            &[Transformation::add([
                ("source", json!("gateway")),
                ("cached", json!(false)),
            ])],
            &mut value,
        );
        assert_eq!(
            value,
            json!({"id": "p-1", "source": "gateway", "cached": false})
        );
    }

    #[test]
    fn transformations_compose_in_order() {
        let mut value = json!({"a": 1, "b": 2});
        apply_all(
            &[
                Transformation::remove(["a"]),
                Transformation::add([("a", json!("restored"))]),
            ],
            &mut value,
        );
        assert_eq!(value, json!({"a": "restored", "b": 2}));
    }
}
