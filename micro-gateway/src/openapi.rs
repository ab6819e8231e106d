//! OpenAPI 3 document synthesized from route registrations.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::router::Route;

pub fn document(title: &str, version: &str, routes: &[Arc<Route>]) -> Value {
    let mut paths: Map<String, Value> = Map::new();
    for route in routes {
        let path = openapi_path(&route.path);
        let entry = paths
            .entry(path)
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(operations) = entry {
            operations.insert(route.method.to_ascii_lowercase(), operation(route));
        }
    }

    json!({
        "openapi": "3.0.3",
        "info": {
            "title": title,
            "version": version,
        },
        "paths": paths,
    })
}

fn openapi_path(path: &str) -> String {
    let converted: Vec<String> = path
        .split('/')
        .map(|segment| match segment.strip_prefix(':') {
            Some(name) => format!("{{{name}}}"),
            None => segment.to_string(),
        })
        .collect();
    let joined = converted.join("/");
    if joined.starts_with('/') {
        joined
    } else {
        format!("/{joined}")
    }
}

fn operation(route: &Route) -> Value {
    let parameters: Vec<Value> = route
        .path
        .split('/')
        .filter_map(|segment| segment.strip_prefix(':'))
        .map(|name| {
            json!({
                "name": name,
                "in": "path",
                "required": true,
                "schema": {"type": "string"},
            })
        })
        .collect();

    let (operation_id, tag, description) = match &route.aggregate {
        Some(spec) => {
            let keys: Vec<&str> = spec.backends.iter().map(|b| b.key.as_str()).collect();
            (
                format!("aggregate_{}", keys.join("_")),
                "aggregate".to_string(),
                format!("Aggregates {} backends in parallel.", spec.backends.len()),
            )
        }
        None => (
            format!("{}_{}", route.service, route.service_method),
            route.service.clone(),
            format!(
                "Proxies to `{}.{}`.",
                route.service, route.service_method
            ),
        ),
    };

    let mut operation = json!({
        "operationId": operation_id,
        "tags": [tag],
        "description": description,
        "responses": {
            "200": {"description": "Successful response"},
        },
    });
    if !parameters.is_empty() {
        operation["parameters"] = Value::Array(parameters);
    }
    if !route.required_roles.is_empty() {
        operation["security"] = json!([{"bearerAuth": route.required_roles}]);
    }
    operation
}
