//! Radix-tree router keyed by path segments.
//!
//! `:name` segments capture positional parameters. Static segments beat
//! parameter segments; lookup backtracks into the parameter child when the
//! static branch dead-ends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use micro_server::Middleware;

use crate::transform::Transformation;

/// One leg of an aggregation route.
#[derive(Debug, Clone)]
pub struct AggregateBackend {
    /// Key the leg's response lands under in the merged object.
    pub key: String,
    pub service: String,
    pub method: String,
}

impl AggregateBackend {
    pub fn new(
        key: impl Into<String>,
        service: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        AggregateBackend {
            key: key.into(),
            service: service.into(),
            method: method.into(),
        }
    }
}

/// What a failed leg does to the merged response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialFailure {
    /// The leg's key carries an error object; the rest succeeds.
    ErrorField,
    /// The whole response fails.
    FailResponse,
}

#[derive(Debug, Clone)]
pub struct AggregateSpec {
    pub backends: Vec<AggregateBackend>,
    pub on_failure: PartialFailure,
}

/// A gateway route: HTTP shape on the left, RPC target on the right.
pub struct Route {
    pub method: String,
    pub path: String,
    pub service: String,
    pub service_method: String,
    pub required_roles: Vec<String>,
    pub transformations: Vec<Transformation>,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub aggregate: Option<AggregateSpec>,
}

impl Route {
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        service: impl Into<String>,
        service_method: impl Into<String>,
    ) -> Self {
        Route {
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            service: service.into(),
            service_method: service_method.into(),
            required_roles: Vec::new(),
            transformations: Vec::new(),
            middleware: Vec::new(),
            timeout: None,
            retries: None,
            aggregate: None,
        }
    }

    /// A parallel fan-out route merging backend responses under their keys.
    pub fn aggregate(
        method: impl Into<String>,
        path: impl Into<String>,
        backends: Vec<AggregateBackend>,
        on_failure: PartialFailure,
    ) -> Self {
        let mut route = Route::new(method, path, "", "");
        route.aggregate = Some(AggregateSpec {
            backends,
            on_failure,
        });
        route
    }

    pub fn with_roles(mut self, roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.required_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_transformation(mut self, transformation: Transformation) -> Self {
        self.transformations.push(transformation);
        self
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

#[derive(Default)]
struct TreeNode {
    children: HashMap<String, TreeNode>,
    param: Option<(String, Box<TreeNode>)>,
    routes: HashMap<String, Arc<Route>>,
}

/// Successful lookup: the route plus captured path parameters.
pub struct RouteMatch {
    pub route: Arc<Route>,
    pub params: Vec<(String, String)>,
}

/// Read-mostly route table. Built at start-up; updates swap entries under
/// the gateway's write lock.
#[derive(Default)]
pub struct Router {
    root: TreeNode,
    all: Vec<Arc<Route>>,
}

impl Router {
    pub fn new() -> Self {
        Router::default()
    }

    pub fn insert(&mut self, route: Route) {
        let route = Arc::new(route);
        let mut node = &mut self.root;
        for segment in segments(&route.path) {
            if let Some(name) = segment.strip_prefix(':') {
                let (_, child) = node
                    .param
                    .get_or_insert_with(|| (name.to_string(), Box::new(TreeNode::default())));
                node = child;
            } else {
                node = node.children.entry(segment.to_string()).or_default();
            }
        }
        node.routes.insert(route.method.clone(), route.clone());
        self.all.push(route);
    }

    pub fn lookup(&self, method: &str, path: &str) -> Option<RouteMatch> {
        let segments: Vec<&str> = segments(path).collect();
        let method = method.to_ascii_uppercase();
        let mut params = Vec::new();
        let route = walk(&self.root, &segments, &method, &mut params)?;
        Some(RouteMatch { route, params })
    }

    /// Every registered route, in insertion order.
    pub fn routes(&self) -> &[Arc<Route>] {
        &self.all
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn walk(
    node: &TreeNode,
    remaining: &[&str],
    method: &str,
    params: &mut Vec<(String, String)>,
) -> Option<Arc<Route>> {
    let Some((head, tail)) = remaining.split_first() else {
        return node.routes.get(method).cloned();
    };
    if let Some(child) = node.children.get(*head) {
        if let Some(route) = walk(child, tail, method, params) {
            return Some(route);
        }
    }
    if let Some((name, child)) = &node.param {
        params.push((name.clone(), (*head).to_string()));
        if let Some(route) = walk(child, tail, method, params) {
            return Some(route);
        }
        params.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router {
        let mut router = Router::new();
        router.insert(Route::new("GET", "/products", "catalog", "list"));
        router.insert(Route::new("POST", "/products", "catalog", "create"));
        router.insert(Route::new("GET", "/products/:id", "catalog", "get"));
        router.insert(Route::new(
            "GET",
            "/products/featured",
            "catalog",
            "featured",
        ));
        router.insert(Route::new(
            "GET",
            "/orgs/:org/users/:user",
            "accounts",
            "get_member",
        ));
        router
    }

    #[test]
    fn static_lookup() {
        let router = router();
        let found = router.lookup("GET", "/products").unwrap();
        assert_eq!(found.route.service_method, "list");
        assert!(found.params.is_empty());
    }

    #[test]
    fn method_filtering_is_per_route() {
        let router = router();
        assert_eq!(
            router.lookup("POST", "/products").unwrap().route.service_method,
            "create"
        );
        assert!(router.lookup("DELETE", "/products").is_none());
    }

    #[test]
    fn params_are_captured() {
        let router = router();
        let found = router.lookup("GET", "/products/p-42").unwrap();
        assert_eq!(found.route.service_method, "get");
        assert_eq!(found.params, vec![("id".to_string(), "p-42".to_string())]);

        let found = router.lookup("GET", "/orgs/acme/users/u7").unwrap();
        assert_eq!(found.route.service_method, "get_member");
        assert_eq!(
            found.params,
            vec![
                ("org".to_string(), "acme".to_string()),
                ("user".to_string(), "u7".to_string())
            ]
        );
    }

    #[test]
    fn static_segments_beat_params() {
        let router = router();
        let found = router.lookup("GET", "/products/featured").unwrap();
        assert_eq!(found.route.service_method, "featured");
        assert!(found.params.is_empty());
    }

    #[test]
    fn missing_paths_are_none() {
        let router = router();
        assert!(router.lookup("GET", "/missing").is_none());
        assert!(router.lookup("GET", "/products/p-1/extra").is_none());
    }

    #[test]
    fn trailing_slash_is_tolerated() {
        let router = router();
        assert!(router.lookup("GET", "/products/").is_some());
        assert!(router.lookup("GET", "products").is_some());
    }

    #[test]
    fn backtracks_from_static_to_param() {
        let mut router = Router::new();
        router.insert(Route::new("GET", "/a/static/x", "s", "static_x"));
        router.insert(Route::new("GET", "/a/:p/y", "s", "param_y"));
        // "static" matches the static child, but only the param branch has
        // a "y" leaf.
        let found = router.lookup("GET", "/a/static/y").unwrap();
        assert_eq!(found.route.service_method, "param_y");
        assert_eq!(found.params[0].1, "static");
    }
}
