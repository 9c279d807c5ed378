//! Administrative endpoints served on the proxy's own listener.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

type Handler = Arc<dyn Fn() -> Value + Send + Sync>;

/// Maps request paths to handlers producing JSON bodies.
#[derive(Clone, Default)]
pub struct AdminRouter {
    routes: BTreeMap<String, Handler>,
}

impl AdminRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounts `handler` at `path`, replacing any previous handler.
    pub fn route<F>(&mut self, path: &str, handler: F)
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.routes.insert(path.to_string(), Arc::new(handler));
    }

    /// Runs the handler for `target`; the query string is ignored.
    pub fn handle(&self, target: &str) -> Option<Value> {
        let path = target.split('?').next().unwrap_or(target);
        self.routes.get(path).map(|handler| handler())
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Debug for AdminRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminRouter")
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}
