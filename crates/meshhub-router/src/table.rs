//! Ordered route table

use crate::pattern::{PathPattern, PatternError, RouteParams};
use http::Method;
use thiserror::Error;
use tracing::trace;

/// Route resolution errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("No route for {0}")]
    NotFound(String),

    #[error("Method {method} not allowed for {path}")]
    MethodNotAllowed {
        method: Method,
        path: String,
        allowed: Vec<Method>,
    },

    #[error("Parameter '{name}' of {path} is not valid UTF-8")]
    InvalidParameter { name: String, path: String },
}

struct Route<H> {
    pattern: PathPattern,
    handlers: Vec<(Method, H)>,
}

/// Successful resolution: the handler plus extracted parameters
#[derive(Debug)]
pub struct RouteMatch<'a, H> {
    pub handler: &'a H,
    pub params: RouteParams,
    pub pattern: &'a PathPattern,
}

/// Builder collecting routes in registration order
pub struct RouteTableBuilder<H> {
    routes: Vec<Route<H>>,
}

impl<H> RouteTableBuilder<H> {
    /// Register handlers for a path pattern.
    ///
    /// Patterns are tried in the order they were registered.
    pub fn route<I>(mut self, pattern: &str, handlers: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = (Method, H)>,
    {
        let pattern = PathPattern::parse(pattern)?;
        self.routes.push(Route {
            pattern,
            handlers: handlers.into_iter().collect(),
        });
        Ok(self)
    }

    pub fn build(self) -> RouteTable<H> {
        RouteTable {
            routes: self.routes,
        }
    }
}

/// Compiled route table; resolution is a pure function of `(method, path)`
pub struct RouteTable<H> {
    routes: Vec<Route<H>>,
}

impl<H> RouteTable<H> {
    pub fn builder() -> RouteTableBuilder<H> {
        RouteTableBuilder { routes: Vec::new() }
    }

    /// Resolve a request target.
    ///
    /// Any query string is ignored. The first pattern matching the path
    /// decides the outcome: its handler for `method`, or
    /// [`RouteError::MethodNotAllowed`] listing the methods it does support.
    /// A named parameter that does not decode to UTF-8 is refused with
    /// [`RouteError::InvalidParameter`].
    pub fn resolve(&self, method: &Method, target: &str) -> Result<RouteMatch<'_, H>, RouteError> {
        let path = target.split_once('?').map_or(target, |(path, _)| path);

        for route in &self.routes {
            let Some(params) = route.pattern.matches(path) else {
                continue;
            };

            trace!(pattern = %route.pattern, %method, path, "Route matched");

            return match route.handlers.iter().find(|(m, _)| m == method) {
                Some((_, handler)) => match params.invalid_parameter() {
                    Some(name) => Err(RouteError::InvalidParameter {
                        name: name.to_string(),
                        path: path.to_string(),
                    }),
                    None => Ok(RouteMatch {
                        handler,
                        params,
                        pattern: &route.pattern,
                    }),
                },
                None => Err(RouteError::MethodNotAllowed {
                    method: method.clone(),
                    path: path.to_string(),
                    allowed: route.handlers.iter().map(|(m, _)| m.clone()).collect(),
                }),
            };
        }

        Err(RouteError::NotFound(path.to_string()))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
