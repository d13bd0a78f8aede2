//! Path-based request routing with a middleware chain.
//!
//! A router is a mutable builder until its first dispatch: exact matches via
//! [`Router::map`], longest-prefix matches via [`Router::mount`], middleware
//! via [`Router::use_middleware`]. The first dispatch freezes everything
//! into an immutable pipeline; mutating a frozen router is an error.
//!
//! Lookup order: strip the router's absolute prefix, try an exact match,
//! then walk prefixes from most to least specific. Paths deep enough to
//! exhaust [`MAX_SEGMENTS`] retries without bottoming out at the root are
//! rejected outright, which keeps adversarial paths from turning lookups
//! into long walks.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use tokio_util::sync::CancellationToken;

use floe_types::{
    DispatchErrorCode, DispatchException, DispatchFuture, Dispatcher, Error, IncomingRequest,
};

/// Longest-prefix lookups retry at most this many times before giving up.
pub const MAX_SEGMENTS: usize = 10;

/// Middleware transforms the dispatcher below it into the one above it.
pub type Middleware = Box<dyn FnOnce(Arc<dyn Dispatcher>) -> Arc<dyn Dispatcher> + Send>;

/// Error from configuring a [`Router`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// The routing pipeline is frozen; registration came after the first
    /// dispatch.
    Frozen,
    /// The path or prefix is not absolute.
    InvalidPath(String),
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::Frozen => f.write_str("router is frozen after its first dispatch"),
            RouterError::InvalidPath(path) => write!(f, "path must be absolute: {path:?}"),
        }
    }
}

impl std::error::Error for RouterError {}

/// Server-side dispatcher selecting a handler by request path.
pub struct Router {
    absolute_prefix: String,
    exact: HashMap<String, Arc<dyn Dispatcher>>,
    prefix: HashMap<String, Arc<dyn Dispatcher>>,
    middleware: Mutex<Vec<Middleware>>,
    frozen: OnceLock<Arc<dyn Dispatcher>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            absolute_prefix: String::new(),
            exact: HashMap::new(),
            prefix: HashMap::new(),
            middleware: Mutex::new(Vec::new()),
            frozen: OnceLock::new(),
        }
    }

    /// A router that only serves paths under `prefix`.
    pub fn with_prefix(prefix: &str) -> Result<Self, RouterError> {
        if !prefix.starts_with('/') {
            return Err(RouterError::InvalidPath(prefix.to_owned()));
        }
        let mut router = Self::new();
        router.absolute_prefix = normalize_prefix(prefix);
        // The root prefix means "no prefix".
        if router.absolute_prefix == "/" {
            router.absolute_prefix.clear();
        }
        Ok(router)
    }

    fn check_mutable(&self) -> Result<(), RouterError> {
        if self.frozen.get().is_some() {
            return Err(RouterError::Frozen);
        }
        Ok(())
    }

    /// Register an exact-match handler.
    pub fn map(&mut self, path: &str, dispatcher: Arc<dyn Dispatcher>) -> Result<(), RouterError> {
        self.check_mutable()?;
        if !path.starts_with('/') {
            return Err(RouterError::InvalidPath(path.to_owned()));
        }
        self.exact.insert(path.to_owned(), dispatcher);
        Ok(())
    }

    /// Register a longest-prefix-match handler.
    pub fn mount(
        &mut self,
        prefix: &str,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<(), RouterError> {
        self.check_mutable()?;
        if !prefix.starts_with('/') {
            return Err(RouterError::InvalidPath(prefix.to_owned()));
        }
        self.prefix.insert(normalize_prefix(prefix), dispatcher);
        Ok(())
    }

    /// Push a middleware onto the stack; the last one pushed runs outermost.
    pub fn use_middleware(
        &mut self,
        middleware: impl FnOnce(Arc<dyn Dispatcher>) -> Arc<dyn Dispatcher> + Send + 'static,
    ) -> Result<(), RouterError> {
        self.check_mutable()?;
        self.middleware.lock().unwrap().push(Box::new(middleware));
        Ok(())
    }

    /// Materialize the dispatch pipeline. First call wins; later mutation
    /// fails.
    fn freeze(&self) -> &Arc<dyn Dispatcher> {
        self.frozen.get_or_init(|| {
            let table = RouteTable {
                absolute_prefix: self.absolute_prefix.clone(),
                exact: self.exact.clone(),
                prefix: self.prefix.clone(),
                default: Arc::new(NotFoundDispatcher),
            };
            let mut dispatcher: Arc<dyn Dispatcher> = Arc::new(table);
            for middleware in self.middleware.lock().unwrap().drain(..) {
                dispatcher = middleware(dispatcher);
            }
            dispatcher
        })
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for Router {
    fn dispatch(&self, request: IncomingRequest, cancel: CancellationToken) -> DispatchFuture<'_> {
        self.freeze().dispatch(request, cancel)
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("absolute_prefix", &self.absolute_prefix)
            .field("exact", &self.exact.len())
            .field("prefix", &self.prefix.len())
            .field("frozen", &self.frozen.get().is_some())
            .finish()
    }
}

/// Fallback for unrouted paths: a service-not-found failure.
pub struct NotFoundDispatcher;

impl Dispatcher for NotFoundDispatcher {
    fn dispatch(&self, request: IncomingRequest, _cancel: CancellationToken) -> DispatchFuture<'_> {
        let exception = DispatchException::new(
            DispatchErrorCode::ServiceNotFound,
            format!("no service at {}", request.path),
        );
        Box::pin(async move { Err(Error::Dispatch(exception)) })
    }
}

struct RouteTable {
    absolute_prefix: String,
    exact: HashMap<String, Arc<dyn Dispatcher>>,
    prefix: HashMap<String, Arc<dyn Dispatcher>>,
    default: Arc<dyn Dispatcher>,
}

impl RouteTable {
    fn resolve(&self, path: &str) -> Result<&Arc<dyn Dispatcher>, Error> {
        let path = if self.absolute_prefix.is_empty() {
            path
        } else {
            match path.strip_prefix(&self.absolute_prefix) {
                Some(rest) if rest.is_empty() => "/",
                Some(rest) if rest.starts_with('/') => rest,
                _ => {
                    return Err(Error::InvalidData(format!(
                        "path {path:?} is outside prefix {:?}",
                        self.absolute_prefix
                    )));
                }
            }
        };

        if let Some(dispatcher) = self.exact.get(path) {
            return Ok(dispatcher);
        }

        let mut prefix = normalize_prefix(path);
        if let Some(dispatcher) = self.prefix.get(&prefix) {
            return Ok(dispatcher);
        }
        for _ in 0..MAX_SEGMENTS {
            if prefix == "/" {
                break;
            }
            prefix = parent_prefix(&prefix);
            if let Some(dispatcher) = self.prefix.get(&prefix) {
                return Ok(dispatcher);
            }
        }
        if prefix == "/" {
            Ok(&self.default)
        } else {
            Err(Error::InvalidData("too many segments in path".into()))
        }
    }
}

impl Dispatcher for RouteTable {
    fn dispatch(&self, request: IncomingRequest, cancel: CancellationToken) -> DispatchFuture<'_> {
        match self.resolve(&request.path) {
            Ok(dispatcher) => dispatcher.dispatch(request, cancel),
            Err(e) => {
                let mut request = request;
                request.payload.complete(Some(e.clone()));
                Box::pin(async move { Err(e) })
            }
        }
    }
}

/// Trim trailing slashes; an empty remainder is the root.
fn normalize_prefix(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// Cut the last segment off a normalized prefix.
fn parent_prefix(prefix: &str) -> String {
    match prefix.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(idx) => prefix[..idx].to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use floe_types::{Deadline, DispatchFn, OutgoingResponse, PayloadSource};

    fn request(path: &str) -> IncomingRequest {
        IncomingRequest {
            path: path.to_owned(),
            operation: "op".into(),
            idempotent: false,
            oneway: false,
            deadline: Deadline::NEVER,
            fields: Default::default(),
            features: Default::default(),
            payload: PayloadSource::empty(),
            payload_stream: None,
        }
    }

    /// A dispatcher answering with a success response tagged by name.
    fn tagged(name: &'static str) -> Arc<dyn Dispatcher> {
        Arc::new(DispatchFn(move |mut request: IncomingRequest, _cancel| {
            request.payload.complete(None);
            async move {
                Ok::<_, Error>(OutgoingResponse::success(PayloadSource::from_bytes(name)))
            }
        }))
    }

    async fn dispatched_tag(router: &Router, path: &str) -> Result<String, Error> {
        let response = router
            .dispatch(request(path), CancellationToken::new())
            .await?;
        let mut payload = response.payload;
        let bytes = payload.read_to_end().await.unwrap();
        payload.complete(None);
        Ok(String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn longest_prefix_wins() {
        let mut router = Router::new();
        router.mount("/a", tagged("d1")).unwrap();
        router.mount("/a/b", tagged("d2")).unwrap();

        assert_eq!(dispatched_tag(&router, "/a/b/c/d").await.unwrap(), "d2");
        assert_eq!(dispatched_tag(&router, "/a/x").await.unwrap(), "d1");
        assert!(matches!(
            dispatched_tag(&router, "/z").await,
            Err(Error::Dispatch(DispatchException {
                code: DispatchErrorCode::ServiceNotFound,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn exact_match_beats_prefix() {
        let mut router = Router::new();
        router.mount("/a", tagged("prefix")).unwrap();
        router.map("/a/b", tagged("exact")).unwrap();

        assert_eq!(dispatched_tag(&router, "/a/b").await.unwrap(), "exact");
        assert_eq!(dispatched_tag(&router, "/a/b/c").await.unwrap(), "prefix");
    }

    #[tokio::test]
    async fn mutation_after_first_dispatch_is_an_error() {
        let mut router = Router::new();
        router.map("/x", tagged("x")).unwrap();
        let _ = dispatched_tag(&router, "/x").await.unwrap();

        assert_eq!(router.map("/y", tagged("y")), Err(RouterError::Frozen));
        assert_eq!(router.mount("/y", tagged("y")), Err(RouterError::Frozen));
        assert_eq!(
            router.use_middleware(|inner| inner),
            Err(RouterError::Frozen)
        );
    }

    #[tokio::test]
    async fn deep_unmatched_paths_are_rejected() {
        let router = Router::new();

        // Ten segments still bottom out at the root and hit the default.
        let ten = "/s1/s2/s3/s4/s5/s6/s7/s8/s9/s10";
        assert!(matches!(
            dispatched_tag(&router, ten).await,
            Err(Error::Dispatch(_))
        ));

        let eleven = "/s1/s2/s3/s4/s5/s6/s7/s8/s9/s10/s11";
        assert!(matches!(
            dispatched_tag(&router, eleven).await,
            Err(Error::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn absolute_prefix_is_required_and_stripped() {
        let mut router = Router::with_prefix("/api/").unwrap();
        router.map("/users", tagged("users")).unwrap();

        assert_eq!(dispatched_tag(&router, "/api/users").await.unwrap(), "users");
        assert!(matches!(
            dispatched_tag(&router, "/other/users").await,
            Err(Error::InvalidData(_))
        ));
        assert!(matches!(
            dispatched_tag(&router, "/apix").await,
            Err(Error::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn middleware_composes_in_stack_order() {
        struct Tagging {
            tag: &'static str,
            inner: Arc<dyn Dispatcher>,
        }
        impl Dispatcher for Tagging {
            fn dispatch(
                &self,
                mut request: IncomingRequest,
                cancel: CancellationToken,
            ) -> DispatchFuture<'_> {
                request.operation.push_str(self.tag);
                self.inner.dispatch(request, cancel)
            }
        }

        let seen = Arc::new(Mutex::new(String::new()));
        let seen_by_handler = seen.clone();
        let mut router = Router::new();
        router
            .map(
                "/x",
                Arc::new(DispatchFn(move |mut request: IncomingRequest, _cancel| {
                    request.payload.complete(None);
                    *seen_by_handler.lock().unwrap() = request.operation.clone();
                    async move { Ok::<_, Error>(OutgoingResponse::success(PayloadSource::empty())) }
                })),
            )
            .unwrap();
        router
            .use_middleware(|inner| Arc::new(Tagging { tag: "-inner", inner }))
            .unwrap();
        router
            .use_middleware(|inner| Arc::new(Tagging { tag: "-outer", inner }))
            .unwrap();

        let _ = dispatched_tag(&router, "/x").await.unwrap();
        // The outermost middleware (last pushed) appends first.
        assert_eq!(seen.lock().unwrap().as_str(), "op-outer-inner");
    }

    #[test]
    fn prefix_normalization() {
        assert_eq!(normalize_prefix("/a/b/"), "/a/b");
        assert_eq!(normalize_prefix("/"), "/");
        assert_eq!(normalize_prefix(""), "/");
        assert_eq!(parent_prefix("/a/b"), "/a");
        assert_eq!(parent_prefix("/a"), "/");
    }
}
