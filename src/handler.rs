//! Method handlers and the routing table
//!
//! Handlers are plain async closures over a [`CallContext`], tagged by call shape. A
//! [`ServiceHandlers`] groups the methods of one service; the runtime freezes every registered
//! set into an immutable [`Router`] when it starts.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    future::Future,
    sync::Arc,
};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};

use crate::call::{CallContext, CallShape};
use crate::errors::HandlerError;
use crate::rpc::StatusCode;

pub type HandlerFuture<T> = BoxFuture<'static, Result<T, HandlerError>>;

type UnaryFn = dyn Fn(Bytes, CallContext) -> HandlerFuture<Bytes> + Send + Sync;
type ServerStreamingFn = dyn Fn(Bytes, CallContext) -> HandlerFuture<()> + Send + Sync;
type ClientStreamingFn = dyn Fn(CallContext) -> HandlerFuture<Bytes> + Send + Sync;
type BidiStreamingFn = dyn Fn(CallContext) -> HandlerFuture<()> + Send + Sync;

/// A method implementation, tagged by its streaming shape.
#[derive(Clone)]
pub enum MethodHandler {
    /// One request in, the returned message out.
    Unary(Arc<UnaryFn>),
    /// One request in, responses written through the context.
    ServerStreaming(Arc<ServerStreamingFn>),
    /// Requests read through the context, the returned message out.
    ClientStreaming(Arc<ClientStreamingFn>),
    /// Both directions through the context.
    BidiStreaming(Arc<BidiStreamingFn>),
}

impl MethodHandler {
    pub fn unary<F, Fut>(handler: F) -> Self
    where
        F: Fn(Bytes, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
    {
        Self::Unary(Arc::new(move |request, ctx| handler(request, ctx).boxed()))
    }

    pub fn server_streaming<F, Fut>(handler: F) -> Self
    where
        F: Fn(Bytes, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self::ServerStreaming(Arc::new(move |request, ctx| handler(request, ctx).boxed()))
    }

    pub fn client_streaming<F, Fut>(handler: F) -> Self
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
    {
        Self::ClientStreaming(Arc::new(move |ctx| handler(ctx).boxed()))
    }

    pub fn bidi_streaming<F, Fut>(handler: F) -> Self
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self::BidiStreaming(Arc::new(move |ctx| handler(ctx).boxed()))
    }

    pub fn shape(&self) -> CallShape {
        match self {
            Self::Unary(_) => CallShape::Unary,
            Self::ServerStreaming(_) => CallShape::ServerStreaming,
            Self::ClientStreaming(_) => CallShape::ClientStreaming,
            Self::BidiStreaming(_) => CallShape::BidiStreaming,
        }
    }

    /// Runs the handler against `ctx`, yielding the single response for shapes that have one.
    pub(crate) fn invoke(&self, ctx: CallContext) -> HandlerFuture<Option<Bytes>> {
        let handler = self.clone();
        async move {
            match handler {
                Self::Unary(handler) => {
                    let request = read_single_request(&ctx).await?;
                    handler(request, ctx).await.map(Some)
                }
                Self::ServerStreaming(handler) => {
                    let request = read_single_request(&ctx).await?;
                    handler(request, ctx).await.map(|()| None)
                }
                Self::ClientStreaming(handler) => handler(ctx).await.map(Some),
                Self::BidiStreaming(handler) => handler(ctx).await.map(|()| None),
            }
        }
        .boxed()
    }
}

impl fmt::Debug for MethodHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MethodHandler").field(&self.shape()).finish()
    }
}

/// Reads exactly one request message followed by the client's half-close.
async fn read_single_request(ctx: &CallContext) -> Result<Bytes, HandlerError> {
    let Some(request) = ctx.read().await? else {
        return Err(ctx
            .abort(StatusCode::Internal, "expected one request message, received none")
            .await
            .into());
    };
    if ctx.read().await?.is_some() {
        return Err(ctx
            .abort(
                StatusCode::Internal,
                "expected one request message, received more",
            )
            .await
            .into());
    }
    Ok(request)
}

/// The methods of one service, registered with the server as a unit.
#[derive(Debug, Clone)]
pub struct ServiceHandlers {
    service: String,
    methods: BTreeMap<String, MethodHandler>,
}

impl ServiceHandlers {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            methods: BTreeMap::new(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(mut self, name: impl Into<String>, handler: MethodHandler) -> Self {
        self.methods.insert(name.into(), handler);
        self
    }

    pub fn unary<F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Bytes, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
    {
        self.method(name, MethodHandler::unary(handler))
    }

    pub fn server_streaming<F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Bytes, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.method(name, MethodHandler::server_streaming(handler))
    }

    pub fn client_streaming<F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
    {
        self.method(name, MethodHandler::client_streaming(handler))
    }

    pub fn bidi_streaming<F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.method(name, MethodHandler::bidi_streaming(handler))
    }

    /// Fully qualified method paths, `/service/Method`.
    pub fn method_paths(&self) -> impl Iterator<Item = String> + '_ {
        self.methods
            .keys()
            .map(|method| method_path(&self.service, method))
    }
}

pub fn method_path(service: &str, method: &str) -> String {
    format!("/{service}/{method}")
}

/// Accumulates handler sets before the server starts.
#[derive(Debug, Default)]
pub struct RouterBuilder {
    sets: Vec<ServiceHandlers>,
}

impl RouterBuilder {
    pub fn add(&mut self, handlers: ServiceHandlers) {
        self.sets.push(handlers);
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sets.iter().flat_map(ServiceHandlers::method_paths).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Freezes the registered sets. Earlier registrations win when two sets define the same path.
    pub fn build(self) -> Router {
        let mut routes = HashMap::new();
        for set in self.sets {
            for (method, handler) in set.methods {
                routes
                    .entry(method_path(&set.service, &method))
                    .or_insert(handler);
            }
        }
        Router { routes }
    }
}

/// Immutable method-path to handler table.
#[derive(Debug, Default)]
pub struct Router {
    routes: HashMap<String, MethodHandler>,
}

impl Router {
    pub fn lookup(&self, path: &str) -> Option<&MethodHandler> {
        self.routes.get(path)
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> MethodHandler {
        MethodHandler::unary(|request, _ctx| async move { Ok::<_, HandlerError>(request) })
    }

    #[test]
    fn routes_by_full_method_path() {
        let mut builder = RouterBuilder::default();
        builder.add(
            ServiceHandlers::new("demo.Echo")
                .method("Echo", echo())
                .bidi_streaming("Chat", |_ctx| async move { Ok::<_, HandlerError>(()) }),
        );
        let router = builder.build();

        assert_eq!(router.len(), 2);
        assert_eq!(
            router.lookup("/demo.Echo/Echo").map(MethodHandler::shape),
            Some(CallShape::Unary)
        );
        assert_eq!(
            router.lookup("/demo.Echo/Chat").map(MethodHandler::shape),
            Some(CallShape::BidiStreaming)
        );
        assert!(router.lookup("/demo.Echo/Missing").is_none());
        assert!(router.lookup("Echo").is_none());
    }

    #[test]
    fn first_registration_wins() {
        let mut builder = RouterBuilder::default();
        builder.add(ServiceHandlers::new("svc").method("Do", echo()));
        builder.add(
            ServiceHandlers::new("svc").client_streaming("Do", |_ctx| async move {
                Ok::<_, HandlerError>(Bytes::new())
            }),
        );

        let router = builder.build();
        assert_eq!(
            router.lookup("/svc/Do").map(MethodHandler::shape),
            Some(CallShape::Unary)
        );
    }

    #[test]
    fn builder_lists_sorted_unique_method_names() {
        let mut builder = RouterBuilder::default();
        builder.add(ServiceHandlers::new("b").method("Y", echo()));
        builder.add(ServiceHandlers::new("a").method("X", echo()));
        builder.add(ServiceHandlers::new("a").method("X", echo()));

        assert_eq!(builder.method_names(), vec!["/a/X", "/b/Y"]);
    }
}
