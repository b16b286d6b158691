//! Registry: a shareable table of remotely callable methods.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use tracing::warn;

use crate::context::CallContext;
use crate::error::{MethodError, RegisterError};
use crate::message::encode_payload;

/// Type-erased handler future: an encoded reply, or the message for the
/// error response.
pub(crate) type HandlerFuture = BoxFuture<'static, Result<Box<RawValue>, MethodError>>;

/// A registered method: decodes its arguments, runs, encodes its reply.
pub(crate) type MethodHandler =
    dyn Fn(CallContext, Option<Box<RawValue>>) -> HandlerFuture + Send + Sync;

/// A collection of services whose methods can be called remotely. Each
/// method has a name in the format `SERVICE.METHOD`.
///
/// A single registry is intended to be shared by many endpoints: it is
/// populated once at startup and only read afterwards, on every inbound
/// request. Re-registering an existing name replaces the previous handler.
#[derive(Default)]
pub struct Registry {
    functions: RwLock<HashMap<String, Arc<MethodHandler>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every method of `service` under its canonical name, so that
    /// peers can call them as `"NAME.Method"`.
    ///
    /// Fails with [`RegisterError::NoMethods`] when the service declares no
    /// methods at all.
    pub fn register_service<S: Service>(&self, service: S) -> Result<(), RegisterError> {
        self.register_service_as(S::NAME, service)
    }

    /// Like [`register_service`](Self::register_service), under an explicit
    /// service name instead of [`Service::NAME`].
    pub fn register_service_as<S: Service>(
        &self,
        name: &str,
        service: S,
    ) -> Result<(), RegisterError> {
        let mut scope = ServiceScope {
            service: Arc::new(service),
            methods: Vec::new(),
        };
        S::methods(&mut scope);

        if scope.methods.is_empty() {
            return Err(RegisterError::NoMethods);
        }

        let mut functions = self.functions.write();
        for (method, handler) in scope.methods {
            let full_name = format!("{name}.{method}");
            if functions.insert(full_name.clone(), handler).is_some() {
                warn!(method = %full_name, "re-registered method replaces previous handler");
            }
        }
        Ok(())
    }

    /// Look up a handler by fully qualified name. The handler is cloned out
    /// so the table lock is not held across dispatch.
    pub(crate) fn lookup(&self, name: &str) -> Option<Arc<MethodHandler>> {
        self.functions.read().get(name).cloned()
    }

    /// Sorted fully qualified names of every registered method.
    ///
    /// This is the payload of the discovery RPC.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.read().is_empty()
    }
}

/// A set of methods callable from the peer.
///
/// The registration scope replaces reflective method scanning: a service
/// names itself and declares each method as a typed async closure.
///
/// ```
/// use birpc::{Service, ServiceScope};
///
/// struct WordLength;
///
/// impl Service for WordLength {
///     const NAME: &'static str = "WordLength";
///
///     fn methods(scope: &mut ServiceScope<Self>) {
///         scope.method("Len", |_svc, word: String| async move { Ok(word.len() as u64) });
///     }
/// }
/// ```
pub trait Service: Send + Sync + Sized + 'static {
    /// Unqualified service name; methods are exposed as `"NAME.Method"`.
    /// By convention this is the implementing type's name.
    const NAME: &'static str;

    /// Declare the remotely callable methods.
    fn methods(scope: &mut ServiceScope<Self>);
}

/// Registration scope for one service's methods.
///
/// Handlers receive the service instance and their decoded arguments, and
/// return the reply value; the scope erases them down to the raw-payload
/// shape the dispatcher works with. Argument decoding happens before the
/// handler body runs, so a malformed payload produces an error reply
/// without invoking the handler.
pub struct ServiceScope<S> {
    service: Arc<S>,
    methods: Vec<(&'static str, Arc<MethodHandler>)>,
}

impl<S: Send + Sync + 'static> ServiceScope<S> {
    /// Register a typed method.
    pub fn method<Args, Reply, Fut, F>(&mut self, name: &'static str, f: F)
    where
        Args: DeserializeOwned + Send + 'static,
        Reply: Serialize + Send + 'static,
        Fut: Future<Output = Result<Reply, MethodError>> + Send + 'static,
        F: Fn(Arc<S>, Args) -> Fut + Send + Sync + 'static,
    {
        self.method_with_ctx(name, move |service, _ctx, args| f(service, args));
    }

    /// Register a typed method that also receives the per-call
    /// [`CallContext`] (the endpoint handle plus codec-published values).
    pub fn method_with_ctx<Args, Reply, Fut, F>(&mut self, name: &'static str, f: F)
    where
        Args: DeserializeOwned + Send + 'static,
        Reply: Serialize + Send + 'static,
        Fut: Future<Output = Result<Reply, MethodError>> + Send + 'static,
        F: Fn(Arc<S>, CallContext, Args) -> Fut + Send + Sync + 'static,
    {
        let service = self.service.clone();
        let handler: Arc<MethodHandler> = Arc::new(move |ctx, raw_args| {
            let decoded: Result<Args, serde_json::Error> = match &raw_args {
                Some(raw) => serde_json::from_str(raw.get()),
                None => serde_json::from_str("null"),
            };
            let args = match decoded {
                Ok(args) => args,
                Err(e) => {
                    let err = MethodError::new(format!("unmarshaling args: {e}"));
                    return Box::pin(async move { Err(err) }) as HandlerFuture;
                }
            };

            let fut = f(service.clone(), ctx, args);
            Box::pin(async move {
                let reply = fut.await?;
                encode_payload(&reply)
                    .map_err(|e| MethodError::new(format!("marshaling reply: {e}")))
            })
        });
        self.methods.push((name, handler));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct WordLength;

    impl Service for WordLength {
        const NAME: &'static str = "WordLength";

        fn methods(scope: &mut ServiceScope<Self>) {
            scope.method("Len", |_svc, word: String| async move {
                Ok(word.len() as u64)
            });
            scope.method("Upper", |_svc, word: String| async move {
                Ok(word.to_uppercase())
            });
        }
    }

    struct Empty;

    impl Service for Empty {
        const NAME: &'static str = "Empty";

        fn methods(_scope: &mut ServiceScope<Self>) {}
    }

    #[test]
    fn registered_names_are_qualified_and_sorted() {
        let registry = Registry::new();
        registry.register_service(WordLength).unwrap();

        assert_eq!(
            registry.method_names(),
            vec!["WordLength.Len".to_owned(), "WordLength.Upper".to_owned()]
        );
        assert!(registry.lookup("WordLength.Len").is_some());
        assert!(registry.lookup("WordLength.len").is_none());
    }

    #[test]
    fn explicit_service_name_overrides_default() {
        let registry = Registry::new();
        registry.register_service_as("Words", WordLength).unwrap();

        assert!(registry.lookup("Words.Len").is_some());
        assert!(registry.lookup("WordLength.Len").is_none());
    }

    #[test]
    fn empty_service_is_rejected() {
        let registry = Registry::new();
        let err = registry.register_service(Empty).unwrap_err();
        assert_eq!(err.to_string(), "no suitable methods");
        assert!(registry.is_empty());
    }

    #[test]
    fn reregistration_overwrites() {
        let registry = Registry::new();
        registry.register_service(WordLength).unwrap();
        registry.register_service(WordLength).unwrap();
        assert_eq!(registry.len(), 2);
    }
}
