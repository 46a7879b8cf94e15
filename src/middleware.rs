//! User-supplied hooks run before an intercepted or passthrough command is
//! dispatched to the origin.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use crate::context::ContextHandle;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// `(context, raw param) -> Result<()>`. An `Err` aborts dispatch of the
/// current command with a synthetic `500` reply; the origin is never
/// contacted for that line.
pub type MiddlewareFn =
    Arc<dyn Fn(ContextHandle, String) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

use std::sync::Arc;

/// Maps an uppercase verb to at most one middleware hook.
#[derive(Default, Clone)]
pub struct MiddlewareRegistry {
    hooks: HashMap<String, MiddlewareFn>,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` for `verb`, replacing any previously registered hook.
    pub fn use_verb<F, Fut>(&mut self, verb: &str, f: F)
    where
        F: Fn(ContextHandle, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let verb = verb.to_ascii_uppercase();
        self.hooks
            .insert(verb, Arc::new(move |ctx, param| Box::pin(f(ctx, param))));
    }

    /// Run the hook registered for `verb`, if any.
    pub async fn dispatch(&self, verb: &str, ctx: ContextHandle, param: String) -> anyhow::Result<()> {
        if let Some(hook) = self.hooks.get(verb) {
            hook(ctx, param).await
        } else {
            Ok(())
        }
    }

    pub fn has(&self, verb: &str) -> bool {
        self.hooks.contains_key(verb)
    }
}
