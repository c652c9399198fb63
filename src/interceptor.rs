//! Call-level adapter around the decision pipeline.
//!
//! Order per call: whitelist, selectors, identity extraction, rule evaluation.
//! An allow runs the wrapped handler and returns its result untouched; a deny
//! fails the call with [`AuthzError::PermissionDenied`] before the handler runs.
//! Evaluation is synchronous on the calling task.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::authorizer::{Authorize, Decision, DecisionReason};
use crate::context::EvaluationContext;
use crate::error::{AuthzError, AuthzResult};
use crate::identity::{CallInfo, IdentityExtractor, NoIdentity};
use crate::selector::{selected, Selector, Whitelist};

#[derive(Clone)]
pub struct Interceptor {
    whitelist: Whitelist,
    selectors: Vec<Selector>,
    extractor: Arc<dyn IdentityExtractor>,
    authorizer: Arc<dyn Authorize>,
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("whitelist", &self.whitelist.len())
            .field("selectors", &self.selectors)
            .field("authorizer", &self.authorizer.name())
            .finish()
    }
}

impl Interceptor {
    pub fn new(authorizer: Arc<dyn Authorize>) -> Self {
        Self { whitelist: Whitelist::default(), selectors: Vec::new(), extractor: Arc::new(NoIdentity), authorizer }
    }

    pub fn with_whitelist(mut self, whitelist: Whitelist) -> Self {
        self.whitelist = whitelist;
        self
    }

    pub fn with_selectors(mut self, selectors: Vec<Selector>) -> Self {
        self.selectors = selectors;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn IdentityExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn authorizer(&self) -> &Arc<dyn Authorize> {
        &self.authorizer
    }

    /// Run the pipeline and report the decision without turning a deny into an error.
    pub fn check(&self, call: &CallInfo, request: Option<Value>, is_stream: bool) -> AuthzResult<Decision> {
        if self.whitelist.contains(&call.method) {
            debug!(target: "authz", "{} whitelisted", call.method);
            return Ok(Decision::allow(DecisionReason::Whitelisted));
        }
        if !selected(&self.selectors, &call.method, &call.metadata) {
            debug!(target: "authz", "{} not selected; passing through", call.method);
            return Ok(Decision::allow(DecisionReason::NotSelected));
        }
        let user = self.extractor.extract(call).map_err(|e| {
            warn!(target: "authz", "identity extraction failed for {}: {:#}", call.method, e);
            AuthzError::Identity(format!("{:#}", e))
        })?;
        let ctx = EvaluationContext::build(user, request, &call.metadata, is_stream, &call.method)
            .with_deadline(call.deadline);
        match self.authorizer.authorize(&ctx) {
            Ok(d) => {
                debug!(target: "authz", "{} -> allow={} ({})", call.method, d.allow, d.reason);
                Ok(d)
            }
            Err(e) => {
                warn!(target: "authz", "{} aborted: {}", call.method, e);
                Err(e)
            }
        }
    }

    /// Like [`check`](Self::check) but a deny becomes `PermissionDenied`.
    pub fn enforce(&self, call: &CallInfo, request: Option<Value>, is_stream: bool) -> AuthzResult<Decision> {
        let d = self.check(call, request, is_stream)?;
        if !d.allow {
            info!(target: "authz", "permission denied for {} ({})", call.method, d.reason);
            return Err(AuthzError::denied(&call.method));
        }
        Ok(d)
    }

    /// Authorize a single-request call, then hand the original request to `handler`.
    pub async fn unary<Req, Resp, E, F, Fut>(&self, call: &CallInfo, req: Req, handler: F) -> Result<Resp, E>
    where
        Req: Serialize,
        E: From<AuthzError>,
        F: FnOnce(Req) -> Fut,
        Fut: Future<Output = Result<Resp, E>>,
    {
        let value = serde_json::to_value(&req)
            .map_err(|e| AuthzError::evaluation("request", format!("request is not serializable: {}", e)))?;
        self.enforce(call, Some(value), false)?;
        handler(req).await
    }

    /// Authorize a stream before it starts. The request is never visible to rules.
    pub async fn stream<Resp, E, F, Fut>(&self, call: &CallInfo, handler: F) -> Result<Resp, E>
    where
        E: From<AuthzError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Resp, E>>,
    {
        self.enforce(call, None, true)?;
        handler().await
    }
}
