//! Vary dimensions.
//!
//! Applications register named, pure evaluators that add dimensions to the
//! cache key. Each evaluator declares up front which request fields it reads;
//! at evaluation time it only sees those fields through a [`RequestView`].
//! The names and fingerprints of the registered set are persisted per URL so
//! later requests can rebuild the same key before the page is generated.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::context::RequestContext;

/// Headers an evaluator may never read. Cookies and credentials must not
/// become key material.
const FORBIDDEN_HEADERS: &[&str] = &["cookie", "authorization", "proxy-authorization"];

/// A request field an evaluator is allowed to read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    Host,
    Method,
    Path,
    Query,
    Protocol,
    Tls,
    /// A single request header (lowercase name).
    Header(String),
}

impl Capability {
    pub fn header(name: &str) -> Self {
        Capability::Header(name.to_ascii_lowercase())
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Host => f.write_str("host"),
            Capability::Method => f.write_str("method"),
            Capability::Path => f.write_str("path"),
            Capability::Query => f.write_str("query"),
            Capability::Protocol => f.write_str("protocol"),
            Capability::Tls => f.write_str("tls"),
            Capability::Header(name) => write!(f, "header:{name}"),
        }
    }
}

/// Value produced by an evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VaryValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl From<bool> for VaryValue {
    fn from(value: bool) -> Self {
        VaryValue::Bool(value)
    }
}

impl From<i64> for VaryValue {
    fn from(value: i64) -> Self {
        VaryValue::Int(value)
    }
}

impl From<&str> for VaryValue {
    fn from(value: &str) -> Self {
        VaryValue::Text(value.to_string())
    }
}

impl From<String> for VaryValue {
    fn from(value: String) -> Self {
        VaryValue::Text(value)
    }
}

impl<T: Into<VaryValue>> From<Option<T>> for VaryValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(VaryValue::Null, Into::into)
    }
}

/// Read-only window onto a [`RequestContext`], limited to declared capabilities.
pub struct RequestView<'a> {
    ctx: &'a RequestContext,
    capabilities: &'a BTreeSet<Capability>,
}

impl<'a> RequestView<'a> {
    fn allows(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn host(&self) -> Option<&'a str> {
        self.allows(&Capability::Host).then(|| self.ctx.host())
    }

    pub fn method(&self) -> Option<&'a str> {
        self.allows(&Capability::Method)
            .then(|| self.ctx.method().as_str())
    }

    pub fn path(&self) -> Option<&'a str> {
        self.allows(&Capability::Path).then(|| self.ctx.path())
    }

    pub fn query(&self, name: &str) -> Option<&'a str> {
        if !self.allows(&Capability::Query) {
            return None;
        }
        self.ctx.query_param(name)
    }

    pub fn protocol(&self) -> Option<&'a str> {
        self.allows(&Capability::Protocol)
            .then(|| self.ctx.protocol())
    }

    pub fn tls(&self) -> Option<bool> {
        self.allows(&Capability::Tls).then(|| self.ctx.is_tls())
    }

    pub fn header(&self, name: &str) -> Option<&'a str> {
        if !self.allows(&Capability::header(name)) {
            return None;
        }
        self.ctx.header(name)
    }
}

type Evaluator = Arc<dyn Fn(&RequestView<'_>) -> VaryValue + Send + Sync>;

/// A named, pure evaluator contributing one key dimension.
#[derive(Clone)]
pub struct VaryFunction {
    name: String,
    revision: String,
    capabilities: BTreeSet<Capability>,
    fingerprint: String,
    evaluate: Evaluator,
}

impl fmt::Debug for VaryFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaryFunction")
            .field("name", &self.name)
            .field("revision", &self.revision)
            .field("capabilities", &self.capabilities)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl VaryFunction {
    /// Validate and build an evaluator.
    ///
    /// The fingerprint covers the name, the capabilities and the revision
    /// tag, never the closure body. Bump the tag with [`Self::revision`] when
    /// the body changes so persisted keys are rebuilt.
    pub fn new<F>(
        name: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
        evaluate: F,
    ) -> Result<Self, VaryError>
    where
        F: Fn(&RequestView<'_>) -> VaryValue + Send + Sync + 'static,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(VaryError::EmptyName);
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(VaryError::InvalidName(name));
        }

        let capabilities: BTreeSet<Capability> = capabilities
            .into_iter()
            .map(|capability| match capability {
                Capability::Header(header) => Capability::header(&header),
                other => other,
            })
            .collect();
        if capabilities.is_empty() {
            return Err(VaryError::NoCapabilities(name));
        }

        for capability in &capabilities {
            if let Capability::Header(header) = capability {
                if FORBIDDEN_HEADERS.contains(&header.as_str()) {
                    return Err(VaryError::ForbiddenHeader {
                        name,
                        header: header.clone(),
                    });
                }
            }
        }

        let revision = String::new();
        let fingerprint = fingerprint(&name, &revision, &capabilities);

        Ok(Self {
            name,
            revision,
            capabilities,
            fingerprint,
            evaluate: Arc::new(evaluate),
        })
    }

    /// Dimension keyed on the raw value of one request header.
    pub fn header(header: &str) -> Result<Self, VaryError> {
        let header = header.trim().to_ascii_lowercase();
        let lookup = header.clone();
        Self::new(
            format!("header.{header}"),
            [Capability::Header(header)],
            move |req| VaryValue::from(req.header(&lookup)),
        )
    }

    /// Tag the definition. A new tag yields a new fingerprint.
    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self.fingerprint = fingerprint(&self.name, &self.revision, &self.capabilities);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn evaluate(&self, ctx: &RequestContext) -> VaryValue {
        let view = RequestView {
            ctx,
            capabilities: &self.capabilities,
        };
        (self.evaluate)(&view)
    }
}

fn fingerprint(name: &str, revision: &str, capabilities: &BTreeSet<Capability>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"\0");
    hasher.update(revision.as_bytes());
    for capability in capabilities {
        hasher.update(b"\0");
        hasher.update(capability.to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Registration-time errors. These are configuration mistakes and are fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VaryError {
    #[error("vary dimension name must not be empty")]
    EmptyName,
    #[error("vary dimension name `{0}` may only contain ASCII letters, digits, `_`, `-` and `.`")]
    InvalidName(String),
    #[error("vary dimension `{0}` must read at least one request field")]
    NoCapabilities(String),
    #[error("vary dimension `{name}` may not read header `{header}`")]
    ForbiddenHeader { name: String, header: String },
    #[error("vary dimension `{0}` is already registered with a different definition")]
    Conflict(String),
}

/// Persisted record of `{dimension name: fingerprint}` for one URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaryDimensionSet {
    pub dimensions: BTreeMap<String, String>,
}

impl VaryDimensionSet {
    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }
}

/// Evaluated dimensions, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolvedVary(BTreeMap<String, VaryValue>);

impl ResolvedVary {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&VaryValue> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// The evaluators known to this process, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct VaryRegistry {
    functions: BTreeMap<String, VaryFunction>,
}

impl VaryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an evaluator. Re-registering an identical definition is a no-op.
    pub fn register(&mut self, function: VaryFunction) -> Result<(), VaryError> {
        if let Some(existing) = self.functions.get(function.name()) {
            if existing.fingerprint() != function.fingerprint() {
                return Err(VaryError::Conflict(function.name().to_string()));
            }
        }
        self.functions.insert(function.name.clone(), function);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// The record persisted alongside a freshly captured entry.
    pub fn dimension_set(&self) -> VaryDimensionSet {
        VaryDimensionSet {
            dimensions: self
                .functions
                .values()
                .map(|function| (function.name.clone(), function.fingerprint.clone()))
                .collect(),
        }
    }

    /// Evaluate every registered evaluator in name order.
    pub fn resolve_all(&self, ctx: &RequestContext) -> ResolvedVary {
        ResolvedVary(
            self.functions
                .values()
                .map(|function| (function.name.clone(), function.evaluate(ctx)))
                .collect(),
        )
    }

    /// Evaluate a persisted dimension set.
    ///
    /// Returns `None` when a persisted dimension is unknown to this process or
    /// its definition changed; the key cannot be rebuilt faithfully then.
    pub fn resolve_persisted(
        &self,
        set: &VaryDimensionSet,
        ctx: &RequestContext,
    ) -> Option<ResolvedVary> {
        let mut resolved = BTreeMap::new();
        for (name, fingerprint) in &set.dimensions {
            let function = self.functions.get(name)?;
            if function.fingerprint() != fingerprint {
                return None;
            }
            resolved.insert(name.clone(), function.evaluate(ctx));
        }
        Some(ResolvedVary(resolved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mobile() -> VaryFunction {
        VaryFunction::new("mobile", [Capability::header("User-Agent")], |req| {
            req.header("user-agent")
                .map(|ua| ua.contains("Mobile"))
                .unwrap_or(false)
                .into()
        })
        .expect("valid vary function")
    }

    #[test]
    fn evaluator_sees_only_declared_fields() {
        let host_reader = VaryFunction::new("host_reader", [Capability::Path], |req| {
            VaryValue::from(req.host().is_some())
        })
        .expect("valid vary function");

        let ctx = RequestContext::get("example.com", "/");
        assert_eq!(host_reader.evaluate(&ctx), VaryValue::Bool(false));
    }

    #[test]
    fn mobile_dimension_reads_user_agent() {
        let ctx = RequestContext::get("example.com", "/")
            .with_header("User-Agent", "Mozilla/5.0 (iPhone) Mobile Safari");
        assert_eq!(mobile().evaluate(&ctx), VaryValue::Bool(true));
    }

    #[test]
    fn header_dimension_reads_one_header() {
        let language = VaryFunction::header("Accept-Language").expect("valid vary function");
        assert_eq!(language.name(), "header.accept-language");

        let ctx = RequestContext::get("example.com", "/").with_header("Accept-Language", "de");
        assert_eq!(language.evaluate(&ctx), VaryValue::Text("de".to_string()));
        let bare = RequestContext::get("example.com", "/");
        assert_eq!(language.evaluate(&bare), VaryValue::Null);
    }

    #[test]
    fn header_dimension_cannot_read_cookies() {
        assert!(matches!(
            VaryFunction::header("Cookie"),
            Err(VaryError::ForbiddenHeader { .. })
        ));
    }

    #[test]
    fn empty_name_is_rejected() {
        let err = VaryFunction::new(" ", [Capability::Host], |_| VaryValue::Null).unwrap_err();
        assert_eq!(err, VaryError::EmptyName);
    }

    #[test]
    fn capabilities_are_required() {
        let err = VaryFunction::new("constant", [], |_| VaryValue::Null).unwrap_err();
        assert_eq!(err, VaryError::NoCapabilities("constant".to_string()));
    }

    #[test]
    fn credential_headers_are_rejected() {
        let err = VaryFunction::new("auth", [Capability::header("Authorization")], |_| {
            VaryValue::Null
        })
        .unwrap_err();
        assert!(matches!(err, VaryError::ForbiddenHeader { .. }));
    }

    #[test]
    fn conflicting_redefinition_is_rejected() {
        let mut registry = VaryRegistry::new();
        registry.register(mobile()).expect("first registration");
        registry
            .register(mobile())
            .expect("identical registration is idempotent");

        let other = VaryFunction::new("mobile", [Capability::Query], |_| VaryValue::Null)
            .expect("valid vary function");
        assert_eq!(
            registry.register(other),
            Err(VaryError::Conflict("mobile".to_string()))
        );
    }

    #[test]
    fn revised_definition_no_longer_matches_persisted_sets() {
        let mut before = VaryRegistry::new();
        before.register(mobile()).expect("registration");
        let set = before.dimension_set();

        let revised = mobile().revision("2");
        assert_ne!(revised.fingerprint(), mobile().fingerprint());
        assert_eq!(mobile().revision("").fingerprint(), mobile().fingerprint());

        let mut after = VaryRegistry::new();
        after.register(revised).expect("registration");
        let ctx = RequestContext::get("example.com", "/");
        assert!(after.resolve_persisted(&set, &ctx).is_none());
    }

    #[test]
    fn persisted_set_resolves_with_matching_fingerprints() {
        let mut registry = VaryRegistry::new();
        registry.register(mobile()).expect("registration");
        let set = registry.dimension_set();

        let ctx = RequestContext::get("example.com", "/").with_header("user-agent", "Mobile");
        let resolved = registry
            .resolve_persisted(&set, &ctx)
            .expect("known dimensions");
        assert_eq!(resolved.get("mobile"), Some(&VaryValue::Bool(true)));
    }

    #[test]
    fn unknown_persisted_dimension_cannot_resolve() {
        let registry = VaryRegistry::new();
        let mut set = VaryDimensionSet::default();
        set.dimensions
            .insert("mobile".to_string(), "deadbeef".to_string());

        let ctx = RequestContext::get("example.com", "/");
        assert!(registry.resolve_persisted(&set, &ctx).is_none());
    }

    #[test]
    fn option_values_map_to_null() {
        assert_eq!(VaryValue::from(None::<&str>), VaryValue::Null);
        assert_eq!(
            VaryValue::from(Some("x")),
            VaryValue::Text("x".to_string())
        );
    }
}
