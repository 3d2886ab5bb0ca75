use http::request::Parts;

/// Authenticated requester, inserted into request extensions by upstream auth middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequesterIdentity(pub String);

/// Resolves who is making a request so cache keys can be scoped per requester.
pub trait IdentityResolver: Send + Sync {
    fn current_identity(&self, parts: &Parts) -> Option<String>;
}

/// Reads [`RequesterIdentity`] from the request extensions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionIdentityResolver;

impl IdentityResolver for ExtensionIdentityResolver {
    fn current_identity(&self, parts: &Parts) -> Option<String> {
        parts
            .extensions
            .get::<RequesterIdentity>()
            .map(|identity| identity.0.clone())
    }
}

/// Never scopes keys. Useful for services without authentication.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousIdentityResolver;

impl IdentityResolver for AnonymousIdentityResolver {
    fn current_identity(&self, _parts: &Parts) -> Option<String> {
        None
    }
}
