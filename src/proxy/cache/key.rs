use crate::proxy::request::ProxyRequest;

/// Identifies a cached response.
///
/// The resource string (`host[:port]/path`) is kept for diagnostics; storage uses the BLAKE3
/// digest of it, which is fixed-width hex and therefore safe as a file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    resource: String,
    entry_id: String,
}

impl CacheKey {
    pub fn new(resource: impl Into<String>) -> Self {
        let resource = resource.into();
        let entry_id = Self::entry_id_for(&resource);
        Self { resource, entry_id }
    }

    pub fn for_request(request: &ProxyRequest) -> Self {
        Self::new(request.resource())
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    fn entry_id_for(resource: &str) -> String {
        blake3::hash(resource.as_bytes()).to_hex().to_string()
    }
}
