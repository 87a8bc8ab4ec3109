/*
[INPUT]:  Request method, endpoint path and body
[OUTPUT]: Authentication headers for private token requests
[POS]:    HTTP layer - request signing seam for authenticated endpoints
[UPDATE]: When the signing contract between client and signer changes
*/

use crate::http::Result;

/// Produces the authentication headers for a private REST call.
///
/// The key/secret scheme lives with the caller; the adapter only needs the
/// resulting headers to request a private connection token.
pub trait RequestSigner: Send + Sync {
    /// Headers to attach to `method endpoint` carrying `body`
    fn sign(&self, method: &str, endpoint: &str, body: &str) -> Result<Vec<(String, String)>>;
}

/// Signer returning a fixed header set, for tests and pre-signed gateways
#[derive(Debug, Clone, Default)]
pub struct StaticHeaderSigner {
    headers: Vec<(String, String)>,
}

impl StaticHeaderSigner {
    pub fn new(headers: Vec<(String, String)>) -> Self {
        Self { headers }
    }
}

impl RequestSigner for StaticHeaderSigner {
    fn sign(&self, _method: &str, _endpoint: &str, _body: &str) -> Result<Vec<(String, String)>> {
        Ok(self.headers.clone())
    }
}
