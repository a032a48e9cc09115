//! Signature verification hook
//!
//! Payloads carrying a `signatures` member are checked by every configured
//! verifier before they reach filters or handlers. Unsigned payloads pass.

use std::sync::Arc;

use crate::envelope::Request;

pub trait SignatureVerifier: Send + Sync + 'static {
    fn verify(&self, request: &Request) -> Result<(), String>;
}

impl<F> SignatureVerifier for F
where
    F: Fn(&Request) -> Result<(), String> + Send + Sync + 'static,
{
    fn verify(&self, request: &Request) -> Result<(), String> {
        self(request)
    }
}

/// Run `verifiers` against a signed request; first failure wins
pub fn verify_signed(verifiers: &[Arc<dyn SignatureVerifier>], request: &Request) -> Result<(), String> {
    if !request.payload().has_signatures() {
        return Ok(());
    }
    verifiers
        .iter()
        .try_for_each(|verifier| verifier.verify(request))
}
