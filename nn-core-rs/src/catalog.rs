//! Message catalog
//!
//! Explicit registry from a message type tag (the OCPP action name) to the
//! typed parse and serialize functions of that message. Catalogs are built
//! once at startup and are immutable afterwards.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::envelope::Payload;

/// Errors converting between payloads and typed messages
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid {action} payload: {reason}")]
    Invalid { action: String, reason: String },

    #[error("{action} expects a {expected} payload")]
    WrongEncoding {
        action: String,
        expected: &'static str,
    },

    #[error("failed to serialize {action}: {reason}")]
    Serialize { action: String, reason: String },
}

/// One request/response message pair of the catalog
pub trait Operation: Send + Sync + 'static {
    /// Message type tag on the wire
    const ACTION: &'static str;

    type Request: Clone + Debug + Send + Sync + 'static;
    type Response: Clone + Debug + Send + Sync + 'static;

    fn parse_request(payload: &Payload) -> Result<Self::Request, CodecError>;

    fn request_payload(request: &Self::Request) -> Result<Payload, CodecError>;

    fn parse_response(payload: &Payload) -> Result<Self::Response, CodecError>;

    fn response_payload(response: &Self::Response) -> Result<Payload, CodecError>;

    /// Response used when `request` is refused without reaching a handler,
    /// e.g. by a relay filter
    fn rejected(request: &Self::Request, reason: &str) -> Self::Response;
}

/// Helpers for operations whose payloads are serde JSON types
pub mod json {
    use super::*;

    pub fn parse<T: DeserializeOwned>(action: &str, payload: &Payload) -> Result<T, CodecError> {
        let Payload::Json(value) = payload else {
            return Err(CodecError::WrongEncoding {
                action: action.to_string(),
                expected: "JSON",
            });
        };
        T::deserialize(value).map_err(|e| CodecError::Invalid {
            action: action.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn payload<T: Serialize>(action: &str, value: &T) -> Result<Payload, CodecError> {
        serde_json::to_value(value)
            .map(Payload::Json)
            .map_err(|e| CodecError::Serialize {
                action: action.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Type-erased view of an [`Operation`]
pub trait CatalogEntry: Send + Sync {
    fn action(&self) -> &'static str;

    /// Parse the request payload into the operation's boxed request type
    fn parse_request_any(&self, payload: &Payload) -> Result<Box<dyn Any + Send + Sync>, CodecError>;

    /// Parse the request payload, discarding the typed value
    fn check_request(&self, payload: &Payload) -> Result<(), CodecError> {
        self.parse_request_any(payload).map(|_| ())
    }

    fn check_response(&self, payload: &Payload) -> Result<(), CodecError>;

    /// Payload of the operation's rejected response to a request parsed
    /// with [`parse_request_any`](Self::parse_request_any)
    fn rejected_payload(
        &self,
        parsed: &(dyn Any + Send + Sync),
        reason: &str,
    ) -> Result<Payload, CodecError>;
}

struct Entry<O>(PhantomData<fn() -> O>);

impl<O: Operation> CatalogEntry for Entry<O> {
    fn action(&self) -> &'static str {
        O::ACTION
    }

    fn parse_request_any(&self, payload: &Payload) -> Result<Box<dyn Any + Send + Sync>, CodecError> {
        let request = O::parse_request(payload)?;
        Ok(Box::new(request))
    }

    fn check_response(&self, payload: &Payload) -> Result<(), CodecError> {
        O::parse_response(payload).map(|_| ())
    }

    fn rejected_payload(
        &self,
        parsed: &(dyn Any + Send + Sync),
        reason: &str,
    ) -> Result<Payload, CodecError> {
        let request = parsed
            .downcast_ref::<O::Request>()
            .ok_or_else(|| CodecError::Invalid {
                action: O::ACTION.to_string(),
                reason: "request of another operation".to_string(),
            })?;
        O::response_payload(&O::rejected(request, reason))
    }
}

/// Immutable action → operation registry
#[derive(Clone)]
pub struct Catalog {
    name: String,
    entries: HashMap<&'static str, Arc<dyn CatalogEntry>>,
}

impl Catalog {
    pub fn builder(name: impl Into<String>) -> CatalogBuilder {
        CatalogBuilder {
            name: name.into(),
            entries: HashMap::new(),
        }
    }

    /// Catalog without any operations
    pub fn empty(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, action: &str) -> Option<&Arc<dyn CatalogEntry>> {
        self.entries.get(action)
    }

    pub fn contains(&self, action: &str) -> bool {
        self.entries.contains_key(action)
    }

    /// Registered actions in alphabetical order
    pub fn actions(&self) -> Vec<&'static str> {
        let mut actions: Vec<_> = self.entries.keys().copied().collect();
        actions.sort_unstable();
        actions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("name", &self.name)
            .field("actions", &self.actions())
            .finish()
    }
}

/// Builder for [`Catalog`]
pub struct CatalogBuilder {
    name: String,
    entries: HashMap<&'static str, Arc<dyn CatalogEntry>>,
}

impl CatalogBuilder {
    /// Register an operation; a second registration of the same action is
    /// ignored.
    pub fn register<O: Operation>(mut self) -> Self {
        if self.entries.contains_key(O::ACTION) {
            warn!("Catalog {}: {} already registered, ignoring", self.name, O::ACTION);
            return self;
        }
        self.entries
            .insert(O::ACTION, Arc::new(Entry::<O>(PhantomData)));
        self
    }

    /// Take over every operation of `other` not registered yet
    pub fn extend(mut self, other: &Catalog) -> Self {
        for (action, entry) in &other.entries {
            self.entries.entry(action).or_insert_with(|| entry.clone());
        }
        self
    }

    pub fn build(self) -> Catalog {
        Catalog {
            name: self.name,
            entries: self.entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct PingRequest {
        seq: u32,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct PingResponse {
        status: String,
    }

    struct Ping;

    impl Operation for Ping {
        const ACTION: &'static str = "Ping";
        type Request = PingRequest;
        type Response = PingResponse;

        fn parse_request(payload: &Payload) -> Result<PingRequest, CodecError> {
            json::parse(Self::ACTION, payload)
        }

        fn request_payload(request: &PingRequest) -> Result<Payload, CodecError> {
            json::payload(Self::ACTION, request)
        }

        fn parse_response(payload: &Payload) -> Result<PingResponse, CodecError> {
            json::parse(Self::ACTION, payload)
        }

        fn response_payload(response: &PingResponse) -> Result<Payload, CodecError> {
            json::payload(Self::ACTION, response)
        }

        fn rejected(_request: &PingRequest, _reason: &str) -> PingResponse {
            PingResponse {
                status: "Rejected".into(),
            }
        }
    }

    #[test]
    fn test_registry_lookup() {
        let catalog = Catalog::builder("test").register::<Ping>().register::<Ping>().build();

        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.actions(), vec!["Ping"]);
        assert!(catalog.get("Pong").is_none());

        let entry = catalog.get("Ping").unwrap();
        assert!(entry.check_request(&Payload::Json(json!({"seq": 1}))).is_ok());
        assert!(entry.check_request(&Payload::Json(json!({"seq": "x"}))).is_err());
        assert!(matches!(
            entry.check_request(&Payload::Binary(vec![1])),
            Err(CodecError::WrongEncoding { .. })
        ));
    }

    #[test]
    fn test_rejected_payload() {
        let catalog = Catalog::builder("test").register::<Ping>().build();
        let entry = catalog.get("Ping").unwrap();
        let parsed = entry.parse_request_any(&Payload::Json(json!({"seq": 3}))).unwrap();

        let payload = entry.rejected_payload(&*parsed, "nope").unwrap();
        assert_eq!(payload, Payload::Json(json!({"status": "Rejected"})));
        assert!(entry.rejected_payload(&"other", "nope").is_err());
    }

    #[test]
    fn test_extend() {
        let base = Catalog::builder("base").register::<Ping>().build();
        let merged = Catalog::builder("merged").extend(&base).build();
        assert!(merged.contains("Ping"));
        assert!(Catalog::empty("none").is_empty());
    }
}
