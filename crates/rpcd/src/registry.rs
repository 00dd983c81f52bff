//! Service registry for dispatching authenticated calls to handlers.
//!
//! This module provides the `Registry` struct that maps service names to
//! handlers. Typed handlers take and return `serde` values encoded as
//! MessagePack maps; raw handlers see the payload bytes untouched.

use std::collections::HashMap;

use protocol::{DispatchError, DispatchResult, Dispatcher};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

type Handler = Box<dyn Fn(&[u8]) -> DispatchResult + Send + Sync>;

/// Encodes a value as a MessagePack map with named fields.
pub fn encode_payload<T: Serialize + ?Sized>(
    value: &T,
) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(value)
}

/// Decodes a MessagePack payload.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(payload)
}

/// Explicit registration table implementing [`Dispatcher`].
#[derive(Default)]
pub struct Registry {
    services: HashMap<String, Handler>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a typed handler under `name`.
    ///
    /// The request payload is decoded into `Req`; a decode failure is an
    /// internal error. A handler's `Err(text)` is returned to the caller as
    /// a logic error.
    pub fn register<Req, Resp, F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        Req: DeserializeOwned,
        Resp: Serialize,
        F: Fn(Req) -> Result<Resp, String> + Send + Sync + 'static,
    {
        let name = name.into();
        let service = name.clone();
        self.insert(
            name,
            Box::new(move |payload: &[u8]| {
                let request: Req = decode_payload(payload).map_err(|e| {
                    DispatchError::Internal(format!("failed to decode {} request: {}", service, e))
                })?;
                let response = handler(request).map_err(DispatchError::Logic)?;
                encode_payload(&response).map_err(|e| {
                    DispatchError::Internal(format!("failed to encode {} response: {}", service, e))
                })
            }),
        )
    }

    /// Registers a handler that works on raw payload bytes.
    pub fn register_raw<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&[u8]) -> DispatchResult + Send + Sync + 'static,
    {
        self.insert(name.into(), Box::new(handler))
    }

    fn insert(&mut self, name: String, handler: Handler) -> &mut Self {
        if self.services.insert(name.clone(), handler).is_some() {
            warn!(service = %name, "Replaced existing service handler");
        } else {
            debug!(service = %name, "Registered service");
        }
        self
    }

    /// Returns true if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Returns the registered service names, sorted.
    pub fn service_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl Dispatcher for Registry {
    fn dispatch(&self, service: &str, payload: &[u8]) -> DispatchResult {
        match self.services.get(service) {
            Some(handler) => handler(payload),
            None => Err(DispatchError::Logic(format!("can't find service {}", service))),
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("services", &self.service_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct AddRequest {
        a: i64,
        b: i64,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct AddResponse {
        sum: i64,
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register("math.Add", |req: AddRequest| {
                req.a
                    .checked_add(req.b)
                    .map(|sum| AddResponse { sum })
                    .ok_or_else(|| "overflow".to_string())
            })
            .register_raw("svc.Echo", |payload| Ok(payload.to_vec()));
        registry
    }

    #[test]
    fn test_registry_typed_dispatch() {
        let registry = registry();
        let payload = encode_payload(&AddRequest { a: 2, b: 40 }).unwrap();
        let response = registry.dispatch("math.Add", &payload).unwrap();
        let response: AddResponse = decode_payload(&response).unwrap();
        assert_eq!(response, AddResponse { sum: 42 });
    }

    #[test]
    fn test_registry_raw_dispatch() {
        let registry = registry();
        assert_eq!(registry.dispatch("svc.Echo", &[1, 2, 3]).unwrap(), vec![1, 2, 3]);
        assert!(registry.dispatch("svc.Echo", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_registry_handler_error_is_logic() {
        let registry = registry();
        let payload = encode_payload(&AddRequest { a: i64::MAX, b: 1 }).unwrap();
        assert_eq!(
            registry.dispatch("math.Add", &payload),
            Err(DispatchError::Logic("overflow".to_string()))
        );
    }

    #[test]
    fn test_registry_unknown_service_is_logic() {
        let registry = registry();
        assert_eq!(
            registry.dispatch("math.Sub", &[]),
            Err(DispatchError::Logic("can't find service math.Sub".to_string()))
        );
    }

    #[test]
    fn test_registry_bad_payload_is_internal() {
        let registry = registry();
        let result = registry.dispatch("math.Add", &[0xc1]);
        assert!(matches!(result, Err(DispatchError::Internal(_))));
    }

    #[test]
    fn test_payloads_use_named_fields() {
        let payload = encode_payload(&AddResponse { sum: 1 }).unwrap();
        // fixmap with one entry, then the fixstr "sum"
        assert_eq!(&payload[..5], &[0x81, 0xa3, b's', b'u', b'm']);
    }

    #[test]
    fn test_registry_names() {
        let registry = registry();
        assert_eq!(registry.service_names(), vec!["math.Add", "svc.Echo"]);
        assert!(registry.contains("svc.Echo"));
        assert!(!registry.contains("svc.echo"));
        assert_eq!(registry.len(), 2);
        assert!(!registry.is_empty());
        assert!(Registry::new().is_empty());
    }

    #[test]
    fn test_registry_replace_handler() {
        let mut registry = registry();
        registry.register_raw("svc.Echo", |_| Ok(b"replaced".to_vec()));
        assert_eq!(registry.dispatch("svc.Echo", b"x").unwrap(), b"replaced");
        assert_eq!(registry.len(), 2);
    }
}
