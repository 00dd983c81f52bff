//! Demo services served by `sealrpc serve`.

use protocol::DispatchResult;
use serde::{Deserialize, Serialize};

use crate::registry::Registry;

/// Request for `service.Query`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueryRequest {
    pub name: String,
}

/// Response for `service.Query`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueryResponse {
    pub age: i64,
}

/// Echoes the payload bytes back unchanged.
pub fn echo(payload: &[u8]) -> DispatchResult {
    Ok(payload.to_vec())
}

/// Looks up a user by name. Only `admin` is known.
pub fn query(req: QueryRequest) -> Result<QueryResponse, String> {
    if req.name != "admin" {
        return Err("unknown name".to_string());
    }
    Ok(QueryResponse { age: 100 })
}

/// Builds a registry with every demo service.
pub fn demo_registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register_raw("svc.Echo", echo)
        .register("service.Query", query);
    registry
}
