//! Wire packet model: the sole unit crossing every WebSocket edge.

use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved route names. Reserved routes begin and end with `$`;
/// user routes must not collide with them.
pub mod routes {
    pub const HEARTICK: &str = "$heartick$";
    pub const RESPONSE: &str = "$response$";
    pub const INNER_P2P: &str = "$innerP2P$";
    pub const INNER_GRP: &str = "$innerGRP$";
    pub const INNER_ALL: &str = "$innerALL$";
    pub const INNER_RMC: &str = "$innerRMC$";

    /// Whether a route name falls in the reserved namespace.
    pub fn is_reserved(route: &str) -> bool {
        route.len() >= 2 && route.starts_with('$') && route.ends_with('$')
    }
}

/// WebSocket close codes. The framework reserves 4001-4200:
/// server side 4001-4100, client side 4101-4200. Applications may use
/// 4201-4999.
pub mod close {
    /// Parse error (codec failure).
    pub const PARSE: u16 = 4001;
    /// Format error (packet shape validation).
    pub const FORMAT: u16 = 4002;
    /// Repeat error (duplicate reqId).
    pub const REPEAT: u16 = 4003;
    /// Sign error (cluster envelope signature mismatch).
    pub const SIGN: u16 = 4004;
    /// Remote error (unknown RMC route).
    pub const REMOTE: u16 = 4005;
    /// Route error (unknown user route).
    pub const ROUTE: u16 = 4006;
    /// Socket error.
    pub const SOCKET: u16 = 4007;
    /// Timeout (heartbeat lapse).
    pub const TIMEOUT: u16 = 4008;
    /// Displaced by a newer bind of the same UID.
    pub const NEWBIND: u16 = 4009;

    /// Client: stale socket being replaced before a retry.
    pub const CLIENT_RETRY: u16 = 4101;
    /// Client: remote closed the connection.
    pub const CLIENT_CLOSE: u16 = 4102;
    /// Client: socket-level error.
    pub const CLIENT_ERROR: u16 = 4103;
    /// Client: explicit disconnect call.
    pub const CLIENT_CALL: u16 = 4104;
}

/// A single wire packet.
///
/// `req_id` is assigned by the sender and must be unique among in-flight
/// requests on that connection; `message` carries an arbitrary JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub route: String,
    #[serde(rename = "reqId")]
    pub req_id: u64,
    pub message: Value,
}

impl Packet {
    pub fn new(route: impl Into<String>, req_id: u64, message: Value) -> Self {
        Self {
            route: route.into(),
            req_id,
            message,
        }
    }

    /// Validate the shape of a decoded JSON value and build a packet.
    ///
    /// `route` must be a string, `reqId` a non-negative number, and
    /// `message` present and non-null. A violation is a format error,
    /// which the server answers with close code 4002.
    pub fn from_value(value: Value) -> MeshResult<Self> {
        let obj = match value {
            Value::Object(map) => map,
            other => return Err(MeshError::Format(format!("packet is not an object: {other}"))),
        };
        let route = match obj.get("route").and_then(Value::as_str) {
            Some(r) if !r.is_empty() => r.to_string(),
            Some(_) => return Err(MeshError::Format("route is empty".into())),
            None => return Err(MeshError::Format("route is not a string".into())),
        };
        let req_id = match obj.get("reqId").and_then(Value::as_u64) {
            Some(id) => id,
            None => return Err(MeshError::Format("reqId is not a number".into())),
        };
        let message = match obj.get("message") {
            Some(Value::Null) | None => {
                return Err(MeshError::Format("message is absent or null".into()))
            }
            Some(m) => m.clone(),
        };
        Ok(Self {
            route,
            req_id,
            message,
        })
    }
}

/// The `message` field of a `$response$` packet.
///
/// `code` 200 means success; 4xx/5xx carry a failure. `data` holds the
/// result or an error description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub code: i64,
    pub data: Value,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self { code: 200, data }
    }

    pub fn fail(code: i64, data: Value) -> Self {
        Self { code, data }
    }

    /// The envelope synthesized when a pending request outlives its deadline.
    pub fn gateway_timeout() -> Self {
        Self {
            code: 504,
            data: Value::String("Gateway Timeout".into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 200
    }

    /// Read a response envelope out of a packet `message` field.
    /// A malformed envelope is reported as a 500 carrying the raw value.
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<Response>(value.clone()) {
            Ok(resp) => resp,
            Err(_) => Self { code: 500, data: value },
        }
    }
}

impl From<Response> for Value {
    fn from(resp: Response) -> Value {
        serde_json::json!({ "code": resp.code, "data": resp.data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_value_accepts_well_formed() {
        let p = Packet::from_value(json!({"route": "echo", "reqId": 1, "message": "hi"})).unwrap();
        assert_eq!(p.route, "echo");
        assert_eq!(p.req_id, 1);
        assert_eq!(p.message, json!("hi"));
    }

    #[test]
    fn from_value_rejects_bad_shapes() {
        assert!(Packet::from_value(json!({})).is_err());
        assert!(Packet::from_value(json!({"route": 1, "reqId": 1, "message": "x"})).is_err());
        assert!(Packet::from_value(json!({"route": "", "reqId": 1, "message": "x"})).is_err());
        assert!(Packet::from_value(json!({"route": "r", "reqId": "1", "message": "x"})).is_err());
        assert!(Packet::from_value(json!({"route": "r", "reqId": -1, "message": "x"})).is_err());
        assert!(Packet::from_value(json!({"route": "r", "reqId": 1})).is_err());
        assert!(Packet::from_value(json!({"route": "r", "reqId": 1, "message": null})).is_err());
        assert!(Packet::from_value(json!("not an object")).is_err());
    }

    #[test]
    fn req_id_field_serializes_camel_case() {
        let p = Packet::new("echo", 7, json!({"a": 1}));
        let text = serde_json::to_string(&p).unwrap();
        assert!(text.contains("\"reqId\":7"));
        let back: Packet = serde_json::from_str(&text).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn reserved_route_predicate() {
        assert!(routes::is_reserved(routes::HEARTICK));
        assert!(routes::is_reserved(routes::INNER_RMC));
        assert!(!routes::is_reserved("echo"));
        assert!(!routes::is_reserved("$"));
    }

    #[test]
    fn response_from_value_is_lenient() {
        let ok = Response::from_value(json!({"code": 200, "data": "HI"}));
        assert!(ok.is_ok());
        let bad = Response::from_value(json!("garbage"));
        assert_eq!(bad.code, 500);
    }
}
