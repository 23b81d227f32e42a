use serde::{Deserialize, Serialize};

/// Hard cap on a request datagram. Larger payloads are rejected at parse
/// time; there is no fragmentation or reassembly.
pub const MAX_DATAGRAM: usize = 1_400;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchRequest {
    pub model_session_id: String,
    pub request_id: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchReply {
    pub request_id: u64,
    pub status: DispatchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendEndpoint>,
}

impl DispatchReply {
    pub fn found(request_id: u64, backend: BackendEndpoint) -> Self {
        Self {
            request_id,
            status: DispatchStatus::Ok,
            backend: Some(backend),
        }
    }

    pub fn not_found(request_id: u64) -> Self {
        Self {
            request_id,
            status: DispatchStatus::ModelNotFound,
            backend: None,
        }
    }

    pub fn invalid(request_id: u64) -> Self {
        Self {
            request_id,
            status: DispatchStatus::InvalidRequest,
            backend: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Ok,
    ModelNotFound,
    InvalidRequest,
}

impl DispatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchStatus::Ok => "ok",
            DispatchStatus::ModelNotFound => "model_not_found",
            DispatchStatus::InvalidRequest => "invalid_request",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendEndpoint {
    pub backend_id: u32,
    pub address: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_from_wire_json() {
        let raw = br#"{"model_session_id":"resnet:1","request_id":42}"#;
        let request: DispatchRequest =
            serde_json::from_slice(raw).expect("request should parse");

        assert_eq!(request.model_session_id, "resnet:1");
        assert_eq!(request.request_id, 42);
    }

    #[test]
    fn not_found_reply_omits_the_backend() {
        let reply = DispatchReply::not_found(7);
        let encoded = serde_json::to_string(&reply).expect("reply should encode");

        assert!(encoded.contains("model_not_found"));
        assert!(!encoded.contains("backend"));
    }

    #[test]
    fn found_reply_round_trips() {
        let reply = DispatchReply::found(
            9,
            BackendEndpoint {
                backend_id: 2,
                address: "10.0.0.2:8001".to_owned(),
            },
        );
        let encoded = serde_json::to_vec(&reply).expect("reply should encode");
        assert!(encoded.len() <= MAX_DATAGRAM);

        let decoded: DispatchReply =
            serde_json::from_slice(&encoded).expect("reply should decode");
        assert_eq!(decoded.status, DispatchStatus::Ok);
        assert_eq!(decoded.backend.map(|backend| backend.backend_id), Some(2));
    }
}
