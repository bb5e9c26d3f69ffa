// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf messages of the `direktiv_flow.Flow` service used by the sidecar.
//!
//! Only the two calls the sidecar issues are declared here. Field tags match
//! the engine's service definition.

/// Fully qualified gRPC service name.
pub const SERVICE_NAME: &str = "direktiv_flow.Flow";

/// Method path for `ReportActionResults`.
pub const REPORT_ACTION_RESULTS_PATH: &str = "/direktiv_flow.Flow/ReportActionResults";

/// Method path for `ActionLog`.
pub const ACTION_LOG_PATH: &str = "/direktiv_flow.Flow/ActionLog";

/// Result of a single action, reported once per accepted action.
///
/// Exactly one of the following holds:
/// - success: `error_code` and `error_message` are empty
/// - catchable failure: `error_code` is set
/// - uncatchable failure: only `error_message` is set
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportActionResultsRequest {
    #[prost(string, tag = "1")]
    pub instance_id: ::prost::alloc::string::String,
    #[prost(int32, tag = "2")]
    pub step: i32,
    #[prost(string, tag = "3")]
    pub action_id: ::prost::alloc::string::String,
    #[prost(int32, tag = "4")]
    pub iterator: i32,
    #[prost(bytes = "vec", tag = "5")]
    pub output: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "6")]
    pub error_code: ::prost::alloc::string::String,
    #[prost(string, tag = "7")]
    pub error_message: ::prost::alloc::string::String,
}

/// Log lines emitted by an action, attributed to an instance and iterator.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActionLogRequest {
    #[prost(string, tag = "1")]
    pub instance_id: ::prost::alloc::string::String,
    #[prost(int32, tag = "2")]
    pub iterator: i32,
    #[prost(string, repeated, tag = "3")]
    pub msg: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_report_request_wire_layout() {
        let request = ReportActionResultsRequest {
            instance_id: "i".to_string(),
            step: 3,
            action_id: String::new(),
            iterator: 0,
            output: Vec::new(),
            error_code: String::new(),
            error_message: String::new(),
        };

        // Default-valued fields are omitted on the wire.
        let bytes = request.encode_to_vec();
        assert_eq!(bytes, vec![0x0a, 0x01, b'i', 0x10, 0x03]);
    }

    #[test]
    fn test_action_log_repeated_messages() {
        let request = ActionLogRequest {
            instance_id: "inst".to_string(),
            iterator: 1,
            msg: vec!["first".to_string(), "second".to_string()],
        };

        let decoded = ActionLogRequest::decode(request.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.msg, vec!["first", "second"]);
        assert_eq!(decoded.iterator, 1);
    }

    #[test]
    fn test_method_paths_belong_to_service() {
        assert!(REPORT_ACTION_RESULTS_PATH.starts_with(&format!("/{SERVICE_NAME}/")));
        assert!(ACTION_LOG_PATH.starts_with(&format!("/{SERVICE_NAME}/")));
    }
}
