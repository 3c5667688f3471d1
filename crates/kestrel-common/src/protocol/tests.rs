//! Tests for the protocol module
//!
//! These tests cover request construction, ID generation, response helpers
//! and error classification.

#[cfg(test)]
mod tests {
    use super::super::*;
    use super::super::requests::compose_request_id;
    use std::collections::HashSet;

    #[test]
    fn test_request_builder() {
        let req = RpcRequest::builder("UserService", "getUser")
            .param(&42u64)
            .unwrap()
            .param("alice")
            .unwrap()
            .build();

        assert_eq!(req.service_name, "UserService");
        assert_eq!(req.method_name, "getUser");
        assert_eq!(req.parameters.len(), 2);
        assert_eq!(req.parameter_types[0], TypeDescriptor::new("u64"));
        assert_eq!(req.parameter_types[1], TypeDescriptor::new("str"));
        assert_eq!(req.param::<u64>(0).unwrap(), 42);
        assert_eq!(req.param::<String>(1).unwrap(), "alice");
    }

    #[test]
    fn test_request_missing_param() {
        let req = RpcRequest::builder("UserService", "getUser").build();
        assert!(matches!(req.param::<u64>(0), Err(TransportError::Codec(_))));
    }

    #[test]
    fn test_request_id_uniqueness() {
        let ids: HashSet<_> = (0..1000)
            .map(|_| RpcRequest::builder("s", "m").build().request_id)
            .collect();
        assert_eq!(ids.len(), 1000, "All request IDs should be unique");
    }

    #[test]
    fn test_request_ids_differ_across_processes_sharing_a_clock() {
        let timestamp = 0x1234_5678_0000_0000;
        let first: Vec<_> = (0..100).map(|n| compose_request_id(timestamp, 0xdead_beef, n)).collect();
        let second: Vec<_> = (0..100).map(|n| compose_request_id(timestamp, 0x0bad_cafe_f00d, n)).collect();

        let all: HashSet<_> = first.iter().chain(&second).collect();
        assert_eq!(all.len(), 200);
        assert!(first.iter().all(|id| id.len() == 32));
    }

    #[test]
    fn test_request_id_uniqueness_under_stress() {
        use std::sync::{Arc, Mutex};
        use std::thread;

        let ids = Arc::new(Mutex::new(HashSet::new()));
        let mut handles = vec![];

        for _ in 0..8 {
            let ids_clone = Arc::clone(&ids);
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    let id = RpcRequest::builder("s", "m").build().request_id;
                    let mut ids = ids_clone.lock().unwrap();
                    assert!(ids.insert(id.clone()), "Duplicate ID detected: {}", id);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ids.lock().unwrap().len(), 4000);
    }

    #[test]
    fn test_response_success_value() {
        let resp = RpcResponse::success_value("abc", &vec![1, 2, 3]).unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.request_id, "abc");
        assert_eq!(resp.value::<Vec<i32>>().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_response_failure_has_no_payload() {
        let resp = RpcResponse::failure("abc", ErrorInfo::new(ErrorInfoKind::MethodNotFound, "nope"));
        assert!(!resp.is_success());
        assert!(resp.data.is_empty());
        assert_eq!(resp.message, "nope");
        assert_eq!(resp.exception.unwrap().kind, ErrorInfoKind::MethodNotFound);
    }

    #[test]
    fn test_metadata_keys() {
        let meta = ServiceMetadata::new("UserService", "host1", 8001);
        assert_eq!(meta.address(), "host1:8001");
        assert_eq!(meta.registry_key(), "/services/UserService/host1:8001");
        assert_eq!(ServiceMetadata::service_prefix("UserService"), "/services/UserService/");
        assert_eq!(meta.weight, 1);
        assert_eq!(meta.version, "1.0");
    }

    #[test]
    fn test_metadata_defaults_on_deserialize() {
        let meta: ServiceMetadata =
            serde_json::from_str(r#"{"service_name":"s","host":"h","port":1}"#).unwrap();
        assert_eq!(meta.weight, 1);
        assert_eq!(meta.version, "1.0");
    }

    // ========================================================================
    // Error classification
    // ========================================================================

    #[test]
    fn test_transport_timeout_becomes_timeout_error() {
        let err = RpcError::from_transport(Stage::Send, "h:1", TransportError::Timeout(50));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.instance(), Some("h:1"));
        assert_eq!(err.stage(), Stage::Send);
    }

    #[test]
    fn test_registry_error_kinds() {
        let unavailable = RpcError::Registry {
            stage: Stage::Resolve,
            source: RegistryError::Unavailable("down".into()),
        };
        assert_eq!(unavailable.kind(), ErrorKind::RegistryUnavailable);

        let missing = RpcError::NoProviderAvailable { service: "s".into() };
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        assert_eq!(missing.stage(), Stage::Resolve);
    }

    #[test]
    fn test_retry_exhausted_reports_last_failure() {
        let last = RpcError::from_transport(Stage::Send, "h:1", TransportError::Timeout(50));
        let err = RpcError::RetryExhausted {
            attempts: 3,
            last: Box::new(last.clone()),
        };

        assert_eq!(err.kind(), ErrorKind::RetryExhausted);
        assert_eq!(err.root(), &last);
        assert_eq!(err.stage(), Stage::Send);
        assert_eq!(err.instance(), Some("h:1"));

        let message = err.to_string();
        assert!(message.contains("3 attempts"), "{}", message);
        assert!(message.contains("[send]"), "{}", message);
        assert!(message.contains("h:1"), "{}", message);
    }

    #[test]
    fn test_io_error_mapping() {
        use std::io;

        let refused = TransportError::from_io(io::Error::from(io::ErrorKind::ConnectionRefused), "connect", 10);
        assert!(matches!(refused, TransportError::ConnectionRefused(_)));

        let timed_out = TransportError::from_io(io::Error::from(io::ErrorKind::TimedOut), "read", 10);
        assert_eq!(timed_out, TransportError::Timeout(10));

        let eof = TransportError::from_io(io::Error::from(io::ErrorKind::UnexpectedEof), "read", 10);
        assert!(matches!(eof, TransportError::Closed(_)));
    }
}
