//! Integration tests for the transport layer
//!
//! These tests run a real `TcpServer` on an ephemeral port and talk to it
//! through `TcpTransportAsync`.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::protocol::{ErrorInfoKind, RpcRequest, RpcResponse};
    use crate::transport::{receive_message, send_message, Codec, TcpServer, TcpTransportAsync};

    async fn spawn_echo_server() -> String {
        let server = TcpServer::new("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            server
                .run_with_handler(|request: RpcRequest| async move {
                    let name: String = request.param(0).unwrap_or_default();
                    RpcResponse::success_value(request.request_id, &format!("hello {}", name)).unwrap()
                })
                .await
        });

        addr
    }

    #[tokio::test]
    async fn test_request_response_over_tcp() {
        let addr = spawn_echo_server().await;
        let transport = TcpTransportAsync::new(Duration::from_secs(2));
        let mut stream = transport.connect(&addr).await.unwrap();

        let request = RpcRequest::builder("Greeter", "hello").param("kestrel").unwrap().build();
        let response = transport.send_request(&mut stream, &Codec::json(), &request).await.unwrap();

        assert_eq!(response.request_id, request.request_id);
        assert_eq!(response.value::<String>().unwrap(), "hello kestrel");
    }

    #[tokio::test]
    async fn test_keep_alive_multiple_requests() {
        let addr = spawn_echo_server().await;
        let transport = TcpTransportAsync::new(Duration::from_secs(2));
        let mut stream = transport.connect(&addr).await.unwrap();

        for i in 0..5 {
            let request = RpcRequest::builder("Greeter", "hello").param(&format!("n{}", i)).unwrap().build();
            let response = transport.send_request(&mut stream, &Codec::json(), &request).await.unwrap();
            assert_eq!(response.value::<String>().unwrap(), format!("hello n{}", i));
        }
    }

    #[tokio::test]
    async fn test_reply_uses_request_codec() {
        let addr = spawn_echo_server().await;
        let transport = TcpTransportAsync::new(Duration::from_secs(2));
        let mut stream = transport.connect(&addr).await.unwrap();

        let request = RpcRequest::builder("Greeter", "hello").param("bin").unwrap().build();
        let encoded = Codec::postcard().encode_request(&request).unwrap();
        let reply = transport.round_trip(&mut stream, &encoded).await.unwrap();

        assert_eq!(Codec::detect(&reply).unwrap(), Codec::postcard());
        let response = Codec::decode_response(&reply).unwrap();
        assert_eq!(response.value::<String>().unwrap(), "hello bin");
    }

    #[tokio::test]
    async fn test_undecodable_frame_gets_bad_request() {
        let addr = spawn_echo_server().await;
        let mut stream = tokio::net::TcpStream::connect(&addr).await.unwrap();

        send_message(&mut stream, &[1, b'n', b'o', b'p', b'e']).await.unwrap();
        let reply = receive_message(&mut stream).await.unwrap();
        let response = Codec::decode_response(&reply).unwrap();

        assert!(!response.is_success());
        assert_eq!(response.exception.unwrap().kind, ErrorInfoKind::BadRequest);

        // Connection is still usable afterwards
        let request = RpcRequest::builder("Greeter", "hello").param("again").unwrap().build();
        send_message(&mut stream, &Codec::json().encode_request(&request).unwrap()).await.unwrap();
        let reply = receive_message(&mut stream).await.unwrap();
        assert!(Codec::decode_response(&reply).unwrap().is_success());
    }
}
