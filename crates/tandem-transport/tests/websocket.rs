//! Integration tests for the WebSocket client transport.
//!
//! These tests spin up a real `tokio-tungstenite` server on an ephemeral
//! port and dial it through [`WebSocketConnector`], so bytes actually cross
//! a socket.

#[cfg(feature = "websocket")]
mod websocket {
    use futures_util::{SinkExt, StreamExt};
    use tandem_transport::{Connection, Connector, TransportError, WebSocketConnector};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    /// Binds a listener on a random port and returns it with its ws:// url.
    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("should bind");
        let addr = listener.local_addr().expect("should have addr");
        (listener, format!("ws://{addr}"))
    }

    #[tokio::test]
    async fn test_websocket_connect_and_send_receive() {
        let (listener, url) = listen().await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Echo one message back.
            let msg = ws.next().await.unwrap().unwrap();
            ws.send(msg).await.unwrap();
            ws
        });

        let conn = WebSocketConnector.connect(&url).await.expect("should connect");
        conn.send(b"hello from client").await.expect("send should succeed");

        let echoed = conn
            .recv()
            .await
            .expect("recv should succeed")
            .expect("should have data");
        assert_eq!(echoed, b"hello from client");

        let _ws = server.await.unwrap();
        conn.close().await.expect("close should succeed");
    }

    #[tokio::test]
    async fn test_websocket_normal_close_returns_none() {
        let (listener, url) = listen().await;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "done".into(),
            }))
            .await
            .unwrap();
        });

        let conn = WebSocketConnector.connect(&url).await.unwrap();
        let result = conn.recv().await.expect("normal close is not an error");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_websocket_abnormal_close_is_error() {
        let (listener, url) = listen().await;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Error,
                reason: "boom".into(),
            })))
            .await
            .unwrap();
        });

        let conn = WebSocketConnector.connect(&url).await.unwrap();
        let err = conn.recv().await.unwrap_err();
        assert!(matches!(err, TransportError::Closed { code: Some(1011), .. }));
    }

    #[tokio::test]
    async fn test_websocket_connect_refused() {
        // Bind then drop so the port is (almost certainly) closed.
        let (listener, url) = listen().await;
        drop(listener);

        let result = WebSocketConnector.connect(&url).await;
        assert!(matches!(result, Err(TransportError::ConnectFailed(_))));
    }

    #[cfg(feature = "tls")]
    #[tokio::test]
    async fn test_wss_attempts_a_tls_handshake() {
        let (listener, url) = listen().await;
        let url = url.replacen("ws://", "wss://", 1);

        // Accept and hang up: the TLS handshake itself must be what fails.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let err = match WebSocketConnector.connect(&url).await {
            Ok(_) => panic!("handshake with a closed socket succeeded"),
            Err(err) => err,
        };
        assert!(matches!(err, TransportError::ConnectFailed(_)));
        assert!(!err.to_string().contains("not compiled"), "{err}");
    }
}
