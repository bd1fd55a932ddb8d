//! Runs a real [`SrpcServer`] and [`SrpcClient`] pair over an actual
//! loopback TCP socket, for tests that want to exercise the handshake, auth
//! and request/response path end to end instead of against a hand-rolled
//! mini-server (as `basalt-srpc::client`'s own unit tests do).

use std::sync::Arc;

use async_trait::async_trait;
use basalt_srpc::{
    AllowAllAuthorizer, ClientAuthorizer, ClientKeyFetcher, SrpcClient, SrpcClientOptions,
    SrpcServer, SrpcServerOptions,
};
use tokio::net::TcpListener;

/// A [`ClientKeyFetcher`] backed by a single fixed client id/secret pair,
/// for tests that only ever dial in as one client.
struct SingleClientKeyFetcher {
    client_id: String,
    secret: String,
}

#[async_trait]
impl ClientKeyFetcher for SingleClientKeyFetcher {
    async fn fetch(&self, client_id: &str) -> Option<String> {
        (client_id == self.client_id).then(|| self.secret.clone())
    }
}

/// A running [`SrpcServer`] bound to a loopback port, plus a connected
/// [`SrpcClient`] dialed against it with matching credentials.
///
/// Dropping this struct stops the client's reconnect supervisor and the
/// accept-loop task; the listener itself closes when `server` is dropped.
pub struct LoopbackSrpc {
    pub server: Arc<SrpcServer>,
    pub client: SrpcClient,
    accept_task: tokio::task::JoinHandle<()>,
}

impl LoopbackSrpc {
    /// Binds a server on `127.0.0.1:0`, spawns its accept loop, and connects
    /// a client to it using `client_id`/`secret` for the HMAC handshake.
    pub async fn start(client_id: &str, secret: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback listener");
        let addr = listener.local_addr().expect("local addr");

        let server = Arc::new(SrpcServer::new(
            SrpcServerOptions::default(),
            Arc::new(SingleClientKeyFetcher {
                client_id: client_id.to_string(),
                secret: secret.to_string(),
            }),
            Arc::new(AllowAllAuthorizer) as Arc<dyn ClientAuthorizer>,
        ));

        let accept_server = server.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (tcp, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let server = accept_server.clone();
                tokio::spawn(async move {
                    let mut query = String::new();
                    let callback = |request: &tokio_tungstenite::tungstenite::handshake::server::Request,
                                     response: tokio_tungstenite::tungstenite::handshake::server::Response| {
                        query = request.uri().query().unwrap_or("").to_string();
                        Ok(response)
                    };
                    let ws = match tokio_tungstenite::accept_hdr_async(tcp, callback).await {
                        Ok(ws) => ws,
                        Err(_) => return,
                    };
                    let _ = server.accept(ws, &query).await;
                });
            }
        });

        let client = SrpcClient::new(SrpcClientOptions {
            url: format!("ws://{addr}/ws"),
            client_id: client_id.to_string(),
            secret: secret.to_string(),
            ..Default::default()
        });
        client.connect().await.expect("client connects to loopback server");

        Self {
            server,
            client,
            accept_task,
        }
    }
}

impl Drop for LoopbackSrpc {
    fn drop(&mut self) {
        self.client.stop();
        self.accept_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn client_completes_a_request_against_a_real_server() {
        let harness = LoopbackSrpc::start("client-1", "s3cr3t").await;
        harness
            .server
            .register_handler("uEcho", |data| async move { Ok(data) });

        let reply = harness
            .client
            .invoke("uEcho", serde_json::json!({"hello": "world"}), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, serde_json::json!({"hello": "world"}));
    }

    #[tokio::test]
    async fn wrong_secret_fails_the_handshake() {
        let harness = LoopbackSrpc::start("client-1", "s3cr3t").await;
        drop(harness);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(SrpcServer::new(
            SrpcServerOptions::default(),
            Arc::new(SingleClientKeyFetcher {
                client_id: "client-1".to_string(),
                secret: "correct-secret".to_string(),
            }),
            Arc::new(AllowAllAuthorizer) as Arc<dyn ClientAuthorizer>,
        ));
        let accept_server = server.clone();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut query = String::new();
            let callback = |request: &tokio_tungstenite::tungstenite::handshake::server::Request,
                             response: tokio_tungstenite::tungstenite::handshake::server::Response| {
                query = request.uri().query().unwrap_or("").to_string();
                Ok(response)
            };
            let ws = tokio_tungstenite::accept_hdr_async(tcp, callback).await.unwrap();
            let _ = accept_server.accept(ws, &query).await;
        });

        let client = SrpcClient::new(SrpcClientOptions {
            url: format!("ws://{addr}/ws"),
            client_id: "client-1".to_string(),
            secret: "wrong-secret".to_string(),
            reconnect: false,
            connect_timeout_ms: 500,
            ..Default::default()
        });
        let connected = tokio::time::timeout(Duration::from_millis(800), client.connect()).await;
        assert!(connected.is_err() || !client.is_connected());
    }
}
