mod common;

use std::net::SocketAddr;

use reqwest::StatusCode;

struct TestServer {
    addr: SocketAddr,
    client: reqwest::Client,
}

impl TestServer {
    async fn spawn() -> Self {
        let app = signalhub_api::app::build_app(common::scored_services());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            addr,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

#[tokio::test]
async fn serves_health_and_insights_over_tcp() {
    let server = TestServer::spawn().await;

    let res = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = server.client.get(server.url("/insights/churn")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["scored"], common::CUSTOMERS);
    assert_eq!(body["threshold"], 0.5);
}
