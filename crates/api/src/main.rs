#[tokio::main]
async fn main() {
    flowforge_observability::init();

    let bind = std::env::var("FLOWFORGE_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let app = flowforge_api::app::build_app();

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {bind}: {e}"));

    tracing::info!("listening on {}", listener.local_addr().unwrap());

    axum::serve(listener, app).await.unwrap();
}
