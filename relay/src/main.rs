mod routes;
mod state;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let port: u16 = match std::env::var("PORT") {
        Ok(raw) => match raw.parse() {
            Ok(port) => port,
            Err(e) => {
                tracing::error!(%raw, error = %e, "invalid PORT");
                return;
            }
        },
        Err(_) => 3000,
    };

    let state = state::RelayState::from_env();
    let app = routes::app(state);

    let listener = match tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(%port, error = %e, "failed to bind");
            return;
        }
    };

    tracing::info!(%port, "relay listening");
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "relay server failed");
    }
}
