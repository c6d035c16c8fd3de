use std::sync::Arc;

use rpc_call_runtime::{
    build_admin_app, config::Config, echo, logging, transport::TlsCredentials, AdminState,
    Server,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    let bind_socket = config.bind_socket()?;

    let server = Server::with_options(config.server_options());
    server.register_handlers(echo::service())?;
    let port = match &config.tls {
        Some(tls) => {
            let cert = std::fs::read(&tls.cert)?;
            let key = std::fs::read(&tls.key)?;
            let credentials = TlsCredentials::from_pem(&cert, &key)?;
            server.bind_secure_port(&bind_socket.to_string(), Arc::new(credentials))?
        }
        None => server.bind_insecure_port(&bind_socket.to_string())?,
    };

    info!(
        bind_addr = %config.bind_addr,
        bind_port = port,
        tls = config.tls.is_some(),
        "server starting"
    );
    server.start().await?;

    if let Some(admin_socket) = config.admin_socket()? {
        let app = build_admin_app(AdminState::new(server.clone(), config.admin_token.clone()));
        let listener = tokio::net::TcpListener::bind(admin_socket).await?;
        info!(admin_addr = %admin_socket, "admin endpoint listening");
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app.into_make_service()).await {
                warn!(error = %err, "admin endpoint failed");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!(
        grace_ms = u64::try_from(config.shutdown_grace.as_millis()).unwrap_or(u64::MAX),
        "shutdown requested"
    );
    server.stop(Some(config.shutdown_grace)).await;
    server.wait_for_termination(None).await;
    Ok(())
}
