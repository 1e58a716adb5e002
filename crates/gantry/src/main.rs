use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use argh::FromArgs;
use tokio::net::TcpListener;
use tracing::{error, info};

use gantry::config::Config;
use gantry::db::Database;
use gantry::error::{Result, ServerError};
use gantry::http::build_router;
use gantry::mqtt::{self, MqttClient};
use gantry::server::Server;
use gantry::unix;

#[derive(FromArgs)]
/// API gateway daemon for 3D-printer installations.
struct Cli {
    /// path to the TOML configuration file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,
    /// enable debug logging
    #[argh(switch, short = 'v')]
    verbose: bool,
}

fn main() {
    let cli: Cli = argh::from_env();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(if cli.verbose { "debug" } else { "info" })
            }),
        )
        .init();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("failed to build tokio runtime: {error}");
            std::process::exit(1);
        }
    };
    if let Err(error) = runtime.block_on(run(cli)) {
        error!(%error, "gantry exited with error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .or_else(|| std::env::var_os("GANTRY_CONFIG").map(PathBuf::from));
    let config = Config::load(config_path.as_deref())?;

    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ServerError::internal(format!("create database dir: {e}")))?;
    }
    let database = Database::open(db_path, config.server.instance_id.clone()).await?;
    info!(
        unsafe_shutdowns = database.unsafe_shutdown_count(),
        "database ready"
    );

    let server = Server::new(config, database);
    server.register_builtin_endpoints()?;

    if let Some(mqtt_config) = server.config.mqtt.clone() {
        let (mqtt_client, eventloop) = MqttClient::new(Arc::downgrade(&server), &mqtt_config);
        server.set_mqtt(mqtt_client.clone());
        mqtt::register_endpoints(&server)?;
        mqtt_client.start(eventloop);
    }

    let http_addr = format!("{}:{}", server.config.server.host, server.config.server.port);
    let http_listener = TcpListener::bind(&http_addr)
        .await
        .map_err(|e| ServerError::internal(format!("bind http on {http_addr}: {e}")))?;
    let unix_listener = unix::bind(&server.config.unix_socket_path()).await?;

    tokio::spawn(unix::run_acceptor(unix_listener, server.clone()));
    tokio::spawn(server.klippy.clone().run());

    let app = build_router(server.clone());
    let serve = axum::serve(
        http_listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );
    info!(%http_addr, "gantry ready");
    tokio::select! {
        result = serve.into_future() => {
            if let Err(error) = result {
                error!(%error, "http server error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }
    server.close().await;
    Ok(())
}
