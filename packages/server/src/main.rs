// Intake orchestration core: scheduler + crawler control plane.

use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use server_core::{build_app, Config, CoreBuilder};

// Exit codes: 0 clean shutdown, 1 config/startup failure, 2 dependency
// unreachable at startup.
const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_DEPENDENCY: i32 = 2;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let _ = dotenvy::dotenv();

    tracing::info!("starting intake orchestration core");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return EXIT_CONFIG;
        }
    };

    let pool = match PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "database unreachable");
            return EXIT_DEPENDENCY;
        }
    };
    tracing::info!("database connected");

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        tracing::error!(error = %e, "migrations failed");
        return EXIT_DEPENDENCY;
    }
    tracing::info!("migrations complete");

    let port = config.port;
    let core = match CoreBuilder::new(config, pool).build() {
        Ok(core) => core,
        Err(e) => {
            tracing::error!(error = %e, "core wiring failed");
            return EXIT_CONFIG;
        }
    };

    let shutdown = CancellationToken::new();
    let workers = match core.start(shutdown.clone()).await {
        Ok(workers) => workers,
        Err(e) => {
            tracing::error!(error = %e, "core startup failed");
            return EXIT_DEPENDENCY;
        }
    };

    let app = build_app(core.state.clone());
    let addr = format!("0.0.0.0:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind");
            return EXIT_CONFIG;
        }
    };
    tracing::info!(addr = %addr, "control API listening");

    let serve = axum::serve(listener, app).with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    if let Err(e) = serve.await {
        tracing::error!(error = %e, "server error");
        shutdown.cancel();
        return EXIT_CONFIG;
    }

    // Let the scheduler drain in-flight executions.
    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    tracing::info!("clean shutdown");
    EXIT_OK
}
