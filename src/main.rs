use authora::auth::{AuthProvider, LocalAuthProvider, RemoteAuthProvider};
use authora::device_flow::{DeviceFlow, DeviceFlowConfig};
use authora::ratelimit::{MemoryStore, RateLimitStore, RateLimiter, SharedStore};
use authora::session::SessionGuard;
use authora::settings::Settings;
use authora::token::{LocalTokenProvider, RemoteTokenProvider, TokenProvider};
use authora::tokens::TokenService;
use authora::users::UserService;
use authora::web::AppState;
use authora::{jobs, storage, web};
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use migration::MigratorTrait;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "authora",
    version,
    about = "OAuth 2.0 Device Authorization Grant server"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings (rejects invalid enum values)
    let settings = Settings::load(&cli.config)?;
    tracing::info!(
        addr = %settings.server.addr,
        auth_mode = %settings.auth.mode,
        token_provider = %settings.token_provider.mode,
        rate_limit_store = %settings.rate_limit.store,
        "Loaded configuration"
    );

    // init storage
    let db = storage::init(&settings.database).await?;
    migration::Migrator::up(&db, None).await.into_diagnostic()?;
    tracing::info!("Database migrations applied successfully");

    // seed break-glass admin and a first client
    authora::users::ensure_default_admin(&db, "admin", "password123").await?;
    ensure_default_client(&db).await?;

    // auth providers
    let local_auth: Arc<dyn AuthProvider> = Arc::new(LocalAuthProvider::new(db.clone()));
    let remote_mode = settings.auth.mode == "remote";
    let remote_auth: Option<Arc<dyn AuthProvider>> = if remote_mode {
        let url = settings
            .auth
            .remote_url
            .clone()
            .ok_or_else(|| miette::miette!("auth.remote_url missing"))?;
        let provider = RemoteAuthProvider::new(
            url,
            Duration::from_secs(settings.auth.remote_timeout_secs),
            settings.auth.remote_insecure,
        )
        .map_err(|e| miette::miette!("failed to build remote auth client: {e}"))?;
        Some(Arc::new(provider))
    } else {
        None
    };
    let users = UserService::new(db.clone(), local_auth, remote_auth, remote_mode);

    // token provider
    let token_provider: Arc<dyn TokenProvider> = match settings.token_provider.mode.as_str() {
        "remote" => {
            let url = settings
                .token_provider
                .remote_url
                .clone()
                .ok_or_else(|| miette::miette!("token_provider.remote_url missing"))?;
            Arc::new(
                RemoteTokenProvider::new(
                    url,
                    Duration::from_secs(settings.token_provider.remote_timeout_secs),
                    settings.token_provider.remote_insecure,
                )
                .map_err(|e| miette::miette!("failed to build remote token client: {e}"))?,
            )
        }
        _ => Arc::new(LocalTokenProvider::new(settings.jwt.secret.clone())),
    };

    // rate limiter
    let limiter = if settings.rate_limit.enabled {
        let store: Arc<dyn RateLimitStore> = match settings.rate_limit.store.as_str() {
            "shared" => {
                let addr = settings
                    .rate_limit
                    .shared_addr
                    .clone()
                    .ok_or_else(|| miette::miette!("rate_limit.shared_addr missing"))?;
                Arc::new(
                    SharedStore::connect(
                        &addr,
                        settings.rate_limit.shared_password.as_deref(),
                        settings.rate_limit.shared_db,
                    )
                    .await
                    .map_err(|e| miette::miette!("{e}"))?,
                )
            }
            _ => Arc::new(MemoryStore::new()),
        };
        Some(RateLimiter::new(
            store,
            settings.rate_limit.trust_proxy_headers,
        ))
    } else {
        tracing::warn!("Rate limiting is disabled");
        None
    };

    let device = DeviceFlow::new(
        db.clone(),
        Arc::clone(&token_provider),
        DeviceFlowConfig {
            base_url: settings.base_url(),
            expiry_secs: settings.device.expiry_secs,
            poll_interval_secs: settings.device.poll_interval_secs,
            token_ttl_secs: settings.jwt.ttl_secs,
        },
    );
    let tokens = TokenService::new(db.clone(), token_provider);
    let sessions = SessionGuard::new(db.clone(), &settings);

    // background sweeps
    let _scheduler = jobs::init_scheduler(db.clone(), settings.session.idle_timeout_secs).await?;

    web::serve(AppState {
        settings: Arc::new(settings),
        db,
        users,
        device,
        tokens,
        sessions,
        limiter,
    })
    .await
}

async fn ensure_default_client(db: &sea_orm::DatabaseConnection) -> Result<()> {
    if storage::any_client_exists(db).await? {
        return Ok(());
    }
    let client = storage::create_client(
        db,
        storage::NewClient {
            name: "Authora CLI".to_string(),
            creator_user_id: None,
            grant_types: "urn:ietf:params:oauth:grant-type:device_code".to_string(),
            scopes: "read write".to_string(),
        },
    )
    .await?;
    tracing::info!(
        client_id = %client.client_id,
        client_secret = %client.client_secret,
        "Created default device-flow client"
    );
    Ok(())
}
