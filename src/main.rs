//! certd - certificate authority gateway, issuance worker and admin tool
//!
//! One binary runs either role of the cluster. Both roles read the same
//! configuration file, database, cache and shared secret.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use certd_api::{health_router, ApiServer, ApiServerConfig, AppState};
use certd_cert::{FileKeyStore, KeyStore, ProfileRequest};
use certd_control::{
    connect_cache, init_ca, rotate_ocsp_key, AcmeStore, CaStore, CertdConfig, DbJobQueue, InitCa,
    IssuanceWorker, Job, JobQueue, NetworkValidator, OrderMachine, Readiness, RetryPolicy,
    SharedSecret, StatusCache, WorkerHealth,
};
use certd_db::entities::{job::JobStatus, revocation::RevocationReason};
use sea_orm::DatabaseConnection;

#[derive(Parser, Debug)]
#[command(name = "certd")]
#[command(about = "Certificate authority with ACME and OCSP", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// YAML configuration file (defaults apply when omitted)
    #[arg(long, short, global = true, env = "CERTD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// Settings that take precedence over the configuration file
#[derive(clap::Args, Debug, Default)]
struct Overrides {
    /// Database connection URL (sqlite://... or postgres://...)
    #[arg(long, global = true, env = "CERTD_DATABASE_URL")]
    database_url: Option<String>,

    /// Status cache URL (memory:// or redis://...)
    #[arg(long, global = true, env = "CERTD_CACHE_URL")]
    cache_url: Option<String>,

    /// Shared secret file
    #[arg(long, global = true, env = "CERTD_SECRET_FILE")]
    secret_file: Option<PathBuf>,

    /// Directory holding CA and OCSP responder keys
    #[arg(long, global = true, env = "CERTD_KEY_DIR")]
    key_dir: Option<PathBuf>,

    /// Gateway bind address
    #[arg(long, global = true, env = "CERTD_BIND")]
    bind: Option<String>,

    /// Worker health endpoint bind address
    #[arg(long, global = true, env = "CERTD_HEALTH_BIND")]
    health_bind: Option<String>,
}

impl Overrides {
    fn apply(self, config: &mut CertdConfig) {
        if let Some(url) = self.database_url {
            config.database_url = url;
        }
        if let Some(url) = self.cache_url {
            config.cache_url = url;
        }
        if let Some(path) = self.secret_file {
            config.secret_file = path;
        }
        if let Some(dir) = self.key_dir {
            config.key_dir = dir;
        }
        if let Some(bind) = self.bind {
            config.gateway.bind = bind;
        }
        if let Some(bind) = self.health_bind {
            config.worker.health_bind = bind;
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve ACME, OCSP and the management API
    Gateway,

    /// Process the job queue; the only role that signs with CA keys
    Worker,

    /// Gateway and Worker in one process (development)
    All,

    /// Apply database migrations and exit
    Migrate,

    /// Create a root CA with its delegated OCSP responder
    InitCa {
        /// Unique name, used in ACME URLs
        #[arg(long)]
        name: String,

        #[arg(long)]
        common_name: String,

        #[arg(long)]
        organization: Option<String>,

        #[arg(long, default_value = "3650")]
        validity_days: i64,

        /// Do not serve this CA over ACME
        #[arg(long)]
        no_acme: bool,
    },

    /// Issue a new OCSP responder certificate and key generation
    RotateOcspKey {
        /// CA id or name
        #[arg(long)]
        ca: String,
    },

    /// Queue a CSR for signing
    SignCert {
        /// CA id or name
        #[arg(long)]
        ca: String,

        /// PEM or DER PKCS#10 file
        #[arg(long)]
        csr: PathBuf,

        #[arg(long)]
        validity_days: Option<i64>,

        /// Extra DNS names added to the CSR's
        #[arg(long = "san")]
        sans: Vec<String>,

        /// Idempotency key (random when omitted)
        #[arg(long)]
        request_id: Option<String>,

        /// Wait for a worker to finish and print the certificate
        #[arg(long)]
        wait: bool,
    },

    /// Queue a revocation
    RevokeCert {
        /// CA id or name
        #[arg(long)]
        ca: String,

        /// Serial in hex (`2A`, `01:00`) or `0x`-prefixed
        #[arg(long)]
        serial: String,

        /// RFC 5280 reason name, e.g. keyCompromise
        #[arg(long, default_value = "unspecified")]
        reason: String,
    },

    /// Print a CA and its responder as JSON
    ViewCa {
        /// CA id or name
        #[arg(long)]
        ca: String,
    },

    /// Mint a management API token from the shared secret
    GenerateToken {
        /// Operator or service name
        #[arg(long, default_value = "admin")]
        subject: String,

        /// Token validity in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn load_config(path: Option<&PathBuf>, overrides: Overrides) -> Result<Arc<CertdConfig>> {
    let mut config = match path {
        Some(path) => CertdConfig::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => CertdConfig::default(),
    };
    overrides.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(Arc::new(config))
}

/// Shared infrastructure every role needs
struct Runtime {
    config: Arc<CertdConfig>,
    db: DatabaseConnection,
    store: CaStore,
    queue: Arc<dyn JobQueue>,
    secret: SharedSecret,
}

impl Runtime {
    async fn open(config: Arc<CertdConfig>) -> Result<Self> {
        let secret = SharedSecret::load(&config.secret_file)
            .context("The shared secret is required; refusing to start")?;

        info!("Connecting to database");
        let db = certd_db::connect(&config.database_url)
            .await
            .context("Failed to connect to database")?;
        certd_db::migrate(&db)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to run database migrations: {}", e))?;

        let retry = RetryPolicy {
            max_attempts: config.worker.max_attempts,
            base: Duration::from_millis(config.worker.backoff_base_ms),
            max: Duration::from_millis(config.worker.backoff_max_ms),
        };

        Ok(Self {
            store: CaStore::new(db.clone()),
            queue: Arc::new(DbJobQueue::new(db.clone(), retry)),
            db,
            secret,
            config,
        })
    }

    async fn cache(&self) -> Result<Arc<dyn StatusCache>> {
        connect_cache(&self.config.cache_url)
            .await
            .context("Failed to connect to status cache")
    }

    fn keys(&self) -> Arc<dyn KeyStore> {
        Arc::new(FileKeyStore::new(&self.config.key_dir))
    }

    async fn find_ca(&self, ca: &str) -> Result<certd_db::entities::certificate_authority::Model> {
        self.store
            .find_ca(ca)
            .await?
            .with_context(|| format!("{}: CA not found", ca))
    }
}

fn parse_addr(addr: &str, what: &str) -> Result<SocketAddr> {
    addr.parse()
        .with_context(|| format!("Invalid {} address {}", what, addr))
}

fn gateway_server(rt: &Runtime, cache: Arc<dyn StatusCache>) -> Result<ApiServer> {
    let signing_keys: Option<Arc<dyn KeyStore>> = if rt.config.gateway.sign_ocsp {
        info!("Gateway signs OCSP responses with delegated responder keys");
        Some(Arc::new(FileKeyStore::read_only(&rt.config.key_dir)))
    } else {
        None
    };

    let state = AppState::new(
        rt.db.clone(),
        cache,
        rt.queue.clone(),
        signing_keys,
        &rt.secret,
        rt.config.clone(),
    );
    Ok(ApiServer::new(
        ApiServerConfig {
            bind_addr: parse_addr(&rt.config.gateway.bind, "gateway")?,
            enable_cors: true,
            jwt_secret: rt.secret.jwt_secret(),
        },
        state,
    ))
}

fn issuance_worker(rt: &Runtime, cache: Arc<dyn StatusCache>) -> Result<IssuanceWorker> {
    let validator = NetworkValidator::new(
        Duration::from_secs(rt.config.acme.validation_timeout_secs),
        rt.config.acme.http01_port,
    )
    .map_err(|e| anyhow::anyhow!("Failed to create challenge validator: {}", e))?;

    Ok(IssuanceWorker::new(
        rt.store.clone(),
        rt.queue.clone(),
        cache,
        rt.keys(),
        OrderMachine::new(AcmeStore::new(rt.db.clone())),
        Arc::new(validator),
        rt.config.clone(),
        WorkerHealth::new(),
    ))
}

/// Cancel `shutdown` on Ctrl+C
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, stopping..."),
            Err(err) => error!("Error listening for shutdown signal: {}", err),
        }
        shutdown.cancel();
    });
}

async fn run_gateway(rt: Runtime) -> Result<()> {
    let cache = rt.cache().await?;
    let server = gateway_server(&rt, cache)?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());
    server.start(shutdown).await?;

    info!("Gateway stopped");
    Ok(())
}

async fn run_worker(rt: Runtime) -> Result<()> {
    let cache = rt.cache().await?;
    let worker = Arc::new(issuance_worker(&rt, cache.clone())?);
    let readiness = Arc::new(
        Readiness::new(rt.store.clone(), cache, rt.queue.clone())
            .with_worker(worker.health().clone()),
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let health_addr = parse_addr(&rt.config.worker.health_bind, "worker health")?;
    let listener = tokio::net::TcpListener::bind(health_addr).await?;
    info!("Worker health endpoint on {}", health_addr);
    let health_shutdown = shutdown.clone();
    let health = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health_router(readiness))
            .with_graceful_shutdown(async move { health_shutdown.cancelled().await })
            .await
        {
            error!("Health endpoint failed: {}", e);
        }
    });

    worker.run(shutdown).await;
    let _ = health.await;

    info!("Worker stopped");
    Ok(())
}

async fn run_all(rt: Runtime) -> Result<()> {
    let cache = rt.cache().await?;
    let server = gateway_server(&rt, cache.clone())?;
    let worker = Arc::new(issuance_worker(&rt, cache)?);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let worker_task = tokio::spawn(worker.run(shutdown.clone()));
    let result = server.start(shutdown.clone()).await;
    shutdown.cancel();
    if let Err(e) = worker_task.await {
        warn!("Worker task ended abnormally: {}", e);
    }
    result
}

async fn sign_cert(
    rt: Runtime,
    ca: &str,
    csr: &Path,
    validity_days: Option<i64>,
    sans: Vec<String>,
    request_id: Option<String>,
    wait: bool,
) -> Result<()> {
    let ca = rt.find_ca(ca).await?;
    let bytes = std::fs::read(csr).with_context(|| format!("Failed to read {}", csr.display()))?;
    let parsed = certd_cert::ParsedCsr::parse(&bytes).context("Invalid CSR")?;
    let request_id = request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let enqueued = rt
        .queue
        .enqueue(&Job::Issue {
            ca_id: ca.id.clone(),
            csr_pem: parsed.to_pem(),
            profile: ProfileRequest {
                validity_days,
                sans,
                ..Default::default()
            },
            order_id: None,
            request_id: request_id.clone(),
        })
        .await?;
    info!(job_id = %enqueued.job_id, request_id = %request_id, "Issuance queued");

    if !wait {
        println!("{}", enqueued.job_id);
        return Ok(());
    }

    loop {
        let job = rt
            .queue
            .get(&enqueued.job_id)
            .await?
            .with_context(|| format!("{}: job vanished", enqueued.job_id))?;
        match job.status {
            JobStatus::Succeeded => break,
            JobStatus::Failed | JobStatus::Dead | JobStatus::Superseded => {
                anyhow::bail!(
                    "Issuance failed: {}",
                    job.last_error.unwrap_or_else(|| "unknown error".to_string())
                );
            }
            JobStatus::Queued | JobStatus::Running => {
                tokio::time::sleep(Duration::from_millis(500)).await
            }
        }
    }

    let cert = rt
        .store
        .find_by_idempotency_key(&request_id)
        .await?
        .context("Job succeeded but the certificate is missing")?;
    print!("{}", cert.cert_pem);
    Ok(())
}

async fn revoke_cert(rt: Runtime, ca: &str, serial: &str, reason: &str) -> Result<()> {
    let ca = rt.find_ca(ca).await?;
    let hex: String = serial
        .trim_start_matches("0x")
        .chars()
        .filter(|c| *c != ':')
        .collect();
    let serial = i64::from_str_radix(&hex, 16)
        .ok()
        .filter(|v| *v >= 0)
        .with_context(|| format!("{}: invalid serial", serial))?;
    let reason = RevocationReason::parse(reason)
        .with_context(|| format!("{}: unknown revocation reason", reason))?;

    let enqueued = rt
        .queue
        .enqueue(&Job::Revoke {
            ca_id: ca.id,
            serial,
            reason,
        })
        .await?;
    println!("{}", enqueued.job_id);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config = load_config(cli.config.as_ref(), cli.overrides)?;

    match cli.command {
        Commands::GenerateToken { subject, hours } => {
            let secret = SharedSecret::load(&config.secret_file)?;
            let token = certd_api::middleware::issue_token(
                &secret.jwt_secret(),
                &subject,
                chrono::Duration::hours(hours),
            )?;
            println!("{}", token);
            Ok(())
        }
        Commands::Migrate => {
            let db = certd_db::connect(&config.database_url).await?;
            certd_db::migrate(&db)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to run database migrations: {}", e))?;
            info!("Migrations applied");
            Ok(())
        }
        Commands::Gateway => {
            info!("Starting certd gateway");
            run_gateway(Runtime::open(config).await?).await
        }
        Commands::Worker => {
            info!("Starting certd worker");
            run_worker(Runtime::open(config).await?).await
        }
        Commands::All => {
            info!("Starting certd gateway and worker");
            run_all(Runtime::open(config).await?).await
        }
        Commands::InitCa {
            name,
            common_name,
            organization,
            validity_days,
            no_acme,
        } => {
            let rt = Runtime::open(config).await?;
            let ca = init_ca(
                &rt.store,
                &rt.keys(),
                &rt.config.ocsp,
                InitCa {
                    name,
                    common_name,
                    organization,
                    validity_days,
                    acme_enabled: !no_acme,
                },
                chrono::Utc::now(),
            )
            .await?;
            println!("{}", ca.id);
            Ok(())
        }
        Commands::RotateOcspKey { ca } => {
            let rt = Runtime::open(config).await?;
            let ca = rt.find_ca(&ca).await?;
            let generation =
                rotate_ocsp_key(&rt.store, &rt.keys(), &rt.config.ocsp, &ca.id, chrono::Utc::now())
                    .await?;
            // Cached responses of the old generation are re-signed on the next refresh
            rt.queue
                .enqueue(&Job::RefreshAll {
                    bucket: chrono::Utc::now().timestamp(),
                })
                .await?;
            info!(ca = %ca.name, generation, "OCSP responder key rotated");
            Ok(())
        }
        Commands::SignCert {
            ca,
            csr,
            validity_days,
            sans,
            request_id,
            wait,
        } => {
            let rt = Runtime::open(config).await?;
            sign_cert(rt, &ca, &csr, validity_days, sans, request_id, wait).await
        }
        Commands::RevokeCert { ca, serial, reason } => {
            let rt = Runtime::open(config).await?;
            revoke_cert(rt, &ca, &serial, &reason).await
        }
        Commands::ViewCa { ca } => {
            let rt = Runtime::open(config).await?;
            let ca = rt.find_ca(&ca).await?;
            let view = serde_json::json!({
                "id": ca.id,
                "name": ca.name,
                "subject": ca.subject,
                "status": ca.status,
                "not_before": ca.not_before,
                "not_after": ca.not_after,
                "next_serial": ca.next_serial,
                "acme_enabled": ca.acme_enabled,
                "key_generation": ca.key_generation,
                "certificate": ca.cert_pem,
                "ocsp_certificate": ca.ocsp_cert_pem,
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
    }
}
