//! dossierd — knowledge record service entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config and init logger at the configured level
//!   3. Construct the generator backend and service
//!   4. Register existing snapshots (metadata only)
//!   5. Spawn the refresh scheduler if enabled
//!   6. Run until ctrl-c, then shut down

use tracing::info;

use dossier::config;
use dossier::error::KbError;
use dossier::fetcher::{DeltaSource, StaticDeltaSource};
use dossier::generator::Generator;
use dossier::logger;
use dossier::monitor::MemoryMonitor;
use dossier::scheduler::RefreshScheduler;
use dossier::service::KnowledgeBaseService;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), KbError> {
    // Load .env if present — ignore errors (file is optional).
    let _ = dotenvy::dotenv();

    let cfg = config::load()?;
    logger::init(&cfg.log_level)?;

    info!(
        service = %cfg.service_name,
        data_dir = %cfg.data_dir.display(),
        provider = %cfg.generator.provider,
        "config loaded"
    );

    let generator = Generator::from_config(&cfg.generator, cfg.llm_api_key.clone())?;
    let service = KnowledgeBaseService::new(&cfg, generator)?;

    let registered = service.initialize().await?;
    info!(registered, "service initialized");

    if cfg.scheduler.enabled && cfg.scheduler.auto_start {
        let monitor = MemoryMonitor::process(cfg.limits.memory_ceiling_mb);
        let source = DeltaSource::Static(StaticDeltaSource::new());
        let scheduler = RefreshScheduler::new(service.clone(), source, monitor, &cfg.scheduler);
        scheduler.spawn(cfg.scheduler.trigger.clone());
        info!("refresh scheduler started");
    } else if cfg.scheduler.enabled {
        info!("refresh trigger registered but not auto-started");
    } else {
        info!("refresh scheduler disabled");
    }

    tokio::signal::ctrl_c().await?;
    service.shutdown();
    Ok(())
}
