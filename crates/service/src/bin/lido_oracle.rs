use std::sync::Arc;

use clap::{Parser, Subcommand};

use lido_oracle_modules::accounting::AccountingModule;
use lido_oracle_modules::collector::PerformanceCollector;
use lido_oracle_modules::ejector::EjectorModule;
use lido_oracle_modules::performance::PerformanceModule;
use lido_oracle_service::common::{build_app_state, EnvVars};
use lido_oracle_service::cycle::{self, AnyModule};
use lido_oracle_service::server;
use lido_oracle_service::tracing::{setup_logger, LoggingConfig};

#[derive(Parser)]
#[command(name = "lido-oracle", about = "Off-chain oracle daemon for the Lido protocol")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Build reports but do not submit any transaction.
    #[arg(long, global = true)]
    dry: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Pooled-ether rebase, withdrawal finalization and vault valuations.
    Accounting,
    /// Validator exit requests covering withdrawal demand.
    Ejector,
    /// Performance oracle of the permissionless module.
    Csm,
    /// Duty collection into the persistent store.
    Collector,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let env_vars = EnvVars::read();
    setup_logger(LoggingConfig::default().use_format(env_vars.log_format.value.clone()));
    env_vars.log_config();

    let app = build_app_state(&env_vars, cli.dry).await?;
    server::launch(env_vars.metrics_bind_to_addr.value.clone(), app.registry.clone());

    let module = match cli.command {
        Command::Accounting => AnyModule::Accounting(AccountingModule::new(Arc::clone(&app.ctx))),
        Command::Ejector => AnyModule::Ejector(EjectorModule::new(Arc::clone(&app.ctx))),
        Command::Csm => AnyModule::Performance(PerformanceModule::new(
            Arc::clone(&app.ctx),
            Arc::clone(&app.store),
            &app.cache_path,
        )),
        Command::Collector => AnyModule::Collector(PerformanceCollector::new(
            Arc::clone(&app.ctx),
            Arc::clone(&app.store),
        )?),
    };

    cycle::run(app.ctx, module).await
}
