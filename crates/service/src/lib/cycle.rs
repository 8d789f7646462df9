//! The main loop: one module, woken per finalized slot, run to completion,
//! then a delay hint is honored. Fatal errors end the process; external
//! orchestration restarts it.

use std::sync::Arc;
use std::time::Duration;

use lido_oracle_client::blockstamp::get_latest_blockstamp;
use lido_oracle_client::consensus::StateId;
use lido_oracle_modules::accounting::AccountingModule;
use lido_oracle_modules::collector::PerformanceCollector;
use lido_oracle_modules::consensus::{
    execute_consensus_module, ConsensusDriver, ConsensusModule, Error as ModuleError, ModuleExecuteDelay,
};
use lido_oracle_modules::ejector::EjectorModule;
use lido_oracle_modules::performance::PerformanceModule;
use lido_oracle_modules::Web3Context;

pub enum AnyModule {
    Accounting(AccountingModule),
    Ejector(EjectorModule),
    Performance(PerformanceModule),
    Collector(PerformanceCollector),
}

impl AnyModule {
    fn name(&self) -> &'static str {
        match self {
            AnyModule::Accounting(_) => "accounting",
            AnyModule::Ejector(_) => "ejector",
            AnyModule::Performance(_) => "performance",
            AnyModule::Collector(_) => "collector",
        }
    }
}

async fn startup_checks(ctx: &Web3Context, module: &AnyModule) -> Result<(), ModuleError> {
    let driver = ConsensusDriver::new(ctx);
    let oracle = match module {
        AnyModule::Accounting(m) => m.report_contract(),
        AnyModule::Ejector(m) => m.report_contract(),
        AnyModule::Performance(m) => m.report_contract(),
        // The collector talks to the consensus layer only.
        AnyModule::Collector(_) => return Ok(()),
    };
    driver.check_contract_configs(oracle).await?;

    // Surfaces a missing membership/submit role before the first frame, so
    // a misconfigured member fails at startup rather than mid-frame.
    let latest = get_latest_blockstamp(&ctx.cc, &StateId::Head).await?;
    driver.get_member_info(oracle, &latest).await?;
    Ok(())
}

pub async fn run(ctx: Arc<Web3Context>, module: AnyModule) -> anyhow::Result<()> {
    let spec = ctx.cc.get_config_spec().await?;
    ::tracing::info!(module = module.name(), "Starting the oracle cycle");

    startup_checks(&ctx, &module).await?;

    loop {
        let finalized = get_latest_blockstamp(&ctx.cc, &StateId::Finalized).await?;
        let meta = &ctx.metrics.metadata;
        meta.oracle_slot_number
            .with_label_values(&["finalized"])
            .set(finalized.slot_number);
        meta.oracle_block_number
            .with_label_values(&["finalized"])
            .set(finalized.block_number);

        let result = match &module {
            AnyModule::Accounting(m) => execute_consensus_module(&ctx, m, &finalized).await,
            AnyModule::Ejector(m) => execute_consensus_module(&ctx, m, &finalized).await,
            AnyModule::Performance(m) => execute_consensus_module(&ctx, m, &finalized).await,
            AnyModule::Collector(m) => m.execute_module(&finalized).await,
        };

        let delay = match result {
            Ok(delay) => delay,
            // Not fatal: the collector is still backfilling the demanded
            // range; come back once more epochs are finalized.
            Err(ModuleError::DutyDataNotReady { l_epoch, r_epoch }) => {
                ::tracing::info!(l_epoch, r_epoch, "Waiting for the duty data to be collected");
                ModuleExecuteDelay::NextFinalizedEpoch
            }
            Err(fatal) => return Err(fatal.into()),
        };

        let sleep_seconds = match delay {
            ModuleExecuteDelay::NextSlot => spec.seconds_per_slot,
            ModuleExecuteDelay::NextFinalizedEpoch => spec.seconds_per_slot * spec.slots_per_epoch,
        };
        tokio::time::sleep(Duration::from_secs(sleep_seconds)).await;
    }
}
