use anyhow::Result;
use clap::Parser;
use log::{error, info};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use VellumDB::consts::{
    ERR_MAPPING_OOM, ERR_MISSING_MASTER_KEY, EXIT_CANCELLED, EXIT_DISABLE_COW_REQUIRED,
    EXIT_FAILURE, EXIT_MISSING_MASTER_KEY, EXIT_SUCCESS,
};
use VellumDB::config::VellumConfig;
use VellumDB::crypto::MasterKey;
use VellumDB::recovery::{Recovery, RecoveryConfig, RecoveryOutcome};

mod cli;

fn main() {
    env_logger::init();
    let code = match run() {
        Ok(outcome) => match outcome {
            RecoveryOutcome::Success => EXIT_SUCCESS,
            RecoveryOutcome::CancellationRequested => EXIT_CANCELLED,
        },
        Err(e) => {
            let msg = format!("{:#}", e);
            eprintln!("error: {}", msg);
            // Различимые фатальные исходы транслируются в коды завершения
            if msg.contains(ERR_MISSING_MASTER_KEY) {
                EXIT_MISSING_MASTER_KEY
            } else if msg.contains(ERR_MAPPING_OOM) {
                error!("rerun with --disable-copy-on-write to replay into the original file");
                EXIT_DISABLE_COW_REQUIRED
            } else {
                EXIT_FAILURE
            }
        }
    };
    std::process::exit(code);
}

fn run() -> Result<RecoveryOutcome> {
    let args = cli::Cli::parse();

    let master_key = match (&args.master_key_hex, &args.master_key_file) {
        (Some(hex), _) => Some(Arc::new(MasterKey::from_hex(hex)?)),
        (None, Some(path)) => Some(Arc::new(MasterKey::from_file(path)?)),
        (None, None) => MasterKey::from_env_opt()?.map(Arc::new),
    };

    // База — центральный конфиг (VL_* переменные), флаги CLI поверх
    let mut cfg = VellumConfig::from_env();
    if args.ignore_invalid_journal {
        cfg = cfg.with_ignore_invalid_journal(true);
    }
    if args.disable_copy_on_write {
        cfg = cfg.with_copy_on_write(false);
    }
    if args.discard_orphans {
        cfg = cfg.with_discard_orphans(true);
    }
    if let Some(secs) = args.progress_interval {
        cfg = cfg.with_progress_interval_secs(secs);
    }

    // Кооперативная отмена: сканер проверяет флаг раз на страницу.
    // Для библиотечных вызовов флаг ставит хозяин процесса; CLI завершает
    // прогон целиком.
    let cancel = AtomicBool::new(false);

    let recovery = Recovery::new(RecoveryConfig {
        data_dir: args.data_dir,
        output_dir: args.output_dir,
        page_size: args.page_size,
        master_key,
        progress_interval: Duration::from_secs(cfg.progress_interval_secs),
        ignore_invalid_journal: cfg.ignore_invalid_journal,
        copy_on_write: cfg.copy_on_write,
        discard_orphans: cfg.discard_orphans,
    })?;

    let (outcome, status) = recovery.run(&cancel)?;
    info!(
        "recovered {} document(s), {} revision(s), {} attachment(s); {} faulted page(s)",
        status.documents, status.revisions, status.attachments, status.faulted_pages
    );
    Ok(outcome)
}
