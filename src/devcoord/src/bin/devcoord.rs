// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate slog;

logging::logger_with_subsystem!(sl, "devcoord-main");

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use devcoord::devfs::DevfsTree;
use devcoord::launcher::ProcessLauncher;
use devcoord::power::LoggingPowerController;
use devcoord::service::{self, CoordinatorHandle, CoordinatorService, TokioScheduler};
use devcoord::{Coordinator, CoordinatorConfig};

const NAME: &str = "devcoord";

#[derive(Debug, Parser)]
#[clap(name = NAME, version, about = "Device coordinator")]
struct Args {
    /// TOML configuration file.
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,

    /// Directory scanned for driver manifests; may be repeated.
    #[clap(long = "driver-search-path", value_parser)]
    driver_search_paths: Vec<PathBuf>,

    /// Driver manifest loaded before the search paths; may be repeated.
    #[clap(long = "load-driver", value_parser)]
    load_drivers: Vec<PathBuf>,

    /// Library bound to the sys device.
    #[clap(long, value_parser)]
    sys_device_driver: Option<String>,

    /// Devhost executable.
    #[clap(long, value_parser)]
    devhost: Option<PathBuf>,

    #[clap(long, value_parser)]
    log_level: Option<String>,

    /// Log JSON to stderr instead of text to the terminal.
    #[clap(long)]
    json_log: bool,
}

impl Args {
    fn config(&self) -> Result<CoordinatorConfig> {
        let mut config = match &self.config {
            Some(path) => CoordinatorConfig::load(path)?,
            None => CoordinatorConfig::default(),
        };
        config
            .driver_search_paths
            .extend(self.driver_search_paths.iter().cloned());
        config.load_drivers.extend(self.load_drivers.iter().cloned());
        if let Some(driver) = &self.sys_device_driver {
            config.sys_device_driver = Some(driver.clone());
        }
        if let Some(devhost) = &self.devhost {
            config.devhost_binary = devhost.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.config()?;

    let level = logging::level_name_to_slog_level(&config.log_level).map_err(|e| anyhow!(e))?;
    let (logger, _async_guard) = if args.json_log {
        logging::create_logger(NAME, NAME, level, std::io::stderr())
    } else {
        logging::create_term_logger(level)
    };
    let _scope_guard = slog_scope::set_global_logger(logger);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    runtime.block_on(real_main(config))
}

async fn real_main(config: CoordinatorConfig) -> Result<()> {
    let (tx, rx) = service::channel();
    let launcher = ProcessLauncher::new(
        config.devhost_binary.clone(),
        config.devhost_args.clone(),
        tx.clone(),
    );
    let mut coordinator = Coordinator::new(
        config,
        Box::new(launcher),
        Box::new(TokioScheduler::new(tx.clone())),
        Box::new(DevfsTree::new()),
    )
    .context("failed to create coordinator")?;

    let loaded = coordinator.load_configured_drivers();
    info!(sl!(), "loaded {} drivers", loaded);
    coordinator.start().context("failed to start coordinator")?;
    debug!(sl!(), "device tree:\n{}", coordinator.dump());

    let handle = CoordinatorHandle::new(tx);
    let service = CoordinatorService::new(
        coordinator,
        rx,
        Arc::new(LoggingPowerController::default()),
    );
    let task = tokio::spawn(service.run());

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for interrupt")?;
    info!(sl!(), "interrupted, powering off devhosts");
    match handle.poweroff().await {
        Ok(report) => info!(
            sl!(),
            "poweroff done: {} suspended, {} failed",
            report.hosts_suspended,
            report.failures.len()
        ),
        Err(e) => warn!(sl!(), "poweroff failed: {}", e),
    }

    handle.shutdown().await?;
    task.await.context("coordinator service panicked")??;
    Ok(())
}
