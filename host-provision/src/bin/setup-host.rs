// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisions a single host, retrying until it succeeds or is given up on.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use chrono::Utc;
use clap::Parser;
use host_exec::HostExecutor;
use host_provision::cloud::StaticCloudManager;
use host_provision::datastore::InMemoryDataStore;
use host_provision::events::SlogEventLog;
use host_provision::host::User;
use host_provision::queue::{InMemoryJobQueue, JobQueue};
use host_provision::{
    Collaborators, Config, Host, HostProvisioner, SetupHostDriver,
    SetupHostJob,
};
use slog::{info, o, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[clap(name = "setup-host", about = "Install the agent on a started host")]
struct Args {
    /// Provisioner configuration (TOML)
    #[clap(long, action)]
    config: Utf8PathBuf,

    /// Host record to provision (JSON)
    #[clap(long, action)]
    host: Utf8PathBuf,

    /// Owner of a spawn host (JSON), needed to load the client
    #[clap(long, action)]
    owner: Option<Utf8PathBuf>,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Utf8PathBuf) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing {path}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_file(&args.config)?;
    let log = config
        .log
        .to_logger("setup-host")
        .context("initializing logger")?;
    let config = Arc::new(config);

    let host: Host = read_json(&args.host)?;
    let host_id = host.id.clone();
    let store = Arc::new(InMemoryDataStore::new());
    store.insert_host(host);
    if let Some(path) = &args.owner {
        let owner: User = read_json(path)?;
        store.insert_user(owner);
    }

    let executor = HostExecutor::with_max_output_bytes(
        log.new(o!("component" => "HostExecutor")),
        config.provisioning.max_output_bytes,
    );
    let provisioner = Arc::new(HostProvisioner::new(
        &log,
        config.clone(),
        Collaborators {
            hosts: store.clone(),
            credentials: store.clone(),
            users: store.clone(),
            events: Arc::new(SlogEventLog::new(&log)),
            cloud: Arc::new(StaticCloudManager::new()),
            executor: executor.as_executor(),
        },
    ));
    let queue = Arc::new(InMemoryJobQueue::new());
    queue.start();
    let driver = SetupHostDriver::new(
        &log,
        provisioner,
        queue.clone(),
        &config.provisioning,
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        let log = log.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(log, "interrupted; stopping after the current step");
                cancel.cancel();
            }
        }
    });

    driver
        .submit(&SetupHostJob::new(host_id.clone(), "initial"), Utc::now())
        .await
        .context("queueing setup job")?;

    loop {
        for report in driver.run_ready(Utc::now(), &cancel).await {
            info!(
                log,
                "setup-host job finished";
                "job" => &report.job_id,
                "outcome" => ?report.outcome,
                "attempts" => report.attempts(),
            );
        }
        if cancel.is_cancelled() {
            queue.stop();
            break;
        }
        let Some(next) = queue.next_not_before().await else {
            break;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.cancelled() => {}
        }
    }

    let host = store
        .host(&host_id)
        .with_context(|| format!("host {host_id} disappeared"))?;
    println!("{}", serde_json::to_string_pretty(&host)?);
    Ok(())
}
