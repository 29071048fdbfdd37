// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! AppWrapper dispatcher daemon.
//!
//! Wires the controller to a live cluster: AppWrapper and pod watches feed
//! the reconciliation queue, a periodic ticker retries dispatch, and a
//! single worker drains the queue until shutdown.

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};

use batchd_controller::api::UID_LABEL;
use batchd_controller::{
    channel, logging, AppWrapper, CancellationToken, DispatcherConfig, QueueHandle, ReconcileKey,
    Reconciler, KubeStore, Result, Worker,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file (overrides BATCHD_CONFIG_PATH)
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();
    if let Some(path) = &args.config {
        std::env::set_var("BATCHD_CONFIG_PATH", path);
    }
    let config = DispatcherConfig::from_settings()?;

    let client = Client::try_default().await?;
    let store = Arc::new(KubeStore::new(client.clone()));

    let (handle, receiver) = channel();
    let reconciler = Arc::new(Reconciler::new(store, config.clone(), handle.clone()));
    let worker = Worker::new(reconciler, handle.clone(), receiver, &config);

    let cancel = CancellationToken::new();

    tokio::spawn(watch_app_wrappers(
        client.clone(),
        handle.clone(),
        cancel.child_token(),
    ));
    tokio::spawn(watch_pods(
        client.clone(),
        handle.clone(),
        cancel.child_token(),
    ));
    tokio::spawn(dispatch_ticker(
        handle.clone(),
        config.dispatch_delay(),
        cancel.child_token(),
    ));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    // Kick off an initial admission pass; the watches replay existing
    // objects on startup and cover the rest.
    handle.trigger_dispatch_next();

    worker.run(cancel).await;
    Ok(())
}

/// Feed AppWrapper events into the queue.
async fn watch_app_wrappers(client: Client, queue: QueueHandle, cancel: CancellationToken) {
    let api: Api<AppWrapper> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .touched_objects()
        .boxed();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            item = stream.next() => match item {
                Some(Ok(app_wrapper)) => {
                    queue.enqueue(ReconcileKey::for_app_wrapper(&app_wrapper));
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "AppWrapper watch error");
                }
                None => break,
            }
        }
    }
}

/// Feed events of owner-labelled pods into the queue, keyed by owner.
async fn watch_pods(client: Client, queue: QueueHandle, cancel: CancellationToken) {
    let api: Api<Pod> = Api::all(client);
    // Selecting on the UID label keeps foreign pods out of the stream.
    let watch_config = watcher::Config::default().labels(UID_LABEL);
    let mut stream = watcher(api, watch_config)
        .default_backoff()
        .touched_objects()
        .boxed();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            item = stream.next() => match item {
                Some(Ok(pod)) => {
                    if let Some(key) = ReconcileKey::for_pod(&pod) {
                        queue.enqueue(key);
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "pod watch error");
                }
                None => break,
            }
        }
    }
}

/// Periodic dispatch retry, coalesced by the queue.
async fn dispatch_ticker(
    queue: QueueHandle,
    period: tokio::time::Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => queue.trigger_dispatch_next(),
        }
    }
}
