use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use ipnetwork::IpNetwork;
use tokio::task::JoinSet;

use crate::burrow::{
    comm::{
        client::{self, ClientOptions},
        handshake::{Credentials, Identity},
        registry::Registries,
        server::CommServer,
    },
    config, logging, telemetry,
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    let server_enabled = !cfg.endpoints.is_empty();
    let agent_enabled = cfg.agent.is_some();

    if !server_enabled && !agent_enabled {
        anyhow::bail!("config: nothing to run (set endpoints and/or agent)");
    }

    let identity = Identity::load_or_generate(&cfg.identity.cert_file, &cfg.identity.key_file)
        .context("identity: load")?;

    tracing::info!(
        config = %resolved.path.display(),
        fingerprint = %identity.fingerprint(),
        server_enabled,
        agent_enabled,
        endpoints = cfg.endpoints.len(),
        trusted_peers = cfg.peer_fingerprints.len(),
        metrics_addr = %cfg.metrics_addr,
        "burrow: starting"
    );

    if let Some(addr) = telemetry::init_prometheus(&cfg.metrics_addr)? {
        tracing::info!(addr = %addr, "metrics: exporter listening");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    let server = if server_enabled {
        let creds = Arc::new(Credentials::new(
            identity.clone(),
            cfg.peer_fingerprints.clone(),
        ));
        let server = Arc::new(CommServer::new(
            Registries::new(),
            creds,
            cfg.comm.options(),
        ));
        for ep in &cfg.endpoints {
            // Bind up front so a bad endpoint fails startup instead of a task.
            let ln = CommServer::bind(&ep.listen_addr)
                .await
                .with_context(|| format!("comm: bind {}", ep.listen_addr))?;
            let server = server.clone();
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { server.serve(ln, shutdown).await });
        }
        Some(server)
    } else {
        None
    };

    if let Some(agent) = &cfg.agent {
        let opts = agent_options(agent, &cfg.comm)?;
        let trusted = if agent.server_fingerprint.is_empty() {
            cfg.peer_fingerprints.clone()
        } else {
            vec![agent.server_fingerprint.clone()]
        };
        let creds = Credentials::new(identity.clone(), trusted);
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { client::run(opts, creds, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    let outcome = tokio::select! {
        res = shutdown_signal() => {
            res?;
            tracing::info!("shutdown: signal");
            Ok(())
        }
        res = tasks.join_next() => match res {
            Some(Ok(Ok(()))) | None => Ok(()),
            Some(Ok(Err(err))) => Err(err),
            Some(Err(join_err)) => Err(join_err.into()),
        },
    };
    let _ = shutdown_tx.send(true);

    if let Some(server) = &server {
        server.shutdown().await;
    }

    let drain = async {
        while let Some(_res) = tasks.join_next().await {
            // Teardown errors are expected once the comms are gone.
        }
    };

    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    outcome
}

fn agent_options(
    agent: &config::AgentConfig,
    comm: &config::CommConfig,
) -> anyhow::Result<ClientOptions> {
    for iface in &agent.interfaces {
        iface
            .parse::<IpNetwork>()
            .with_context(|| format!("config: agent interface {:?}", iface))?;
    }
    Ok(ClientOptions {
        server_addr: agent.server_addr.clone(),
        name: agent.name.clone(),
        kind: agent.kind,
        interfaces: agent.interfaces.clone(),
        dial_timeout: agent.dial_timeout,
        handshake_timeout: comm.handshake_timeout,
        request_timeout: comm.request_timeout,
    })
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).context("signal: install SIGTERM handler")?;

        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("signal: ctrl-c")?,
            _ = term.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("signal: ctrl-c")
    }
}
