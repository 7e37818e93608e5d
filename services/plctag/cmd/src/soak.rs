//! Registry soak run.
//!
//! Producers create and attach requests to one shared session, a reaper
//! detaches and destroys them as they arrive (keeping every n-th one attached),
//! and a walker plays the background I/O thread by walking the pending list
//! under the registry lock. At the end the session's count must equal its one
//! external owner plus the requests left attached.

use crate::config::SoakConfig;
use crate::{component_debug, component_info, component_warn};
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use plctag_session::{
    Registry, RegistryError, RequestHandle, RequestKind, Session, SessionHandle,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Pause before retrying a request the pool could not hold
const POOL_RETRY_BACKOFF: Duration = Duration::from_micros(200);

/// Outcome of a soak run
#[derive(Debug, Clone, Default)]
pub struct SoakReport {
    /// Requests created by all producers
    pub created: usize,
    /// Creations retried after the pool was exhausted
    pub pool_retries: usize,
    /// Requests the reaper destroyed
    pub destroyed: usize,
    /// Requests left attached by the reaper
    pub kept: usize,
    /// Session count observed before the kept requests were released
    pub session_refs: usize,
    /// Walks of the pending list
    pub walks: u64,
    /// Deepest pending list seen by the walker
    pub max_depth: usize,
    /// Wall time of the run
    pub elapsed: Duration,
}

/// Run one soak pass against a fresh registry and session
pub async fn run(config: &SoakConfig) -> Result<SoakReport> {
    config.validate()?;

    let started = Instant::now();
    let registry = Registry::new(config.registry_config());

    let torn_down = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&torn_down);
    let session = Session::open_with_teardown(
        config.gateway.clone(),
        config.path.clone(),
        move |s| {
            component_info!("session", "Session {} closed after {:?}", s.id(), s.uptime());
            flag.store(true, Ordering::SeqCst);
        },
    );

    component_info!(
        "soak",
        "Starting soak: {} producers x {} requests on session {}",
        config.producers,
        config.requests_per_producer,
        session.id()
    );

    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = watch::channel(false);

    let producers: Vec<_> = (0..config.producers)
        .map(|producer| {
            spawn_producer(
                producer,
                config.requests_per_producer,
                registry.clone(),
                session.clone(),
                request_tx.clone(),
            )
        })
        .collect();
    drop(request_tx);

    let walker = spawn_walker(registry.clone(), session.clone(), config.walk_interval, stop_rx);
    let reaper = spawn_reaper(config.keep_every, registry.clone(), session.clone(), request_rx);

    let mut report = SoakReport::default();
    for producer in producers {
        let (created, retries) = producer.await.context("producer task panicked")??;
        report.created += created;
        report.pool_retries += retries;
    }

    let (kept, destroyed) = reaper.await.context("reaper task panicked")??;
    report.kept = kept.len();
    report.destroyed = destroyed;

    // A closed receiver only means the walker already stopped.
    let _ = stop_tx.send(true);
    let (walks, max_depth) = walker.await.context("walker task panicked")?;
    report.walks = walks;
    report.max_depth = max_depth;

    report.session_refs = session.ref_count();
    let outstanding = registry.outstanding(&session);
    if report.session_refs != 1 + kept.len() || outstanding != kept.len() {
        bail!(
            "count parity violated: session refs={} outstanding={} kept={}",
            report.session_refs,
            outstanding,
            kept.len()
        );
    }

    drop(kept);
    let stats = registry.stats();
    if session.ref_count() != 1 || stats.live_requests != 0 || stats.attached_requests != 0 {
        bail!(
            "leak after release: session refs={} stats={:?}",
            session.ref_count(),
            stats
        );
    }

    drop(session);
    if !torn_down.load(Ordering::SeqCst) {
        bail!("session was not torn down after its last release");
    }

    report.elapsed = started.elapsed();
    Ok(report)
}

fn request_kind(n: usize) -> RequestKind {
    match n % 3 {
        0 => RequestKind::Read,
        1 => RequestKind::Write,
        _ => RequestKind::List,
    }
}

fn spawn_producer(
    producer: usize,
    count: usize,
    registry: Registry,
    session: SessionHandle,
    request_tx: mpsc::UnboundedSender<RequestHandle>,
) -> JoinHandle<Result<(usize, usize)>> {
    tokio::task::spawn_blocking(move || {
        let mut retries = 0;

        for n in 0..count {
            let payload = Bytes::from(
                [(producer as u32).to_le_bytes(), (n as u32).to_le_bytes()].concat(),
            );

            let request = loop {
                match registry.create_request(request_kind(n), payload.clone()) {
                    Ok(request) => break request,
                    Err(RegistryError::OutOfMemory { .. }) => {
                        retries += 1;
                        std::thread::sleep(POOL_RETRY_BACKOFF);
                    }
                    Err(e) => return Err(e.into()),
                }
            };

            registry.attach(Some(&session), &request)?;
            request_tx
                .send(request)
                .map_err(|_| anyhow!("reaper stopped before producer {} finished", producer))?;
        }

        component_debug!("producer", "Producer {} done ({} pool retries)", producer, retries);
        Ok((count, retries))
    })
}

fn spawn_reaper(
    keep_every: usize,
    registry: Registry,
    session: SessionHandle,
    mut request_rx: mpsc::UnboundedReceiver<RequestHandle>,
) -> JoinHandle<Result<(Vec<RequestHandle>, usize)>> {
    tokio::task::spawn_blocking(move || {
        let mut kept = Vec::new();
        let mut destroyed = 0;
        let mut seen = 0;

        while let Some(request) = request_rx.blocking_recv() {
            seen += 1;
            if keep_every > 0 && seen % keep_every == 0 {
                kept.push(request);
                continue;
            }

            registry.detach(Some(&session), Some(&request))?;
            let mut slot = Some(request);
            registry.destroy_request(&mut slot);
            destroyed += 1;
        }

        component_info!("reaper", "Reaper destroyed {} requests, kept {}", destroyed, kept.len());
        Ok((kept, destroyed))
    })
}

fn spawn_walker(
    registry: Registry,
    session: SessionHandle,
    walk_interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) -> JoinHandle<(u64, usize)> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(walk_interval);
        let mut walks = 0;
        let mut max_depth = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let depth = {
                        let guard = registry.lock();
                        let pending = guard.pending(&session);
                        if pending.iter().any(|request| !request.is_attached()) {
                            component_warn!("walker", "Walked a request that is not attached");
                        }
                        pending.len()
                    };
                    walks += 1;
                    max_depth = max_depth.max(depth);
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }

        component_debug!("walker", "Walker stopped after {} walks", walks);
        (walks, max_depth)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistrySettings;

    fn small_config() -> SoakConfig {
        SoakConfig {
            producers: 3,
            requests_per_producer: 50,
            keep_every: 10,
            walk_interval: Duration::from_micros(100),
            ..SoakConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_soak_keeps_count_parity() {
        let config = small_config();
        let report = run(&config).await.unwrap();

        assert_eq!(report.created, 150);
        assert_eq!(report.kept, config.expected_kept());
        assert_eq!(report.destroyed, 150 - report.kept);
        assert_eq!(report.session_refs, 1 + report.kept);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_soak_with_bounded_pool() {
        let config = SoakConfig {
            registry: RegistrySettings {
                max_requests: Some(24),
                strict_detach: true,
            },
            ..small_config()
        };
        let report = run(&config).await.unwrap();

        assert_eq!(report.created, 150);
        assert_eq!(report.session_refs, 1 + config.expected_kept());
    }

    #[tokio::test]
    async fn test_soak_rejects_undersized_pool() {
        let config = SoakConfig {
            registry: RegistrySettings {
                max_requests: Some(1),
                strict_detach: false,
            },
            ..small_config()
        };
        assert!(run(&config).await.is_err());
    }
}
