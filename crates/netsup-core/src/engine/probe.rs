//! Single probe execution
//!
//! Every probe, whether scheduled, on demand or part of a discovery sweep,
//! goes through [`run_probe`]: it takes a slot from the shared worker pool,
//! applies the per-protocol timeout and races the driver against
//! cancellation and the cycle deadline. Losing the race drops the driver
//! future, which releases its socket or child process.

use chrono::Utc;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::device::DeviceIdentity;
use crate::error::ProbeError;
use crate::traits::{ProbeDriver, ProbeOptions, ProbePayload, ProbeResult, validate_target};

/// Everything needed to run one probe
pub(crate) struct ProbeJob<'a> {
    pub driver: &'a dyn ProbeDriver,
    pub identity: &'a DeviceIdentity,
    pub address: IpAddr,
    pub options: &'a ProbeOptions,
    pub timeout: Duration,
}

/// Run one probe to completion, cancellation or deadline
///
/// # Parameters
///
/// - `pool`: Shared worker pool bounding in-flight probes
/// - `held`: A pool permit the caller already holds (used instead of acquiring)
/// - `cancel`: Aborts the probe with `ProbeError::Cancelled`
/// - `deadline`: Cycle deadline, same effect as `cancel` once reached
pub(crate) async fn run_probe(
    job: ProbeJob<'_>,
    pool: &Arc<Semaphore>,
    held: Option<OwnedSemaphorePermit>,
    cancel: &CancelToken,
    deadline: Option<Instant>,
) -> ProbeResult {
    let protocol = job.driver.protocol();
    let started_at = Utc::now();
    let started = Instant::now();

    let until_deadline = async move {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProbeError::Cancelled),
        _ = until_deadline => Err(ProbeError::Cancelled),
        outcome = execute(&job, pool, held) => outcome,
    };

    if let Err(e) = &outcome {
        debug!(
            "{} probe of {} via {} failed: {}",
            protocol,
            job.address,
            job.driver.driver_name(),
            e
        );
    }

    ProbeResult {
        identity: job.identity.clone(),
        protocol,
        outcome,
        latency: started.elapsed(),
        // Stamped at start so a slow probe never counts as newer than a later one
        timestamp: started_at,
    }
}

async fn execute(
    job: &ProbeJob<'_>,
    pool: &Arc<Semaphore>,
    held: Option<OwnedSemaphorePermit>,
) -> Result<ProbePayload, ProbeError> {
    validate_target(job.address)?;

    let _permit = match held {
        Some(permit) => permit,
        None => pool
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProbeError::Cancelled)?,
    };

    match tokio::time::timeout(
        job.timeout,
        job.driver.probe(job.address, job.timeout, job.options),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(ProbeError::timeout_for(job.driver.protocol())),
    }
}
