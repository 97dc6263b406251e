use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use kube::runtime::controller::Action;
use log::{info, warn};
use rand::Rng;

use crate::context::Context;

pub mod frpserver;
pub mod pod;
pub mod refmanager;
pub mod service;
pub mod store;

pub const RECONCILE_TIMEOUT: Duration = Duration::from_secs(60);

const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(300);

/// Backoff before retry number `attempt` (0-based): 1s doubling up to 5
/// minutes, then spread by up to 10% either way.
pub fn retry_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE
        .checked_mul(2u32.saturating_pow(attempt))
        .unwrap_or(RETRY_CAP)
        .min(RETRY_CAP);
    let jitter = rand::thread_rng().gen_range(0.9..=1.1);
    base.mul_f64(jitter)
}

/// Counts consecutive failures per object key.
pub struct RetryTracker {
    max_retries: u32,
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryTracker {
    pub fn new(max_retries: u32) -> Self {
        RetryTracker {
            max_retries,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failure. Returns the delay before the next try, or `None`
    /// once the key has used up its retries; the key is then forgotten.
    pub fn next(&self, key: &str) -> Option<Duration> {
        let Ok(mut attempts) = self.attempts.lock() else {
            return Some(RETRY_CAP);
        };
        let attempt = attempts.entry(key.to_string()).or_insert(0);
        if *attempt >= self.max_retries {
            attempts.remove(key);
            return None;
        }
        let delay = retry_delay(*attempt);
        *attempt += 1;
        Some(delay)
    }

    pub fn forget(&self, key: &str) {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.remove(key);
        }
    }

    pub fn action(&self, key: &str) -> Action {
        match self.next(key) {
            Some(delay) => Action::requeue(delay),
            None => {
                warn!("giving up on {key} after {} retries", self.max_retries);
                Action::await_change()
            }
        }
    }
}

/// Runs the FrpServer and Service controllers until both stop.
pub async fn run(ctx: Arc<Context>) -> anyhow::Result<()> {
    info!("starting controllers");

    let frp_server_fut = frpserver::run(ctx.clone());

    let service_fut = service::run(ctx.clone());

    let (frp_server_res, service_res) = futures_util::join!(frp_server_fut, service_fut);
    frp_server_res?;
    service_res?;

    Ok(())
}
