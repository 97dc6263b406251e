//! Lease-based leader election over coordination.k8s.io/v1.
//!
//! Every write carries the resourceVersion that was read, so two candidates
//! racing for an expired lease cannot both win: the loser gets a 409.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta},
};
use log::{debug, info, warn};
use rand::{distributions::Alphanumeric, Rng};
use tokio::{sync::oneshot, task::JoinHandle};

use crate::{config::LeaderElection, controllers::store::ObjectStore, error::Error};

/// `<hostname>_<random>`, unique per process.
pub fn holder_identity() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| "frp-lb".to_string());
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{host}_{suffix}")
}

pub struct LeaderElector {
    leases: Arc<dyn ObjectStore<Lease>>,
    namespace: String,
    lease_name: String,
    identity: String,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
}

impl LeaderElector {
    pub fn new(
        leases: Arc<dyn ObjectStore<Lease>>,
        namespace: &str,
        identity: &str,
        config: &LeaderElection,
    ) -> Self {
        LeaderElector {
            leases,
            namespace: namespace.to_string(),
            lease_name: config.lease_name.clone(),
            identity: identity.to_string(),
            lease_duration: Duration::from_secs(config.lease_duration_seconds),
            renew_deadline: Duration::from_secs(config.renew_deadline_seconds),
            retry_period: Duration::from_secs(config.retry_period_seconds),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Waits until this process holds the lease.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!("waiting for lease {}/{} as {}", self.namespace, self.lease_name, self.identity);
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!("acquired lease {}/{}", self.namespace, self.lease_name);
                    return self.guard();
                }
                Ok(false) => debug!("lease {} is held by another candidate", self.lease_name),
                Err(err) => warn!("acquiring lease {} failed: {err}", self.lease_name),
            }
            tokio::time::sleep(self.retry_period).await;
        }
    }

    fn guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal = tokio::spawn(async move { elector.renew_loop(lost_tx).await });
        LeaderGuard {
            renewal,
            lost_rx: Some(lost_rx),
        }
    }

    /// Renews every retry period. Leadership is lost when someone else
    /// takes the lease, or when no renewal succeeded within the renew
    /// deadline.
    async fn renew_loop(&self, lost_tx: oneshot::Sender<()>) {
        let mut last_renew = Instant::now();
        loop {
            tokio::time::sleep(self.retry_period).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => last_renew = Instant::now(),
                Ok(false) => {
                    warn!("lease {} was taken over", self.lease_name);
                    break;
                }
                Err(err) => {
                    warn!("renewing lease {} failed: {err}", self.lease_name);
                    if last_renew.elapsed() >= self.renew_deadline {
                        break;
                    }
                }
            }
        }
        if lost_tx.send(()).is_err() {
            debug!("lease {} lost after its guard was dropped", self.lease_name);
        }
    }

    fn spec(&self, now: chrono::DateTime<Utc>, acquired: Option<MicroTime>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
            acquire_time: Some(acquired.unwrap_or(MicroTime(now))),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..LeaseSpec::default()
        }
    }

    pub async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let now = Utc::now();
        let existing = match self.leases.get(&self.namespace, &self.lease_name).await {
            Ok(lease) => lease,
            Err(err) if err.is_not_found() => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.lease_name.clone()),
                        namespace: Some(self.namespace.clone()),
                        ..ObjectMeta::default()
                    },
                    spec: Some(self.spec(now, None, 0)),
                };
                return match self.leases.create(&self.namespace, &lease).await {
                    Ok(_) => Ok(true),
                    Err(err) if err.is_conflict() => Ok(false),
                    Err(err) => Err(err),
                };
            }
            Err(err) => return Err(err),
        };

        let spec = existing.spec.clone().unwrap_or_default();
        let held_by_us = spec.holder_identity.as_deref() == Some(self.identity.as_str());
        let expired = match (&spec.renew_time, spec.lease_duration_seconds) {
            (Some(renewed), Some(secs)) => now > renewed.0 + chrono::Duration::seconds(secs as i64),
            _ => true,
        };
        if !held_by_us && !expired {
            return Ok(false);
        }

        let transitions = spec.lease_transitions.unwrap_or(0);
        let mut updated = existing;
        updated.spec = Some(if held_by_us {
            self.spec(now, spec.acquire_time, transitions)
        } else {
            self.spec(now, None, transitions + 1)
        });
        match self.leases.replace(&updated).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_conflict() => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// Held while this process leads. Dropping it stops renewing.
pub struct LeaderGuard {
    renewal: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Resolves once renewing stops. Returns true when leadership was lost,
    /// false when the renewal task ended without reporting a loss.
    pub async fn lost(&mut self) -> bool {
        let Some(rx) = self.lost_rx.take() else {
            return false;
        };
        match rx.await {
            Ok(()) => true,
            Err(_) => {
                debug!("lease renewal stopped without reporting a loss");
                false
            }
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::store::memory::MemoryStore;

    fn elector(store: &Arc<MemoryStore<Lease>>, identity: &str) -> LeaderElector {
        LeaderElector::new(store.clone(), "frp-system", identity, &LeaderElection::default())
    }

    #[tokio::test]
    async fn first_candidate_creates_the_lease() {
        let store = Arc::new(MemoryStore::<Lease>::default());
        assert!(elector(&store, "a").try_acquire_or_renew().await.unwrap());
        let lease = store.get("frp-system", "frp-lb-controller-manager").await.unwrap();
        let spec = lease.spec.unwrap();
        assert_eq!(spec.holder_identity.as_deref(), Some("a"));
        assert_eq!(spec.lease_duration_seconds, Some(30));
    }

    #[tokio::test]
    async fn live_lease_is_not_stolen() {
        let store = Arc::new(MemoryStore::<Lease>::default());
        let a = elector(&store, "a");
        let b = elector(&store, "b");
        assert!(a.try_acquire_or_renew().await.unwrap());
        assert!(!b.try_acquire_or_renew().await.unwrap());
        assert!(a.try_acquire_or_renew().await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let store = Arc::new(MemoryStore::<Lease>::default());
        assert!(elector(&store, "a").try_acquire_or_renew().await.unwrap());

        let mut lease = store.get("frp-system", "frp-lb-controller-manager").await.unwrap();
        if let Some(spec) = lease.spec.as_mut() {
            spec.renew_time = Some(MicroTime(Utc::now() - chrono::Duration::seconds(120)));
        }
        store.seed(lease);

        assert!(elector(&store, "b").try_acquire_or_renew().await.unwrap());
        let spec = store
            .get("frp-system", "frp-lb-controller-manager")
            .await
            .unwrap()
            .spec
            .unwrap();
        assert_eq!(spec.holder_identity.as_deref(), Some("b"));
        assert_eq!(spec.lease_transitions, Some(1));
    }

    #[tokio::test]
    async fn takeover_is_reported_as_lost() {
        let store = Arc::new(MemoryStore::<Lease>::default());
        let config = LeaderElection {
            retry_period_seconds: 1,
            ..LeaderElection::default()
        };
        let a = Arc::new(LeaderElector::new(store.clone(), "frp-system", "a", &config));
        let mut guard = a.acquire().await;

        let mut lease = store.get("frp-system", "frp-lb-controller-manager").await.unwrap();
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = Some("b".to_string());
            spec.renew_time = Some(MicroTime(Utc::now()));
        }
        store.seed(lease);

        let lost = tokio::time::timeout(Duration::from_secs(5), guard.lost())
            .await
            .unwrap();
        assert!(lost);
    }

    #[tokio::test]
    async fn stopped_renewal_is_not_a_loss() {
        let store = Arc::new(MemoryStore::<Lease>::default());
        let a = Arc::new(elector(&store, "a"));
        let mut guard = a.acquire().await;
        guard.renewal.abort();

        let lost = tokio::time::timeout(Duration::from_secs(1), guard.lost())
            .await
            .unwrap();
        assert!(!lost);
    }

    #[test]
    fn identities_are_unique() {
        assert_ne!(holder_identity(), holder_identity());
    }
}
