//! Adoption and release of child objects under a controller reference.

use std::collections::BTreeMap;

use futures_util::future::BoxFuture;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use log::{debug, info};

use super::store::{matches_selector, ObjectStore};
use crate::error::Error;

/// The controlling object children are claimed for.
#[derive(Debug, Clone)]
pub struct Owner {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    pub deleting: bool,
}

impl Owner {
    pub fn of<O>(owner: &O) -> Owner
    where
        O: Resource<DynamicType = ()>,
    {
        Owner {
            api_version: O::api_version(&()).to_string(),
            kind: O::kind(&()).to_string(),
            name: owner.name_any(),
            uid: owner.uid().unwrap_or_default(),
            deleting: owner.meta().deletion_timestamp.is_some(),
        }
    }

    pub fn controller_ref(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

pub fn controller_of<K: Resource>(obj: &K) -> Option<&OwnerReference> {
    obj.meta()
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|oref| oref.controller == Some(true))
}

enum AdoptCheck<'a> {
    Unchecked(BoxFuture<'a, Result<(), Error>>),
    Passed,
    Failed(String),
}

/// Decides which candidates an owner keeps, adopting matching orphans and
/// releasing owned objects that stopped matching.
pub struct RefManager<'a, K> {
    store: &'a dyn ObjectStore<K>,
    selector: BTreeMap<String, String>,
    owner: Owner,
    adopt_check: AdoptCheck<'a>,
}

impl<'a, K> RefManager<'a, K>
where
    K: Resource + Clone + Send + Sync,
{
    /// `can_adopt` runs at most once, right before the first adoption, and
    /// should confirm the live owner is the one we think and is not going
    /// away.
    pub fn new(
        store: &'a dyn ObjectStore<K>,
        selector: BTreeMap<String, String>,
        owner: Owner,
        can_adopt: BoxFuture<'a, Result<(), Error>>,
    ) -> Self {
        RefManager {
            store,
            selector,
            owner,
            adopt_check: AdoptCheck::Unchecked(can_adopt),
        }
    }

    async fn can_adopt(&mut self) -> Result<(), Error> {
        let check = std::mem::replace(&mut self.adopt_check, AdoptCheck::Passed);
        self.adopt_check = match check {
            AdoptCheck::Unchecked(fut) => match fut.await {
                Ok(()) => AdoptCheck::Passed,
                Err(err) => AdoptCheck::Failed(err.to_string()),
            },
            other => other,
        };
        match &self.adopt_check {
            AdoptCheck::Failed(reason) => Err(Error::InvalidConfig(format!(
                "can't adopt for {} {}: {reason}",
                self.owner.kind, self.owner.name
            ))),
            _ => Ok(()),
        }
    }

    pub async fn claim(&mut self, candidates: Vec<K>) -> Result<Vec<K>, Error> {
        let mut claimed = Vec::new();
        let mut errors = Vec::new();
        for obj in candidates {
            match self.claim_one(obj).await {
                Ok(Some(obj)) => claimed.push(obj),
                Ok(None) => {}
                Err(err) => errors.push(err),
            }
        }
        Error::aggregate(errors)?;
        Ok(claimed)
    }

    async fn claim_one(&mut self, obj: K) -> Result<Option<K>, Error> {
        let matches = matches_selector(obj.labels(), &self.selector);

        if let Some(controller) = controller_of(&obj) {
            if controller.uid != self.owner.uid {
                return Ok(None);
            }
            if matches {
                return Ok(Some(obj));
            }
            if self.owner.deleting {
                return Ok(None);
            }
            self.release(obj).await?;
            return Ok(None);
        }

        if !matches || self.owner.deleting || obj.meta().deletion_timestamp.is_some() {
            return Ok(None);
        }
        self.adopt(obj).await
    }

    async fn adopt(&mut self, obj: K) -> Result<Option<K>, Error> {
        self.can_adopt().await?;

        let mut updated = obj;
        updated
            .meta_mut()
            .owner_references
            .get_or_insert_with(Vec::new)
            .push(self.owner.controller_ref());
        match self.store.replace(&updated).await {
            Ok(adopted) => {
                info!(
                    "{} {} adopted {}",
                    self.owner.kind,
                    self.owner.name,
                    adopted.name_any()
                );
                Ok(Some(adopted))
            }
            Err(err) if err.is_not_found() => {
                debug!("{} vanished before adoption", updated.name_any());
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn release(&mut self, obj: K) -> Result<(), Error> {
        let mut updated = obj;
        let uid = self.owner.uid.clone();
        if let Some(refs) = updated.meta_mut().owner_references.as_mut() {
            refs.retain(|oref| oref.uid != uid);
        }
        match self.store.replace(&updated).await {
            Ok(released) => {
                info!(
                    "{} {} released {}",
                    self.owner.kind,
                    self.owner.name,
                    released.name_any()
                );
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::store::memory::MemoryStore;
    use super::*;
    use futures_util::FutureExt;
    use k8s_openapi::api::core::v1::{Pod, Service};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn selector() -> BTreeMap<String, String> {
        BTreeMap::from([("gofrp.io/service-name".to_string(), "web".to_string())])
    }

    fn owner() -> Owner {
        let svc = Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("app".to_string()),
                uid: Some("U".to_string()),
                ..ObjectMeta::default()
            },
            ..Service::default()
        };
        Owner::of(&svc)
    }

    fn pod(name: &str, matching: bool, controller_uid: Option<&str>) -> Pod {
        let labels = if matching { selector() } else { BTreeMap::new() };
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("app".to_string()),
                labels: Some(labels),
                owner_references: controller_uid.map(|uid| {
                    vec![OwnerReference {
                        api_version: "v1".to_string(),
                        kind: "Service".to_string(),
                        name: "web".to_string(),
                        uid: uid.to_string(),
                        controller: Some(true),
                        block_owner_deletion: Some(true),
                    }]
                }),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        }
    }

    fn allow() -> BoxFuture<'static, Result<(), Error>> {
        async { Ok(()) }.boxed()
    }

    #[test]
    fn owner_reference_is_controlling() {
        let oref = owner().controller_ref();
        assert_eq!(oref.kind, "Service");
        assert_eq!(oref.api_version, "v1");
        assert_eq!(oref.controller, Some(true));
        assert_eq!(oref.block_owner_deletion, Some(true));
    }

    #[tokio::test]
    async fn keeps_owned_matching_and_ignores_foreign() {
        let store = MemoryStore::<Pod>::default();
        let mine = store.seed(pod("mine", true, Some("U")));
        let foreign = store.seed(pod("foreign", true, Some("other")));

        let mut rm = RefManager::new(&store, selector(), owner(), allow());
        let claimed = rm.claim(vec![mine, foreign]).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].name_any(), "mine");
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn adopts_matching_orphans_after_one_check() {
        let store = MemoryStore::<Pod>::default();
        let a = store.seed(pod("a", true, None));
        let b = store.seed(pod("b", true, None));
        let unmatched = store.seed(pod("c", false, None));

        let checks = AtomicUsize::new(0);
        let check = async {
            checks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        .boxed();
        let mut rm = RefManager::new(&store, selector(), owner(), check);
        let claimed = rm.claim(vec![a, b, unmatched]).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(checks.load(Ordering::SeqCst), 1);
        for pod in claimed {
            assert_eq!(controller_of(&pod).map(|o| o.uid.as_str()), Some("U"));
        }
    }

    #[tokio::test]
    async fn failed_check_blocks_adoption() {
        let store = MemoryStore::<Pod>::default();
        let a = store.seed(pod("a", true, None));
        let check = async { Err(Error::InvalidConfig("owner uid changed".to_string())) }.boxed();
        let mut rm = RefManager::new(&store, selector(), owner(), check);
        assert!(rm.claim(vec![a]).await.is_err());
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn releases_owned_pods_that_stopped_matching() {
        let store = MemoryStore::<Pod>::default();
        let stale = store.seed(pod("stale", false, Some("U")));
        let mut rm = RefManager::new(&store, selector(), owner(), allow());
        assert!(rm.claim(vec![stale]).await.unwrap().is_empty());
        let released = store.get("app", "stale").await.unwrap();
        assert!(controller_of(&released).is_none());
    }

    #[tokio::test]
    async fn deleting_owner_neither_adopts_nor_releases() {
        let store = MemoryStore::<Pod>::default();
        let orphan = store.seed(pod("orphan", true, None));
        let stale = store.seed(pod("stale", false, Some("U")));
        let mut deleting = owner();
        deleting.deleting = true;
        let mut rm = RefManager::new(&store, selector(), deleting, allow());
        assert!(rm.claim(vec![orphan, stale]).await.unwrap().is_empty());
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn terminating_orphans_are_skipped() {
        let store = MemoryStore::<Pod>::default();
        let mut orphan = pod("orphan", true, None);
        orphan.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let orphan = store.seed(orphan);
        let mut rm = RefManager::new(&store, selector(), owner(), allow());
        assert!(rm.claim(vec![orphan]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn vanished_candidates_are_not_errors() {
        let store = MemoryStore::<Pod>::default();
        let orphan = pod("gone", true, None);
        let stale = pod("gone-too", false, Some("U"));
        let mut rm = RefManager::new(&store, selector(), owner(), allow());
        assert!(rm.claim(vec![orphan, stale]).await.unwrap().is_empty());
    }
}
