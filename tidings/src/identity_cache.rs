// Copyright (C) 2024-2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of tidings.
//
// tidings is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// tidings is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with tidings.  If not,
// see <http://www.gnu.org/licenses/>.

//! # The identity cache
//!
//! Every application-scoped request names its application by token, so resolving tokens is the
//! hottest read we do. Application tokens never change once issued, which means a cached entry can
//! only go stale by the application being deleted (or edited); the applier calls [invalidate] when
//! that happens.
//!
//! [invalidate]: IdentityCache::invalidate

use std::{num::NonZeroUsize, sync::Arc};

use lru::LruCache;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    counter_add,
    entities::{AppId, Application},
    metrics::{self, Instruments, Sort},
    storage::{self, Store},
};

/// The two kinds of application credential
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TokenKind {
    Application,
    Backend,
}

inventory::submit! { metrics::Registration::new("identity.cache.hits", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("identity.cache.misses", Sort::IntegralCounter) }

pub struct IdentityCache {
    store: Store,
    entries: Mutex<LruCache<(TokenKind, String), Arc<Application>>>,
    instruments: Arc<Instruments>,
}

impl IdentityCache {
    pub fn new(store: Store, size: usize, instruments: Arc<Instruments>) -> IdentityCache {
        IdentityCache {
            store,
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN),
            )),
            instruments,
        }
    }
    pub async fn lookup_by_application_token(
        &self,
        token: &str,
    ) -> storage::Result<Option<Arc<Application>>> {
        self.lookup(TokenKind::Application, token).await
    }
    pub async fn lookup_by_backend_token(
        &self,
        token: &str,
    ) -> storage::Result<Option<Arc<Application>>> {
        self.lookup(TokenKind::Backend, token).await
    }
    /// Resolve `token`, reading through to the store on a miss
    pub async fn lookup(
        &self,
        kind: TokenKind,
        token: &str,
    ) -> storage::Result<Option<Arc<Application>>> {
        let key = (kind, token.to_owned());
        if let Some(app) = self.entries.lock().await.get(&key) {
            counter_add!(self.instruments, "identity.cache.hits", 1, &[]);
            return Ok(Some(app.clone()));
        }
        counter_add!(self.instruments, "identity.cache.misses", 1, &[]);
        let app = match kind {
            TokenKind::Application => self.store.application_by_token(token).await?,
            TokenKind::Backend => self.store.application_by_backend_token(token).await?,
        }
        .map(Arc::new);
        // Negative results aren't cached; the application may simply not have been applied yet
        if let Some(app) = &app {
            self.entries.lock().await.put(key, app.clone());
        }
        Ok(app)
    }
    /// Drop every entry for the application `app_id`
    pub async fn invalidate(&self, app_id: AppId) {
        let mut entries = self.entries.lock().await;
        let stale = entries
            .iter()
            .filter(|(_, app)| app.id == app_id)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        stale.iter().for_each(|key| {
            entries.pop(key);
        });
        debug!("Invalidated {} cache entries for application {}", stale.len(), app_id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{entities::OrgId, memory::InMemory, storage::Record};

    #[tokio::test]
    async fn read_through_and_invalidate() {
        let store = Store::new(Arc::new(InMemory::new()));
        let cache = IdentityCache::new(store.clone(), 16, Arc::new(Instruments::new("tidings")));
        assert!(cache
            .lookup_by_application_token("app-token")
            .await
            .unwrap()
            .is_none());

        let mut app = Application {
            id: AppId::new(2),
            org_id: OrgId::new(1),
            name: "app".to_owned(),
            token: "app-token".to_owned(),
            backend_token: "backend-token".to_owned(),
            enabled: true,
            ..Default::default()
        };
        store.put(Record::Application(app.clone())).await.unwrap();
        let found = cache
            .lookup_by_application_token("app-token")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, AppId::new(2));
        assert!(cache
            .lookup_by_backend_token("backend-token")
            .await
            .unwrap()
            .is_some());

        // A hit is served from the cache, even if the store has changed underneath us
        app.name = "renamed".to_owned();
        store.put(Record::Application(app)).await.unwrap();
        let found = cache
            .lookup_by_application_token("app-token")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "app");

        cache.invalidate(AppId::new(2)).await;
        let found = cache
            .lookup_by_application_token("app-token")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "renamed");
    }
}
