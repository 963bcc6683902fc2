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

//! # Deferred "last read" updates
//!
//! Reading one's feed advances one's `last_read` high-water mark, but the response shouldn't wait
//! on that write. Handlers post the update to a bounded queue drained by a single worker task. If
//! the queue is full the update is dropped: the next feed read will post another, and an overshoot
//! of the mark only hides events the user has already seen.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error};

use crate::{
    counter_add,
    entities::{Namespace, UserId},
    metrics::{self, Instruments, Sort},
    storage::{self, Record, Store},
};

inventory::submit! { metrics::Registration::new("last_read.queued", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("last_read.dropped", Sort::IntegralCounter) }

#[derive(Clone, Copy, Debug)]
struct Update {
    ns: Namespace,
    user: UserId,
    at: DateTime<Utc>,
}

/// Producer side of the update queue
#[derive(Clone)]
pub struct LastRead {
    sender: mpsc::Sender<Update>,
    instruments: Arc<Instruments>,
}

impl LastRead {
    /// Start a worker draining a queue of depth `depth`; it exits once every [LastRead] handle
    /// has been dropped
    pub fn spawn(
        store: Store,
        depth: usize,
        instruments: Arc<Instruments>,
    ) -> (LastRead, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(depth.max(1));
        let worker = tokio::spawn(drain(store, receiver));
        (
            LastRead {
                sender,
                instruments,
            },
            worker,
        )
    }
    /// Ask that `user`'s last-read mark be advanced to `at`; never blocks
    pub fn mark(&self, ns: Namespace, user: UserId, at: DateTime<Utc>) {
        match self.sender.try_send(Update { ns, user, at }) {
            Ok(()) => {
                counter_add!(self.instruments, "last_read.queued", 1, &[]);
            }
            Err(err) => {
                debug!("Dropping a last-read update: {}", err);
                counter_add!(self.instruments, "last_read.dropped", 1, &[]);
            }
        }
    }
}

async fn advance(store: &Store, update: Update) -> storage::Result<()> {
    if let Some(mut user) = store.app_user(update.ns, update.user).await? {
        if user.last_read.map(|t| t < update.at).unwrap_or(true) {
            user.last_read = Some(update.at);
            store.put(Record::AppUser(update.ns, user)).await?;
        }
    }
    Ok(())
}

async fn drain(store: Store, mut receiver: mpsc::Receiver<Update>) {
    while let Some(update) = receiver.recv().await {
        if let Err(err) = advance(&store, update).await {
            error!("Failed to advance last-read for {}: {}", update.user, err);
        }
    }
    debug!("Last-read worker exiting");
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::Duration;

    use crate::{
        entities::{AppId, AppUser, OrgId},
        memory::InMemory,
    };

    #[tokio::test]
    async fn marks_only_move_forward() {
        let ns = Namespace::new(OrgId::new(1), AppId::new(2));
        let store = Store::new(Arc::new(InMemory::new()));
        store
            .put(Record::AppUser(
                ns,
                AppUser {
                    id: UserId::new(100),
                    enabled: true,
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        let (last_read, worker) =
            LastRead::spawn(store.clone(), 4, Arc::new(Instruments::new("tidings")));
        let later = Utc::now();
        last_read.mark(ns, UserId::new(100), later);
        last_read.mark(ns, UserId::new(100), later - Duration::seconds(10));
        drop(last_read);
        worker.await.unwrap();
        let user = store.app_user(ns, UserId::new(100)).await.unwrap().unwrap();
        assert_eq!(user.last_read, Some(later));
    }
}
