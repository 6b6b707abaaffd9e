// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Global running-set counter.
//!
//! The count of running activations is the number of activations holding a
//! slot flag in the state store. Acquisition is a conditional update, so two
//! schedulers racing on the last slot cannot both win, and releasing an
//! unheld slot changes nothing.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::persistence::Persistence;

/// Slot accounting against `EDA_MAX_RUNNING_ACTIVATIONS`.
#[derive(Clone)]
pub struct RunningSet {
    persistence: Arc<dyn Persistence>,
    cap: u32,
}

impl RunningSet {
    /// Create a counter with the given cap.
    pub fn new(persistence: Arc<dyn Persistence>, cap: u32) -> Self {
        Self { persistence, cap }
    }

    /// Configured cap.
    pub fn cap(&self) -> u32 {
        self.cap
    }

    /// Take a slot for `activation_id` if one is free.
    pub async fn try_admit(&self, activation_id: i64) -> Result<bool> {
        let admitted = self
            .persistence
            .try_acquire_slot(activation_id, self.cap)
            .await?;
        debug!(activation_id, admitted, "Slot acquisition");
        Ok(admitted)
    }

    /// Return the slot of `activation_id`. Safe to call more than once.
    pub async fn release(&self, activation_id: i64) -> Result<()> {
        if self.persistence.release_slot(activation_id).await? {
            debug!(activation_id, "Slot released");
        }
        Ok(())
    }

    /// Slots currently held.
    pub async fn held(&self) -> Result<u32> {
        self.persistence.count_slots().await
    }

    /// Reset the counter from observed running activations.
    pub async fn rebuild(&self, running: &[i64]) -> Result<u32> {
        let held = self.persistence.rebuild_slots(running).await?;
        info!(held, cap = self.cap, "Running set rebuilt");
        Ok(held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::NewActivation;
    use crate::persistence::SqlitePersistence;

    async fn running_set(cap: u32, activations: usize) -> (RunningSet, Vec<i64>) {
        let persistence = Arc::new(
            SqlitePersistence::connect("sqlite::memory:")
                .await
                .expect("Failed to create in-memory SQLite persistence"),
        );
        let mut ids = Vec::new();
        for i in 0..activations {
            let new = NewActivation::new(format!("a{i}"), "quay.io/ansible/ansible-rulebook:main");
            ids.push(persistence.create_activation(&new).await.unwrap().id);
        }
        (RunningSet::new(persistence, cap), ids)
    }

    #[tokio::test]
    async fn test_admission_stops_at_cap() {
        let (set, ids) = running_set(2, 3).await;
        assert!(set.try_admit(ids[0]).await.unwrap());
        assert!(set.try_admit(ids[1]).await.unwrap());
        assert!(!set.try_admit(ids[2]).await.unwrap());
        assert_eq!(set.held().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_admitting_twice_takes_one_slot() {
        let (set, ids) = running_set(2, 1).await;
        assert!(set.try_admit(ids[0]).await.unwrap());
        assert!(!set.try_admit(ids[0]).await.unwrap());
        assert_eq!(set.held().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (set, ids) = running_set(1, 2).await;
        set.try_admit(ids[0]).await.unwrap();
        set.release(ids[0]).await.unwrap();
        set.release(ids[0]).await.unwrap();
        set.release(ids[1]).await.unwrap();
        assert_eq!(set.held().await.unwrap(), 0);
        assert!(set.try_admit(ids[1]).await.unwrap());
    }

    #[tokio::test]
    async fn test_rebuild_replaces_held_slots() {
        let (set, ids) = running_set(3, 3).await;
        set.try_admit(ids[0]).await.unwrap();
        set.try_admit(ids[1]).await.unwrap();

        assert_eq!(set.rebuild(&[ids[2], 9_999]).await.unwrap(), 1);
        assert_eq!(set.held().await.unwrap(), 1);
        assert!(set.try_admit(ids[0]).await.unwrap());
    }
}
