//! Time-bounded task leases.
//!
//! A lease grants one agent exclusive permission to work one task until it
//! expires. Grants, renewals and reclaims all take the lease-collection
//! write lock, so concurrent callers racing on the same task are serialized
//! and the loser observes a conflict. A background loop per project scans
//! for past-expiry leases and returns their tasks to the pending pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde_json::json;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{MarcusError, Result};
use crate::events::EventBus;
use crate::models::{event_types, Lease, LeaseStatus, Task, TaskStatus};
use crate::persistence::{collections, ProjectStore};
use crate::task_pool::TaskPool;

/// Default lease lifetime
pub const DEFAULT_TTL_SECONDS: i64 = 3600;

/// Default interval between reclaim scans
pub const DEFAULT_RECLAIM_INTERVAL_SECONDS: u64 = 30;

struct LeaseState {
    leases: HashMap<String, Lease>,
}

/// Grants and tracks leases for one project. Cheap to clone.
#[derive(Clone)]
pub struct LeaseManager {
    state: Arc<RwLock<LeaseState>>,
    tasks: TaskPool,
    bus: EventBus,
    store: ProjectStore,
    default_ttl: Duration,
    reclaim_interval: StdDuration,
}

impl LeaseManager {
    pub fn new(
        tasks: TaskPool,
        bus: EventBus,
        store: ProjectStore,
        default_ttl: Duration,
        reclaim_interval: StdDuration,
    ) -> Self {
        Self {
            state: Arc::new(RwLock::new(LeaseState {
                leases: HashMap::new(),
            })),
            tasks,
            bus,
            store,
            default_ttl,
            reclaim_interval,
        }
    }

    /// Grant a lease on `task_id` to `agent_id`.
    ///
    /// Fails with a lease conflict when a live lease already exists for the
    /// task, or when the agent already holds a live lease on any task.
    pub async fn grant(
        &self,
        task_id: &str,
        agent_id: &str,
        ttl: Option<Duration>,
    ) -> Result<Lease> {
        let lease = {
            let mut state = self.state.write().await;
            if state.leases.values().any(|l| l.task_id == task_id && l.is_live()) {
                return Err(MarcusError::lease_conflict(task_id).with_agent(agent_id));
            }
            if let Some(held) = state
                .leases
                .values()
                .find(|l| l.agent_id == agent_id && l.is_live())
            {
                return Err(MarcusError::lease_conflict(held.task_id.clone())
                    .with_agent(agent_id)
                    .with_detail("held_lease_id", held.lease_id.clone()));
            }

            let now = Utc::now();
            let lease = Lease {
                lease_id: Uuid::new_v4().to_string(),
                task_id: task_id.to_string(),
                agent_id: agent_id.to_string(),
                granted_at: now,
                expires_at: now + ttl.unwrap_or(self.default_ttl),
                renewal_count: 0,
                status: LeaseStatus::Active,
            };
            state.leases.insert(lease.lease_id.clone(), lease.clone());
            lease
        };

        self.persist_lease(&lease).await;
        Ok(lease)
    }

    /// Extend a live lease, incrementing its renewal count
    pub async fn renew(&self, lease_id: &str, extension: Option<Duration>) -> Result<Lease> {
        let lease = {
            let mut state = self.state.write().await;
            let lease = state
                .leases
                .get_mut(lease_id)
                .ok_or_else(|| MarcusError::lease_not_active(lease_id))?;
            if !lease.status.can_transition_to(LeaseStatus::Renewed) {
                return Err(MarcusError::lease_not_active(lease_id)
                    .with_detail("status", lease.status.to_string()));
            }
            lease.status = LeaseStatus::Renewed;
            lease.renewal_count += 1;
            lease.expires_at = lease.expires_at + extension.unwrap_or(self.default_ttl);
            lease.clone()
        };

        self.persist_lease(&lease).await;
        Ok(lease)
    }

    /// Complete a live lease; the task moves to completed and
    /// `TaskCompleted` is published.
    pub async fn complete(&self, lease_id: &str) -> Result<Lease> {
        let lease = self
            .transition_lease(lease_id, LeaseStatus::Completed)
            .await?;

        let task = self
            .tasks
            .transition(&lease.task_id, TaskStatus::Completed)
            .await?;
        self.persist_task(&task).await;

        self.bus
            .publish(self.event(
                event_types::TASK_COMPLETED,
                json!({
                    "task_id": lease.task_id,
                    "agent_id": lease.agent_id,
                    "lease_id": lease.lease_id,
                }),
            ))
            .await;
        Ok(lease)
    }

    /// Expire a live lease without touching the task; publishes
    /// `LeaseExpired`.
    pub async fn expire(&self, lease_id: &str) -> Result<Lease> {
        let lease = self.transition_lease(lease_id, LeaseStatus::Expired).await?;
        self.bus
            .publish(self.event(
                event_types::LEASE_EXPIRED,
                json!({
                    "task_id": lease.task_id,
                    "agent_id": lease.agent_id,
                    "lease_id": lease.lease_id,
                }),
            ))
            .await;
        Ok(lease)
    }

    /// Reclaim a past-expiry live lease: the task returns to pending and
    /// `LeaseExpired` then `LeaseReclaimed` are published in that order.
    ///
    /// Returns `None` when the lease is not eligible (still current, or no
    /// longer live). Reclamation is independent of caller cancellation.
    pub async fn reclaim(&self, lease_id: &str) -> Result<Option<Lease>> {
        let lease = {
            let mut state = self.state.write().await;
            let Some(lease) = state.leases.get_mut(lease_id) else {
                return Ok(None);
            };
            if !lease.is_live() || !lease.is_past_expiry(Utc::now()) {
                return Ok(None);
            }
            lease.status = LeaseStatus::Reclaimed;
            lease.clone()
        };
        self.persist_lease(&lease).await;

        let task = self
            .tasks
            .update(&lease.task_id, |task| {
                if !task.status.can_transition_to(TaskStatus::Pending) {
                    // Completed while the scan was running; leave it alone.
                    return Ok(task.clone());
                }
                task.status = TaskStatus::Pending;
                task.assigned_agent_id = None;
                task.lease_id = None;
                Ok(task.clone())
            })
            .await?;
        self.persist_task(&task).await;

        let payload = json!({
            "task_id": lease.task_id,
            "agent_id": lease.agent_id,
            "lease_id": lease.lease_id,
        });
        self.bus
            .publish(self.event(event_types::LEASE_EXPIRED, payload.clone()))
            .await;
        self.bus
            .publish(self.event(event_types::LEASE_RECLAIMED, payload))
            .await;
        Ok(Some(lease))
    }

    /// Drop a provisional lease acquired by an assignment that was
    /// cancelled before completing. No events are published.
    pub async fn abort(&self, lease_id: &str) {
        let mut state = self.state.write().await;
        state.leases.remove(lease_id);
    }

    /// The live lease on a task, if any
    pub async fn live_lease_for_task(&self, task_id: &str) -> Option<Lease> {
        let state = self.state.read().await;
        state
            .leases
            .values()
            .find(|l| l.task_id == task_id && l.is_live())
            .cloned()
    }

    /// The live lease held by an agent, if any
    pub async fn live_lease_for_agent(&self, agent_id: &str) -> Option<Lease> {
        let state = self.state.read().await;
        state
            .leases
            .values()
            .find(|l| l.agent_id == agent_id && l.is_live())
            .cloned()
    }

    pub async fn get(&self, lease_id: &str) -> Option<Lease> {
        self.state.read().await.leases.get(lease_id).cloned()
    }

    pub async fn all(&self) -> Vec<Lease> {
        self.state.read().await.leases.values().cloned().collect()
    }

    /// Restore leases from a persisted snapshot
    pub async fn restore(&self, leases: Vec<Lease>) {
        let mut state = self.state.write().await;
        state.leases = leases
            .into_iter()
            .map(|l| (l.lease_id.clone(), l))
            .collect();
    }

    /// One reclaim pass over every live lease; returns the reclaimed set
    pub async fn scan_and_reclaim(&self) -> Result<Vec<Lease>> {
        let now = Utc::now();
        let expired_ids: Vec<String> = {
            let state = self.state.read().await;
            state
                .leases
                .values()
                .filter(|l| l.is_live() && l.is_past_expiry(now))
                .map(|l| l.lease_id.clone())
                .collect()
        };

        let mut reclaimed = Vec::new();
        for lease_id in expired_ids {
            if let Some(lease) = self.reclaim(&lease_id).await? {
                tracing::info!(
                    project_id = %self.store.project_id(),
                    task_id = %lease.task_id,
                    agent_id = %lease.agent_id,
                    lease_id = %lease.lease_id,
                    "Reclaimed expired lease"
                );
                reclaimed.push(lease);
            }
        }
        Ok(reclaimed)
    }

    /// Spawn the periodic reclaim loop for this project
    pub fn spawn_reclaim_loop(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.reclaim_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = manager.scan_and_reclaim().await {
                    tracing::warn!(
                        project_id = %manager.store.project_id(),
                        error = %err,
                        "Lease reclaim scan failed"
                    );
                }
            }
        })
    }

    async fn transition_lease(&self, lease_id: &str, next: LeaseStatus) -> Result<Lease> {
        let lease = {
            let mut state = self.state.write().await;
            let lease = state
                .leases
                .get_mut(lease_id)
                .ok_or_else(|| MarcusError::lease_not_active(lease_id))?;
            if !lease.status.can_transition_to(next) {
                return Err(MarcusError::lease_not_active(lease_id)
                    .with_detail("status", lease.status.to_string()));
            }
            lease.status = next;
            lease.clone()
        };
        self.persist_lease(&lease).await;
        Ok(lease)
    }

    fn event(&self, event_type: &str, data: serde_json::Value) -> crate::models::Event {
        crate::models::Event::new(event_type, self.store.project_id(), data)
    }

    async fn persist_lease(&self, lease: &Lease) {
        self.store
            .save_best_effort(collections::LEASES, &lease.lease_id, lease)
            .await;
    }

    async fn persist_task(&self, task: &Task) {
        self.store
            .save_best_effort(collections::TASKS, &task.task_id, task)
            .await;
    }
}
