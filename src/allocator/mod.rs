//! Resource allocator
//!
//! Matches enabled work items to eligible workers under capability,
//! capacity, fairness and lease rules. Shared across cases: reservations
//! are atomic test-and-set, queues are FIFO per capability tag, and no
//! worker ever exceeds its concurrent limit.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::case::CaseId;
use crate::error::{WorkflowError, WorkflowResult};
use crate::item::ItemId;
use crate::spec::types::{AllocationMode, AllocationRule};

/// Abstract worker identity: a participant or an automated agent
#[derive(Debug, Clone)]
pub struct Worker {
    /// Worker id
    pub id: String,
    /// Capability tags
    pub capabilities: BTreeSet<String>,
    /// Maximum concurrent allocations
    pub concurrent_limit: u32,
    /// Current allocation count
    pub current_load: u32,
    /// Availability flag
    pub available: bool,
    /// When availability last changed
    pub available_since: DateTime<Utc>,
}

impl Worker {
    /// A new, available worker
    pub fn new(id: impl Into<String>, capabilities: impl IntoIterator<Item = String>, concurrent_limit: u32) -> Self {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().collect(),
            concurrent_limit,
            current_load: 0,
            available: true,
            available_since: Utc::now(),
        }
    }

    fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    fn has_headroom(&self) -> bool {
        self.available && self.current_load < self.concurrent_limit
    }
}

/// Terminal outcome reported on release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Item completed
    Completed,
    /// Item cancelled or withdrawn
    Cancelled,
    /// Item failed or its lease was reclaimed
    Failed,
}

/// A recorded offer for one item
#[derive(Debug, Clone)]
struct Offer {
    case_id: CaseId,
    rule: AllocationRule,
    eligible: Vec<String>,
    reserved: Option<String>,
}

/// An item waiting in a capability-tag queue
#[derive(Debug, Clone)]
struct QueuedItem {
    item_id: ItemId,
    case_id: CaseId,
    rule: AllocationRule,
}

/// Aggregate cap over a tagged worker set
#[derive(Debug, Clone, Copy)]
struct PoolCap {
    cap: u32,
}

/// An allocation decided by the allocator itself (single-pick or queue)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// The item
    pub item_id: ItemId,
    /// Its case
    pub case_id: CaseId,
    /// The worker now holding the reservation
    pub worker_id: String,
}

/// Shared, instantiable allocator state
pub struct ResourceAllocator {
    workers: DashMap<String, Worker>,
    offers: DashMap<ItemId, Offer>,
    queues: Mutex<BTreeMap<String, VecDeque<QueuedItem>>>,
    pools: DashMap<String, PoolCap>,
}

impl ResourceAllocator {
    /// Empty allocator
    pub fn new() -> Self {
        Self {
            workers: DashMap::new(),
            offers: DashMap::new(),
            queues: Mutex::new(BTreeMap::new()),
            pools: DashMap::new(),
        }
    }

    /// Register or replace a worker
    pub fn register_worker(&self, worker: Worker) {
        tracing::info!(worker_id = %worker.id, limit = worker.concurrent_limit, "worker registered");
        self.workers.insert(worker.id.clone(), worker);
    }

    /// Flip a worker's availability
    pub fn set_availability(&self, worker_id: &str, available: bool, now: DateTime<Utc>) -> WorkflowResult<()> {
        let mut worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| WorkflowError::ResourceUnavailable(format!("unknown worker {worker_id}")))?;
        worker.available = available;
        worker.available_since = now;
        Ok(())
    }

    /// Cap the aggregate load of workers holding `tag`
    pub fn set_pool_cap(&self, tag: impl Into<String>, cap: u32) {
        self.pools.insert(tag.into(), PoolCap { cap });
    }

    /// Current load of one worker
    pub fn worker_load(&self, worker_id: &str) -> Option<u32> {
        self.workers.get(worker_id).map(|w| w.current_load)
    }

    /// Workers eligible for a rule right now, in deterministic order:
    /// preference list first, then least-loaded, then id
    ///
    /// Works on a snapshot so pool-load accounting never nests map
    /// iteration inside a shard guard.
    fn eligible_workers(&self, rule: &AllocationRule) -> Vec<String> {
        let snapshot: Vec<Worker> = self.workers.iter().map(|w| w.clone()).collect();

        let mut tag_load: BTreeMap<&str, u32> = BTreeMap::new();
        for worker in &snapshot {
            for tag in &worker.capabilities {
                *tag_load.entry(tag.as_str()).or_insert(0) += worker.current_load;
            }
        }
        let pool_ok = |worker: &Worker| {
            worker.capabilities.iter().all(|tag| {
                self.pools
                    .get(tag)
                    .is_none_or(|pool| tag_load.get(tag.as_str()).copied().unwrap_or(0) < pool.cap)
            })
        };

        let mut eligible: Vec<(usize, u32, String)> = snapshot
            .iter()
            .filter(|w| w.has_capabilities(&rule.required_capabilities))
            .filter(|w| w.has_headroom())
            .filter(|w| pool_ok(w))
            .map(|w| {
                let pref = rule
                    .preference
                    .iter()
                    .position(|p| p == &w.id)
                    .unwrap_or(usize::MAX);
                (pref, w.current_load, w.id.clone())
            })
            .collect();
        eligible.sort();
        eligible.into_iter().map(|(_, _, id)| id).collect()
    }

    fn queue_tag(rule: &AllocationRule) -> String {
        rule.required_capabilities
            .first()
            .cloned()
            .unwrap_or_default()
    }

    /// Offer an item to eligible workers
    ///
    /// `offer-all` returns the whole offer set and lets `reserve` race.
    /// `single-pick` pre-binds a deterministic choice. `queue` (and any
    /// offer with no eligible worker) enqueues FIFO per capability tag;
    /// urgent items jump to the head. Returns the offer set and any
    /// allocator-decided dispatches.
    pub fn offer(
        &self,
        item_id: ItemId,
        case_id: CaseId,
        rule: &AllocationRule,
        urgent: bool,
    ) -> WorkflowResult<(Vec<String>, Vec<Dispatch>)> {
        let eligible = self.eligible_workers(rule);

        if eligible.is_empty() || rule.mode == AllocationMode::Queue {
            let queued = QueuedItem {
                item_id,
                case_id,
                rule: rule.clone(),
            };
            let tag = Self::queue_tag(rule);
            let mut queues = self.queues.lock();
            let queue = queues.entry(tag).or_default();
            if urgent {
                queue.push_front(queued);
            } else {
                queue.push_back(queued);
            }
            drop(queues);
            let dispatches = self.drain_queues();
            return Ok((Vec::new(), dispatches));
        }

        match rule.mode {
            AllocationMode::OfferAll => {
                self.offers.insert(
                    item_id,
                    Offer {
                        case_id,
                        rule: rule.clone(),
                        eligible: eligible.clone(),
                        reserved: None,
                    },
                );
                Ok((eligible, Vec::new()))
            }
            AllocationMode::SinglePick => {
                let chosen = eligible[0].clone();
                self.offers.insert(
                    item_id,
                    Offer {
                        case_id,
                        rule: rule.clone(),
                        eligible: vec![chosen.clone()],
                        reserved: None,
                    },
                );
                self.reserve(&item_id, &chosen)?;
                Ok((
                    vec![chosen.clone()],
                    vec![Dispatch {
                        item_id,
                        case_id,
                        worker_id: chosen,
                    }],
                ))
            }
            AllocationMode::Queue => unreachable!("queue mode handled above"),
        }
    }

    /// Atomic test-and-set reservation; only one reserve succeeds per item
    pub fn reserve(&self, item_id: &ItemId, worker_id: &str) -> WorkflowResult<()> {
        {
            let mut offer = self
                .offers
                .get_mut(item_id)
                .ok_or_else(|| {
                    WorkflowError::PreconditionViolated(format!("item {item_id} is not offered"))
                })?;
            if let Some(holder) = &offer.reserved {
                return Err(WorkflowError::PreconditionViolated(format!(
                    "item {item_id} already reserved by {holder}"
                )));
            }
            if !offer.eligible.iter().any(|w| w == worker_id) {
                return Err(WorkflowError::ResourceUnavailable(format!(
                    "worker {worker_id} is not eligible for item {item_id}"
                )));
            }
            offer.reserved = Some(worker_id.to_string());
        }

        // Capacity check-and-increment under the worker entry lock.
        let capacity_ok = {
            match self.workers.get_mut(worker_id) {
                Some(mut worker) if worker.has_headroom() => {
                    worker.current_load += 1;
                    true
                }
                _ => false,
            }
        };
        if !capacity_ok {
            if let Some(mut offer) = self.offers.get_mut(item_id) {
                offer.reserved = None;
            }
            return Err(WorkflowError::ResourceUnavailable(format!(
                "worker {worker_id} is at capacity"
            )));
        }
        tracing::debug!(item_id = %item_id, worker_id, "item reserved");
        Ok(())
    }

    /// Release an item on checkin, withdrawal or lease loss
    ///
    /// Decrements the reserving worker's load, drops the offer, purges the
    /// item from any queue, and drains queues freed by the released
    /// capacity.
    pub fn release(&self, item_id: &ItemId, outcome: ReleaseOutcome) -> Vec<Dispatch> {
        if let Some((_, offer)) = self.offers.remove(item_id) {
            if let Some(worker_id) = offer.reserved {
                if let Some(mut worker) = self.workers.get_mut(&worker_id) {
                    worker.current_load = worker.current_load.saturating_sub(1);
                }
            }
        }
        {
            let mut queues = self.queues.lock();
            for queue in queues.values_mut() {
                queue.retain(|q| q.item_id != *item_id);
            }
        }
        tracing::debug!(item_id = %item_id, ?outcome, "item released");
        self.drain_queues()
    }

    /// Dispatch queue heads to workers with free capacity, FIFO per tag
    fn drain_queues(&self) -> Vec<Dispatch> {
        let mut dispatched = Vec::new();
        let mut queues = self.queues.lock();
        for queue in queues.values_mut() {
            loop {
                let Some(head) = queue.front() else { break };
                let eligible = self.eligible_workers(&head.rule);
                let Some(worker_id) = eligible.first().cloned() else {
                    // Head blocks the tag queue: strict FIFO, no overtaking.
                    break;
                };
                let Some(head) = queue.pop_front() else { break };
                self.offers.insert(
                    head.item_id,
                    Offer {
                        case_id: head.case_id,
                        rule: head.rule.clone(),
                        eligible: vec![worker_id.clone()],
                        reserved: Some(worker_id.clone()),
                    },
                );
                if let Some(mut worker) = self.workers.get_mut(&worker_id) {
                    worker.current_load += 1;
                }
                dispatched.push(Dispatch {
                    item_id: head.item_id,
                    case_id: head.case_id,
                    worker_id,
                });
            }
        }
        dispatched
    }

    /// Number of items waiting across all tag queues
    pub fn queued_len(&self) -> usize {
        self.queues.lock().values().map(VecDeque::len).sum()
    }
}

impl Default for ResourceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(caps: &[&str], mode: AllocationMode) -> AllocationRule {
        AllocationRule {
            required_capabilities: caps.iter().map(|s| s.to_string()).collect(),
            mode,
            preference: Vec::new(),
        }
    }

    fn allocator_with_workers() -> ResourceAllocator {
        let allocator = ResourceAllocator::new();
        allocator.register_worker(Worker::new("w1", vec!["review".to_string()], 2));
        allocator.register_worker(Worker::new("w2", vec!["review".to_string()], 2));
        allocator.register_worker(Worker::new("w3", vec!["ship".to_string()], 1));
        allocator
    }

    #[test]
    fn offer_all_first_reserve_wins() {
        let allocator = allocator_with_workers();
        let item = ItemId::new();
        let (offered, _) = allocator
            .offer(item, CaseId::new(), &rule(&["review"], AllocationMode::OfferAll), false)
            .unwrap();
        assert_eq!(offered.len(), 2);

        allocator.reserve(&item, "w2").unwrap();
        let err = allocator.reserve(&item, "w1").unwrap_err();
        assert!(matches!(err, WorkflowError::PreconditionViolated(_)));
        assert_eq!(allocator.worker_load("w2"), Some(1));
        assert_eq!(allocator.worker_load("w1"), Some(0));
    }

    #[test]
    fn reserve_rejects_ineligible_worker() {
        let allocator = allocator_with_workers();
        let item = ItemId::new();
        allocator
            .offer(item, CaseId::new(), &rule(&["review"], AllocationMode::OfferAll), false)
            .unwrap();
        let err = allocator.reserve(&item, "w3").unwrap_err();
        assert!(matches!(err, WorkflowError::ResourceUnavailable(_)));
    }

    #[test]
    fn single_pick_is_deterministic_least_loaded() {
        let allocator = allocator_with_workers();
        let (_, dispatches) = allocator
            .offer(ItemId::new(), CaseId::new(), &rule(&["review"], AllocationMode::SinglePick), false)
            .unwrap();
        assert_eq!(dispatches.len(), 1);
        // Equal load: lexicographically first worker.
        assert_eq!(dispatches[0].worker_id, "w1");

        let (_, dispatches) = allocator
            .offer(ItemId::new(), CaseId::new(), &rule(&["review"], AllocationMode::SinglePick), false)
            .unwrap();
        // w1 now carries load 1, so w2 is the least loaded.
        assert_eq!(dispatches[0].worker_id, "w2");
    }

    #[test]
    fn capacity_limit_is_never_exceeded() {
        let allocator = ResourceAllocator::new();
        allocator.register_worker(Worker::new("solo", vec!["review".to_string()], 1));

        let first = ItemId::new();
        let (_, d) = allocator
            .offer(first, CaseId::new(), &rule(&["review"], AllocationMode::SinglePick), false)
            .unwrap();
        assert_eq!(d.len(), 1);

        // No headroom: the next offer queues instead of over-allocating.
        let second = ItemId::new();
        let (offered, dispatches) = allocator
            .offer(second, CaseId::new(), &rule(&["review"], AllocationMode::OfferAll), false)
            .unwrap();
        assert!(offered.is_empty() && dispatches.is_empty());
        assert_eq!(allocator.queued_len(), 1);

        // Releasing the first dispatch frees the slot and drains the queue.
        let dispatches = allocator.release(&first, ReleaseOutcome::Completed);
        assert_eq!(dispatches.len(), 1);
        assert_eq!(dispatches[0].item_id, second);
        assert_eq!(allocator.worker_load("solo"), Some(1));
    }

    #[test]
    fn queue_mode_is_fifo_and_urgent_jumps() {
        let allocator = ResourceAllocator::new();
        allocator.register_worker(Worker::new("solo", vec!["review".to_string()], 1));
        let r = rule(&["review"], AllocationMode::Queue);

        let first = ItemId::new();
        let (_, d) = allocator.offer(first, CaseId::new(), &r, false).unwrap();
        assert_eq!(d.len(), 1, "empty queue dispatches immediately");

        let second = ItemId::new();
        let third = ItemId::new();
        let urgent = ItemId::new();
        allocator.offer(second, CaseId::new(), &r, false).unwrap();
        allocator.offer(third, CaseId::new(), &r, false).unwrap();
        allocator.offer(urgent, CaseId::new(), &r, true).unwrap();

        let mut served = Vec::new();
        let mut current = first;
        loop {
            let dispatches = allocator.release(&current, ReleaseOutcome::Completed);
            let Some(d) = dispatches.first() else { break };
            served.push(d.item_id);
            current = d.item_id;
        }
        // Urgent overtook the two waiting items.
        assert_eq!(served[0], urgent);
        assert_eq!(served[1], second);
        assert_eq!(served[2], third);
    }

    #[test]
    fn pool_cap_queues_offers() {
        let allocator = ResourceAllocator::new();
        allocator.register_worker(Worker::new("w1", vec!["review".to_string()], 5));
        allocator.register_worker(Worker::new("w2", vec!["review".to_string()], 5));
        allocator.set_pool_cap("review", 1);

        let r = rule(&["review"], AllocationMode::SinglePick);
        let (_, d) = allocator.offer(ItemId::new(), CaseId::new(), &r, false).unwrap();
        assert_eq!(d.len(), 1);

        // Pool exhausted despite per-worker headroom.
        let queued = ItemId::new();
        let (offered, d) = allocator.offer(queued, CaseId::new(), &r, false).unwrap();
        assert!(offered.is_empty() && d.is_empty());
        assert_eq!(allocator.queued_len(), 1);
    }

    #[test]
    fn unavailable_workers_receive_no_offers() {
        let allocator = allocator_with_workers();
        allocator.set_availability("w1", false, Utc::now()).unwrap();
        let (offered, _) = allocator
            .offer(ItemId::new(), CaseId::new(), &rule(&["review"], AllocationMode::OfferAll), false)
            .unwrap();
        assert_eq!(offered, vec!["w2".to_string()]);
    }
}
