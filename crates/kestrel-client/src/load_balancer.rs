use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kestrel_common::config::LoadBalancerKind;
use kestrel_common::protocol::{LoadBalancerError, ServiceMetadata};
use parking_lot::RwLock;
use rand::Rng;

/// Virtual nodes placed on the hash ring per instance
pub const VIRTUAL_NODES: usize = 100;

/// Picks one instance out of the candidates for each call.
///
/// All strategies are safe to share between concurrent callers. Per-service
/// state (round-robin counters, hash rings) lives inside the balancer, so one
/// instance serves every service a client talks to.
pub enum LoadBalancer {
    RoundRobin(RoundRobin),
    Random(RandomPick),
    ConsistentHash(ConsistentHash),
}

impl LoadBalancer {
    pub fn new(kind: LoadBalancerKind) -> Self {
        match kind {
            LoadBalancerKind::RoundRobin => LoadBalancer::RoundRobin(RoundRobin::default()),
            LoadBalancerKind::Random => LoadBalancer::Random(RandomPick),
            LoadBalancerKind::ConsistentHash => LoadBalancer::ConsistentHash(ConsistentHash::default()),
        }
    }

    pub fn kind(&self) -> LoadBalancerKind {
        match self {
            LoadBalancer::RoundRobin(_) => LoadBalancerKind::RoundRobin,
            LoadBalancer::Random(_) => LoadBalancerKind::Random,
            LoadBalancer::ConsistentHash(_) => LoadBalancerKind::ConsistentHash,
        }
    }

    /// Selects exactly one instance from `candidates`.
    ///
    /// `request_key` only matters for consistent hashing, where equal keys
    /// land on the same instance while membership is unchanged.
    pub fn select(
        &self,
        service_name: &str,
        candidates: &[ServiceMetadata],
        request_key: &str,
    ) -> Result<ServiceMetadata, LoadBalancerError> {
        if candidates.is_empty() {
            return Err(LoadBalancerError::NoAvailableInstance(service_name.to_string()));
        }

        let selected = match self {
            LoadBalancer::RoundRobin(rr) => rr.select(service_name, candidates),
            LoadBalancer::Random(random) => random.select(candidates),
            LoadBalancer::ConsistentHash(ch) => ch.select(service_name, candidates, request_key),
        };
        Ok(selected)
    }

    /// Like [`select`](Self::select), but skips instances whose address is in
    /// `excluded` while any other candidate remains.
    ///
    /// Consistent hashing walks the full ring clockwise past excluded
    /// instances, which lands where a ring without them would, and leaves the
    /// cached ring untouched.
    pub fn select_excluding(
        &self,
        service_name: &str,
        candidates: &[ServiceMetadata],
        request_key: &str,
        excluded: &HashSet<String>,
    ) -> Result<ServiceMetadata, LoadBalancerError> {
        if excluded.is_empty() {
            return self.select(service_name, candidates, request_key);
        }

        if let LoadBalancer::ConsistentHash(ch) = self {
            if candidates.is_empty() {
                return Err(LoadBalancerError::NoAvailableInstance(service_name.to_string()));
            }
            let ring = ch.ring(service_name, candidates);
            let selected = ring
                .lookup_excluding(request_key, excluded)
                .unwrap_or_else(|| ring.lookup(request_key));
            return Ok(selected.clone());
        }

        let healthy: Vec<ServiceMetadata> = candidates
            .iter()
            .filter(|m| !excluded.contains(&m.address()))
            .cloned()
            .collect();
        // Every instance failed already: fall back to the full set
        if healthy.is_empty() {
            self.select(service_name, candidates, request_key)
        } else {
            self.select(service_name, &healthy, request_key)
        }
    }
}

/// Cycles through the candidates with one counter per service.
#[derive(Default)]
pub struct RoundRobin {
    counters: RwLock<HashMap<String, Arc<AtomicUsize>>>,
}

impl RoundRobin {
    fn counter(&self, service_name: &str) -> Arc<AtomicUsize> {
        if let Some(counter) = self.counters.read().get(service_name) {
            return counter.clone();
        }
        self.counters
            .write()
            .entry(service_name.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }

    fn select(&self, service_name: &str, candidates: &[ServiceMetadata]) -> ServiceMetadata {
        let index = self.counter(service_name).fetch_add(1, Ordering::Relaxed);
        candidates[index % candidates.len()].clone()
    }
}

/// Uniform random pick.
pub struct RandomPick;

impl RandomPick {
    fn select(&self, candidates: &[ServiceMetadata]) -> ServiceMetadata {
        let index = rand::thread_rng().gen_range(0..candidates.len());
        candidates[index].clone()
    }
}

/// Consistent hashing over a ring of virtual nodes.
///
/// Each service has its own ring, rebuilt whenever the candidate set differs
/// from the one it was built from. Rebuilding happens outside the lock and
/// the finished ring is swapped in, so concurrent callers always see a
/// complete ring.
#[derive(Default)]
pub struct ConsistentHash {
    rings: RwLock<HashMap<String, Arc<Ring>>>,
}

impl ConsistentHash {
    fn select(&self, service_name: &str, candidates: &[ServiceMetadata], request_key: &str) -> ServiceMetadata {
        self.ring(service_name, candidates).lookup(request_key).clone()
    }

    /// The service's ring for `candidates`, rebuilt if membership changed.
    fn ring(&self, service_name: &str, candidates: &[ServiceMetadata]) -> Arc<Ring> {
        let fingerprint = membership_fingerprint(candidates);

        let cached = self.rings.read().get(service_name).cloned();
        match cached {
            Some(ring) if ring.fingerprint == fingerprint => ring,
            _ => {
                let ring = Arc::new(Ring::build(candidates, fingerprint));
                tracing::debug!(
                    service = service_name,
                    instances = candidates.len(),
                    points = ring.points.len(),
                    "Rebuilt hash ring"
                );
                self.rings.write().insert(service_name.to_string(), ring.clone());
                ring
            }
        }
    }
}

pub struct Ring {
    fingerprint: u64,
    members: Vec<ServiceMetadata>,
    /// (position, index into `members`), sorted by position then identity
    points: Vec<(u64, usize)>,
}

impl Ring {
    pub fn build(candidates: &[ServiceMetadata], fingerprint: u64) -> Self {
        let members = candidates.to_vec();
        let identities: Vec<String> = members.iter().map(|m| m.address()).collect();

        let mut points = Vec::with_capacity(members.len() * VIRTUAL_NODES);
        for (index, identity) in identities.iter().enumerate() {
            for i in 0..VIRTUAL_NODES {
                points.push((hash_key(&format!("{}#{}", identity, i)), index));
            }
        }
        points.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| identities[a.1].cmp(&identities[b.1])));

        Self {
            fingerprint,
            members,
            points,
        }
    }

    /// First virtual node clockwise from the key's position, wrapping.
    pub fn lookup(&self, key: &str) -> &ServiceMetadata {
        let position = hash_key(key);
        let index = self.points.partition_point(|(point, _)| *point < position);
        let (_, member) = self.points.get(index).unwrap_or(&self.points[0]);
        &self.members[*member]
    }

    /// First virtual node clockwise from the key's position whose instance
    /// is not in `excluded`; `None` when every instance is excluded.
    pub fn lookup_excluding(&self, key: &str, excluded: &HashSet<String>) -> Option<&ServiceMetadata> {
        let allowed: Vec<bool> = self.members.iter().map(|m| !excluded.contains(&m.address())).collect();
        if !allowed.contains(&true) {
            return None;
        }

        let position = hash_key(key);
        let start = self.points.partition_point(|(point, _)| *point < position);
        self.points[start..]
            .iter()
            .chain(&self.points[..start])
            .find(|(_, member)| allowed[*member])
            .map(|(_, member)| &self.members[*member])
    }
}

/// Order-independent digest of the candidate set.
fn membership_fingerprint(candidates: &[ServiceMetadata]) -> u64 {
    candidates
        .iter()
        .map(|m| hash_key(&format!("{}#{}#{}", m.address(), m.weight, m.version)))
        .fold(candidates.len() as u64, |acc, h| acc.wrapping_add(h))
}

/// 64-bit FNV-1a followed by the murmur3 finalizer for better avalanche.
pub fn hash_key(key: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }

    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    hash ^= hash >> 33;
    hash
}
