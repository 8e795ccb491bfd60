use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use moka::sync::Cache;
use moka::Expiry;

use crate::filter::DUBIOUS_TTL;

const CACHE_CAPACITY: u64 = 1024;
/// Expiry computation starts from this ceiling and is reduced by the
/// smallest positive answer TTL.
const TTL_CEILING: u32 = 3600;
/// Lifetime of answers flagged dubious by the filter chain.
const DUBIOUS_EXPIRY: u32 = 300;

#[derive(Clone)]
struct CachedResponse {
    msg: Message,
    lifetime: Duration,
}

struct PerEntryLifetime;

impl Expiry<String, CachedResponse> for PerEntryLifetime {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedResponse,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.lifetime)
    }
}

/// Stable identity of a question: lowercase qname + qclass + qtype. Shared
/// by the cache and the single-flight gate.
pub fn fingerprint(msg: &Message) -> Option<String> {
    let q = msg.queries().first()?;
    Some(format!(
        "{}{}{}",
        q.name().to_lowercase(),
        u16::from(q.query_class()),
        u16::from(q.query_type())
    ))
}

/// Bounded response store keyed by fingerprint, entries expiring on their
/// own computed lifetime.
pub struct ResponseCache {
    inner: Cache<String, CachedResponse>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .expire_after(PerEntryLifetime)
                .build(),
        }
    }

    /// Deep copy of the stored message, question and id included; the
    /// caller rewrites the id to match the live request.
    pub fn get(&self, req: &Message) -> Option<Message> {
        let key = fingerprint(req)?;
        self.inner.get(&key).map(|hit| hit.msg)
    }

    /// Store `resp` under its own fingerprint. `shift` left-shifts the
    /// computed TTL; the duplicate-response path passes 1 so a corrected
    /// record outlives whatever the first arrival planted.
    pub fn set(&self, resp: &Message, shift: u32) {
        let Some(key) = fingerprint(resp) else { return };
        self.inner.insert(
            key,
            CachedResponse {
                msg: resp.clone(),
                lifetime: lifetime_for(resp, shift),
            },
        );
    }
}

/// The TTL discipline: smallest positive answer TTL under a 3600 s ceiling;
/// ≤ 2 marks a dubious record held 300 s for re-verification; everything
/// else is shifted (the ceiling applies before the shift, so a shift=1
/// write may reach 7200 s).
fn lifetime_for(resp: &Message, shift: u32) -> Duration {
    let mut expiry = TTL_CEILING;
    for rr in resp.answers() {
        let ttl = rr.ttl();
        if ttl > 0 && ttl < expiry {
            expiry = ttl;
        }
    }
    if expiry <= DUBIOUS_TTL {
        expiry = DUBIOUS_EXPIRY;
    } else {
        expiry <<= shift;
    }
    Duration::from_secs(expiry as u64)
}
