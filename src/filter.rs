use std::net::Ipv4Addr;

use hickory_proto::op::Message;
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::info;

/// TTL planted on a record that passed the static rules but cannot be
/// cross-checked; the cache keeps such answers only briefly (see
/// `cache::ResponseCache::set`).
pub const DUBIOUS_TTL: u32 = 2;

/// A single answer-set transform. Chains are applied in declared order.
/// IPv4 only; AAAA and other records pass through untouched.
#[derive(Debug, Clone)]
pub enum RecordFilter {
    /// Reject the whole answer set when any A record hits the rule set.
    DropV4(FxHashSet<u32>),
    /// Rewrite matching A rdata in place. Never empties the set.
    ReplaceV4(FxHashMap<u32, u32>),
}

impl RecordFilter {
    pub fn filter(&self, mut answers: Vec<Record>, msg: &Message) -> Vec<Record> {
        match self {
            RecordFilter::DropV4(rules) => {
                let mut lone_a = None;
                let mut a_count = 0usize;
                for (idx, rr) in answers.iter().enumerate() {
                    if let Some(RData::A(a)) = rr.data() {
                        if rules.contains(&u32::from(a.0)) {
                            info!(event = "filter_drop", record = %rr, "answer set rejected");
                            return Vec::new();
                        }
                        lone_a = Some(idx);
                        a_count += 1;
                    }
                }
                // A single A answer with nothing in the additional section
                // passed the static rules but looks thin; shorten its TTL so
                // it gets re-verified soon.
                if a_count == 1 && msg.additionals().is_empty() && msg.edns().is_none() {
                    if let Some(idx) = lone_a {
                        answers[idx].set_ttl(DUBIOUS_TTL);
                    }
                }
                answers
            }
            RecordFilter::ReplaceV4(rules) => {
                for rr in answers.iter_mut() {
                    let hit = match rr.data() {
                        Some(RData::A(a)) => rules.get(&u32::from(a.0)).copied(),
                        _ => None,
                    };
                    if let Some(repl) = hit {
                        info!(event = "filter_replace", record = %rr, to = %Ipv4Addr::from(repl), "answer rewritten");
                        rr.set_data(Some(RData::A(A(Ipv4Addr::from(repl)))));
                    }
                }
                answers
            }
        }
    }
}

/// Run the answer section of `msg` through `filters`. `None` means every
/// record was filtered away and the message counts as "no answer".
pub fn apply_filters(mut msg: Message, filters: &[RecordFilter]) -> Option<Message> {
    let mut rrset = msg.take_answers();
    for f in filters {
        rrset = f.filter(rrset, &msg);
    }
    if rrset.is_empty() {
        return None;
    }
    msg.insert_answers(rrset);
    Some(msg)
}
