use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use anyhow::{bail, Result};
use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::Record;
use tracing::warn;

use crate::filter::RecordFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// An upstream resolver. Unique by `url`, immutable after config load.
#[derive(Debug, Clone)]
pub struct Backend {
    pub transport: Transport,
    /// host:port
    pub addr: String,
    /// canonical `udp://host:port` form
    pub url: String,
}

impl Backend {
    pub fn parse(s: &str) -> Result<Backend> {
        let (transport, rest) = if let Some(rest) = s.strip_prefix("udp://") {
            (Transport::Udp, rest)
        } else if let Some(rest) = s.strip_prefix("tcp://") {
            (Transport::Tcp, rest)
        } else {
            bail!("backend {s:?}: expected udp:// or tcp:// scheme");
        };
        if rest.is_empty() {
            bail!("backend {s:?}: missing host");
        }
        let scheme = match transport {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        };
        let addr = if rest.contains(':') {
            rest.to_string()
        } else {
            format!("{rest}:53")
        };
        Ok(Backend {
            transport,
            url: format!("{scheme}://{addr}"),
            addr,
        })
    }
}

/// Key of the static records map: class in the high half, type in the low.
pub type RrKey = u32;

pub fn rr_key(class: u16, rtype: u16) -> RrKey {
    (class as u32) << 16 | rtype as u32
}

/// Per-name policy: where to forward, what to filter, and optionally which
/// records to answer locally.
#[derive(Debug, Default)]
pub struct Entry {
    pub backends: Vec<Arc<Backend>>,
    pub filters: Arc<Vec<RecordFilter>>,
    pub records: HashMap<RrKey, Vec<Record>>,
}

impl Entry {
    /// Static zone responder: answer from locally configured records, no
    /// network involved. `None` when nothing is configured for the
    /// question's (class, type), letting the caller fall through to the
    /// backends.
    pub fn answer_static(&self, req: &Message) -> Option<Message> {
        let q = req.queries().first()?;
        let key = rr_key(u16::from(q.query_class()), u16::from(q.query_type()));
        let records = self.records.get(&key)?;
        let mut resp = Message::new();
        resp.set_id(req.id());
        resp.set_message_type(MessageType::Response);
        resp.add_query(q.clone());
        for rr in records {
            resp.add_answer(rr.clone());
        }
        Some(resp)
    }
}

pub fn reverse_chars(s: &str) -> String {
    s.chars().rev().collect()
}

#[derive(Clone, Copy)]
enum Node {
    Entry(usize),
    Disabled,
}

/// Accumulates configured domains, refused prefixes and zone records, then
/// freezes them into a `Policy`. Comma-group siblings share one entry, so a
/// zone record merged into one of them is visible through all of its names.
pub struct PolicyBuilder {
    global: Arc<Entry>,
    entries: Vec<Entry>,
    tree: BTreeMap<String, Node>,
}

impl PolicyBuilder {
    pub fn new(global: Arc<Entry>) -> Self {
        Self {
            global,
            entries: Vec::new(),
            tree: BTreeMap::new(),
        }
    }

    /// Insert one policy entry under each of `names`.
    pub fn add_domains<'a>(&mut self, names: impl Iterator<Item = &'a str>, entry: Entry) {
        let idx = self.entries.len();
        self.entries.push(entry);
        for name in names {
            if name.is_empty() {
                continue;
            }
            self.tree.insert(reverse_chars(name), Node::Entry(idx));
        }
    }

    /// Mark a domain suffix as refused.
    pub fn add_disabled(&mut self, name: &str) {
        if name.is_empty() {
            return;
        }
        self.tree.insert(reverse_chars(name), Node::Disabled);
    }

    /// Merge a locally served record into the entry owning its exact name,
    /// creating a records-only entry when there is none.
    pub fn add_zone_record(&mut self, rr: Record) {
        let mut key = reverse_chars(&rr.name().to_string());
        if key.starts_with('.') {
            key.remove(0);
        }
        let rrk = rr_key(u16::from(rr.dns_class()), u16::from(rr.record_type()));
        let idx = match self.tree.get(&key) {
            Some(Node::Entry(i)) => *i,
            Some(Node::Disabled) => {
                warn!(name = %rr.name(), "zone record under a disabled prefix, ignored");
                return;
            }
            None => {
                let i = self.entries.len();
                self.entries.push(Entry::default());
                self.tree.insert(key, Node::Entry(i));
                i
            }
        };
        self.entries[idx].records.entry(rrk).or_default().push(rr);
    }

    pub fn finish(self) -> Policy {
        let arcs: Vec<Arc<Entry>> = self.entries.into_iter().map(Arc::new).collect();
        let disabled = Arc::new(Entry::default());
        let tree = self
            .tree
            .into_iter()
            .map(|(key, node)| {
                let entry = match node {
                    Node::Entry(i) => arcs[i].clone(),
                    Node::Disabled => disabled.clone(),
                };
                (key, entry)
            })
            .collect();
        Policy {
            global: self.global,
            disabled,
            tree,
        }
    }
}

/// The resolver-selection tree. Names are stored character-reversed so a
/// suffix lookup becomes a longest-prefix lookup over an ordered map.
pub struct Policy {
    global: Arc<Entry>,
    disabled: Arc<Entry>,
    tree: BTreeMap<String, Arc<Entry>>,
}

impl Policy {
    pub fn global(&self) -> &Arc<Entry> {
        &self.global
    }

    pub fn is_disabled(&self, entry: &Arc<Entry>) -> bool {
        Arc::ptr_eq(entry, &self.disabled)
    }

    /// Longest-suffix policy lookup, falling back to the global entry.
    ///
    /// Matching is character-level, not label-aligned: "foo-example.com"
    /// matches an "example.com" entry. Callers wanting label alignment must
    /// configure ".example.com" style names.
    pub fn find(&self, name: &str) -> Arc<Entry> {
        let mut key = reverse_chars(name);
        if key.starts_with('.') {
            // fully qualified names carry a trailing dot
            key.remove(0);
        }
        self.longest_prefix(&key)
            .cloned()
            .unwrap_or_else(|| self.global.clone())
    }

    fn longest_prefix(&self, key: &str) -> Option<&Arc<Entry>> {
        let mut end = key.len();
        loop {
            let probe = &key[..end];
            let (stored, entry) = self
                .tree
                .range::<str, _>((Bound::Unbounded, Bound::Included(probe)))
                .next_back()?;
            if probe.starts_with(stored.as_str()) {
                return Some(entry);
            }
            // shrink the probe to the shared prefix and retry; any stored
            // prefix of the key sorts at or below that point
            let common = stored
                .as_bytes()
                .iter()
                .zip(probe.as_bytes())
                .take_while(|(a, b)| a == b)
                .count();
            if common == 0 {
                return None;
            }
            end = common;
            while !key.is_char_boundary(end) {
                end -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn entry_with_marker(ip: [u8; 4]) -> Entry {
        // distinguish entries in assertions by a single static A record
        let mut entry = Entry::default();
        let rr = Record::from_rdata(
            Name::from_str("marker.test.").expect("name"),
            60,
            RData::A(A(Ipv4Addr::from(ip))),
        );
        entry.records.entry(rr_key(1, 1)).or_default().push(rr);
        entry
    }

    fn marker_of(entry: &Entry) -> Option<Ipv4Addr> {
        let rr = entry.records.get(&rr_key(1, 1))?.first()?;
        match rr.data() {
            Some(RData::A(a)) => Some(a.0),
            _ => None,
        }
    }

    fn build_sample() -> Policy {
        let mut b = PolicyBuilder::new(Arc::new(Entry::default()));
        b.add_domains(["example.com"].into_iter(), entry_with_marker([1, 0, 0, 1]));
        b.add_domains(
            ["mail.example.com"].into_iter(),
            entry_with_marker([1, 0, 0, 2]),
        );
        b.add_disabled("ads.example.net");
        b.finish()
    }

    #[test]
    fn find_prefers_longest_suffix() {
        let p = build_sample();
        assert_eq!(
            marker_of(&p.find("mail.example.com.")),
            Some(Ipv4Addr::new(1, 0, 0, 2))
        );
        assert_eq!(
            marker_of(&p.find("www.example.com.")),
            Some(Ipv4Addr::new(1, 0, 0, 1))
        );
        assert_eq!(
            marker_of(&p.find("deep.sub.mail.example.com.")),
            Some(Ipv4Addr::new(1, 0, 0, 2))
        );
    }

    #[test]
    fn find_falls_back_to_global() {
        let p = build_sample();
        let hit = p.find("unrelated.org.");
        assert!(Arc::ptr_eq(&hit, p.global()));
    }

    #[test]
    fn find_matches_across_label_boundaries() {
        // documented simplification of the reversed-string tree
        let p = build_sample();
        assert_eq!(
            marker_of(&p.find("foo-example.com.")),
            Some(Ipv4Addr::new(1, 0, 0, 1))
        );
    }

    #[test]
    fn disabled_prefix_is_shared_sentinel() {
        let p = build_sample();
        assert!(p.is_disabled(&p.find("ads.example.net.")));
        assert!(p.is_disabled(&p.find("sub.ads.example.net.")));
        assert!(!p.is_disabled(&p.find("example.com.")));
    }

    #[test]
    fn comma_group_siblings_share_one_entry() {
        let mut b = PolicyBuilder::new(Arc::new(Entry::default()));
        b.add_domains(
            "example.com, example.net".split(',').map(str::trim),
            entry_with_marker([1, 0, 0, 3]),
        );
        let p = b.finish();
        let a = p.find("example.com.");
        let b = p.find("example.net.");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn zone_record_merges_into_existing_entry() {
        let mut b = PolicyBuilder::new(Arc::new(Entry::default()));
        b.add_domains(["lan"].into_iter(), Entry::default());
        let rr = Record::from_rdata(
            Name::from_str("router.lan.").expect("name"),
            3600,
            RData::A(A(Ipv4Addr::new(192, 168, 1, 1))),
        );
        b.add_zone_record(rr.clone());
        let second = Record::from_rdata(
            Name::from_str("router.lan.").expect("name"),
            3600,
            RData::A(A(Ipv4Addr::new(192, 168, 1, 2))),
        );
        b.add_zone_record(second);
        let p = b.finish();
        let entry = p.find("router.lan.");
        let key = rr_key(u16::from(DNSClass::IN), u16::from(RecordType::A));
        assert_eq!(entry.records.get(&key).map(Vec::len), Some(2));
    }

    #[test]
    fn answer_static_copies_id_and_question() {
        let mut b = PolicyBuilder::new(Arc::new(Entry::default()));
        let rr = Record::from_rdata(
            Name::from_str("router.lan.").expect("name"),
            3600,
            RData::A(A(Ipv4Addr::new(192, 168, 1, 1))),
        );
        b.add_zone_record(rr);
        let p = b.finish();
        let entry = p.find("router.lan.");

        let mut req = Message::new();
        req.set_id(0x1234);
        req.add_query(Query::query(
            Name::from_str("router.lan.").expect("name"),
            RecordType::A,
        ));
        let resp = entry.answer_static(&req).expect("static answer");
        assert_eq!(resp.id(), 0x1234);
        assert_eq!(resp.message_type(), MessageType::Response);
        assert_eq!(resp.queries().len(), 1);
        assert_eq!(resp.answers().len(), 1);

        // no AAAA records configured, so the lookup falls through
        let mut v6 = Message::new();
        v6.add_query(Query::query(
            Name::from_str("router.lan.").expect("name"),
            RecordType::AAAA,
        ));
        assert!(entry.answer_static(&v6).is_none());
    }

    #[test]
    fn backend_parse_defaults_port_and_scheme() {
        let be = Backend::parse("udp://203.0.113.1").expect("backend");
        assert_eq!(be.transport, Transport::Udp);
        assert_eq!(be.addr, "203.0.113.1:53");
        assert_eq!(be.url, "udp://203.0.113.1:53");

        let be = Backend::parse("tcp://8.8.8.8:5353").expect("backend");
        assert_eq!(be.transport, Transport::Tcp);
        assert_eq!(be.addr, "8.8.8.8:5353");

        assert!(Backend::parse("https://8.8.8.8").is_err());
        assert!(Backend::parse("udp://").is_err());
    }
}
