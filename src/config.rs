use std::collections::HashMap;
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use hickory_proto::rr::rdata::{A, AAAA, CNAME, MX, NS, PTR, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;
use tracing::info;

use crate::filter::RecordFilter;
use crate::policy::{Backend, Entry, Policy, PolicyBuilder};

/// Group label resolving to the global fallback entry.
const DEFAULT_LABEL: &str = "default";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigDoc {
    #[serde(default)]
    pub prefilters: PrefilterDoc,
    /// Named backend groups, each a list of `udp://host[:port]` /
    /// `tcp://host[:port]` urls.
    #[serde(default)]
    pub backends: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub filters: HashMap<String, FilterDoc>,
    /// Comma-separated name lists mapped to group references.
    #[serde(default)]
    pub domains: HashMap<String, DomainDoc>,
    /// Locally served records in zone-file textual form.
    #[serde(default)]
    pub zones: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PrefilterDoc {
    /// Domain suffixes refused outright; `@path` includes one per line.
    #[serde(default)]
    pub disabled: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FilterDoc {
    /// IPv4 literals (or `@path` includes) whose presence rejects an answer.
    #[serde(default)]
    pub drop: Vec<String>,
    /// `from/to` IPv4 pairs rewritten in place.
    #[serde(default)]
    pub replace: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DomainDoc {
    #[serde(default)]
    pub backends: Vec<String>,
    #[serde(default)]
    pub filters: Vec<String>,
}

pub fn load_config(path: &Path) -> Result<ConfigDoc> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let doc: ConfigDoc = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;
    info!(
        target = "config",
        backends = doc.backends.len(),
        domains = doc.domains.len(),
        zones = doc.zones.len(),
        "config loaded"
    );
    Ok(doc)
}

/// Rewrite the config file pretty-printed in place.
pub fn format_config(path: &Path) -> Result<()> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;
    let mut pretty = serde_json::to_string_pretty(&value).context("render config")?;
    pretty.push('\n');
    fs::write(path, pretty).with_context(|| format!("write config file: {}", path.display()))
}

/// Expand a list whose `@path` elements pull one item per line from a file.
/// Lines not starting with an alphanumeric are treated as comments.
fn expand_items(items: &[String]) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for item in items {
        if let Some(path) = item.strip_prefix('@') {
            let content =
                fs::read_to_string(path).with_context(|| format!("include file: {path}"))?;
            for line in content.lines() {
                let line = line.trim();
                if line
                    .chars()
                    .next()
                    .map_or(false, |c| c.is_ascii_alphanumeric())
                {
                    out.push(line.to_string());
                }
            }
        } else if !item.is_empty() {
            out.push(item.clone());
        }
    }
    Ok(out)
}

fn parse_v4(s: &str) -> Result<u32> {
    let ip: Ipv4Addr = s
        .parse()
        .with_context(|| format!("bad ipv4 literal: {s:?}"))?;
    Ok(u32::from(ip))
}

fn build_filters(doc: &FilterDoc) -> Result<Vec<RecordFilter>> {
    let mut chain = Vec::new();
    if !doc.drop.is_empty() {
        let mut rules = FxHashSet::default();
        for item in expand_items(&doc.drop)? {
            rules.insert(parse_v4(&item)?);
        }
        chain.push(RecordFilter::DropV4(rules));
    }
    if !doc.replace.is_empty() {
        let mut rules = FxHashMap::default();
        for pair in &doc.replace {
            let (from, to) = pair
                .split_once('/')
                .with_context(|| format!("replace rule {pair:?}: expected from/to"))?;
            rules.insert(parse_v4(from.trim())?, parse_v4(to.trim())?);
        }
        chain.push(RecordFilter::ReplaceV4(rules));
    }
    Ok(chain)
}

fn parse_owner(s: &str) -> Result<Name> {
    let mut name = Name::from_str(s).with_context(|| format!("bad domain name: {s:?}"))?;
    if !name.is_fqdn() {
        name.set_fqdn(true);
    }
    Ok(name)
}

/// Parse one textual RR literal: `name [ttl] [class] type rdata`.
/// Covers the record types a local zone realistically carries.
pub fn parse_rr(s: &str) -> Result<Record> {
    let mut tokens = s.split_whitespace();
    let owner = tokens
        .next()
        .with_context(|| format!("zone record {s:?}: missing owner name"))?;
    let name = parse_owner(owner)?;

    let mut ttl = 3600u32;
    let mut tok = tokens
        .next()
        .with_context(|| format!("zone record {s:?}: missing type"))?;
    if let Ok(n) = tok.parse::<u32>() {
        ttl = n;
        tok = tokens
            .next()
            .with_context(|| format!("zone record {s:?}: missing type"))?;
    }
    if matches!(tok, "IN" | "CH" | "HS") {
        // class is accepted but ignored; everything served here is IN
        tok = tokens
            .next()
            .with_context(|| format!("zone record {s:?}: missing type"))?;
    }
    let rtype = RecordType::from_str(tok)
        .with_context(|| format!("zone record {s:?}: unknown type {tok:?}"))?;
    let rest = tokens.collect::<Vec<_>>().join(" ");
    if rest.is_empty() {
        bail!("zone record {s:?}: missing rdata");
    }

    let rdata = match rtype {
        RecordType::A => {
            let ip: Ipv4Addr = rest
                .parse()
                .with_context(|| format!("zone record {s:?}: bad A rdata"))?;
            RData::A(A(ip))
        }
        RecordType::AAAA => {
            let ip: Ipv6Addr = rest
                .parse()
                .with_context(|| format!("zone record {s:?}: bad AAAA rdata"))?;
            RData::AAAA(AAAA(ip))
        }
        RecordType::CNAME => RData::CNAME(CNAME(parse_owner(&rest)?)),
        RecordType::NS => RData::NS(NS(parse_owner(&rest)?)),
        RecordType::PTR => RData::PTR(PTR(parse_owner(&rest)?)),
        RecordType::TXT => RData::TXT(TXT::new(vec![rest.trim_matches('"').to_string()])),
        RecordType::MX => {
            let (pref, exchange) = rest
                .split_once(' ')
                .with_context(|| format!("zone record {s:?}: MX needs preference and exchange"))?;
            let pref: u16 = pref
                .parse()
                .with_context(|| format!("zone record {s:?}: bad MX preference"))?;
            RData::MX(MX::new(pref, parse_owner(exchange.trim())?))
        }
        other => bail!("zone record {s:?}: unsupported type {other}"),
    };
    Ok(Record::from_rdata(name, ttl, rdata))
}

/// Materialize the policy object: resolve group references, apply global
/// inheritance, insert refused prefixes and local zones.
pub fn compile(doc: &ConfigDoc) -> Result<Policy> {
    let mut all_backends: HashMap<String, Vec<Arc<Backend>>> = HashMap::new();
    for (label, urls) in &doc.backends {
        let mut group = Vec::new();
        for url in urls {
            group.push(Arc::new(Backend::parse(url)?));
        }
        all_backends.insert(label.clone(), group);
    }

    let mut all_filters: HashMap<String, Vec<RecordFilter>> = HashMap::new();
    for (label, fdoc) in &doc.filters {
        all_filters.insert(label.clone(), build_filters(fdoc)?);
    }

    let global = Arc::new(Entry {
        backends: all_backends.get(DEFAULT_LABEL).cloned().unwrap_or_default(),
        filters: Arc::new(all_filters.get(DEFAULT_LABEL).cloned().unwrap_or_default()),
        records: HashMap::new(),
    });

    let mut builder = PolicyBuilder::new(global.clone());
    for (names, domain) in &doc.domains {
        let mut entry = Entry::default();
        for label in &domain.backends {
            let group = all_backends
                .get(label)
                .with_context(|| format!("domain {names:?}: unknown backend group {label:?}"))?;
            entry.backends.extend(group.iter().cloned());
        }
        let mut chain = Vec::new();
        for label in &domain.filters {
            let group = all_filters
                .get(label)
                .with_context(|| format!("domain {names:?}: unknown filter group {label:?}"))?;
            chain.extend(group.iter().cloned());
        }
        // sections left out inherit the global defaults
        if entry.backends.is_empty() {
            entry.backends = global.backends.clone();
        }
        entry.filters = if chain.is_empty() {
            global.filters.clone()
        } else {
            Arc::new(chain)
        };
        builder.add_domains(names.split(',').map(str::trim), entry);
    }

    for name in expand_items(&doc.prefilters.disabled)? {
        builder.add_disabled(&name);
    }
    for line in &doc.zones {
        builder.add_zone_record(parse_rr(line.trim())?);
    }
    Ok(builder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, Query};
    use hickory_proto::rr::DNSClass;
    use serde_json::json;

    fn doc_from(value: serde_json::Value) -> ConfigDoc {
        serde_json::from_value(value).expect("parse config")
    }

    #[test]
    fn sections_default_to_empty() {
        let doc = doc_from(json!({}));
        assert!(doc.backends.is_empty());
        assert!(doc.domains.is_empty());
        assert!(doc.prefilters.disabled.is_empty());
    }

    #[test]
    fn compile_resolves_groups_and_inherits_global() {
        let doc = doc_from(json!({
            "backends": {
                "default": ["udp://203.0.113.1:53"],
                "clean": ["tcp://8.8.8.8"]
            },
            "filters": {
                "default": { "drop": ["10.0.0.1"] }
            },
            "domains": {
                "example.com,example.net": { "backends": ["clean"] },
                "filtered.org": { "filters": ["default"] }
            }
        }));
        let policy = compile(&doc).expect("compile");

        let entry = policy.find("www.example.com.");
        assert_eq!(entry.backends.len(), 1);
        assert_eq!(entry.backends[0].url, "tcp://8.8.8.8:53");
        // filters were left out, so the global chain applies
        assert_eq!(entry.filters.len(), 1);

        // backends were left out, so the global group applies
        let entry = policy.find("filtered.org.");
        assert_eq!(entry.backends[0].url, "udp://203.0.113.1:53");

        let global = policy.find("other.net.");
        assert_eq!(global.backends[0].url, "udp://203.0.113.1:53");
    }

    #[test]
    fn compile_rejects_unknown_references() {
        let doc = doc_from(json!({
            "domains": { "example.com": { "backends": ["missing"] } }
        }));
        assert!(compile(&doc).is_err());

        let doc = doc_from(json!({
            "filters": { "default": { "replace": ["1.2.3.4"] } }
        }));
        assert!(compile(&doc).is_err());
    }

    #[test]
    fn compile_wires_disabled_and_zones() {
        let doc = doc_from(json!({
            "prefilters": { "disabled": ["ads.example.net"] },
            "zones": ["router.lan 3600 IN A 192.168.1.1"]
        }));
        let policy = compile(&doc).expect("compile");
        assert!(policy.is_disabled(&policy.find("ads.example.net.")));

        let mut req = Message::new();
        req.add_query(Query::query(
            Name::from_str("router.lan.").expect("name"),
            RecordType::A,
        ));
        let entry = policy.find("router.lan.");
        let resp = entry.answer_static(&req).expect("zone answer");
        assert_eq!(resp.answers().len(), 1);
        assert_eq!(resp.answers()[0].dns_class(), DNSClass::IN);
    }

    #[test]
    fn parse_rr_accepts_optional_ttl_and_class() {
        let rr = parse_rr("router.lan 600 IN A 192.168.1.1").expect("rr");
        assert_eq!(rr.ttl(), 600);
        assert_eq!(rr.record_type(), RecordType::A);
        assert!(rr.name().is_fqdn());

        let rr = parse_rr("router.lan A 192.168.1.1").expect("rr");
        assert_eq!(rr.ttl(), 3600);

        let rr = parse_rr("mail.lan MX 10 smtp.lan").expect("rr");
        assert_eq!(rr.record_type(), RecordType::MX);

        let rr = parse_rr("host.lan 60 TXT \"hello world\"").expect("rr");
        assert_eq!(rr.record_type(), RecordType::TXT);

        assert!(parse_rr("broken.lan A").is_err());
        assert!(parse_rr("broken.lan 60 SOA whatever").is_err());
    }

    #[test]
    fn expand_items_reads_include_files() {
        let path = std::env::temp_dir().join("dnspanic-test-include.list");
        fs::write(&path, "# comment\n10.0.0.1\n\n10.0.0.2\n").expect("write include");
        let items = vec![format!("@{}", path.display()), "10.0.0.3".to_string()];
        let out = expand_items(&items).expect("expand");
        fs::remove_file(&path).ok();
        assert_eq!(out, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

        assert!(expand_items(&["@/nonexistent/include.list".to_string()]).is_err());
    }

    #[test]
    fn format_config_pretty_prints_in_place() {
        let path = std::env::temp_dir().join("dnspanic-test-format.conf");
        fs::write(&path, "{\"backends\":{\"default\":[\"udp://1.1.1.1\"]}}").expect("write");
        format_config(&path).expect("format");
        let formatted = fs::read_to_string(&path).expect("read back");
        fs::remove_file(&path).ok();
        assert!(formatted.contains("\n"));
        let parsed: serde_json::Value = serde_json::from_str(&formatted).expect("still json");
        assert_eq!(parsed["backends"]["default"][0], "udp://1.1.1.1");
    }
}
