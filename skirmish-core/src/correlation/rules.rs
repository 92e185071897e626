//! Linkage rules and stage tagging.
//!
//! Everything in this module is a pure function of its inputs. Correlation
//! must be reproducible for replay and testing, so no rule reads the clock
//! or any state outside the events it is handed.

use std::collections::{BTreeMap, HashSet};

use skirmish_model::{AttackStage, CorrelatedEvent, EventPayload, SourceKind};

use crate::error::{CoreError, Result};

/// Typed view extracted from a raw event payload.
///
/// Collectors ship pre-parsed JSON objects; this is the subset of shapes
/// the linkage rules understand. Payloads with an unrecognized `type`
/// still correlate (as singletons), but a recognized `type` with missing
/// or mistyped fields is malformed and rejected at ingestion.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Connection {
        proto: String,
        src_ip: String,
        src_port: u16,
        dst_ip: String,
        dst_port: u16,
    },
    DnsQuery {
        query: String,
        resolved: Vec<String>,
    },
    ProcessCreate {
        host: String,
        image: String,
        pid: u32,
    },
    FileWrite {
        host: String,
        path: String,
        size: u64,
    },
    Upload {
        src_ip: String,
        dst_ip: String,
        dst_port: u16,
        bytes: u64,
    },
    Other,
}

fn str_field(payload: &EventPayload, key: &str) -> Result<String> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| CoreError::InvalidPayload(format!("missing string field `{key}`")))
}

fn u64_field(payload: &EventPayload, key: &str) -> Result<u64> {
    payload
        .get(key)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| CoreError::InvalidPayload(format!("missing numeric field `{key}`")))
}

fn port_field(payload: &EventPayload, key: &str) -> Result<u16> {
    let raw = u64_field(payload, key)?;
    u16::try_from(raw)
        .map_err(|_| CoreError::InvalidPayload(format!("`{key}` out of port range: {raw}")))
}

impl Observation {
    /// Parse a payload into a typed view. `origin` is the collector's VM
    /// or agent identity, used as the host for host-sourced events.
    pub fn parse(source: SourceKind, origin: &str, payload: &EventPayload) -> Result<Self> {
        let kind = payload.get("type").and_then(|v| v.as_str()).ok_or_else(|| {
            CoreError::InvalidPayload("payload has no `type` field".into())
        })?;

        let obs = match (source, kind) {
            (SourceKind::Network, "connection") => Observation::Connection {
                proto: str_field(payload, "proto")?,
                src_ip: str_field(payload, "src_ip")?,
                src_port: port_field(payload, "src_port")?,
                dst_ip: str_field(payload, "dst_ip")?,
                dst_port: port_field(payload, "dst_port")?,
            },
            (SourceKind::Network, "dns_query") => {
                let resolved = payload
                    .get("resolved")
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| {
                        CoreError::InvalidPayload("missing array field `resolved`".into())
                    })?
                    .iter()
                    .map(|v| {
                        v.as_str().map(str::to_string).ok_or_else(|| {
                            CoreError::InvalidPayload(
                                "`resolved` entries must be strings".into(),
                            )
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Observation::DnsQuery {
                    query: str_field(payload, "query")?,
                    resolved,
                }
            }
            (SourceKind::Network, "upload") => Observation::Upload {
                src_ip: str_field(payload, "src_ip")?,
                dst_ip: str_field(payload, "dst_ip")?,
                dst_port: port_field(payload, "dst_port")?,
                bytes: u64_field(payload, "bytes")?,
            },
            (SourceKind::Host, "process_create") => Observation::ProcessCreate {
                host: origin.to_string(),
                image: str_field(payload, "image")?,
                pid: u64_field(payload, "pid")? as u32,
            },
            (SourceKind::Host, "file_write") => Observation::FileWrite {
                host: origin.to_string(),
                path: str_field(payload, "path")?,
                size: u64_field(payload, "size")?,
            },
            _ => Observation::Other,
        };
        Ok(obs)
    }

    /// Evidence attributes surfaced to detection rules, flattened to
    /// strings so scoring stays deterministic.
    pub fn attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        match self {
            Observation::Connection {
                proto,
                src_ip,
                src_port,
                dst_ip,
                dst_port,
            } => {
                attrs.insert("proto".into(), proto.clone());
                attrs.insert("src_ip".into(), src_ip.clone());
                attrs.insert("src_port".into(), src_port.to_string());
                attrs.insert("dst_ip".into(), dst_ip.clone());
                attrs.insert("dst_port".into(), dst_port.to_string());
            }
            Observation::DnsQuery { query, resolved } => {
                attrs.insert("query".into(), query.clone());
                attrs.insert("resolved".into(), resolved.join(","));
            }
            Observation::ProcessCreate { host, image, pid } => {
                attrs.insert("host".into(), host.clone());
                attrs.insert("image".into(), image.clone());
                attrs.insert("pid".into(), pid.to_string());
            }
            Observation::FileWrite { host, path, size } => {
                attrs.insert("host".into(), host.clone());
                attrs.insert("path".into(), path.clone());
                attrs.insert("size".into(), size.to_string());
            }
            Observation::Upload {
                src_ip,
                dst_ip,
                dst_port,
                bytes,
            } => {
                attrs.insert("src_ip".into(), src_ip.clone());
                attrs.insert("dst_ip".into(), dst_ip.clone());
                attrs.insert("dst_port".into(), dst_port.to_string());
                attrs.insert("bytes".into(), bytes.to_string());
            }
            Observation::Other => {}
        }
        attrs
    }
}

/// Which linkage rule matched a cause/effect pair. Priority order is the
/// declaration order; the first matching rule wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRule {
    /// Host process creation followed by a connection from the same host.
    ProcessToConnection,
    /// DNS query followed by a connection to a resolved address.
    QueryToConnection,
    /// File write followed by a network upload of matching size.
    WriteToUpload,
}

/// Ports associated with remote-execution / lateral-movement tooling.
const LATERAL_PORTS: [u16; 6] = [135, 139, 445, 3389, 5985, 5986];

fn is_lateral_image(image: &str) -> bool {
    let image = image.to_ascii_lowercase();
    ["psexec", "wmic", "winrs", "schtasks", "smbexec"]
        .iter()
        .any(|needle| image.contains(needle))
}

/// Does `cause` (earlier) link to `effect` (later) under `rule`?
/// Time-window eligibility is checked by the engine; this is the pure
/// structural match.
pub fn link_matches(
    rule: LinkRule,
    cause: &Observation,
    effect: &Observation,
    size_tolerance: f64,
) -> bool {
    match (rule, cause, effect) {
        (
            LinkRule::ProcessToConnection,
            Observation::ProcessCreate { host, .. },
            Observation::Connection { src_ip, .. },
        ) => host == src_ip,
        (
            LinkRule::QueryToConnection,
            Observation::DnsQuery { resolved, .. },
            Observation::Connection { dst_ip, .. },
        ) => resolved.iter().any(|addr| addr == dst_ip),
        (
            LinkRule::WriteToUpload,
            Observation::FileWrite { size, .. },
            Observation::Upload { bytes, .. },
        ) => {
            let tolerance = (*size as f64 * size_tolerance).max(1.0);
            (*bytes as f64 - *size as f64).abs() <= tolerance
        }
        _ => false,
    }
}

/// Stage assigned to an event given the rule that linked it (if any) and
/// its own payload. Deterministic; this is the whole tagging taxonomy.
pub fn tag_stage(obs: &Observation, matched: Option<(LinkRule, &Observation)>) -> AttackStage {
    match (obs, matched) {
        // Connection explained by a process on the source host: lateral
        // movement when it smells like remote-execution tooling.
        (
            Observation::Connection { dst_port, .. },
            Some((LinkRule::ProcessToConnection, cause)),
        ) => {
            let lateral_image = matches!(
                cause,
                Observation::ProcessCreate { image, .. } if is_lateral_image(image)
            );
            if LATERAL_PORTS.contains(dst_port) || lateral_image {
                AttackStage::LateralMovement
            } else {
                AttackStage::Execution
            }
        }
        // Connection explained by a prior DNS resolution: first contact.
        (Observation::Connection { .. }, Some((LinkRule::QueryToConnection, _))) => {
            AttackStage::InitialAccess
        }
        (Observation::Upload { .. }, Some((LinkRule::WriteToUpload, _))) => {
            AttackStage::Exfiltration
        }
        (Observation::DnsQuery { .. }, _) => AttackStage::Reconnaissance,
        (Observation::ProcessCreate { .. }, _) => AttackStage::Execution,
        _ => AttackStage::Unknown,
    }
}

/// Validate the no-cycle invariant: sequences strictly increasing and
/// unique, every `causes` entry pointing at a strictly smaller sequence.
pub fn validate_dag(events: &[CorrelatedEvent]) -> Result<()> {
    let mut seen = HashSet::new();
    let mut last = None;
    for event in events {
        if !seen.insert(event.sequence) {
            return Err(CoreError::CorruptTimeline(format!(
                "duplicate sequence {}",
                event.sequence
            )));
        }
        if let Some(prev) = last {
            if event.sequence <= prev {
                return Err(CoreError::CorruptTimeline(format!(
                    "sequence {} not increasing after {prev}",
                    event.sequence
                )));
            }
        }
        last = Some(event.sequence);
    }

    let sequence_of: std::collections::HashMap<_, _> =
        events.iter().map(|e| (e.id, e.sequence)).collect();
    for event in events {
        for cause in &event.causes {
            match sequence_of.get(cause) {
                Some(&seq) if seq < event.sequence => {}
                Some(&seq) => {
                    return Err(CoreError::CorruptTimeline(format!(
                        "cause sequence {seq} not below effect sequence {}",
                        event.sequence
                    )));
                }
                None => {
                    return Err(CoreError::CorruptTimeline(format!(
                        "cause {cause} not in timeline"
                    )));
                }
            }
        }
    }
    Ok(())
}
