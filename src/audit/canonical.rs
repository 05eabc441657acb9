//! Canonical byte form for audit chain hashing.
//!
//! Every scalar field plus the sorted metadata pairs, each written as
//! `name=value` on its own line, with the previous event's hash as the final
//! line. Field order is fixed; optional fields serialise as an empty value so
//! presence and absence hash differently from an empty string only through
//! the adjacent fields. Any change to this layout invalidates existing
//! chains, so it is append-only by convention.

use chrono::SecondsFormat;

use super::AuditEvent;
use crate::hashing::HashFunction;

/// Render the canonical byte form of `event` chained to `previous_hash`.
pub fn canonical_bytes(event: &AuditEvent, previous_hash: &str) -> Vec<u8> {
    let mut out = String::new();
    push_field(&mut out, "event_id", &event.event_id);
    push_field(&mut out, "event_type", event.event_type.as_str());
    push_field(&mut out, "action", &event.action);
    push_field(&mut out, "outcome", event.outcome.as_str());
    push_field(
        &mut out,
        "timestamp",
        &event
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Micros, true),
    );
    push_field(&mut out, "actor_id", &event.actor_id);
    push_opt(&mut out, "actor_type", event.actor_type.as_deref());
    push_opt(&mut out, "resource_id", event.resource_id.as_deref());
    push_opt(&mut out, "resource_type", event.resource_type.as_deref());
    push_opt(
        &mut out,
        "resource_classification",
        event.resource_classification.map(|c| c.as_str()),
    );
    push_opt(&mut out, "tenant_id", event.tenant_id.as_deref());
    push_opt(&mut out, "correlation_id", event.correlation_id.as_deref());
    push_opt(&mut out, "session_id", event.session_id.as_deref());
    push_opt(&mut out, "ip_address", event.ip_address.as_deref());
    push_opt(&mut out, "user_agent", event.user_agent.as_deref());
    push_opt(&mut out, "reason", event.reason.as_deref());
    push_field(&mut out, "sequence_number", &event.sequence_number.to_string());

    let mut metadata: Vec<(&String, &String)> = event.metadata.iter().collect();
    metadata.sort();
    for (key, value) in metadata {
        push_field(&mut out, &format!("metadata.{key}"), value);
    }

    push_field(&mut out, "previous_event_hash", previous_hash);
    out.into_bytes()
}

/// Compute the chained hash for `event`.
pub fn compute_event_hash(
    hash: &dyn HashFunction,
    event: &AuditEvent,
    previous_hash: &str,
) -> String {
    hash.digest_hex(&canonical_bytes(event, previous_hash))
}

fn push_field(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push('=');
    out.push_str(value);
    out.push('\n');
}

fn push_opt(out: &mut String, name: &str, value: Option<&str>) {
    push_field(out, name, value.unwrap_or(""));
}
