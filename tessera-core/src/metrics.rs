/*
    metrics.rs - Replication and connection metrics

    Counters and gauges for:
    - Inbound traffic (received, dropped by reason)
    - Peer admission and eviction
    - Oplog merge outcomes and sync rounds
    - Identify / join outcomes

    No exporter is installed here; the embedding process picks one.
*/

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    describe_counter!(
        "tessera_messages_received_total",
        "Envelopes read from peer transports"
    );
    describe_counter!(
        "tessera_messages_dropped_total",
        "Envelopes dropped before dispatch, labeled by reason (oversize, decode, checksum, hash_mismatch, not_for_me, handler)"
    );
    describe_counter!(
        "tessera_peers_admitted_total",
        "Peers admitted into a tier, labeled by tier"
    );
    describe_counter!(
        "tessera_peers_evicted_total",
        "Peers evicted to respect the global capacity, labeled by tier"
    );
    describe_counter!(
        "tessera_oplogs_merged_total",
        "Incoming oplogs by merge outcome (applied, conflict, failed, duplicate)"
    );
    describe_counter!(
        "tessera_sync_rounds_total",
        "Sync rounds started, labeled by kind (merkle, pending, force)"
    );
    describe_counter!(
        "tessera_handshakes_total",
        "Identify and join handshakes by outcome"
    );
    describe_gauge!("tessera_active_peers", "Currently registered peers");
}

pub fn message_received() {
    counter!("tessera_messages_received_total").increment(1);
}

pub fn message_dropped(reason: &'static str) {
    counter!("tessera_messages_dropped_total", "reason" => reason).increment(1);
}

pub fn peer_admitted(tier: &'static str) {
    counter!("tessera_peers_admitted_total", "tier" => tier).increment(1);
}

pub fn peer_evicted(tier: &'static str) {
    counter!("tessera_peers_evicted_total", "tier" => tier).increment(1);
}

pub fn oplogs_merged(outcome: &'static str, count: usize) {
    counter!("tessera_oplogs_merged_total", "outcome" => outcome).increment(count as u64);
}

pub fn sync_round(kind: &'static str) {
    counter!("tessera_sync_rounds_total", "kind" => kind).increment(1);
}

pub fn handshake(kind: &'static str, outcome: &'static str) {
    counter!("tessera_handshakes_total", "kind" => kind, "outcome" => outcome).increment(1);
}

pub fn set_active_peers(count: usize) {
    gauge!("tessera_active_peers").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_recorder() {
        // No recorder installed: every call must be a cheap no-op.
        init_metrics();
        message_received();
        message_dropped("oversize");
        peer_admitted("random");
        peer_evicted("random");
        oplogs_merged("applied", 3);
        sync_round("merkle");
        handshake("identify", "ok");
        set_active_peers(4);
    }
}
