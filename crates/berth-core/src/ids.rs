//! Id generation for instances and hosts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique id of the form `{prefix}-{16 hex chars}`.
///
/// The digest covers the caller-supplied seed, the wall clock in
/// nanoseconds, the process id and a process-wide counter, so two calls
/// in the same nanosecond still differ.
pub fn generate_id(prefix: &str, seed: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(seq.to_le_bytes());
    let digest = hasher.finalize();

    format!("{prefix}-{}", hex::encode(&digest[..8]))
}

/// Backend resource name for an instance: `{name_prefix}{id suffix}`.
///
/// Deterministic per instance id, so a retried provision finds the
/// resource a previous attempt created.
pub fn instance_name(name_prefix: &str, instance_id: &str) -> String {
    let suffix = instance_id
        .rsplit_once('-')
        .map(|(_, s)| s)
        .unwrap_or(instance_id);
    format!("{name_prefix}{suffix}")
}
