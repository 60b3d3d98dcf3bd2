//! Rebuilds a session core from its store: newest checkpoint first, then every
//! WAL record after it in ascending order through the live apply path.

use crate::persistence::store::StoreError;
use crate::session::state::SessionCore;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RecoveryReport {
    pub checkpoint_wal_seq: Option<u64>,
    pub replayed: usize,
    pub last_wal_seq: u64,
    pub last_event_seq: u64,
    /// Virtual time reached by the recovered state; `None` for an empty store.
    pub clock_ns: Option<i64>,
}

/// `seed` is the session's base RNG seed; the matching RNG is reseeded with
/// it mixed with the recovered WAL position so post-restore draws do not
/// repeat the ones already logged.
pub fn recover(core: &mut SessionCore, seed: u64) -> Result<RecoveryReport, StoreError> {
    let store = core.store().clone();
    let mut report = RecoveryReport::default();

    if let Some(checkpoint) = store.load_latest_checkpoint()? {
        report.checkpoint_wal_seq = Some(checkpoint.last_wal_seq);
        report.last_wal_seq = checkpoint.last_wal_seq;
        report.last_event_seq = checkpoint.last_event_seq;
        report.clock_ns = Some(checkpoint.clock_ns);
        core.restore_checkpoint(checkpoint);
    }

    let records = store.entries_after(report.last_wal_seq)?;
    for record in &records {
        let expected = report.last_wal_seq + 1;
        if record.seq != expected {
            return Err(StoreError::Integrity(format!(
                "WAL gap: expected seq {}, found {}",
                expected, record.seq
            )));
        }
        core.apply_entry(record)?;
        report.last_wal_seq = record.seq;
        report.last_event_seq = report.last_event_seq.max(record.trigger_seq);
        report.clock_ns = Some(report.clock_ns.map_or(record.ts_ns, |c| c.max(record.ts_ns)));
        report.replayed += 1;
    }

    core.finish_replay(report.last_wal_seq, report.last_event_seq, seed ^ report.last_wal_seq);
    info!(
        checkpoint = ?report.checkpoint_wal_seq,
        replayed = report.replayed,
        wal_seq = report.last_wal_seq,
        "♻️ Session state recovered"
    );
    Ok(report)
}
