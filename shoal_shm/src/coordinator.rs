//! Coordinator: the segment's metadata page plus the participant table,
//! liveness heartbeat, and reaper.
//!
//! One coordinator exists per segment, held by whichever process created
//! it (`init`) or attached to it (`connect`). The participant table and
//! reaper logic here are adapted from the teacher's segment-cleanup
//! pattern: a tracked-process map, an `is_process_alive` check, and a
//! grace period before a dead entry's resources are released.

use crate::error::{ShmError, ShmResult};
use crate::platform::is_process_alive;
use shoal_common::consts::DEFAULT_MAX_PARTICIPANTS;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

bitflags::bitflags! {
    /// Per-participant flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ParticipantFlags: u32 {
        /// Slot is occupied.
        const ACTIVE = 0b0000_0001;
        /// Reaper has marked this participant dead; its holds release.
        const DEAD = 0b0000_0010;
    }
}

/// One entry in the fixed-capacity participant table.
#[repr(C, align(64))]
pub struct ParticipantEntry {
    pid: AtomicU32,
    flags: AtomicU32,
    /// Bumped on every transaction commit; the liveness heartbeat.
    epoch: AtomicU64,
    /// Handle of this participant's process-shared event, used for
    /// diagnostic wakeups.
    event_handle: AtomicU64,
}

impl ParticipantEntry {
    fn is_slot_active(&self) -> bool {
        ParticipantFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
            .contains(ParticipantFlags::ACTIVE)
    }

    fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    /// Current heartbeat epoch for this participant.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Bump the heartbeat epoch. Called by the owning process on every
    /// transaction commit.
    pub fn heartbeat(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Publish this participant's last-observed value of the segment's
    /// global allocation epoch, so the reclamation sweeper's
    /// minimum-across-participants comparison lives in the same epoch
    /// space as the retirement stamps it's compared against.
    pub fn publish_epoch(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::Release);
    }

    /// Whether the reaper has marked this participant dead. A dead
    /// participant's epoch is treated as infinity by the reclamation
    /// minimum-epoch computation, so its holds no longer block a sweep.
    pub fn is_dead(&self) -> bool {
        ParticipantFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
            .contains(ParticipantFlags::DEAD)
    }

    fn mark_dead(&self) {
        let mut flags = ParticipantFlags::from_bits_truncate(self.flags.load(Ordering::Acquire));
        flags.insert(ParticipantFlags::DEAD);
        self.flags.store(flags.bits(), Ordering::Release);
    }
}

/// The fixed-capacity participant table, placed after the metadata page.
#[repr(C)]
pub struct ParticipantTable {
    capacity: u32,
    _pad: u32,
    entries: [ParticipantEntry; DEFAULT_MAX_PARTICIPANTS],
}

impl ParticipantTable {
    /// Size in bytes of a table with the workspace-default capacity, for
    /// segment layout computations.
    pub const SIZE: usize = std::mem::size_of::<ParticipantTable>();

    /// Initialize an empty table in place.
    pub fn init(&mut self) {
        self.capacity = DEFAULT_MAX_PARTICIPANTS as u32;
        for entry in &self.entries {
            entry.pid.store(0, Ordering::Relaxed);
            entry.flags.store(0, Ordering::Relaxed);
            entry.epoch.store(0, Ordering::Relaxed);
            entry.event_handle.store(0, Ordering::Relaxed);
        }
    }

    /// Register the calling process as a participant. Fails with
    /// `OutOfResources` if the table is full.
    pub fn register(&self, pid: u32) -> ShmResult<usize> {
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry
                .flags
                .compare_exchange(
                    0,
                    ParticipantFlags::ACTIVE.bits(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                entry.pid.store(pid, Ordering::Release);
                entry.epoch.store(0, Ordering::Release);
                return Ok(idx);
            }
        }
        Err(ShmError::OutOfResources)
    }

    /// Remove the table entry at `idx` on clean detach.
    pub fn unregister(&self, idx: usize) {
        if let Some(entry) = self.entries.get(idx) {
            entry.flags.store(0, Ordering::Release);
            entry.pid.store(0, Ordering::Release);
        }
    }

    /// Number of currently active (non-reaped) participants.
    pub fn participant_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.is_slot_active() && !e.is_dead())
            .count()
    }

    /// Access an entry by table index.
    pub fn entry(&self, idx: usize) -> Option<&ParticipantEntry> {
        self.entries.get(idx).filter(|e| e.is_slot_active())
    }

    /// The minimum heartbeat epoch across all live (non-dead) active
    /// participants, used by the reclamation sweeper. Dead participants
    /// are excluded (treated as epoch infinity), as the spec requires.
    pub fn min_live_epoch(&self) -> Option<u64> {
        self.entries
            .iter()
            .filter(|e| e.is_slot_active() && !e.is_dead())
            .map(|e| e.epoch())
            .min()
    }

    /// Sweep the table for participants whose process has exited, marking
    /// them dead. Returns the number newly marked.
    pub fn reap_dead(&self) -> usize {
        let mut reaped = 0;
        for entry in &self.entries {
            if entry.is_slot_active() && !entry.is_dead() && !is_process_alive(entry.pid()) {
                entry.mark_dead();
                reaped += 1;
            }
        }
        reaped
    }
}

/// Runs the reaper sweep on a fixed interval, bounded by a grace period
/// so a momentarily-unscheduled live process isn't mistaken for dead.
///
/// This is a simple blocking loop intended to run on a dedicated thread
/// in the creator process (see `shoal_coordinatord`); it is not itself
/// async.
pub struct Reaper {
    grace_period: Duration,
}

impl Reaper {
    /// Construct a reaper with the given grace period.
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    /// Run one sweep pass immediately, returning the number of
    /// participants newly marked dead.
    pub fn sweep_once(&self, table: &ParticipantTable) -> usize {
        table.reap_dead()
    }

    /// Block for the grace interval, then run a sweep. Callers loop this
    /// on a dedicated thread.
    pub fn sweep_after_grace(&self, table: &ParticipantTable) -> usize {
        let start = Instant::now();
        while start.elapsed() < self.grace_period {
            std::thread::sleep(Duration::from_millis(50).min(self.grace_period));
        }
        self.sweep_once(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister_round_trips() {
        let mut table = Box::new(unsafe { std::mem::zeroed::<ParticipantTable>() });
        table.init();
        assert_eq!(table.participant_count(), 0);
        let idx = table.register(1234).unwrap();
        assert_eq!(table.participant_count(), 1);
        table.unregister(idx);
        assert_eq!(table.participant_count(), 0);
    }

    #[test]
    fn heartbeat_bumps_epoch() {
        let mut table = Box::new(unsafe { std::mem::zeroed::<ParticipantTable>() });
        table.init();
        let idx = table.register(std::process::id()).unwrap();
        let entry = table.entry(idx).unwrap();
        assert_eq!(entry.epoch(), 0);
        entry.heartbeat();
        assert_eq!(entry.epoch(), 1);
    }

    #[test]
    fn reap_marks_dead_process_entries() {
        let mut table = Box::new(unsafe { std::mem::zeroed::<ParticipantTable>() });
        table.init();
        // A pid essentially guaranteed not to exist.
        let idx = table.register(0x7FFF_FFFE).unwrap();
        let reaped = table.reap_dead();
        assert_eq!(reaped, 1);
        assert!(table.entry(idx).unwrap().is_dead());
        assert_eq!(table.min_live_epoch(), None);
    }

    #[test]
    fn min_live_epoch_excludes_dead_participants() {
        let mut table = Box::new(unsafe { std::mem::zeroed::<ParticipantTable>() });
        table.init();
        let live_idx = table.register(std::process::id()).unwrap();
        table.entry(live_idx).unwrap().heartbeat();
        table.entry(live_idx).unwrap().heartbeat();
        let dead_idx = table.register(0x7FFF_FFFE).unwrap();
        table.entry(dead_idx).unwrap().heartbeat();
        table.reap_dead();
        assert_eq!(table.min_live_epoch(), Some(2));
    }
}
