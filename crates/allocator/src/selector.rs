use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::entry::VolumeEntry;
use crate::mode::ModeState;

/// Outcome of a successful [`Selector::select_vid`] call.
pub struct Selection {
    pub entry: Arc<VolumeEntry>,
    pub retired: bool,
}

/// Round-robin picker over a mode's volume set. Holds one cursor shared
/// by every caller for the lifetime of the owning allocator, giving the
/// process-wide fairness the round-robin is meant to provide rather than
/// restarting from zero on every call.
pub struct Selector {
    cursor: AtomicUsize,
}

impl Selector {
    /// Seeds the cursor from a random start so that two allocators (or
    /// two restarts of the same process) don't both begin their round
    /// robin at volume zero and briefly pile onto the same vid.
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(rand::random::<u16>() as usize),
        }
    }

    /// Retire every vid in `discards` up front: if still present and not
    /// already deleted, its remaining `free` is subtracted from the
    /// mode's advisory counter, it is marked deleted, and removed from
    /// the volume set. Repeating a discard for the same vid is a no-op —
    /// `mark_deleted` is idempotent and `VolumeSet::delete` on a missing
    /// vid simply returns `None`.
    fn apply_discards(mode: &ModeState, discards: &HashSet<u64>) {
        for vid in discards {
            if let Some(entry) = mode.volumes.get(*vid) {
                if entry.mark_deleted() {
                    mode.volumes.delete(*vid);
                    mode.sub_free(entry.free());
                }
            }
        }
    }

    /// Discard every vid in `discards`, then walk the mode's volume list
    /// starting from the shared cursor, skipping deleted entries,
    /// entries in `exclude`, and entries that can't hold `size` bytes,
    /// debiting the first one that can.
    ///
    /// A volume discarded because it is deleted, excluded, or too small
    /// is never counted against `total_free` here — that counter only
    /// moves when a debit actually happens (normal case) or when a
    /// volume retires out from under us (the `total_free -= remaining`
    /// case below). A volume found already expired past its lease is
    /// treated the same as deleted: skipped, no accounting change,
    /// since the Retainer owns reclaiming expired leases.
    pub fn select_vid(
        &self,
        mode: &ModeState,
        size: u64,
        reserve_size: u64,
        exclude: &HashSet<u64>,
        discards: &HashSet<u64>,
    ) -> Option<Selection> {
        Self::apply_discards(mode, discards);

        let snapshot = mode.volumes.list();
        if snapshot.is_empty() {
            return None;
        }

        let len = snapshot.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;

        for offset in 0..len {
            let idx = (start + offset) % len;
            let entry = &snapshot[idx];

            if entry.is_deleted() || exclude.contains(&entry.vid) {
                continue;
            }

            match entry.try_debit(size, reserve_size) {
                Some(outcome) => {
                    if outcome.retired {
                        mode.volumes.delete(entry.vid);
                        mode.sub_free(outcome.remaining_free);
                    }
                    return Some(Selection {
                        entry: entry.clone(),
                        retired: outcome.retired,
                    });
                }
                None => continue,
            }
        }

        None
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::CodeMode;
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    fn mode_with(free_sizes: &[u64]) -> ModeState {
        let (tx, _rx) = mpsc::channel(1);
        let mode = ModeState::new(CodeMode::new("EC6P6"), 10, 1, tx);
        for (i, &free) in free_sizes.iter().enumerate() {
            let vid = i as u64 + 1;
            let entry = Arc::new(VolumeEntry::new(
                vid,
                CodeMode::new("EC6P6"),
                free,
                100,
                Instant::now() + Duration::from_secs(3600),
            ));
            mode.add_free(free);
            mode.volumes.put(entry);
        }
        mode
    }

    #[test]
    fn selects_across_all_volumes_round_robin() {
        let selector = Selector::new();
        let mode = mode_with(&[100, 100, 100]);

        let mut picked = HashSet::new();
        for _ in 0..3 {
            let sel = selector
                .select_vid(&mode, 1, 0, &HashSet::new(), &HashSet::new())
                .unwrap();
            picked.insert(sel.entry.vid);
        }
        assert_eq!(picked.len(), 3, "round robin should visit every volume");
    }

    #[test]
    fn skips_excluded_and_deleted_entries() {
        let selector = Selector::new();
        let mode = mode_with(&[100, 100]);
        mode.volumes.get(1).unwrap().mark_deleted();

        let sel = selector
            .select_vid(&mode, 1, 0, &HashSet::new(), &HashSet::new())
            .unwrap();
        assert_eq!(sel.entry.vid, 2);
    }

    #[test]
    fn retirement_on_selection_removes_entry_and_adjusts_total_free() {
        let selector = Selector::new();
        let mode = mode_with(&[15]);

        let sel = selector
            .select_vid(&mode, 10, 10, &HashSet::new(), &HashSet::new())
            .unwrap();
        assert!(sel.retired);
        assert!(mode.volumes.get(1).is_none());
        // The Selector only subtracts the volume's leftover free space on
        // retirement; the caller (the facade) still owes `total_free` the
        // `size` debit itself.
        assert_eq!(mode.total_free(), 10);
    }

    #[test]
    fn returns_none_when_every_candidate_is_excluded() {
        let selector = Selector::new();
        let mode = mode_with(&[100, 100]);
        let mut exclude = HashSet::new();
        exclude.insert(1);
        exclude.insert(2);

        assert!(selector
            .select_vid(&mode, 1, 0, &exclude, &HashSet::new())
            .is_none());
    }

    #[test]
    fn returns_none_when_no_volume_has_enough_space() {
        let selector = Selector::new();
        let mode = mode_with(&[5, 5]);
        assert!(selector
            .select_vid(&mode, 10, 0, &HashSet::new(), &HashSet::new())
            .is_none());
    }

    #[test]
    fn discards_remove_volumes_before_selection_and_adjust_total_free() {
        let selector = Selector::new();
        let mode = mode_with(&[100, 100, 100]);
        let mut discards = HashSet::new();
        discards.insert(2);

        let sel = selector
            .select_vid(&mode, 5, 0, &HashSet::new(), &discards)
            .unwrap();
        assert_ne!(sel.entry.vid, 2);
        assert!(mode.volumes.get(2).is_none());
        // 300 starting, minus the 100 discarded, minus the 5 just debited.
        assert_eq!(mode.total_free(), 195);
    }

    #[test]
    fn vid_in_both_excludes_and_discards_is_never_selected() {
        let selector = Selector::new();
        let mode = mode_with(&[100, 100]);
        let mut both = HashSet::new();
        both.insert(1);

        let sel = selector.select_vid(&mode, 1, 0, &both, &both).unwrap();
        assert_eq!(sel.entry.vid, 2);
        assert!(mode.volumes.get(1).is_none());
    }

    #[test]
    fn repeated_discard_of_same_vid_is_idempotent() {
        let selector = Selector::new();
        let mode = mode_with(&[100, 100]);
        let mut discards = HashSet::new();
        discards.insert(1);

        Selector::apply_discards(&mode, &discards);
        assert_eq!(mode.total_free(), 100);
        Selector::apply_discards(&mode, &discards);
        assert_eq!(mode.total_free(), 100);

        let sel = selector
            .select_vid(&mode, 1, 0, &HashSet::new(), &discards)
            .unwrap();
        assert_eq!(sel.entry.vid, 2);
    }
}
