/// Loop device slot discovery and binding
use crate::config::types::{Result, StressError};
use crate::kernel::control::{ControlError, DeviceControl};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};

/// Device node for a loop slot
pub fn loop_device_path(slot: u32) -> PathBuf {
    PathBuf::from(format!("/dev/loop{}", slot))
}

/// Extract the slot number from `/dev/loopN` or `loopN`
pub fn parse_loop_slot(device: &str) -> Option<u32> {
    let name = device.rsplit('/').next()?;
    name.strip_prefix("loop")?.parse().ok()
}

/// A slot is bound when sysfs exposes a backing file for it
pub fn slot_bound_in_sysfs(slot: u32) -> bool {
    Path::new(&format!("/sys/block/loop{}/loop/backing_file", slot)).exists()
}

/// Candidate order: the system hint first, then every slot in `0..max_slots`.
///
/// The hint is only a candidate. Every slot, hint included, is checked against
/// the slot namespace before it is used, so a stale hint loses to the first
/// slot that verifies as free.
fn candidate_slots(hint: Option<u32>, max_slots: u32) -> Vec<u32> {
    let mut slots = Vec::with_capacity(max_slots as usize + 1);
    if let Some(hint) = hint {
        slots.push(hint);
    }
    slots.extend((0..max_slots).filter(|slot| Some(*slot) != hint));
    slots
}

/// Bind `backing` to the first verified-free loop slot.
///
/// A permission failure is retried once after [`DeviceControl::escalate`];
/// a second permission failure is fatal for the binding.
pub fn bind_free_slot(
    control: &dyn DeviceControl,
    backing: &Path,
    max_slots: u32,
) -> Result<PathBuf> {
    let hint = match control.next_free_loop() {
        Ok(hint) => hint,
        Err(ControlError::PermissionDenied(msg)) => {
            debug!("next-free loop query denied ({}); scanning only", msg);
            None
        }
        Err(e) => {
            debug!("next-free loop query failed ({}); scanning only", e);
            None
        }
    };

    let mut escalated = false;
    let mut scanned = 0u32;

    for slot in candidate_slots(hint, max_slots) {
        scanned += 1;
        if control.loop_slot_bound(slot) {
            if Some(slot) == hint {
                debug!("stale next-free hint: loop{} is already bound", slot);
            }
            continue;
        }

        let mut attempt = control.attach_loop(slot, backing);
        if let Err(ControlError::PermissionDenied(ref msg)) = attempt {
            if escalated {
                return Err(StressError::Permission(msg.clone()));
            }
            escalated = true;
            if !control.escalate() {
                return Err(StressError::Permission(msg.clone()));
            }
            attempt = control.attach_loop(slot, backing);
        }

        match attempt {
            Ok(()) => {
                let device = loop_device_path(slot);
                info!("Bound {} to {}", backing.display(), device.display());
                return Ok(device);
            }
            Err(ControlError::PermissionDenied(msg)) => {
                return Err(StressError::Permission(msg));
            }
            Err(ControlError::Busy(msg)) => {
                debug!("loop{} taken concurrently: {}", slot, msg);
            }
            Err(ControlError::NotFound(msg)) => {
                debug!("loop{} has no device node: {}", slot, msg);
            }
            Err(ControlError::Failed(msg)) => {
                warn!("loop{} attach failed: {}", slot, msg);
            }
        }
    }

    Err(StressError::NoFreeSlot { scanned })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::control::ControlResult;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    /// Loop-only fake; mapping/mount calls are never reached here.
    struct LoopFake {
        hint: Option<u32>,
        bound: Mutex<BTreeSet<u32>>,
        /// Slots that report busy on attach (lost a race)
        racy: BTreeSet<u32>,
        deny_until_escalated: bool,
        escalation_allowed: bool,
        escalated: Mutex<bool>,
    }

    impl LoopFake {
        fn new(hint: Option<u32>, bound: &[u32]) -> Self {
            Self {
                hint,
                bound: Mutex::new(bound.iter().copied().collect()),
                racy: BTreeSet::new(),
                deny_until_escalated: false,
                escalation_allowed: false,
                escalated: Mutex::new(false),
            }
        }
    }

    impl DeviceControl for LoopFake {
        fn available_bytes(&self, _dir: &Path) -> ControlResult<u64> {
            Ok(u64::MAX)
        }
        fn next_free_loop(&self) -> ControlResult<Option<u32>> {
            Ok(self.hint)
        }
        fn loop_slot_bound(&self, slot: u32) -> bool {
            self.bound.lock().unwrap().contains(&slot)
        }
        fn attach_loop(&self, slot: u32, _backing: &Path) -> ControlResult<()> {
            if self.deny_until_escalated && !*self.escalated.lock().unwrap() {
                return Err(ControlError::PermissionDenied("loop-control".into()));
            }
            if self.racy.contains(&slot) {
                return Err(ControlError::Busy(format!("loop{}", slot)));
            }
            self.bound.lock().unwrap().insert(slot);
            Ok(())
        }
        fn detach_loop(&self, _device: &Path) -> ControlResult<()> {
            unreachable!()
        }
        fn create_mapping(&self, _name: &str, _table: &str) -> ControlResult<()> {
            unreachable!()
        }
        fn remove_mapping(&self, _name: &str) -> ControlResult<()> {
            unreachable!()
        }
        fn mapping_exists(&self, _name: &str) -> bool {
            false
        }
        fn format(&self, _device: &Path, _fs: &str) -> ControlResult<()> {
            unreachable!()
        }
        fn mount(&self, _device: &Path, _mp: &Path, _fs: &str) -> ControlResult<()> {
            unreachable!()
        }
        fn unmount(&self, _mp: &Path) -> ControlResult<()> {
            unreachable!()
        }
        fn is_mounted(&self, _mp: &Path) -> bool {
            false
        }
        fn escalate(&self) -> bool {
            if self.escalation_allowed {
                *self.escalated.lock().unwrap() = true;
            }
            self.escalation_allowed
        }
    }

    #[test]
    fn parses_slot_numbers() {
        assert_eq!(parse_loop_slot("/dev/loop7"), Some(7));
        assert_eq!(parse_loop_slot("loop12"), Some(12));
        assert_eq!(parse_loop_slot("/dev/sda"), None);
        assert_eq!(parse_loop_slot("/dev/loop"), None);
    }

    #[test]
    fn verified_hint_is_used() {
        let fake = LoopFake::new(Some(3), &[0, 1, 2]);
        let dev = bind_free_slot(&fake, Path::new("/tmp/backing"), 8).unwrap();
        assert_eq!(dev, PathBuf::from("/dev/loop3"));
    }

    #[test]
    fn stale_hint_falls_back_to_scan() {
        // Hint says 1, but 1 is bound; 0 is the first verified free slot.
        let fake = LoopFake::new(Some(1), &[1]);
        let dev = bind_free_slot(&fake, Path::new("/tmp/backing"), 8).unwrap();
        assert_eq!(dev, PathBuf::from("/dev/loop0"));
    }

    #[test]
    fn lost_race_moves_to_next_slot() {
        let mut fake = LoopFake::new(None, &[0]);
        fake.racy.insert(1);
        let dev = bind_free_slot(&fake, Path::new("/tmp/backing"), 8).unwrap();
        assert_eq!(dev, PathBuf::from("/dev/loop2"));
    }

    #[test]
    fn exhausted_namespace_reports_no_free_slot() {
        let fake = LoopFake::new(None, &[0, 1, 2, 3]);
        match bind_free_slot(&fake, Path::new("/tmp/backing"), 4) {
            Err(StressError::NoFreeSlot { scanned }) => assert_eq!(scanned, 4),
            other => panic!("expected NoFreeSlot, got {:?}", other),
        }
    }

    #[test]
    fn permission_denied_retries_once_elevated() {
        let mut fake = LoopFake::new(Some(0), &[]);
        fake.deny_until_escalated = true;
        fake.escalation_allowed = true;
        let dev = bind_free_slot(&fake, Path::new("/tmp/backing"), 4).unwrap();
        assert_eq!(dev, PathBuf::from("/dev/loop0"));
    }

    #[test]
    fn permission_denied_without_elevation_is_fatal() {
        let mut fake = LoopFake::new(Some(0), &[]);
        fake.deny_until_escalated = true;
        assert!(matches!(
            bind_free_slot(&fake, Path::new("/tmp/backing"), 4),
            Err(StressError::Permission(_))
        ));
    }
}
