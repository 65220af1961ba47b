use parking_lot::Mutex;

use crate::zone::RoleClass;

#[derive(Debug, Default)]
struct Slots {
    zone: Option<String>,
    class: Option<RoleClass>,
}

/// Two-slot cursor fed by the zone and class dropdowns. A class pick always
/// consumes the pair, whether or not a zone was waiting.
#[derive(Debug, Default)]
pub struct SelectionState {
    slots: Mutex<Slots>,
}

impl SelectionState {
    pub fn pick_zone(&self, zone: impl Into<String>) {
        self.slots.lock().zone = Some(zone.into());
    }

    pub fn clear_zone(&self) {
        self.slots.lock().zone = None;
    }

    pub fn clear_class(&self) {
        self.slots.lock().class = None;
    }

    /// Completes the pair. Returns the pending zone, if any, and resets both slots.
    pub fn pick_class(&self, class: RoleClass) -> Option<(String, RoleClass)> {
        let mut slots = self.slots.lock();
        slots.class = Some(class);
        let pair = slots.zone.take().zip(slots.class.take());
        *slots = Slots::default();
        pair
    }

    pub fn pending(&self) -> (Option<String>, Option<RoleClass>) {
        let slots = self.slots.lock();
        (slots.zone.clone(), slots.class)
    }

    pub fn reset(&self) {
        *self.slots.lock() = Slots::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::{InputKind, OutputKind};

    #[test]
    fn class_completes_pending_zone() {
        let selection = SelectionState::default();
        selection.pick_zone("zone3");
        assert_eq!(
            selection.pick_class(RoleClass::Input(InputKind::Door)),
            Some(("zone3".to_string(), RoleClass::Input(InputKind::Door)))
        );
        assert_eq!(selection.pending(), (None, None));
    }

    #[test]
    fn class_without_zone_is_dropped() {
        let selection = SelectionState::default();
        assert_eq!(selection.pick_class(RoleClass::Output(OutputKind::Toggle)), None);
        assert_eq!(selection.pending(), (None, None));
    }

    #[test]
    fn later_zone_pick_wins() {
        let selection = SelectionState::default();
        selection.pick_zone("zone1");
        selection.pick_zone("zone2");
        assert_eq!(selection.pending().0.as_deref(), Some("zone2"));

        selection.clear_zone();
        assert_eq!(selection.pending(), (None, None));
    }
}
