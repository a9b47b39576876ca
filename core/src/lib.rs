pub mod bus;
pub mod control;
pub mod controller;
pub mod hal;
pub mod image;
pub mod targets;

/// A self-clearing latch for events etc.
#[derive(Debug, Default)]
pub struct LatchingEvent {
    val: bool,
}

impl LatchingEvent {
    /// Returns the current value and clears the event.
    pub fn get_clear(&mut self) -> bool {
        let v = self.val;
        self.val = false;
        v
    }

    /// Sets the event.
    pub fn set(&mut self) {
        self.val = true;
    }
}

pub fn build_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
