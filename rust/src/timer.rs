/// Restartable one-shot timer, modelled as data.
///
/// The actor owns the `Debounce`; a spawned sleep carries the generation it was armed with and
/// reports back when it elapses. Only the most recent arm can fire, so a reset never needs to
/// cancel the task that is already sleeping.
#[derive(Debug, Default, Clone)]
pub struct Debounce {
    generation: u64,
    armed: bool,
}

impl Debounce {
    /// Arms (or re-arms) the timer and returns the generation the sleeper must report.
    pub fn reset(&mut self) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.armed = true;
        self.generation
    }

    /// Consumes a wake-up. Returns true only for the latest arm, and only once.
    pub fn fire(&mut self, generation: u64) -> bool {
        if !self.armed || generation != self.generation {
            return false;
        }
        self.armed = false;
        true
    }

    pub fn cancel(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}
