pub mod vcd;

/// Logic levels of every captured channel at one instant, channel `n` in bit `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample(pub u64);

impl Sample {
    pub fn level(self, channel: u8) -> bool {
        (self.0 >> channel) & 1 == 1
    }
}
