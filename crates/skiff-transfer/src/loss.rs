//! Fault injection for exercising the retransmission path.
//!
//! The receiver consults the simulator before it processes an inbound data
//! datagram and before it sends an acknowledgment. Dropped items are
//! reported to the caller, which logs them. A receiver configured with both
//! percentages at zero carries no simulator at all.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::ConfigError;

pub struct LossSimulator {
    data_drop_percent: u8,
    ack_drop_percent: u8,
    rng: StdRng,
}

impl LossSimulator {
    /// Returns `None` when no loss is configured.
    pub fn new(
        data_drop_percent: u8,
        ack_drop_percent: u8,
        seed: Option<u64>,
    ) -> Result<Option<Self>, ConfigError> {
        for pct in [data_drop_percent, ack_drop_percent] {
            if pct > 100 {
                return Err(ConfigError::DropPercent(pct));
            }
        }
        if data_drop_percent == 0 && ack_drop_percent == 0 {
            return Ok(None);
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Some(Self {
            data_drop_percent,
            ack_drop_percent,
            rng,
        }))
    }

    /// Independent draw for one inbound data datagram.
    pub fn drop_data(&mut self) -> bool {
        self.draw(self.data_drop_percent)
    }

    /// Independent draw for one outbound acknowledgment.
    pub fn drop_ack(&mut self) -> bool {
        self.draw(self.ack_drop_percent)
    }

    fn draw(&mut self, percent: u8) -> bool {
        match percent {
            0 => false,
            100.. => true,
            p => self.rng.random_range(0..100u8) < p,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_loss_means_no_simulator() {
        assert!(LossSimulator::new(0, 0, None).unwrap().is_none());
        assert!(LossSimulator::new(101, 0, None).is_err());
        assert!(LossSimulator::new(0, 200, None).is_err());
    }

    #[test]
    fn extremes_are_deterministic() {
        let mut sim = LossSimulator::new(100, 0, Some(1)).unwrap().unwrap();
        for _ in 0..1000 {
            assert!(sim.drop_data());
            assert!(!sim.drop_ack());
        }
    }

    #[test]
    fn rate_is_roughly_honored() {
        let mut sim = LossSimulator::new(30, 30, Some(7)).unwrap().unwrap();
        let drops = (0..10_000).filter(|_| sim.drop_data()).count();
        assert!((2_500..3_500).contains(&drops), "drops = {}", drops);
    }

    #[test]
    fn seeded_runs_repeat() {
        let mut a = LossSimulator::new(50, 50, Some(42)).unwrap().unwrap();
        let mut b = LossSimulator::new(50, 50, Some(42)).unwrap().unwrap();
        let ra: Vec<bool> = (0..64).map(|_| a.drop_ack()).collect();
        let rb: Vec<bool> = (0..64).map(|_| b.drop_ack()).collect();
        assert_eq!(ra, rb);
    }
}
