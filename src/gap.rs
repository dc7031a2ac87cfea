//! What to do about a detected gap

/// Most samples a single gap may backfill
pub const GAP_REPAIR_CAP: u64 = 5_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GapAction {
    /// Nothing lost (or marker jitter)
    Continue,
    /// Write this many placeholder samples then carry on
    Backfill(u64),
    /// Loss occurred and we were asked to halt on any loss
    Stop,
    /// Loss is bigger than we can repair
    Fatal(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GapPolicy {
    pub capacity: u64,
    pub stop_on_loss: bool,
}

impl Default for GapPolicy {
    fn default() -> Self {
        Self {
            capacity: GAP_REPAIR_CAP,
            stop_on_loss: false,
        }
    }
}

impl GapPolicy {
    pub fn decide(&self, gap: i64) -> GapAction {
        if gap <= 0 {
            return GapAction::Continue;
        }
        let gap = gap as u64;
        if self.stop_on_loss {
            GapAction::Stop
        } else if gap > self.capacity {
            GapAction::Fatal(gap)
        } else {
            GapAction::Backfill(gap)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decisions() {
        let p = GapPolicy {
            capacity: 100,
            stop_on_loss: false,
        };
        assert_eq!(p.decide(-5), GapAction::Continue);
        assert_eq!(p.decide(0), GapAction::Continue);
        assert_eq!(p.decide(1), GapAction::Backfill(1));
        assert_eq!(p.decide(100), GapAction::Backfill(100));
        assert_eq!(p.decide(101), GapAction::Fatal(101));
    }

    #[test]
    fn test_stop_wins() {
        let p = GapPolicy {
            capacity: 100,
            stop_on_loss: true,
        };
        assert_eq!(p.decide(0), GapAction::Continue);
        assert_eq!(p.decide(1), GapAction::Stop);
        assert_eq!(p.decide(1000), GapAction::Stop);
    }
}
