//! Classical Reno congestion control: slow start, congestion avoidance,
//! fast retransmit/recovery (spec §4.8, no SACK-based recovery).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionState {
    SlowStart,
    CongestionAvoidance,
    FastRecovery,
}

#[derive(Debug, Clone, Copy)]
pub struct CongestionControl {
    pub cwnd: u32,
    pub ssthresh: u32,
    pub state: CongestionState,
    pub dup_ack_count: u32,
    pub recovery_seq: u32,
    mss: u32,
}

impl CongestionControl {
    pub fn new(mss: u16) -> Self {
        let mss = mss as u32;
        CongestionControl {
            cwnd: 2 * mss,
            ssthresh: 65535,
            state: CongestionState::SlowStart,
            dup_ack_count: 0,
            recovery_seq: 0,
            mss,
        }
    }

    /// Called when a new (non-duplicate) ACK advances `snd_una` by `acked`
    /// bytes, while not in fast recovery.
    pub fn on_new_ack(&mut self, acked: u32) {
        match self.state {
            CongestionState::SlowStart => {
                self.cwnd += acked;
                if self.cwnd >= self.ssthresh {
                    self.state = CongestionState::CongestionAvoidance;
                }
            }
            CongestionState::CongestionAvoidance => {
                let increment = std::cmp::max(1, (self.mss * self.mss) / self.cwnd.max(1));
                self.cwnd += increment;
            }
            CongestionState::FastRecovery => {
                // New ACKs are handled via `on_full_ack_recovery` instead.
            }
        }
        self.dup_ack_count = 0;
    }

    /// Called on every duplicate ACK (ack == snd_una, no data). Returns
    /// `true` the moment the 3rd duplicate triggers fast retransmit.
    pub fn on_duplicate_ack(&mut self, snd_nxt: u32) -> bool {
        if self.state == CongestionState::FastRecovery {
            self.cwnd += self.mss;
            return false;
        }
        self.dup_ack_count += 1;
        if self.dup_ack_count == 3 {
            self.ssthresh = std::cmp::max(self.cwnd / 2, 2 * self.mss);
            self.cwnd = self.ssthresh + 3 * self.mss;
            self.recovery_seq = snd_nxt;
            self.state = CongestionState::FastRecovery;
            true
        } else {
            false
        }
    }

    /// Called when an ACK covers `recovery_seq`, exiting fast recovery.
    pub fn on_full_ack_recovery(&mut self) {
        self.cwnd = self.ssthresh;
        self.state = CongestionState::CongestionAvoidance;
        self.dup_ack_count = 0;
    }

    /// Called on a retransmit timeout.
    pub fn on_timeout(&mut self) {
        self.ssthresh = std::cmp::max(self.cwnd / 2, 2 * self.mss);
        self.cwnd = self.mss;
        self.state = CongestionState::SlowStart;
        self.dup_ack_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s6_fast_retransmit_arithmetic() {
        // S6 from spec.md section 8.
        let mss = 1460u16;
        let mut cc = CongestionControl::new(mss);
        cc.cwnd = 10 * mss as u32;
        cc.ssthresh = 64 * mss as u32;

        let snd_nxt = 100_000;
        assert!(!cc.on_duplicate_ack(snd_nxt));
        assert!(!cc.on_duplicate_ack(snd_nxt));
        assert!(cc.on_duplicate_ack(snd_nxt));

        assert_eq!(cc.ssthresh, 5 * mss as u32);
        assert_eq!(cc.cwnd, 5 * mss as u32 + 3 * mss as u32);
        assert_eq!(cc.state, CongestionState::FastRecovery);
        assert_eq!(cc.recovery_seq, snd_nxt);
    }

    #[test]
    fn slow_start_grows_by_full_segment_then_switches() {
        let mut cc = CongestionControl::new(1000);
        cc.ssthresh = 3000;
        cc.on_new_ack(1000);
        assert_eq!(cc.cwnd, 3000);
        assert_eq!(cc.state, CongestionState::CongestionAvoidance);
    }

    #[test]
    fn timeout_resets_to_slow_start() {
        let mut cc = CongestionControl::new(1000);
        cc.cwnd = 20000;
        cc.state = CongestionState::CongestionAvoidance;
        cc.on_timeout();
        assert_eq!(cc.cwnd, 1000);
        assert_eq!(cc.state, CongestionState::SlowStart);
        assert_eq!(cc.ssthresh, 10000);
    }
}
