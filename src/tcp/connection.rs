//! The TCP connection state machine: one 4-tuple, one set of send/receive
//! variables, one retransmit queue, one congestion controller.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::config::TcpConfig;
use crate::endpoint::Endpoint;
use crate::error::{NetworkError, Result};

use super::congestion::CongestionControl;
use super::retransmit::RetransmitQueue;
use super::rtt::RttEstimator;
use super::seq;
use super::segment::{TcpFlags, TcpOption, TcpSegment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    fn can_send(self) -> bool {
        matches!(self, TcpState::Established | TcpState::CloseWait)
    }
}

/// The connection's only collaborator: handing a finished, checksummed
/// segment to whatever wraps it in IPv4 and routes it onward.
pub trait SegmentTransmit: Send + Sync {
    fn transmit(&self, segment: TcpSegment);
}

impl<F> SegmentTransmit for F
where
    F: Fn(TcpSegment) + Send + Sync,
{
    fn transmit(&self, segment: TcpSegment) {
        self(segment)
    }
}

const RECV_BUFFER_CAPACITY: usize = 65_535;

struct Inner {
    state: TcpState,
    iss: u32,
    irs: u32,
    snd_una: u32,
    snd_nxt: u32,
    snd_wnd: u16,
    rcv_nxt: u32,
    rcv_wnd: u16,
    mss: u16,
    send_buffer: VecDeque<u8>,
    recv_buffer: VecDeque<u8>,
    retransmit: RetransmitQueue,
    congestion: CongestionControl,
    rtt: RttEstimator,
    retransmit_deadline: Option<Instant>,
    time_wait_deadline: Option<Instant>,
    peer_closed: bool,
    error: Option<NetworkError>,
}

pub struct TcpConnection {
    pub local: Endpoint,
    pub remote: Endpoint,
    inner: Mutex<Inner>,
    recv_cv: Condvar,
    state_cv: Condvar,
    transmit: Arc<dyn SegmentTransmit>,
    config: TcpConfig,
}

fn generate_isn() -> u32 {
    rand::random::<u32>()
}

impl TcpConnection {
    /// Client-side active open: emits the initial SYN and returns a
    /// connection sitting in `SynSent`.
    pub fn connect(
        local: Endpoint,
        remote: Endpoint,
        transmit: Arc<dyn SegmentTransmit>,
        config: TcpConfig,
    ) -> Self {
        let iss = generate_isn();
        let mut inner = Inner::new(iss, config);
        inner.state = TcpState::SynSent;
        let conn = TcpConnection {
            local,
            remote,
            inner: Mutex::new(inner),
            recv_cv: Condvar::new(),
            state_cv: Condvar::new(),
            transmit,
            config,
        };
        let syn = {
            let mut guard = conn.inner.lock().unwrap();
            guard.snd_nxt = iss.wrapping_add(1);
            conn.build_segment(&guard, TcpFlags::SYN, iss, 0, vec![TcpOption::Mss(config.default_mss)], Vec::new())
        };
        conn.send_and_track(iss, syn);
        conn
    }

    /// Server-side passive open: a SYN arrived for a 4-tuple with no prior
    /// connection. Emits SYN|ACK and returns a connection in `SynReceived`.
    pub fn accept_syn(
        local: Endpoint,
        remote: Endpoint,
        transmit: Arc<dyn SegmentTransmit>,
        config: TcpConfig,
        syn: &TcpSegment,
    ) -> Result<Self> {
        if !syn.flags.contains(TcpFlags::SYN) || syn.flags.contains(TcpFlags::ACK) {
            return Err(NetworkError::State("expected a pure SYN".into()));
        }
        let iss = generate_isn();
        let irs = syn.seq;
        let mut inner = Inner::new(iss, config);
        inner.irs = irs;
        inner.rcv_nxt = irs.wrapping_add(1);
        inner.mss = syn.mss().unwrap_or(config.default_mss).min(config.default_mss);
        inner.state = TcpState::SynReceived;
        inner.snd_nxt = iss.wrapping_add(1);

        let conn = TcpConnection {
            local,
            remote,
            inner: Mutex::new(inner),
            recv_cv: Condvar::new(),
            state_cv: Condvar::new(),
            transmit,
            config,
        };
        let synack = {
            let guard = conn.inner.lock().unwrap();
            conn.build_segment(
                &guard,
                TcpFlags::SYN | TcpFlags::ACK,
                iss,
                guard.rcv_nxt,
                vec![TcpOption::Mss(inner_mss(&guard))],
                Vec::new(),
            )
        };
        conn.send_and_track(iss, synack);
        debug!("{} <- {}: SYN received, iss={iss} irs={irs}", conn.local, conn.remote);
        Ok(conn)
    }

    pub fn state(&self) -> TcpState {
        self.inner.lock().unwrap().state
    }

    /// Blocks until the connection reaches `Established` or `deadline`
    /// elapses, polling at `poll_interval` — mirrors a client's `connect()`.
    pub fn wait_established(&self, deadline: Duration, poll_interval: Duration) -> Result<()> {
        let start = Instant::now();
        let mut guard = self.inner.lock().unwrap();
        loop {
            match guard.state {
                TcpState::Established => return Ok(()),
                TcpState::Closed => {
                    return Err(guard.error.take().unwrap_or(NetworkError::State(
                        "connection reset before establishment".into(),
                    )))
                }
                _ => {}
            }
            if start.elapsed() >= deadline {
                return Err(NetworkError::Timeout);
            }
            let (g, _) = self
                .state_cv
                .wait_timeout(guard, poll_interval)
                .unwrap();
            guard = g;
        }
    }

    /// Processes one inbound segment already verified against the pseudo-header
    /// checksum by the caller.
    pub fn handle_segment(&self, seg: &TcpSegment) {
        let mut guard = self.inner.lock().unwrap();

        if seg.flags.contains(TcpFlags::RST) {
            warn!("{} <- {}: RST received, closing", self.local, self.remote);
            guard.state = TcpState::Closed;
            guard.error = Some(NetworkError::State("connection reset by peer".into()));
            drop(guard);
            self.state_cv.notify_all();
            self.recv_cv.notify_all();
            return;
        }

        match guard.state {
            TcpState::Listen => self.handle_listen(&mut guard, seg),
            TcpState::SynSent => self.handle_syn_sent(&mut guard, seg),
            TcpState::SynReceived => self.handle_syn_received(&mut guard, seg),
            TcpState::Established => self.handle_established(&mut guard, seg),
            TcpState::FinWait1 => self.handle_fin_wait1(&mut guard, seg),
            TcpState::FinWait2 => self.handle_fin_wait2(&mut guard, seg),
            TcpState::CloseWait => self.process_ack(&mut guard, seg),
            TcpState::Closing => self.handle_closing(&mut guard, seg),
            TcpState::LastAck => self.handle_last_ack(&mut guard, seg),
            TcpState::TimeWait => self.handle_time_wait(&mut guard, seg),
            TcpState::Closed => {}
        }
    }

    fn handle_listen(&self, inner: &mut Inner, seg: &TcpSegment) {
        if !seg.flags.contains(TcpFlags::SYN) || seg.flags.contains(TcpFlags::ACK) {
            return;
        }
        inner.irs = seg.seq;
        inner.rcv_nxt = seg.seq.wrapping_add(1);
        inner.mss = seg.mss().unwrap_or(self.config.default_mss).min(self.config.default_mss);
        let iss = inner.iss;
        inner.snd_nxt = iss.wrapping_add(1);
        inner.state = TcpState::SynReceived;
        let synack = self.build_segment(
            inner,
            TcpFlags::SYN | TcpFlags::ACK,
            iss,
            inner.rcv_nxt,
            vec![TcpOption::Mss(inner.mss)],
            Vec::new(),
        );
        self.send_and_track(iss, synack);
    }

    fn handle_syn_sent(&self, inner: &mut Inner, seg: &TcpSegment) {
        let syn_ack = seg.flags.contains(TcpFlags::SYN) && seg.flags.contains(TcpFlags::ACK);
        if syn_ack && seg.ack == inner.iss.wrapping_add(1) {
            inner.irs = seg.seq;
            inner.rcv_nxt = seg.seq.wrapping_add(1);
            inner.snd_una = seg.ack;
            inner.mss = seg.mss().unwrap_or(inner.mss).min(inner.mss);
            inner.snd_wnd = seg.window;
            inner.retransmit.remove_acked_before(seg.ack);
            inner.state = TcpState::Established;
            let ack = self.build_segment(inner, TcpFlags::ACK, inner.snd_nxt, inner.rcv_nxt, Vec::new(), Vec::new());
            self.transmit.transmit(ack);
            debug!("{} <-> {}: handshake complete (active)", self.local, self.remote);
            self.state_cv.notify_all();
        } else if seg.flags.contains(TcpFlags::SYN) && !seg.flags.contains(TcpFlags::ACK) {
            // Simultaneous open. The bare SYN from `connect()` is still
            // sitting in the retransmit queue at seq=iss; the SYN|ACK below
            // supersedes it, so swap the queue entry rather than leaving the
            // stale SYN behind to be retransmitted instead of the SYN|ACK
            // the peer is actually waiting on. `inner` is already locked by
            // the caller here, so the queue is updated directly rather than
            // through `send_and_track` (which would re-lock and deadlock).
            inner.irs = seg.seq;
            inner.rcv_nxt = seg.seq.wrapping_add(1);
            inner.state = TcpState::SynReceived;
            let iss = inner.iss;
            let synack = self.build_segment(
                inner,
                TcpFlags::SYN | TcpFlags::ACK,
                iss,
                inner.rcv_nxt,
                Vec::new(),
                Vec::new(),
            );
            inner.retransmit.remove_seq(iss);
            inner.retransmit.push(iss, synack.clone());
            if inner.retransmit_deadline.is_none() {
                inner.retransmit_deadline = Some(Instant::now() + inner.rtt.rto());
            }
            self.transmit.transmit(synack);
        }
    }

    fn handle_syn_received(&self, inner: &mut Inner, seg: &TcpSegment) {
        if seg.flags.contains(TcpFlags::ACK) && seg.ack == inner.snd_nxt {
            inner.snd_una = seg.ack;
            inner.snd_wnd = seg.window;
            inner.retransmit.remove_acked_before(seg.ack);
            inner.state = TcpState::Established;
            debug!("{} <-> {}: handshake complete (passive)", self.local, self.remote);
            self.state_cv.notify_all();
        }
    }

    fn handle_established(&self, inner: &mut Inner, seg: &TcpSegment) {
        self.process_ack(inner, seg);
        self.process_data(inner, seg);
        if seg.flags.contains(TcpFlags::FIN) {
            inner.rcv_nxt = inner.rcv_nxt.wrapping_add(1);
            inner.peer_closed = true;
            inner.state = TcpState::CloseWait;
            let ack = self.build_segment(inner, TcpFlags::ACK, inner.snd_nxt, inner.rcv_nxt, Vec::new(), Vec::new());
            self.transmit.transmit(ack);
            self.recv_cv.notify_all();
        }
    }

    fn handle_fin_wait1(&self, inner: &mut Inner, seg: &TcpSegment) {
        self.process_ack(inner, seg);
        self.process_data(inner, seg);
        let our_fin_acked = seg.flags.contains(TcpFlags::ACK) && seg.ack == inner.snd_nxt;
        let peer_fin = seg.flags.contains(TcpFlags::FIN);
        if peer_fin {
            inner.rcv_nxt = inner.rcv_nxt.wrapping_add(1);
            inner.peer_closed = true;
            let ack = self.build_segment(inner, TcpFlags::ACK, inner.snd_nxt, inner.rcv_nxt, Vec::new(), Vec::new());
            self.transmit.transmit(ack);
        }
        inner.state = match (our_fin_acked, peer_fin) {
            (true, true) => self.enter_time_wait(inner),
            (true, false) => TcpState::FinWait2,
            (false, true) => TcpState::Closing,
            (false, false) => inner.state,
        };
    }

    fn handle_fin_wait2(&self, inner: &mut Inner, seg: &TcpSegment) {
        self.process_ack(inner, seg);
        self.process_data(inner, seg);
        if seg.flags.contains(TcpFlags::FIN) {
            inner.rcv_nxt = inner.rcv_nxt.wrapping_add(1);
            inner.peer_closed = true;
            let ack = self.build_segment(inner, TcpFlags::ACK, inner.snd_nxt, inner.rcv_nxt, Vec::new(), Vec::new());
            self.transmit.transmit(ack);
            inner.state = self.enter_time_wait(inner);
            self.recv_cv.notify_all();
        }
    }

    fn handle_closing(&self, inner: &mut Inner, seg: &TcpSegment) {
        if seg.flags.contains(TcpFlags::ACK) && seg.ack == inner.snd_nxt {
            inner.state = self.enter_time_wait(inner);
        }
    }

    fn handle_last_ack(&self, inner: &mut Inner, seg: &TcpSegment) {
        if seg.flags.contains(TcpFlags::ACK) && seg.ack == inner.snd_nxt {
            inner.state = TcpState::Closed;
            self.state_cv.notify_all();
        }
    }

    fn handle_time_wait(&self, inner: &mut Inner, seg: &TcpSegment) {
        if seg.flags.contains(TcpFlags::FIN) {
            let ack = self.build_segment(inner, TcpFlags::ACK, inner.snd_nxt, inner.rcv_nxt, Vec::new(), Vec::new());
            self.transmit.transmit(ack);
            inner.time_wait_deadline = Some(Instant::now() + self.config.time_wait);
        }
    }

    fn enter_time_wait(&self, inner: &mut Inner) -> TcpState {
        inner.time_wait_deadline = Some(Instant::now() + self.config.time_wait);
        TcpState::TimeWait
    }

    /// ACK processing shared by every post-handshake state.
    fn process_ack(&self, inner: &mut Inner, seg: &TcpSegment) {
        if !seg.flags.contains(TcpFlags::ACK) {
            return;
        }
        let acked = seq::acked_bytes(seg.ack, inner.snd_una);
        if acked > 0 {
            // Karn's algorithm: only sample RTT from a segment that is
            // actually being acked here and was never retransmitted.
            if let Some(earliest) = inner.retransmit.earliest() {
                if seq::before(earliest.seq, seg.ack) && !inner.retransmit.was_retransmitted(earliest.seq) {
                    inner.rtt.sample(earliest.sent_at.elapsed());
                }
            }
            inner.snd_una = seg.ack;
            inner.retransmit.remove_acked_before(seg.ack);
            inner.snd_wnd = seg.window;
            inner.retransmit_deadline = if inner.retransmit.is_empty() {
                None
            } else {
                Some(Instant::now() + inner.rtt.rto())
            };
            inner.rtt.reset_backoff();
            let recovery_seq = inner.congestion.recovery_seq;
            if inner.congestion.state == super::congestion::CongestionState::FastRecovery
                && !seq::before(seg.ack, recovery_seq)
            {
                inner.congestion.on_full_ack_recovery();
            } else {
                inner.congestion.on_new_ack(acked);
            }
            trace!("{} <- {}: ack advanced snd_una to {}", self.local, self.remote, seg.ack);
        } else if seg.data.is_empty() && seg.ack == inner.snd_una && !inner.retransmit.is_empty() {
            if inner.congestion.on_duplicate_ack(inner.snd_nxt) {
                if let Some(entry) = inner.retransmit.earliest() {
                    let resend = entry.segment.clone();
                    let resend_seq = entry.seq;
                    self.transmit.transmit(resend);
                    inner.retransmit.touch_retransmitted(resend_seq);
                    warn!("{} -> {}: fast retransmit at seq {}", self.local, self.remote, resend_seq);
                }
            }
        }
    }

    fn process_data(&self, inner: &mut Inner, seg: &TcpSegment) {
        if seg.data.is_empty() {
            return;
        }
        if seg.seq != inner.rcv_nxt {
            // Out-of-order data is not buffered; only in-order delivery
            // is implemented.
            return;
        }
        let room = RECV_BUFFER_CAPACITY.saturating_sub(inner.recv_buffer.len());
        let take = seg.data.len().min(room);
        inner.recv_buffer.extend(&seg.data[..take]);
        inner.rcv_nxt = inner.rcv_nxt.wrapping_add(take as u32);
        inner.rcv_wnd = RECV_BUFFER_CAPACITY.saturating_sub(inner.recv_buffer.len()) as u16;
        let ack = self.build_segment(inner, TcpFlags::ACK, inner.snd_nxt, inner.rcv_nxt, Vec::new(), Vec::new());
        self.transmit.transmit(ack);
        self.recv_cv.notify_all();
    }

    /// Appends to the send buffer and drains as much as the window allows.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        {
            let mut guard = self.inner.lock().unwrap();
            if !guard.state.can_send() {
                return Err(NetworkError::State(format!("cannot send in state {:?}", guard.state)));
            }
            guard.send_buffer.extend(data);
        }
        self.drain();
        Ok(())
    }

    fn drain(&self) {
        loop {
            let mut guard = self.inner.lock().unwrap();
            if guard.send_buffer.is_empty() {
                return;
            }
            let window_budget = std::cmp::min(guard.snd_wnd as u32, guard.congestion.cwnd);
            let in_flight = guard.snd_nxt.wrapping_sub(guard.snd_una);
            if in_flight >= window_budget {
                return;
            }
            let budget = (window_budget - in_flight) as usize;
            let chunk_len = guard.send_buffer.len().min(guard.mss as usize).min(budget.max(1));
            if chunk_len == 0 {
                return;
            }
            let chunk: Vec<u8> = guard.send_buffer.drain(..chunk_len).collect();
            let seq = guard.snd_nxt;
            let rcv_nxt = guard.rcv_nxt;
            let seg = self.build_segment(&guard, TcpFlags::PSH | TcpFlags::ACK, seq, rcv_nxt, Vec::new(), chunk);
            guard.snd_nxt = guard.snd_nxt.wrapping_add(seg.data.len() as u32);
            drop(guard);
            self.send_and_track(seq, seg);
        }
    }

    /// Blocks until data arrives, the peer closes, or the connection resets.
    pub fn recv(&self) -> Result<Vec<u8>> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if !guard.recv_buffer.is_empty() {
                return Ok(guard.recv_buffer.drain(..).collect());
            }
            if guard.peer_closed || guard.state == TcpState::Closed {
                return Err(NetworkError::SocketClosed);
            }
            guard = self.recv_cv.wait(guard).unwrap();
        }
    }

    /// Application-initiated close: emits FIN and advances the state machine.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let fin = match guard.state {
            TcpState::Established => {
                guard.state = TcpState::FinWait1;
                true
            }
            TcpState::CloseWait => {
                guard.state = TcpState::LastAck;
                true
            }
            TcpState::Closed | TcpState::TimeWait | TcpState::LastAck | TcpState::FinWait1
            | TcpState::FinWait2 | TcpState::Closing => false,
            TcpState::Listen | TcpState::SynSent | TcpState::SynReceived => {
                guard.state = TcpState::Closed;
                self.state_cv.notify_all();
                return Ok(());
            }
        };
        if fin {
            let seq = guard.snd_nxt;
            let rcv_nxt = guard.rcv_nxt;
            let seg = self.build_segment(&guard, TcpFlags::FIN | TcpFlags::ACK, seq, rcv_nxt, Vec::new(), Vec::new());
            guard.snd_nxt = guard.snd_nxt.wrapping_add(1);
            drop(guard);
            self.send_and_track(seq, seg);
        }
        Ok(())
    }

    /// Retransmit-timer and TIME_WAIT-timer expiry; call periodically from
    /// a background tick thread.
    pub fn tick(&self) -> bool {
        let mut guard = self.inner.lock().unwrap();
        if let Some(deadline) = guard.time_wait_deadline {
            if Instant::now() >= deadline {
                guard.state = TcpState::Closed;
                return true;
            }
        }
        if let Some(deadline) = guard.retransmit_deadline {
            if Instant::now() >= deadline && !guard.retransmit.is_empty() {
                guard.rtt.backoff();
                guard.congestion.on_timeout();
                let next_deadline = Instant::now() + guard.rtt.rto();
                guard.retransmit_deadline = Some(next_deadline);
                if let Some(entry) = guard.retransmit.earliest() {
                    let seq = entry.seq;
                    let seg = entry.segment.clone();
                    warn!("{} -> {}: retransmit timeout at seq {}", self.local, self.remote, seq);
                    self.transmit.transmit(seg);
                    guard.retransmit.touch_retransmitted(seq);
                }
            }
        }
        guard.state == TcpState::Closed
    }

    fn send_and_track(&self, seq: u32, seg: TcpSegment) {
        let mut guard = self.inner.lock().unwrap();
        guard.retransmit.push(seq, seg.clone());
        if guard.retransmit_deadline.is_none() {
            guard.retransmit_deadline = Some(Instant::now() + guard.rtt.rto());
        }
        drop(guard);
        self.transmit.transmit(seg);
    }

    fn build_segment(
        &self,
        inner: &Inner,
        flags: TcpFlags,
        seq: u32,
        ack: u32,
        options: Vec<TcpOption>,
        data: Vec<u8>,
    ) -> TcpSegment {
        TcpSegment {
            src_port: self.local.port,
            dst_port: self.remote.port,
            seq,
            ack,
            flags,
            window: inner.rcv_wnd,
            urgent: 0,
            options,
            data,
        }
    }
}

fn inner_mss(inner: &Inner) -> u16 {
    inner.mss
}

impl Inner {
    fn new(iss: u32, config: TcpConfig) -> Self {
        Inner {
            state: TcpState::Closed,
            iss,
            irs: 0,
            snd_una: iss,
            snd_nxt: iss,
            snd_wnd: config.default_window,
            rcv_nxt: 0,
            rcv_wnd: config.default_window,
            mss: config.default_mss,
            send_buffer: VecDeque::new(),
            recv_buffer: VecDeque::new(),
            retransmit: RetransmitQueue::new(),
            congestion: CongestionControl::new(config.default_mss),
            rtt: RttEstimator::new(config.initial_rto, config.min_rto, config.max_rto),
            retransmit_deadline: None,
            time_wait_deadline: None,
            peer_closed: false,
            error: None,
        }
    }
}

/// Builds the RST response for a segment arriving on a 4-tuple with no
/// matching connection.
pub fn reset_for(local_port: u16, remote_port: u16, inbound: &TcpSegment) -> TcpSegment {
    let data_len = inbound.data.len() as u32;
    let syn_len = if inbound.flags.contains(TcpFlags::SYN) { 1 } else { 0 };
    let fin_len = if inbound.flags.contains(TcpFlags::FIN) { 1 } else { 0 };
    if inbound.flags.contains(TcpFlags::ACK) {
        TcpSegment {
            src_port: local_port,
            dst_port: remote_port,
            seq: inbound.ack,
            ack: 0,
            flags: TcpFlags::RST,
            window: 0,
            urgent: 0,
            options: Vec::new(),
            data: Vec::new(),
        }
    } else {
        TcpSegment {
            src_port: local_port,
            dst_port: remote_port,
            seq: 0,
            ack: inbound.seq.wrapping_add(data_len + syn_len + fin_len),
            flags: TcpFlags::RST | TcpFlags::ACK,
            window: 0,
            urgent: 0,
            options: Vec::new(),
            data: Vec::new(),
        }
    }
}
