//! Channel Multiplexer (C7): channel registry, per-channel flow control,
//! forward-listener bookkeeping, and the FIFO global-confirm queue.
//!
//! The data model is our own (spec.md §3/§4.7 define it precisely), kept
//! independent of any live transport so it is directly unit-testable;
//! grounded on `thrussh/src/client/mod.rs`'s `Channel`/`ChannelMsg`/
//! `Session` (window defaults, the `window_adjusted`/`data` flow-control
//! shape) and on `thrussh/src/session.rs` for the default window/packet
//! sizes, with the higher-level per-kind wrapper shape informed by
//! `warpgate-protocol-ssh/src/client/channel_session.rs` and
//! `channel_direct_tcpip.rs`.

use std::collections::{HashMap, VecDeque};

/// `thrussh::client::Config`'s defaults (`window_size`,
/// `maximum_packet_size`); halved at channel creation when a PTY is
/// requested, per spec.md §4.7.
pub const DEFAULT_WINDOW: u32 = 2_097_152;
pub const DEFAULT_MAX_PACKET: u32 = 32_768;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Session,
    DirectTcp,
    ForwardedTcp,
    X11,
    Agent,
    Tun,
    Mux,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    InputDraining,
    OutputDraining,
    Closed,
}

/// A single pending sub-request tied to a channel, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingRequest {
    PtyReq,
    X11Req,
    AuthAgentReq,
    Env(String, String),
    Exec(String),
    Subsystem(String),
    Shell,
}

#[derive(Debug)]
pub struct Channel {
    pub id: ChannelId,
    pub kind: ChannelKind,
    pub state: ChannelState,
    pub local_window: u32,
    pub remote_window: u32,
    pub max_packet: u32,
    pub remote_max_packet: u32,
    pub flow_blocked: bool,
    pub pending_requests: Vec<PendingRequest>,
    local_consumed_since_adjust: u32,
}

impl Channel {
    fn new(id: ChannelId, kind: ChannelKind, window: u32, max_packet: u32) -> Self {
        Channel {
            id,
            kind,
            state: ChannelState::Opening,
            local_window: window,
            remote_window: 0,
            max_packet,
            remote_max_packet: DEFAULT_MAX_PACKET,
            flow_blocked: false,
            pending_requests: Vec::new(),
            local_consumed_since_adjust: 0,
        }
    }

    /// `opening -> open` on confirmation, recording the peer's advertised
    /// window/packet size.
    pub fn confirm_open(&mut self, remote_window: u32, remote_max_packet: u32) {
        assert_eq!(self.state, ChannelState::Opening, "double open-confirmation");
        self.remote_window = remote_window;
        self.remote_max_packet = remote_max_packet;
        self.state = ChannelState::Open;
    }

    /// `opening -> closed` on open-failure.
    pub fn fail_open(&mut self) {
        assert_eq!(self.state, ChannelState::Opening, "open-failure on a non-opening channel");
        self.state = ChannelState::Closed;
    }

    /// `open -> input-draining` on local EOF.
    pub fn local_eof(&mut self) {
        assert_eq!(self.state, ChannelState::Open);
        self.state = ChannelState::InputDraining;
    }

    /// `open -> output-draining` on remote EOF.
    pub fn remote_eof(&mut self) {
        assert_eq!(self.state, ChannelState::Open);
        self.state = ChannelState::OutputDraining;
    }

    /// Either drain state `-> closed` once both sides have signaled
    /// closed and buffered I/O is flushed. Never re-opens a closed
    /// channel (spec.md §3 invariant).
    pub fn close(&mut self) {
        assert_ne!(self.state, ChannelState::Opening, "closing a channel that never confirmed open");
        self.state = ChannelState::Closed;
    }

    /// Account for `n` bytes consumed from the local window by incoming
    /// data, per spec.md §4.7's replenishment policy: replenish when
    /// consumption passes half the starting window, or every packet for
    /// windows narrower than that.
    pub fn account_incoming(&mut self, n: u32, starting_window: u32) -> Option<u32> {
        self.local_window = self.local_window.saturating_sub(n);
        self.local_consumed_since_adjust += n;
        let threshold = (starting_window / 2).max(1);
        if self.local_consumed_since_adjust >= threshold || self.max_packet < threshold {
            let adjust = self.local_consumed_since_adjust;
            self.local_consumed_since_adjust = 0;
            self.local_window += adjust;
            Some(adjust)
        } else {
            None
        }
    }

    pub fn window_adjusted(&mut self, new_size: u32) {
        self.remote_window = self.remote_window.saturating_add(new_size);
        self.flow_blocked = false;
    }

    /// Fragment `data` into `remote_max_packet`-sized pieces, bounded by
    /// `remote_window`. Returns the chunks that fit now and the leftover
    /// that must wait for a future window-adjust, mirroring spec.md
    /// §4.7's "throttled by remote_window" rule and the testable
    /// invariant in spec.md §8 (`bytes_sent <= initial_remote_window + Σ
    /// window_adjusts_received`).
    pub fn fragment_outbound<'a>(&mut self, data: &'a [u8]) -> (Vec<&'a [u8]>, &'a [u8]) {
        let mut chunks = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() && self.remote_window > 0 {
            let packet_cap = self.remote_max_packet as usize;
            let window_cap = self.remote_window as usize;
            let take = packet_cap.min(window_cap).min(data.len() - offset);
            if take == 0 {
                break;
            }
            chunks.push(&data[offset..offset + take]);
            self.remote_window -= take as u32;
            offset += take;
        }
        if offset < data.len() {
            self.flow_blocked = true;
        }
        (chunks, &data[offset..])
    }
}

/// `{listen_host, listen_port, connect_host, connect_port, direction,
/// listener_fd?, remote_confirmed?}` from spec.md §3.
#[derive(Debug, Clone)]
pub struct ForwardRecord {
    pub listen_host: Option<String>,
    pub listen_port: u16,
    pub connect_host: String,
    pub connect_port: u16,
    pub direction: crate::options::ForwardDirection,
    pub listener_bound: bool,
    pub remote_confirmed: Option<bool>,
}

/// A deferred action bound to a pending global request, consumed FIFO as
/// success/failure replies arrive (spec.md §4.7, §9 "Confirm-callback
/// queue").
#[derive(Debug, Clone)]
pub enum ConfirmCallback {
    RemoteForward { forward_index: usize },
    TunForward,
    Generic(String),
}

pub struct Multiplexer {
    channels: HashMap<u32, Channel>,
    next_id: u32,
    pub forwards: Vec<ForwardRecord>,
    confirm_queue: VecDeque<ConfirmCallback>,
}

impl Default for Multiplexer {
    fn default() -> Self {
        Multiplexer {
            channels: HashMap::new(),
            next_id: 0,
            forwards: Vec::new(),
            confirm_queue: VecDeque::new(),
        }
    }
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_id(&mut self) -> ChannelId {
        let id = self.next_id;
        self.next_id += 1;
        ChannelId(id)
    }

    /// `open_session`: allocates a channel in `opening`. `want_tty`
    /// halves both the default window and packet size, per spec.md
    /// §4.7.
    pub fn open_session(&mut self, want_tty: bool) -> ChannelId {
        let (window, packet) = if want_tty {
            (DEFAULT_WINDOW / 2, DEFAULT_MAX_PACKET / 2)
        } else {
            (DEFAULT_WINDOW, DEFAULT_MAX_PACKET)
        };
        let id = self.alloc_id();
        self.channels.insert(id.0, Channel::new(id, ChannelKind::Session, window, packet));
        id
    }

    pub fn open_direct_tcp(&mut self) -> ChannelId {
        let id = self.alloc_id();
        self.channels.insert(
            id.0,
            Channel::new(id, ChannelKind::DirectTcp, DEFAULT_WINDOW, DEFAULT_MAX_PACKET),
        );
        id
    }

    /// Bookkeeping only: `thrussh::client::Handle` has no method to open
    /// an actual `tun@openssh.com` channel, so no live session ever calls
    /// this outside tests (see DESIGN.md's tunnel-forwarding entry).
    pub fn open_tun(&mut self) -> ChannelId {
        let id = self.alloc_id();
        self.channels.insert(
            id.0,
            Channel::new(id, ChannelKind::Tun, DEFAULT_WINDOW, DEFAULT_MAX_PACKET),
        );
        id
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id.0)
    }

    pub fn channel_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.get_mut(&id.0)
    }

    pub fn remove(&mut self, id: ChannelId) {
        self.channels.remove(&id.0);
    }

    pub fn open_channel_count(&self) -> usize {
        self.channels
            .values()
            .filter(|c| c.state != ChannelState::Closed)
            .count()
    }

    /// `setup_session`: the fixed sub-request emission order of spec.md
    /// §4.7 — pty-req, x11-req, auth-agent-req, env items, then the
    /// final action.
    #[allow(clippy::too_many_arguments)]
    pub fn setup_session(
        &mut self,
        id: ChannelId,
        want_tty: bool,
        want_x11: bool,
        want_agent_forward: bool,
        env: &[(String, String)],
        action: SessionAction,
    ) {
        let channel = match self.channel_mut(id) {
            Some(c) => c,
            None => return,
        };
        if want_tty {
            channel.pending_requests.push(PendingRequest::PtyReq);
        }
        if want_x11 {
            channel.pending_requests.push(PendingRequest::X11Req);
        }
        if want_agent_forward {
            channel.pending_requests.push(PendingRequest::AuthAgentReq);
        }
        for (k, v) in env {
            channel.pending_requests.push(PendingRequest::Env(k.clone(), v.clone()));
        }
        channel.pending_requests.push(match action {
            SessionAction::Exec(cmd) => PendingRequest::Exec(cmd),
            SessionAction::Subsystem(name) => PendingRequest::Subsystem(name),
            SessionAction::Shell => PendingRequest::Shell,
        });
    }

    /// `setup_local_forward`: registers a listener-backed forward; the
    /// actual bind and per-accept `direct-tcp` channel open happen in
    /// `session.rs`, which owns the live event loop.
    pub fn setup_local_forward(
        &mut self,
        listen_host: Option<String>,
        listen_port: u16,
        connect_host: String,
        connect_port: u16,
    ) -> usize {
        self.forwards.push(ForwardRecord {
            listen_host,
            listen_port,
            connect_host,
            connect_port,
            direction: crate::options::ForwardDirection::Local,
            listener_bound: false,
            remote_confirmed: None,
        });
        self.forwards.len() - 1
    }

    /// `request_remote_forward`: registers a forward and its confirm
    /// callback in the same call, preserving FIFO wire order.
    pub fn request_remote_forward(
        &mut self,
        listen_host: Option<String>,
        listen_port: u16,
        connect_host: String,
        connect_port: u16,
    ) -> usize {
        let idx = self.forwards.len();
        self.forwards.push(ForwardRecord {
            listen_host,
            listen_port,
            connect_host,
            connect_port,
            direction: crate::options::ForwardDirection::Remote,
            listener_bound: false,
            remote_confirmed: None,
        });
        self.confirm_queue.push_back(ConfirmCallback::RemoteForward { forward_index: idx });
        idx
    }

    pub fn register_global_confirm(&mut self, cb: ConfirmCallback) {
        self.confirm_queue.push_back(cb);
    }

    /// Consume the next pending confirm callback in FIFO order, applying
    /// its effect. For a remote-forward confirm with `listen_port == 0`,
    /// `allocated_port` carries the port read back from the success
    /// payload (spec.md §4.7).
    pub fn resolve_next_confirm(&mut self, success: bool, allocated_port: Option<u16>) -> Option<ConfirmCallback> {
        let cb = self.confirm_queue.pop_front()?;
        if let ConfirmCallback::RemoteForward { forward_index } = &cb {
            if let Some(forward) = self.forwards.get_mut(*forward_index) {
                forward.remote_confirmed = Some(success);
                if success && forward.listen_port == 0 {
                    if let Some(port) = allocated_port {
                        forward.listen_port = port;
                    }
                }
            }
        }
        Some(cb)
    }

    pub fn pending_confirms(&self) -> usize {
        self.confirm_queue.len()
    }

    pub fn active_forward_count(&self) -> usize {
        self.forwards
            .iter()
            .filter(|f| f.remote_confirmed != Some(false))
            .count()
    }
}

#[derive(Debug, Clone)]
pub enum SessionAction {
    Exec(String),
    Subsystem(String),
    Shell,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_session_halves_window_for_tty() {
        let mut mux = Multiplexer::new();
        let id = mux.open_session(true);
        let c = mux.channel(id).unwrap();
        assert_eq!(c.local_window, DEFAULT_WINDOW / 2);
        assert_eq!(c.max_packet, DEFAULT_MAX_PACKET / 2);
    }

    #[test]
    fn state_transitions_are_monotone() {
        let mut mux = Multiplexer::new();
        let id = mux.open_session(false);
        let c = mux.channel_mut(id).unwrap();
        assert_eq!(c.state, ChannelState::Opening);
        c.confirm_open(DEFAULT_WINDOW, DEFAULT_MAX_PACKET);
        assert_eq!(c.state, ChannelState::Open);
        c.local_eof();
        assert_eq!(c.state, ChannelState::InputDraining);
        c.close();
        assert_eq!(c.state, ChannelState::Closed);
    }

    #[test]
    #[should_panic]
    fn reopening_a_closed_channel_panics() {
        let mut mux = Multiplexer::new();
        let id = mux.open_session(false);
        let c = mux.channel_mut(id).unwrap();
        c.confirm_open(DEFAULT_WINDOW, DEFAULT_MAX_PACKET);
        c.close();
        c.confirm_open(DEFAULT_WINDOW, DEFAULT_MAX_PACKET);
    }

    #[test]
    fn outbound_never_exceeds_remote_window_budget() {
        let mut mux = Multiplexer::new();
        let id = mux.open_session(false);
        let c = mux.channel_mut(id).unwrap();
        c.confirm_open(100, 40);
        let data = vec![7u8; 250];
        let (chunks, remainder) = c.fragment_outbound(&data);
        let sent: usize = chunks.iter().map(|c| c.len()).sum();
        assert!(sent <= 100);
        assert_eq!(remainder.len(), data.len() - sent);
        assert!(c.flow_blocked);

        c.window_adjusted(200);
        let (chunks2, remainder2) = c.fragment_outbound(remainder);
        let sent2: usize = chunks2.iter().map(|c| c.len()).sum();
        assert_eq!(sent + sent2, data.len());
        assert!(remainder2.is_empty());
    }

    #[test]
    fn incoming_window_replenishes_past_half_threshold() {
        let mut mux = Multiplexer::new();
        let id = mux.open_session(false);
        let c = mux.channel_mut(id).unwrap();
        c.confirm_open(DEFAULT_WINDOW, DEFAULT_MAX_PACKET);
        let starting = c.local_window;
        assert!(c.account_incoming(10, starting).is_none());
        let adjust = c.account_incoming(starting / 2, starting);
        assert!(adjust.is_some());
    }

    #[test]
    fn remote_forward_confirm_allocates_ephemeral_port() {
        let mut mux = Multiplexer::new();
        let idx = mux.request_remote_forward(None, 0, "internal".into(), 80);
        assert_eq!(mux.pending_confirms(), 1);
        let cb = mux.resolve_next_confirm(true, Some(54321)).unwrap();
        match cb {
            ConfirmCallback::RemoteForward { forward_index } => assert_eq!(forward_index, idx),
            _ => panic!("wrong callback kind"),
        }
        assert_eq!(mux.forwards[idx].listen_port, 54321);
        assert_eq!(mux.forwards[idx].remote_confirmed, Some(true));
    }

    #[test]
    fn confirm_queue_is_fifo() {
        let mut mux = Multiplexer::new();
        mux.register_global_confirm(ConfirmCallback::Generic("first".into()));
        mux.register_global_confirm(ConfirmCallback::Generic("second".into()));
        let first = mux.resolve_next_confirm(true, None).unwrap();
        let second = mux.resolve_next_confirm(true, None).unwrap();
        match (first, second) {
            (ConfirmCallback::Generic(a), ConfirmCallback::Generic(b)) => {
                assert_eq!(a, "first");
                assert_eq!(b, "second");
            }
            _ => panic!("wrong callback kinds"),
        }
    }

    #[test]
    fn setup_session_emits_fixed_order() {
        let mut mux = Multiplexer::new();
        let id = mux.open_session(true);
        mux.setup_session(
            id,
            true,
            true,
            true,
            &[("FOO".into(), "bar".into())],
            SessionAction::Shell,
        );
        let c = mux.channel(id).unwrap();
        assert_eq!(
            c.pending_requests,
            vec![
                PendingRequest::PtyReq,
                PendingRequest::X11Req,
                PendingRequest::AuthAgentReq,
                PendingRequest::Env("FOO".into(), "bar".into()),
                PendingRequest::Shell,
            ]
        );
    }
}
