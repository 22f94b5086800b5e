//! Level-triggered epoll demultiplexer and its descriptor table.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use tracing::{error, trace};

use crate::channel::{Channel, Interest, PollerState, Ready};
use crate::time::Timestamp;

const INITIAL_EVENT_LIST_SIZE: usize = 16;

fn zeroed_event() -> libc::epoll_event {
    libc::epoll_event { events: 0, u64: 0 }
}

fn epoll_bits(interest: Interest) -> u32 {
    let mut bits = 0u32;
    if interest.contains(Interest::READABLE) {
        bits |= (libc::EPOLLIN | libc::EPOLLPRI) as u32;
    }
    if interest.contains(Interest::WRITABLE) {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

fn ready_from_bits(bits: u32) -> Ready {
    let mut ready = Ready::empty();
    if bits & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32 != 0 {
        ready |= Ready::READABLE;
    }
    if bits & libc::EPOLLOUT as u32 != 0 {
        ready |= Ready::WRITABLE;
    }
    if bits & libc::EPOLLERR as u32 != 0 {
        ready |= Ready::ERROR;
    }
    if bits & libc::EPOLLHUP as u32 != 0 {
        ready |= Ready::HANGUP;
    }
    ready
}

/// The OS readiness oracle for one event loop.
///
/// Owns the epoll instance and the fd-to-channel table. Every descriptor
/// the kernel knows about through this loop has an entry here; an entry
/// whose interest went empty stays in the table (OS-deleted) so it can be
/// cheaply re-armed. All calls happen on the owning loop's thread.
pub(crate) struct Poller {
    epoll: OwnedFd,
    channels: HashMap<i32, Arc<Channel>>,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            channels: HashMap::new(),
            events: vec![zeroed_event(); INITIAL_EVENT_LIST_SIZE],
        })
    }

    /// Block for up to `timeout_ms` and collect ready channels into
    /// `active`, stamping each with its reported readiness. Returns the
    /// wall-clock time at which the wait returned.
    pub(crate) fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Timestamp {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let now = Timestamp::now();

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                error!(%err, "epoll_wait failed");
            }
            return now;
        }

        let n = n as usize;
        if n > 0 {
            trace!(events = n, "poll returned");
        }
        for event in &self.events[..n] {
            let fd = event.u64 as i32;
            if let Some(channel) = self.channels.get(&fd) {
                channel.set_ready(ready_from_bits(event.events));
                active.push(channel.clone());
            }
        }
        // a full event list means there may be more; give the next wait
        // more room
        if n == self.events.len() {
            self.events.resize(n * 2, zeroed_event());
        }
        now
    }

    /// Synchronize a channel's interest mask with the kernel.
    pub(crate) fn update_channel(&mut self, channel: &Arc<Channel>) {
        let state = channel.poller_state();
        trace!(fd = channel.fd(), ?state, interest = ?channel.interest(), "update channel");
        match state {
            PollerState::New | PollerState::Deleted => {
                if state == PollerState::New {
                    self.channels.insert(channel.fd(), channel.clone());
                } else {
                    debug_assert!(self.channels.contains_key(&channel.fd()));
                }
                channel.set_poller_state(PollerState::Added);
                self.ctl(libc::EPOLL_CTL_ADD, channel);
            }
            PollerState::Added => {
                if channel.interest().is_empty() {
                    self.ctl(libc::EPOLL_CTL_DEL, channel);
                    channel.set_poller_state(PollerState::Deleted);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    /// Drop a channel from the table and, if armed, from the kernel.
    pub(crate) fn remove_channel(&mut self, channel: &Arc<Channel>) {
        if self.channels.remove(&channel.fd()).is_none() {
            return;
        }
        if channel.poller_state() == PollerState::Added {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_poller_state(PollerState::New);
    }

    pub(crate) fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|entry| Arc::ptr_eq(entry, channel))
    }

    fn ctl(&self, op: libc::c_int, channel: &Arc<Channel>) {
        let mut event = libc::epoll_event {
            events: epoll_bits(channel.interest()),
            u64: channel.fd() as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, channel.fd(), &mut event) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                error!(fd = channel.fd(), %err, "epoll_ctl del failed");
            } else {
                panic!("epoll_ctl op {} failed for fd {}: {}", op, channel.fd(), err);
            }
        }
    }
}
