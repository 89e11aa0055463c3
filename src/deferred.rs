/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use crate::inetaddress::InetAddress;

const QUEUE_CAPACITY: usize = 256;

pub(crate) struct DeferredWirePacket {
    pub local: InetAddress,
    pub remote: InetAddress,
    pub data: Vec<u8>,
}

/// Hand-off queue moving packet decryption and dispatch onto host worker
/// threads.
///
/// The ingress path enqueues raw datagrams when deferral is enabled and the
/// queue has room; otherwise it processes them inline, so a stalled worker
/// pool degrades to foreground processing instead of dropping traffic.
/// Workers block in `wait_and_pop` until work arrives or shutdown is set.
pub struct DeferredPackets {
    queue: Mutex<VecDeque<DeferredWirePacket>>,
    cond: Condvar,
    enabled: AtomicBool,
    die: AtomicBool,
}

impl DeferredPackets {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            enabled: AtomicBool::new(false),
            die: AtomicBool::new(false),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.cond.notify_all();
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && !self.die.load(Ordering::SeqCst)
    }

    /// Try to defer a packet. False means the caller must process it inline.
    pub(crate) fn enqueue(&self, p: DeferredWirePacket) -> bool {
        if !self.enabled() {
            return false;
        }
        let mut q = self.queue.lock().unwrap();
        if q.len() >= QUEUE_CAPACITY {
            return false;
        }
        q.push_back(p);
        drop(q);
        self.cond.notify_one();
        true
    }

    /// Block until a packet is available or shutdown. None means the worker
    /// should exit its loop.
    pub(crate) fn wait_and_pop(&self) -> Option<DeferredWirePacket> {
        let mut q = self.queue.lock().unwrap();
        loop {
            if self.die.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(p) = q.pop_front() {
                return Some(p);
            }
            q = self.cond.wait(q).unwrap();
        }
    }

    pub fn shutdown(&self) {
        self.die.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }
}

impl Default for DeferredPackets {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(n: u8) -> DeferredWirePacket {
        DeferredWirePacket { local: InetAddress::Nil, remote: InetAddress::Nil, data: vec![n] }
    }

    #[test]
    fn disabled_queue_rejects() {
        let dp = DeferredPackets::new();
        assert!(!dp.enqueue(pkt(1)));
        dp.set_enabled(true);
        assert!(dp.enqueue(pkt(2)));
        assert_eq!(dp.wait_and_pop().unwrap().data, vec![2]);
    }

    #[test]
    fn shutdown_wakes_blocked_workers() {
        use std::sync::Arc;
        let dp = Arc::new(DeferredPackets::new());
        dp.set_enabled(true);
        let dp2 = dp.clone();
        let h = std::thread::spawn(move || dp2.wait_and_pop().is_none());
        std::thread::sleep(std::time::Duration::from_millis(50));
        dp.shutdown();
        assert!(h.join().unwrap());
        assert!(!dp.enqueue(pkt(1)));
    }

    #[test]
    fn fifo_order() {
        let dp = DeferredPackets::new();
        dp.set_enabled(true);
        for i in 0..5 {
            assert!(dp.enqueue(pkt(i)));
        }
        for i in 0..5 {
            assert_eq!(dp.wait_and_pop().unwrap().data, vec![i]);
        }
    }
}
