//! Control-plane glue (§4.2, §4.5 step 7): AddDevice/RemoveDevice/
//! DeviceMonitor requests are queued by client command processing and
//! drained by the reactor, so they never run while a client-list lock is
//! held on the calling path.

use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    AddDevice { location: u32, reply_tag: u32, client_id: u32 },
    RemoveDevice { location: u32, reply_tag: u32, client_id: u32 },
    SetDeviceMonitor { location: u32, auto_monitor: bool, reply_tag: u32, client_id: u32 },
}

/// FIFO of deferred control-plane work, owned behind its own mutex per §5.
#[derive(Debug, Default)]
pub struct ControlQueue {
    pending: VecDeque<ControlCommand>,
}

impl ControlQueue {
    pub fn new() -> Self {
        Self { pending: VecDeque::new() }
    }

    pub fn push(&mut self, cmd: ControlCommand) {
        self.pending.push_back(cmd);
    }

    pub fn drain(&mut self) -> Vec<ControlCommand> {
        self.pending.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_empties_queue_in_fifo_order() {
        let mut q = ControlQueue::new();
        q.push(ControlCommand::AddDevice { location: 1, reply_tag: 0, client_id: 0 });
        q.push(ControlCommand::RemoveDevice { location: 2, reply_tag: 0, client_id: 0 });
        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert!(q.is_empty());
        assert_eq!(drained[0], ControlCommand::AddDevice { location: 1, reply_tag: 0, client_id: 0 });
    }
}
