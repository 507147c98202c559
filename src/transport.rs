//! Point-to-point links between a task and the tasks it sends requests to.
//!
//! Every message carries the id of the sending task, which the receiving end checks against
//! the peer the link was built for.

use crate::buffer::TransferBuffer;
use crate::error::{Error, Result};
use crate::stride::RecursionScheme;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::collections::BTreeMap;
use std::time::Duration;

/// Outstanding messages per direction; a parent never has more than one request in flight
/// per child task.
const LINK_CAPACITY: usize = 4;

#[derive(Debug)]
pub struct Packet {
    pub from: u16,
    pub buffer: TransferBuffer,
}

#[derive(Debug)]
pub struct TaskLink {
    local: u16,
    peer: u16,
    tx: Sender<Packet>,
    rx: Receiver<Packet>,
    timeout: Option<Duration>,
}

impl TaskLink {
    /// Both ends of a link between tasks `a` and `b`.
    pub fn pair(a: u16, b: u16, timeout: Option<Duration>) -> (TaskLink, TaskLink) {
        let (a_tx, b_rx) = bounded(LINK_CAPACITY);
        let (b_tx, a_rx) = bounded(LINK_CAPACITY);
        (
            TaskLink {
                local: a,
                peer: b,
                tx: a_tx,
                rx: a_rx,
                timeout,
            },
            TaskLink {
                local: b,
                peer: a,
                tx: b_tx,
                rx: b_rx,
                timeout,
            },
        )
    }

    pub fn peer(&self) -> u16 {
        self.peer
    }

    pub fn send(&self, buffer: TransferBuffer) -> Result<()> {
        self.tx
            .send(Packet {
                from: self.local,
                buffer,
            })
            .map_err(|_| Error::Transport(format!("task {} hung up", self.peer)))
    }

    fn check(&self, packet: Packet) -> Result<TransferBuffer> {
        if packet.from != self.peer {
            return Err(Error::Transport(format!(
                "message from task {} on the link to task {}",
                packet.from, self.peer
            )));
        }
        Ok(packet.buffer)
    }

    /// Waits for a reply, at most the configured reply timeout.
    pub fn recv(&self) -> Result<TransferBuffer> {
        let packet = match self.timeout {
            Some(timeout) => self.rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => {
                    Error::Transport(format!("no reply from task {} within {timeout:?}", self.peer))
                }
                RecvTimeoutError::Disconnected => Error::Transport(format!("task {} hung up", self.peer)),
            })?,
            None => self
                .rx
                .recv()
                .map_err(|_| Error::Transport(format!("task {} hung up", self.peer)))?,
        };
        self.check(packet)
    }

    /// Waits for the next request without a time limit.
    pub fn recv_request(&self) -> Result<TransferBuffer> {
        let packet = self
            .rx
            .recv()
            .map_err(|_| Error::Transport(format!("task {} hung up", self.peer)))?;
        self.check(packet)
    }
}

/// Links of one task: to the task it receives requests from and to the tasks it sends
/// requests to.
#[derive(Debug, Default)]
pub struct TaskLinks {
    pub parent: Option<TaskLink>,
    pub children: BTreeMap<u16, TaskLink>,
}

/// Links for every task of the recursion, indexed by task id.
pub fn build_network(scheme: &RecursionScheme, timeout: Option<Duration>) -> Vec<TaskLinks> {
    let mut network: Vec<TaskLinks> = (0..scheme.nb_tasks()).map(|_| TaskLinks::default()).collect();
    for task in 1..scheme.nb_tasks() {
        if let Some(parent) = scheme.parent_task(task) {
            let (down, up) = TaskLink::pair(parent, task, timeout);
            network[parent as usize].children.insert(task, down);
            network[task as usize].parent = Some(up);
        }
    }
    network
}
