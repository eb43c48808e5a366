//! Pending queue: commands written to the wire and still awaiting a reply.
//!
//! The server answers in request order and no correlation id goes over
//! the wire, so the Nth reply always belongs to the Nth outstanding
//! command. That holds only while queue order equals write order: a
//! command is pushed exactly when its frame is appended to the outbound
//! buffer and popped exactly when its reply (or a fault) resolves it.

use std::collections::VecDeque;

use crate::command::Command;
use crate::error::Error;

/// FIFO of in-flight commands for one connection.
#[derive(Debug, Default)]
pub struct PendingQueue {
    commands: VecDeque<Command>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a command whose request frame was just written out.
    pub fn push(&mut self, command: Command) {
        self.commands.push_back(command);
    }

    /// Take the oldest outstanding command.
    pub fn pop(&mut self) -> Option<Command> {
        self.commands.pop_front()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Fail every outstanding command with `err`, oldest first.
    ///
    /// Returns the number of commands failed.
    pub fn fail_all(&mut self, err: &Error) -> usize {
        let count = self.commands.len();
        for command in self.commands.drain(..) {
            command.fail(err.clone());
        }
        count
    }
}
