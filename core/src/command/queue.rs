// Copyright (c) 2022-2023 The MobileCoin Foundation

use super::PreparedCommand;

/// FIFO of prepared commands, drained on each processing
#[derive(Clone, Debug, Default)]
pub struct CommandQueue {
    commands: Vec<PreparedCommand>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command, parameters must already be validated
    pub fn enqueue(&mut self, cmd: PreparedCommand) {
        log::debug!("enqueue {}", cmd.name());
        self.commands.push(cmd);
    }

    /// Remove and return all commands in enqueue order
    pub fn drain_all(&mut self) -> Vec<PreparedCommand> {
        std::mem::take(&mut self.commands)
    }

    /// Fetch the most recently enqueued command
    pub fn peek_last(&self) -> Option<&PreparedCommand> {
        self.commands.last()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::ReadMode;

    #[test]
    fn fifo_drain() {
        let mut q = CommandQueue::new();

        for n in 1..=5 {
            q.enqueue(PreparedCommand::ReadRecord {
                sfi: 7,
                record_number: n,
                mode: ReadMode::BestEffort,
            });
        }
        q.enqueue(PreparedCommand::CloseSession);

        assert_eq!(q.len(), 6);
        assert_eq!(q.peek_last(), Some(&PreparedCommand::CloseSession));

        let d = q.drain_all();
        assert!(q.is_empty());
        assert_eq!(d.len(), 6);

        for (i, c) in d.iter().take(5).enumerate() {
            match c {
                PreparedCommand::ReadRecord { record_number, .. } => {
                    assert_eq!(*record_number as usize, i + 1)
                }
                _ => panic!("unexpected command {:?}", c),
            }
        }

        assert!(q.drain_all().is_empty());
    }
}
