use std::collections::VecDeque;

/// Commands submitted before an external dependency reports ready are held
/// here and handed back, oldest first, the moment it does.
///
/// Pending --open()--> Ready. There is no way back: once open, every
/// submission runs straight away.
#[derive(Debug)]
pub struct ReadyGate<T> {
    state: GateState<T>,
}

#[derive(Debug)]
enum GateState<T> {
    Pending(VecDeque<T>),
    Ready,
}

/// What the caller should do with a submitted command
#[derive(Debug, PartialEq, Eq)]
pub enum Submission<T> {
    /// Gate is open: execute now
    Run(T),
    /// Buffered until the gate opens
    Queued { position: usize },
}

impl<T> ReadyGate<T> {
    pub fn pending() -> Self {
        Self { state: GateState::Pending(VecDeque::new()) }
    }

    pub fn ready() -> Self {
        Self { state: GateState::Ready }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, GateState::Ready)
    }

    pub fn queued(&self) -> usize {
        match &self.state {
            GateState::Pending(queue) => queue.len(),
            GateState::Ready => 0,
        }
    }

    pub fn submit(&mut self, command: T) -> Submission<T> {
        match &mut self.state {
            GateState::Pending(queue) => {
                queue.push_back(command);
                Submission::Queued { position: queue.len() }
            }
            GateState::Ready => Submission::Run(command),
        }
    }

    /// Opens the gate and drains the buffer in submission order. Only the
    /// first call returns anything.
    pub fn open(&mut self) -> Vec<T> {
        match std::mem::replace(&mut self.state, GateState::Ready) {
            GateState::Pending(queue) => queue.into(),
            GateState::Ready => Vec::new(),
        }
    }
}
