//! Extension points of the event loop.
//!
//! The multiplexer itself knows nothing about sibling processes. Whatever
//! coordination a deployment needs (an accept lock, a shared connection
//! counter, heartbeats) plugs in through [`LoopHooks`].

/// Called by the loop at fixed points of every iteration.
pub trait LoopHooks {
    /// Asked before each poll; true lets this loop watch the listener.
    fn try_enter_accept(&mut self) -> bool {
        true
    }

    /// Called after the poll whenever `try_enter_accept` returned true.
    fn leave_accept(&mut self) {}

    /// Id for the connection about to be accepted.
    fn next_connection_id(&mut self) -> u64;

    /// Worker this loop runs in, if any.
    fn worker(&self) -> Option<u32> {
        None
    }

    /// Once per iteration with the number of open connections.
    fn tick(&mut self, _open: usize) {}

    /// Once when the loop exits, before remaining connections are closed.
    fn shutdown(&mut self, _open: usize) {}
}

/// Hooks for a loop running on its own: always accepts, counts locally.
#[derive(Debug)]
pub struct StandaloneHooks {
    next_id: u64,
}

impl Default for StandaloneHooks {
    fn default() -> Self {
        Self { next_id: 1 }
    }
}

impl LoopHooks for StandaloneHooks {
    fn next_connection_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}
