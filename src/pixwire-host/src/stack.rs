//! The plug-in call stack.
//!
//! Every outstanding call into a plug-in is a frame. The top frame names the
//! current plug-in, the one whose next message the scheduler reads. A frame
//! sits below others while the call it stands for waits on nested work.

use crate::process::PluginId;
use std::fmt;

/// Identifies one outstanding wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WaitId(pub(crate) u64);

impl fmt::Display for WaitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wait-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub plugin: PluginId,
    pub wait: WaitId,
}

#[derive(Debug, Default)]
pub struct CallStack {
    frames: Vec<Frame>,
}

impl CallStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, plugin: PluginId, wait: WaitId) {
        self.frames.push(Frame { plugin, wait });
        tracing::debug!(
            plugin = %plugin,
            wait = %wait,
            depth = self.frames.len(),
            "call stack push"
        );
    }

    /// Removes the frame for `wait`, wherever it sits.
    pub fn remove(&mut self, wait: WaitId) -> Option<Frame> {
        let index = self.frames.iter().rposition(|frame| frame.wait == wait)?;
        let frame = self.frames.remove(index);
        tracing::debug!(
            plugin = %frame.plugin,
            wait = %wait,
            depth = self.frames.len(),
            "call stack pop"
        );
        Some(frame)
    }

    pub fn current(&self) -> Option<Frame> {
        self.frames.last().copied()
    }

    pub fn current_plugin(&self) -> Option<PluginId> {
        self.current().map(|frame| frame.plugin)
    }

    /// Most recent frame belonging to `plugin`.
    pub fn top_for(&self, plugin: PluginId) -> Option<Frame> {
        self.frames
            .iter()
            .rev()
            .find(|frame| frame.plugin == plugin)
            .copied()
    }

    pub fn contains(&self, plugin: PluginId) -> bool {
        self.frames.iter().any(|frame| frame.plugin == plugin)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Plug-ins from the bottom of the stack to the top.
    pub fn plugins(&self) -> impl Iterator<Item = PluginId> + '_ {
        self.frames.iter().map(|frame| frame.plugin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_remove_restore_previous_plugin() {
        let mut stack = CallStack::new();
        assert!(stack.current().is_none());
        stack.push(PluginId(1), WaitId(10));
        stack.push(PluginId(2), WaitId(11));
        assert_eq!(stack.current_plugin(), Some(PluginId(2)));

        stack.remove(WaitId(11));
        assert_eq!(stack.current_plugin(), Some(PluginId(1)));
        stack.remove(WaitId(10));
        assert!(stack.is_empty());
    }

    #[test]
    fn frames_can_leave_from_the_middle() {
        let mut stack = CallStack::new();
        stack.push(PluginId(1), WaitId(1));
        stack.push(PluginId(2), WaitId(2));
        stack.push(PluginId(1), WaitId(3));
        assert_eq!(stack.top_for(PluginId(1)).map(|f| f.wait), Some(WaitId(3)));

        assert!(stack.remove(WaitId(2)).is_some());
        assert!(stack.remove(WaitId(2)).is_none());
        assert_eq!(stack.plugins().collect::<Vec<_>>(), vec![PluginId(1), PluginId(1)]);
        assert!(!stack.contains(PluginId(2)));
    }
}
