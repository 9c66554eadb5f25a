//! The system graph: a forest of simulation systems.
//!
//! Systems are declared as a tree of [`SystemDecl`]s and flattened
//! depth-first when the graph is built. The flattened position is the
//! system's [`SystemId`], fixed for the whole session. A system's enabled
//! bit lives in the frame, not on the node, so enablement rolls back with
//! the rest of the state.
//!
//! A system is *effectively* enabled only when its own bit and the bit of
//! every ancestor are set. `on_enabled` / `on_disabled` fire exactly when
//! the effective state changes.
//!
//! Scheduling walks the roots in declaration order. Each system runs inside
//! its own failure boundary: an `Err` is logged, the tasks it added are
//! discarded, and scheduling continues with the next system.

use std::any::Any;

use log::warn;

use crate::config::ConfigError;
use crate::entity::EntityError;
use crate::frame::{Frame, SystemBits};
use crate::heap::HeapError;
use crate::id::SystemId;
use crate::signal::{Signal, SignalRegistrar, SignalTable};
use crate::task::{TaskError, TaskHandle, TaskScheduler};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SystemError {
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Entity(#[from] EntityError),
    #[error(transparent)]
    Heap(#[from] HeapError),
}

impl SystemError {
    pub fn failed(msg: impl std::fmt::Display) -> Self {
        SystemError::Failed(msg.to_string())
    }
}

impl From<bitcode::Error> for SystemError {
    fn from(e: bitcode::Error) -> Self {
        SystemError::Failed(format!("event encoding failed: {e}"))
    }
}

// ---------------------------------------------------------------------------
// System trait
// ---------------------------------------------------------------------------

/// Downcasting support for [`System`] trait objects.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A unit of simulation logic.
///
/// Every callback returns a `Result`; an `Err` is logged and the system
/// contributes nothing for that call.
pub trait System: AsAny {
    fn name(&self) -> &str;

    /// Own enabled bit on a fresh session.
    fn enabled_at_start(&self) -> bool {
        true
    }

    /// Called once when the session starts, before the first tick. This is
    /// where task units are registered.
    fn on_init(
        &mut self,
        _frame: &mut Frame,
        _tasks: &mut dyn TaskScheduler,
    ) -> Result<(), SystemError> {
        Ok(())
    }

    fn on_enabled(&mut self, _frame: &mut Frame) -> Result<(), SystemError> {
        Ok(())
    }

    fn on_disabled(&mut self, _frame: &mut Frame) -> Result<(), SystemError> {
        Ok(())
    }

    /// Enqueue this tick's work after `incoming` and return the handle the
    /// next system should depend on.
    fn schedule(
        &mut self,
        _frame: &Frame,
        _tasks: &mut dyn TaskScheduler,
        incoming: TaskHandle,
    ) -> Result<TaskHandle, SystemError> {
        Ok(incoming)
    }

    /// Connect signal handlers. Called once when the graph is built.
    fn subscribe(&self, _signals: &mut SignalRegistrar<'_>) {}
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

/// A node of the declared system tree.
pub enum SystemDecl {
    System(Box<dyn System>),
    Group(SystemGroup),
}

impl SystemDecl {
    pub fn system(system: impl System) -> Self {
        SystemDecl::System(Box::new(system))
    }
}

impl From<SystemGroup> for SystemDecl {
    fn from(group: SystemGroup) -> Self {
        SystemDecl::Group(group)
    }
}

/// A composite node scheduling its enabled children in declaration order.
pub struct SystemGroup {
    name: String,
    enabled_at_start: bool,
    children: Vec<SystemDecl>,
}

impl SystemGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled_at_start: true,
            children: Vec::new(),
        }
    }

    pub fn with(mut self, child: impl System) -> Self {
        self.children.push(SystemDecl::system(child));
        self
    }

    pub fn with_group(mut self, group: SystemGroup) -> Self {
        self.children.push(SystemDecl::Group(group));
        self
    }

    pub fn disabled_at_start(mut self) -> Self {
        self.enabled_at_start = false;
        self
    }
}

// ---------------------------------------------------------------------------
// SystemGraph
// ---------------------------------------------------------------------------

enum NodeKind {
    Leaf(Box<dyn System>),
    Group,
}

struct SystemNode {
    name: String,
    parent: Option<SystemId>,
    children: Vec<SystemId>,
    /// One past the last descendant in flattened order.
    subtree_end: usize,
    enabled_at_start: bool,
    kind: NodeKind,
}

/// A system that failed inside its own failure boundary this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemFailure {
    pub system: SystemId,
    pub name: String,
    pub error: SystemError,
}

/// The flattened system forest plus its signal table.
pub struct SystemGraph {
    nodes: Vec<SystemNode>,
    roots: Vec<SystemId>,
    signals: SignalTable,
}

fn enabled_in_hierarchy(nodes: &[SystemNode], bits: &SystemBits, id: SystemId) -> bool {
    let mut current = Some(id);
    while let Some(c) = current {
        if !bits.get(c) {
            return false;
        }
        current = nodes.get(c.index()).and_then(|n| n.parent);
    }
    true
}

impl SystemGraph {
    pub fn build(decls: Vec<SystemDecl>) -> Result<Self, ConfigError> {
        let mut graph = Self {
            nodes: Vec::new(),
            roots: Vec::new(),
            signals: SignalTable::default(),
        };
        for decl in decls {
            let id = graph.flatten(decl, None);
            graph.roots.push(id);
        }
        if graph.nodes.len() > u16::MAX as usize {
            return Err(ConfigError::TooManySystems(graph.nodes.len()));
        }
        for (i, node) in graph.nodes.iter().enumerate() {
            if let NodeKind::Leaf(system) = &node.kind {
                let mut registrar = SignalRegistrar::new(&mut graph.signals, SystemId(i as u16));
                system.subscribe(&mut registrar);
            }
        }
        Ok(graph)
    }

    fn flatten(&mut self, decl: SystemDecl, parent: Option<SystemId>) -> SystemId {
        let id = SystemId(self.nodes.len() as u16);
        let (name, enabled_at_start, kind, children) = match decl {
            SystemDecl::System(system) => (
                system.name().to_string(),
                system.enabled_at_start(),
                NodeKind::Leaf(system),
                Vec::new(),
            ),
            SystemDecl::Group(group) => (
                group.name,
                group.enabled_at_start,
                NodeKind::Group,
                group.children,
            ),
        };
        self.nodes.push(SystemNode {
            name,
            parent,
            children: Vec::new(),
            subtree_end: 0,
            enabled_at_start,
            kind,
        });
        for child in children {
            let child_id = self.flatten(child, Some(id));
            self.nodes[id.index()].children.push(child_id);
        }
        self.nodes[id.index()].subtree_end = self.nodes.len();
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> &[SystemId] {
        &self.roots
    }

    pub fn name(&self, id: SystemId) -> Option<&str> {
        self.nodes.get(id.index()).map(|n| n.name.as_str())
    }

    pub fn parent(&self, id: SystemId) -> Option<SystemId> {
        self.nodes.get(id.index())?.parent
    }

    pub fn children(&self, id: SystemId) -> &[SystemId] {
        self.nodes.get(id.index()).map_or(&[], |n| n.children.as_slice())
    }

    pub fn find(&self, name: &str) -> Option<SystemId> {
        self.nodes
            .iter()
            .position(|n| n.name == name)
            .map(|i| SystemId(i as u16))
    }

    /// Typed access to a leaf system.
    pub fn get<T: System>(&self, id: SystemId) -> Option<&T> {
        match &self.nodes.get(id.index())?.kind {
            NodeKind::Leaf(system) => system.as_ref().as_any().downcast_ref(),
            NodeKind::Group => None,
        }
    }

    pub fn get_mut<T: System>(&mut self, id: SystemId) -> Option<&mut T> {
        match &mut self.nodes.get_mut(id.index())?.kind {
            NodeKind::Leaf(system) => system.as_mut().as_any_mut().downcast_mut(),
            NodeKind::Group => None,
        }
    }

    pub fn signals(&self) -> &SignalTable {
        &self.signals
    }

    // -- Enablement --

    /// Apply every node's start-of-session enabled bit to `frame`.
    pub fn apply_initial_bits(&self, frame: &mut Frame) {
        for (i, node) in self.nodes.iter().enumerate() {
            frame
                .system_bits_mut()
                .set(SystemId(i as u16), node.enabled_at_start);
        }
    }

    pub fn is_enabled(&self, frame: &Frame, id: SystemId) -> bool {
        frame.system_bits().get(id)
    }

    pub fn is_enabled_in_hierarchy(&self, frame: &Frame, id: SystemId) -> bool {
        id.index() < self.nodes.len() && enabled_in_hierarchy(&self.nodes, frame.system_bits(), id)
    }

    /// Set a system's own bit. Returns whether the effective enablement of
    /// any system changed.
    pub fn set_enabled(&mut self, frame: &mut Frame, id: SystemId, enabled: bool) -> bool {
        let Some(node) = self.nodes.get(id.index()) else {
            return false;
        };
        if frame.system_bits().get(id) == enabled {
            return false;
        }
        let subtree = id.index()..node.subtree_end;
        let before: Vec<bool> = subtree
            .clone()
            .map(|i| enabled_in_hierarchy(&self.nodes, frame.system_bits(), SystemId(i as u16)))
            .collect();
        frame.system_bits_mut().set(id, enabled);
        let changed: Vec<SystemId> = subtree
            .zip(before)
            .filter(|&(i, was)| {
                enabled_in_hierarchy(&self.nodes, frame.system_bits(), SystemId(i as u16)) != was
            })
            .map(|(i, _)| SystemId(i as u16))
            .collect();

        // Parents hear about enabling first, children about disabling first.
        if enabled {
            for &c in &changed {
                self.notify(frame, c, true);
            }
        } else {
            for &c in changed.iter().rev() {
                self.notify(frame, c, false);
            }
        }
        !changed.is_empty()
    }

    fn notify(&mut self, frame: &mut Frame, id: SystemId, enabled: bool) {
        let node = &mut self.nodes[id.index()];
        let NodeKind::Leaf(system) = &mut node.kind else {
            return;
        };
        let result = if enabled {
            system.on_enabled(frame)
        } else {
            system.on_disabled(frame)
        };
        if let Err(e) = result {
            let which = if enabled { "on_enabled" } else { "on_disabled" };
            warn!("system {} failed in {which}: {e}", node.name);
        }
    }

    // -- Lifecycle --

    /// Run `on_init` for every system, then `on_enabled` for those enabled
    /// in hierarchy. Failures are logged and returned.
    pub fn init(&mut self, frame: &mut Frame, tasks: &mut dyn TaskScheduler) -> Vec<SystemFailure> {
        let mut failures = Vec::new();
        for (i, node) in self.nodes.iter_mut().enumerate() {
            if let NodeKind::Leaf(system) = &mut node.kind
                && let Err(error) = system.on_init(frame, tasks)
            {
                warn!("system {} failed in on_init: {error}", node.name);
                failures.push(SystemFailure {
                    system: SystemId(i as u16),
                    name: node.name.clone(),
                    error,
                });
            }
        }
        for i in 0..self.nodes.len() {
            let id = SystemId(i as u16);
            if enabled_in_hierarchy(&self.nodes, frame.system_bits(), id) {
                self.notify(frame, id, true);
            }
        }
        failures
    }

    /// Schedule every effectively enabled system, roots in declaration
    /// order, threading the task handle through.
    pub fn schedule(&mut self, frame: &Frame, tasks: &mut dyn TaskScheduler) -> Vec<SystemFailure> {
        let mut failures = Vec::new();
        let mut handle = TaskHandle::NONE;
        for r in 0..self.roots.len() {
            let root = self.roots[r];
            handle = self.schedule_node(root, frame, tasks, handle, &mut failures);
        }
        failures
    }

    fn schedule_node(
        &mut self,
        id: SystemId,
        frame: &Frame,
        tasks: &mut dyn TaskScheduler,
        incoming: TaskHandle,
        failures: &mut Vec<SystemFailure>,
    ) -> TaskHandle {
        if !frame.system_bits().get(id) {
            return incoming;
        }
        let node = &mut self.nodes[id.index()];
        match &mut node.kind {
            NodeKind::Leaf(system) => {
                let mark = tasks.pending_tasks();
                match system.schedule(frame, tasks, incoming) {
                    Ok(handle) => handle,
                    Err(error) => {
                        tasks.discard_tasks_after(mark);
                        warn!(
                            "system {} failed to schedule tick {}: {error}",
                            node.name,
                            frame.tick()
                        );
                        failures.push(SystemFailure {
                            system: id,
                            name: node.name.clone(),
                            error,
                        });
                        incoming
                    }
                }
            }
            NodeKind::Group => {
                let mut handle = incoming;
                for c in 0..self.nodes[id.index()].children.len() {
                    let child = self.nodes[id.index()].children[c];
                    handle = self.schedule_node(child, frame, tasks, handle, failures);
                }
                handle
            }
        }
    }

    // -- Signals --

    /// Invoke signal `S` on every subscriber enabled in hierarchy, in
    /// declaration order. Returns how many handlers ran.
    pub fn signal<S: Signal>(&mut self, frame: &mut Frame, payload: &S::Payload) -> usize {
        let Some(subscribers) = self.signals.subscribers::<S>() else {
            return 0;
        };
        let mut invoked = 0;
        for (id, trampoline) in &subscribers.entries {
            if !enabled_in_hierarchy(&self.nodes, frame.system_bits(), *id) {
                continue;
            }
            let node = &mut self.nodes[id.index()];
            if let NodeKind::Leaf(system) = &mut node.kind {
                invoked += 1;
                if let Err(e) = trampoline(system.as_mut(), frame, payload) {
                    warn!("system {} failed handling signal: {e}", node.name);
                }
            }
        }
        invoked
    }
}

impl std::fmt::Debug for SystemGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemGraph")
            .field("systems", &self.nodes.iter().map(|n| &n.name).collect::<Vec<_>>())
            .field("roots", &self.roots)
            .field("signals", &self.signals)
            .finish()
    }
}
