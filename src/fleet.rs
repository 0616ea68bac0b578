use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::queue::item::ItemView;
use crate::task::CauseOfBlockage;
use crate::work::WorkUnit;

/// Name of the node hosting the controller itself.
pub const CONTROLLER_NODE: &str = "built-in";

/// A label restricting where an item may run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label(pub String);

impl Label {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// A label matches a node that carries it, or whose name it names.
    pub fn matches(&self, node: &Node) -> bool {
        node.name == self.0 || node.labels.contains(self)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMode {
    /// Takes any item it is able to run.
    Normal,
    /// Only takes items whose assigned label ties them to this node.
    Exclusive,
}

/// Static description of a machine in the fleet.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub labels: BTreeSet<Label>,
    pub num_executors: u32,
    pub mode: NodeMode,
}

impl Node {
    pub fn new(name: impl Into<String>, num_executors: u32) -> Self {
        Self {
            name: name.into(),
            labels: BTreeSet::new(),
            num_executors,
            mode: NodeMode::Normal,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(Label::new(label));
        self
    }

    pub fn with_mode(mut self, mode: NodeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Whether this node is able to run the given item; `None` means yes.
    pub fn can_take(&self, item: &ItemView<'_>) -> Option<CauseOfBlockage> {
        match item.assigned_label() {
            Some(label) => {
                if !label.matches(self) {
                    return Some(CauseOfBlockage::NodeLabelMismatch {
                        node: self.name.clone(),
                    });
                }
            }
            None => {
                if self.mode == NodeMode::Exclusive {
                    return Some(CauseOfBlockage::ExclusiveNode {
                        node: self.name.clone(),
                    });
                }
            }
        }
        None
    }
}

/// Runtime state of a node: connectivity and the flyweight intake.
#[derive(Debug)]
pub struct Computer {
    node_name: String,
    online: AtomicBool,
    accepting_tasks: AtomicBool,
    flyweight_intake: Mutex<Vec<Arc<WorkUnit>>>,
}

impl Computer {
    fn new(node_name: String) -> Self {
        Self {
            node_name,
            online: AtomicBool::new(true),
            accepting_tasks: AtomicBool::new(true),
            flyweight_intake: Mutex::new(Vec::new()),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        tracing::info!(node = %self.node_name, online, "computer connectivity changed");
    }

    pub fn is_accepting_tasks(&self) -> bool {
        self.accepting_tasks.load(Ordering::SeqCst)
    }

    pub fn set_accepting_tasks(&self, accepting: bool) {
        self.accepting_tasks.store(accepting, Ordering::SeqCst);
    }

    /// Hand a flyweight work unit to this computer. The embedding
    /// application drains the intake and runs each unit on a one-off
    /// executor.
    pub fn start_flyweight(&self, unit: Arc<WorkUnit>) {
        tracing::debug!(
            node = %self.node_name,
            context = %unit.context().id(),
            "flyweight work unit placed"
        );
        self.flyweight_intake.lock().push(unit);
    }

    pub fn take_flyweights(&self) -> Vec<Arc<WorkUnit>> {
        std::mem::take(&mut *self.flyweight_intake.lock())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    Normal,
    /// Spawned for a single preassigned work unit (flyweight pickup).
    OneOff,
}

/// An executor slot on some computer. The scheduler only observes these;
/// their threads/tasks live in the worker module or the embedding app.
#[derive(Debug)]
pub struct Executor {
    id: u64,
    computer: Arc<Computer>,
    kind: ExecutorKind,
    preassigned: Mutex<Option<Arc<WorkUnit>>>,
}

impl Executor {
    pub fn new(id: u64, computer: Arc<Computer>) -> Self {
        Self {
            id,
            computer,
            kind: ExecutorKind::Normal,
            preassigned: Mutex::new(None),
        }
    }

    pub fn one_off(id: u64, computer: Arc<Computer>, unit: Arc<WorkUnit>) -> Self {
        Self {
            id,
            computer,
            kind: ExecutorKind::OneOff,
            preassigned: Mutex::new(Some(unit)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn computer(&self) -> &Arc<Computer> {
        &self.computer
    }

    pub fn kind(&self) -> ExecutorKind {
        self.kind
    }

    pub(crate) fn take_preassigned(&self) -> Option<Arc<WorkUnit>> {
        self.preassigned.lock().take()
    }
}

/// The controller's view of every node it may place work on.
///
/// The controller node is always present; agents register further nodes as
/// they join. The quiescing flag pauses flyweight placement for everything
/// except non-blocking tasks.
#[derive(Debug)]
pub struct Fleet {
    nodes: RwLock<Vec<Arc<Node>>>,
    computers: RwLock<HashMap<String, Arc<Computer>>>,
    quiescing: AtomicBool,
}

impl Fleet {
    pub fn new(controller_executors: u32) -> Self {
        let controller = Arc::new(Node::new(CONTROLLER_NODE, controller_executors));
        let mut computers = HashMap::new();
        computers.insert(
            controller.name.clone(),
            Arc::new(Computer::new(controller.name.clone())),
        );
        Self {
            nodes: RwLock::new(vec![controller]),
            computers: RwLock::new(computers),
            quiescing: AtomicBool::new(false),
        }
    }

    pub fn add_node(&self, node: Node) -> Arc<Computer> {
        let node = Arc::new(node);
        let computer = Arc::new(Computer::new(node.name.clone()));
        self.nodes.write().push(node.clone());
        self.computers
            .write()
            .insert(node.name.clone(), computer.clone());
        tracing::info!(node = %node.name, executors = node.num_executors, "node joined the fleet");
        computer
    }

    pub fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.read().iter().find(|n| n.name == name).cloned()
    }

    pub fn computer(&self, name: &str) -> Option<Arc<Computer>> {
        self.computers.read().get(name).cloned()
    }

    /// Every node, controller first.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().clone()
    }

    /// Nodes that currently carry the label, and whether any of them is online.
    pub fn label_has_online_node(&self, label: &Label) -> bool {
        let computers = self.computers.read();
        self.nodes
            .read()
            .iter()
            .filter(|n| label.matches(n))
            .any(|n| computers.get(&n.name).is_some_and(|c| c.is_online()))
    }

    pub fn is_quiescing(&self) -> bool {
        self.quiescing.load(Ordering::SeqCst)
    }

    pub fn set_quiescing(&self, quiescing: bool) {
        self.quiescing.store(quiescing, Ordering::SeqCst);
        tracing::info!(quiescing, "controller quiescing flag changed");
    }
}
