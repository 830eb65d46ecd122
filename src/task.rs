//! Helpers and objects for building task trees.
//!
//! A load test describes the behavior of its virtual users with a tree of tasks:
//!
//! - A [`TaskNode`] is either a "section" (a named grouping with no function of its own)
//!   or a "task" (a node with an async function that is executed and timed).
//! - A [`TaskTree`] is the validated, immutable form of a task hierarchy that all
//!   [`VirtualUser`](../user/struct.VirtualUser.html)s share while a load test runs.
//!
//! ## Creating Tasks
//!
//! A task wraps an async function which accepts a mutable reference to the
//! [`VirtualUser`](../user/struct.VirtualUser.html) running it:
//!
//! ```rust
//! use loadtree::prelude::*;
//!
//! let view = task!(view_profile).set_name("view").set_weight(10);
//!
//! async fn view_profile(user: &mut VirtualUser) -> TaskResult {
//!     user.storage.set("last_viewed", user.id);
//!     Ok(())
//! }
//! ```
//!
//! ## Creating Sections
//!
//! Sections group tasks. When a user steps into a section, it selects the next task
//! from the section's children, according to the section's [`SelectionStrategy`]. Now
//! and then the user steps back out to the parent, as controlled by the section's
//! step-out weight.
//!
//! ```rust
//! use loadtree::prelude::*;
//!
//! let entry = TaskNode::entry("MyProject").register_section("profile", |profile| {
//!     profile
//!         .register_task(task!(view).set_name("view").set_weight(10))
//!         .register_task(task!(edit).set_name("edit").set_weight(1))
//! });
//! let tree = TaskTree::build(entry).unwrap();
//! assert_eq!(tree.len(), 4);
//!
//! async fn view(_user: &mut VirtualUser) -> TaskResult {
//!     Ok(())
//! }
//!
//! async fn edit(_user: &mut VirtualUser) -> TaskResult {
//!     Err("profile is locked".into())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::{fmt, future::Future, io, pin::Pin};

use crate::user::{StorageError, VirtualUser};
use crate::LoadTestError;

/// `task!(foo)` expands to `TaskNode::new(foo)`, boxing the returned future to work
/// around a limitation in the compiler.
#[macro_export]
macro_rules! task {
    ($task_func:ident) => {
        $crate::task::TaskNode::new(std::sync::Arc::new(move |s| {
            std::boxed::Box::pin($task_func(s))
        }))
    };
}

/// The function executed each time a task runs.
pub type TaskFunction = Arc<
    dyn for<'r> Fn(&'r mut VirtualUser) -> Pin<Box<dyn Future<Output = TaskResult> + Send + 'r>>
        + Send
        + Sync,
>;

/// The result returned by every task function.
pub type TaskResult = Result<(), TaskError>;

/// Identifies a node within a [`TaskTree`].
pub type NodeId = usize;

/// An enumeration of all errors a task function can return.
///
/// The text displayed for an error is used to group failures in the statistics
/// error summary, so similar failures should produce identical messages.
#[derive(Debug)]
pub enum TaskError {
    /// A task failed for the described reason.
    Failed(String),
    /// Reading from the user's local storage failed.
    Storage(StorageError),
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// The task function panicked with this message.
    Panicked(String),
}
impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TaskError::Failed(ref message) => write!(f, "{}", message),
            TaskError::Storage(ref source) => write!(f, "storage error: {}", source),
            TaskError::Io(ref source) => write!(f, "io error: {}", source),
            TaskError::Panicked(ref message) => write!(f, "task panicked: {}", message),
        }
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            TaskError::Storage(ref source) => Some(source),
            TaskError::Io(ref source) => Some(source),
            TaskError::Failed(_) | TaskError::Panicked(_) => None,
        }
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> TaskError {
        TaskError::Failed(message.to_string())
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> TaskError {
        TaskError::Failed(message)
    }
}

/// Auto-convert storage errors.
impl From<StorageError> for TaskError {
    fn from(err: StorageError) -> TaskError {
        TaskError::Storage(err)
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for TaskError {
    fn from(err: io::Error) -> TaskError {
        TaskError::Io(err)
    }
}

/// How a node chooses which of its children runs next.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelectionStrategy {
    /// Pick a child at random, honoring child weights and the node's step-out weight.
    #[default]
    Random,
    /// Visit each child in the order registered, then step out to the parent.
    InOrder,
}

/// Selection options attached to every node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskOptions {
    /// How this node selects among its own children.
    pub strategy: SelectionStrategy,
    /// How often this node is picked relative to its siblings. A weight of 0 is
    /// treated the same as the default weight of 1.
    pub weight: usize,
    /// How much more often than once per pool this node steps out to its parent
    /// rather than selecting a child.
    pub step_out_weight: usize,
}
impl Default for TaskOptions {
    fn default() -> Self {
        TaskOptions {
            strategy: SelectionStrategy::Random,
            weight: 1,
            step_out_weight: 0,
        }
    }
}

/// A node of a task hierarchy under construction.
///
/// Nodes own their children. Once the hierarchy is complete it is converted into a
/// [`TaskTree`] with [`TaskTree::build`], after which it can no longer change.
#[derive(Clone)]
pub struct TaskNode {
    /// The name of this node, displayed in statistics as part of its full name.
    pub name: String,
    /// An optional function, executed each time this node is selected.
    pub function: Option<TaskFunction>,
    /// Selection options for this node.
    pub options: TaskOptions,
    /// All children of this node, in the order they were registered.
    pub children: Vec<TaskNode>,
}
impl TaskNode {
    /// Creates a new task that runs `function` each time it is selected. Generally
    /// invoked through the [`task!`](../macro.task.html) macro.
    pub fn new(function: TaskFunction) -> Self {
        trace!("new task");
        TaskNode {
            name: "".to_string(),
            function: Some(function),
            options: TaskOptions::default(),
            children: Vec::new(),
        }
    }

    /// Creates a new section: a named node without a function that only groups
    /// other nodes.
    pub fn section(name: &str) -> Self {
        trace!("new section: {}", name);
        TaskNode {
            name: name.to_string(),
            function: None,
            options: TaskOptions::default(),
            children: Vec::new(),
        }
    }

    /// Creates the entry node, the root of a task tree that every user starts at.
    ///
    /// If an entry function is set with [`TaskNode::set_function`] it runs once when
    /// each user spawns, for example to log in.
    pub fn entry(name: &str) -> Self {
        TaskNode::section(name)
    }

    /// Sets the name displayed in statistics for this node.
    pub fn set_name(mut self, name: &str) -> Self {
        trace!("[{}] set_name: {}", self.name, name);
        self.name = name.to_string();
        self
    }

    /// Sets (or replaces) the function executed when this node is selected.
    pub fn set_function(mut self, function: TaskFunction) -> Self {
        self.function = Some(function);
        self
    }

    /// Sets how often this node is selected relative to its siblings. For example, a
    /// task with a weight of 10 is selected ten times as often as a sibling with a
    /// weight of 1. A weight of 0 is treated as 1, so the two are indistinguishable.
    pub fn set_weight(mut self, weight: usize) -> Self {
        trace!("[{}] set_weight: {}", self.name, weight);
        if weight == 0 {
            info!(
                "weight of 0 for {} is treated as the default weight of 1",
                self.name
            );
        }
        self.options.weight = weight;
        self
    }

    /// Sets how likely a user is to step out of this node to its parent instead of
    /// selecting one of its children. Ignored on the entry node.
    pub fn set_step_out_weight(mut self, step_out_weight: usize) -> Self {
        trace!("[{}] set_step_out_weight: {}", self.name, step_out_weight);
        self.options.step_out_weight = step_out_weight;
        self
    }

    /// Sets how this node selects among its children.
    pub fn set_strategy(mut self, strategy: SelectionStrategy) -> Self {
        trace!("[{}] set_strategy: {:?}", self.name, strategy);
        self.options.strategy = strategy;
        self
    }

    /// Replaces all selection options at once.
    pub fn set_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }

    /// Registers a child node (a task or a section) under this node.
    pub fn register_task(mut self, task: TaskNode) -> Self {
        trace!("{} register_task: {}", self.name, task.name);
        self.children.push(task);
        self
    }

    /// Registers a new section named `name` under this node, passing it to `setup` so
    /// children can be registered on it.
    pub fn register_section<F>(self, name: &str, setup: F) -> Self
    where
        F: FnOnce(TaskNode) -> TaskNode,
    {
        let section = setup(TaskNode::section(name));
        self.register_task(section)
    }

    /// Returns true if this node has no function of its own.
    pub fn is_section(&self) -> bool {
        self.function.is_none()
    }
}
impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("name", &self.name)
            .field("function", &self.function.is_some())
            .field("options", &self.options)
            .field("children", &self.children)
            .finish()
    }
}

/// A node within a built [`TaskTree`].
pub struct TreeNode {
    /// The node's own name.
    pub name: String,
    /// Names of all ancestors and this node, joined by ` / `.
    pub full_name: String,
    /// The node's parent, `None` only for the entry node.
    pub parent: Option<NodeId>,
    /// The node's children, in registration order.
    pub children: Vec<NodeId>,
    /// The function executed when this node is selected, if any.
    pub function: Option<TaskFunction>,
    /// Selection options.
    pub options: TaskOptions,
    /// How many steps this node is from the entry node.
    pub depth: usize,
}
impl TreeNode {
    /// Returns true if this node has no function of its own.
    pub fn is_section(&self) -> bool {
        self.function.is_none()
    }
}
impl fmt::Debug for TreeNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TreeNode")
            .field("full_name", &self.full_name)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("function", &self.function.is_some())
            .field("options", &self.options)
            .finish()
    }
}

/// An immutable task hierarchy shared by all users of a load test.
///
/// Nodes are stored in a flat vector and refer to each other by [`NodeId`], so parent
/// links never own anything. The entry node always has the id `0`.
#[derive(Debug)]
pub struct TaskTree {
    nodes: Vec<TreeNode>,
}
impl TaskTree {
    /// The id of the entry node.
    pub const ROOT: NodeId = 0;

    /// Converts a hierarchy of [`TaskNode`]s into a validated [`TaskTree`].
    ///
    /// The entry node must have at least one child, and at least one node other than
    /// the entry node must have a function. As every step out of a node moves toward
    /// the entry node, a tree that passes this validation always resolves to a node
    /// that can be selected.
    pub fn build(entry: TaskNode) -> Result<TaskTree, LoadTestError> {
        if entry.children.is_empty() {
            return Err(LoadTestError::InvalidTaskTree {
                detail: format!("entry node {} has no children to select.", entry.name),
            });
        }

        let mut nodes = Vec::new();
        flatten(entry, None, &mut nodes);

        if !nodes
            .iter()
            .skip(1)
            .any(|node: &TreeNode| node.function.is_some())
        {
            return Err(LoadTestError::InvalidTaskTree {
                detail: format!(
                    "no task below entry node {} has a function to run.",
                    nodes[TaskTree::ROOT].name
                ),
            });
        }

        debug!("built task tree with {} nodes", nodes.len());
        Ok(TaskTree { nodes })
    }

    /// The id of the entry node.
    pub fn root(&self) -> NodeId {
        TaskTree::ROOT
    }

    /// Returns the node with the given id.
    ///
    /// Panics if the id did not come from this tree.
    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id]
    }

    /// Returns the node with the given id, or `None` if there is no such node.
    pub fn get(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    /// Names of all ancestors of `id` and `id` itself, joined by ` / `.
    pub fn full_name(&self, id: NodeId) -> &str {
        &self.nodes[id].full_name
    }

    /// Looks up a node by its full name.
    pub fn find(&self, full_name: &str) -> Option<NodeId> {
        self.nodes.iter().position(|node| node.full_name == full_name)
    }

    /// The number of nodes in the tree.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false, as a valid tree has at least an entry node and one child.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The depth of the deepest node.
    pub fn depth(&self) -> usize {
        self.nodes.iter().map(|node| node.depth).max().unwrap_or(0)
    }

    /// Iterates over all nodes in depth-first registration order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &TreeNode)> {
        self.nodes.iter().enumerate()
    }
}

/// Lists the tree as shown by `--list`.
impl fmt::Display for TaskTree {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for node in &self.nodes {
            let kind = if node.is_section() { "section" } else { "task" };
            writeln!(
                f,
                "{:indent$}- {} ({}, weight: {}, step out weight: {}, strategy: {:?})",
                "",
                node.name,
                kind,
                node.options.weight.max(1),
                node.options.step_out_weight,
                node.options.strategy,
                indent = node.depth * 2,
            )?;
        }
        Ok(())
    }
}

// Push `node` and all its descendants onto `nodes` depth-first, returning its id.
fn flatten(node: TaskNode, parent: Option<NodeId>, nodes: &mut Vec<TreeNode>) -> NodeId {
    let id = nodes.len();
    let (name, depth, full_name) = match parent {
        Some(parent_id) => {
            let parent_node = &nodes[parent_id];
            // Unnamed nodes are identified by their 1-based position among siblings.
            let name = if node.name.is_empty() {
                (parent_node.children.len() + 1).to_string()
            } else {
                node.name.clone()
            };
            let full_name = format!("{} / {}", parent_node.full_name, name);
            (name, parent_node.depth + 1, full_name)
        }
        None => (node.name.clone(), 0, node.name.clone()),
    };

    nodes.push(TreeNode {
        name,
        full_name,
        parent,
        children: Vec::with_capacity(node.children.len()),
        function: node.function,
        options: node.options,
        depth,
    });
    if let Some(parent_id) = parent {
        nodes[parent_id].children.push(id);
    }

    for child in node.children {
        flatten(child, Some(id), nodes);
    }
    id
}
