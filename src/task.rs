//! Declared build work and its dependency descriptors.
//!
//! A [`TaskSpec`] is the declarative description of one unit of build
//! work: a stable name, the files it reads and writes, an ordered list
//! of [`Dependency`] descriptors and an optional action to run. Specs
//! are contributed by plugins before the graph freezes; once the graph
//! is built they are immutable for the rest of the invocation.

use std::fmt::Debug;
use std::sync::Arc;

use camino::Utf8PathBuf;

/// The callback executed when a task runs. Tasks without an action are
/// pure ordering nodes and succeed trivially.
pub type TaskAction = Arc<dyn Fn(&TaskCx) -> anyhow::Result<()> + Send + Sync>;

/// Context handed to a task action at execution time.
pub struct TaskCx<'a> {
    /// Name of the executing task.
    pub name: &'a str,
    /// The task's declared input paths.
    pub inputs: &'a [Utf8PathBuf],
    /// The task's declared output paths.
    pub outputs: &'a [Utf8PathBuf],
}

/// A collaborator-supplied source of dependency edges.
///
/// Implementations contribute zero or more task names when the
/// descriptor holding them is visited during resolution.
pub trait DependencyProvider: Send + Sync {
    fn contribute(&self) -> Vec<String>;
}

/// A declarative reference that expands into zero or more tasks at
/// resolution time.
#[derive(Clone)]
pub enum Dependency {
    /// Direct reference to another task by name.
    Task(String),
    /// The task's own declared input files, resolved transitively to
    /// whichever tasks produce them. Inputs with no known producer are
    /// assumed externally supplied and contribute nothing.
    TaskInputs,
    /// A collection of file paths, each resolved to its producer.
    Files(Vec<Utf8PathBuf>),
    /// Dependencies supplied by an external collaborator.
    Provided(Arc<dyn DependencyProvider>),
}

impl Debug for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dependency::Task(name) => write!(f, "Task({name:?})"),
            Dependency::TaskInputs => write!(f, "TaskInputs"),
            Dependency::Files(paths) => write!(f, "Files({paths:?})"),
            Dependency::Provided(_) => write!(f, "Provided(*)"),
        }
    }
}

/// A unit of declared build work.
#[derive(Clone)]
pub struct TaskSpec {
    pub name: String,
    pub dependencies: Vec<Dependency>,
    pub inputs: Vec<Utf8PathBuf>,
    pub outputs: Vec<Utf8PathBuf>,
    pub action: Option<TaskAction>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            action: None,
        }
    }

    /// Declares an explicit dependency on another task.
    pub fn depends_on(mut self, task: impl Into<String>) -> Self {
        self.dependencies.push(Dependency::Task(task.into()));
        self
    }

    /// Declares an input path and makes the task depend on whichever
    /// task produces it, if any.
    pub fn input(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        if !self.dependencies.iter().any(|d| matches!(d, Dependency::TaskInputs)) {
            self.dependencies.push(Dependency::TaskInputs);
        }
        self.inputs.push(path.into());
        self
    }

    /// Declares an output path, registering this task as its producer.
    pub fn output(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    /// Declares a dependency on a collection of files.
    pub fn files<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        self.dependencies
            .push(Dependency::Files(paths.into_iter().map(Into::into).collect()));
        self
    }

    /// Declares a collaborator-supplied dependency.
    pub fn provided(mut self, provider: Arc<dyn DependencyProvider>) -> Self {
        self.dependencies.push(Dependency::Provided(provider));
        self
    }

    /// Attaches the action to run when the task executes.
    pub fn run<F>(mut self, action: F) -> Self
    where
        F: Fn(&TaskCx) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.action = Some(Arc::new(action));
        self
    }
}

impl Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("action", &self.action.as_ref().map(|_| "*"))
            .finish()
    }
}
