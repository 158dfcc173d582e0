//! The per-key queue of tasks awaiting execution

use std::collections::VecDeque;

use common::types::{task_key::TaskKey, tasks::BoxedTask};

/// Holds the tasks submitted under one key
///
/// Managers are only ever touched through the registry lock of the
/// scheduler, which is why the mutating methods take `&mut self` and no
/// internal synchronization is required
pub trait TaskManager: Send {
    /// Append a task to the end of the queue
    fn add(&mut self, task: BoxedTask);
    /// Take the task at the head of the queue, `None` if the queue is empty
    fn remove(&mut self) -> Option<BoxedTask>;
    /// The number of queued tasks
    fn len(&self) -> usize;
    /// The key the tasks were submitted under
    fn executer_key(&self) -> &TaskKey;

    /// Whether the queue is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds the manager for a key seen for the first time
pub type ManagerFactory = Box<dyn Fn(TaskKey) -> Box<dyn TaskManager> + Send + Sync>;

/// A FIFO task manager
pub struct DefaultTaskManager {
    /// The key of the manager
    key: TaskKey,
    /// The queued tasks, oldest first
    tasks: VecDeque<BoxedTask>,
}

impl DefaultTaskManager {
    /// Constructor
    pub fn new(key: TaskKey) -> Self {
        Self { key, tasks: VecDeque::new() }
    }

    /// Create a boxed manager, usable as a [`ManagerFactory`]
    pub fn boxed(key: TaskKey) -> Box<dyn TaskManager> {
        Box::new(Self::new(key))
    }
}

impl TaskManager for DefaultTaskManager {
    fn add(&mut self, task: BoxedTask) {
        self.tasks.push_back(task);
    }

    fn remove(&mut self) -> Option<BoxedTask> {
        self.tasks.pop_front()
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }

    fn executer_key(&self) -> &TaskKey {
        &self.key
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use common::types::{task_key::TaskKey, tasks::task_fn};

    use super::{DefaultTaskManager, TaskManager};

    /// Tests that tasks leave the manager in the order they were added
    #[test]
    fn test_fifo() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut manager = DefaultTaskManager::new(TaskKey::from("k"));
        for i in 0..3 {
            let order = order.clone();
            manager.add(task_fn(move || order.lock().unwrap().push(i)));
        }
        assert_eq!(manager.len(), 3);

        while let Some(task) = manager.remove() {
            task.run().unwrap();
        }

        assert!(manager.is_empty());
        assert!(manager.remove().is_none());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(manager.executer_key(), &TaskKey::from("k"));
    }
}
