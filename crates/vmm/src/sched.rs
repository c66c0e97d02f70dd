//! Scheduler integration: the address-space side of context switching.
//!
//! Task selection is a plain round-robin queue and deliberately minimal —
//! what matters here is the handoff contract with the memory manager:
//! the incoming task's space is activated exactly when it differs from the
//! outgoing task's active space, and kernel threads, which own no space of
//! their own, borrow whatever space was active when they were switched to.
//! Saving and restoring CPU registers is the platform layer's business and
//! does not touch the structures here.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::frames::FrameAllocator;
use crate::kernel_space::KernelSpace;
use crate::space::{AddressSpace, SharedSpace};
use crate::Fault;

/// Identifies a task for the lifetime of the scheduler.
pub type TaskId = usize;

/// Run state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// On the run queue, waiting for the CPU.
    Ready,
    /// Currently on the CPU.
    Running,
    /// Exited; never scheduled again.
    Zombie,
}

/// A schedulable task and its relationship to an address space.
pub struct Task {
    id: TaskId,
    state: TaskState,
    /// The space this task owns a reference to; `None` for kernel threads.
    mm: Option<SharedSpace>,
    /// The space that was loaded when this task last ran. Differs from
    /// `mm` for kernel threads, which borrow the previous task's space.
    active_mm: Option<SharedSpace>,
}

impl Task {
    /// Returns the task's id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Returns the task's run state.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Returns the space the task owns, if any.
    pub fn mm(&self) -> Option<&SharedSpace> {
        self.mm.as_ref()
    }

    /// Returns the space that was active when the task last ran.
    pub fn active_mm(&self) -> Option<&SharedSpace> {
        self.active_mm.as_ref()
    }
}

/// Single-CPU round-robin scheduler.
pub struct Scheduler {
    tasks: Vec<Task>,
    queue: VecDeque<TaskId>,
    current: TaskId,
}

impl Scheduler {
    /// Creates a scheduler whose task 0 is the boot kernel thread,
    /// already running with no space of its own.
    pub fn new() -> Self {
        Self {
            tasks: alloc::vec![Task {
                id: 0,
                state: TaskState::Running,
                mm: None,
                active_mm: None,
            }],
            queue: VecDeque::new(),
            current: 0,
        }
    }

    /// Adds a task to the run queue. `mm` is `None` for kernel threads.
    pub fn spawn(&mut self, mm: Option<SharedSpace>) -> TaskId {
        let id = self.tasks.len();
        self.tasks.push(Task {
            id,
            state: TaskState::Ready,
            mm,
            active_mm: None,
        });
        self.queue.push_back(id);
        log::debug!("spawned task {id}");
        id
    }

    /// Creates a child of `parent`: kernel threads beget kernel threads;
    /// a user task's child gets a fresh, empty address space.
    ///
    /// There is no copy-on-write and no copying of the parent's mappings —
    /// the child is expected to be populated by the loader.
    pub fn fork(
        &mut self,
        parent: TaskId,
        kernel: &KernelSpace,
        frames: &mut dyn FrameAllocator,
    ) -> Result<TaskId, Fault> {
        let mm = match self.tasks[parent].mm {
            Some(_) => Some(AddressSpace::new(kernel, frames)?.into_shared()),
            None => None,
        };
        Ok(self.spawn(mm))
    }

    /// Returns the running task.
    pub fn current(&self) -> &Task {
        &self.tasks[self.current]
    }

    /// Returns the task with the given id.
    ///
    /// # Panics
    ///
    /// Panics if no such task exists.
    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id]
    }

    /// Picks the next task round-robin and performs the address-space side
    /// of the context switch. Returns the id of the task now running.
    ///
    /// The incoming space is activated only if it differs from the
    /// outgoing task's active space; threads sharing one space switch
    /// without a reload or TLB flush.
    pub fn schedule(&mut self) -> TaskId {
        let Some(next_id) = self.queue.pop_front() else {
            return self.current;
        };
        let prev_id = self.current;

        if self.tasks[prev_id].state == TaskState::Running {
            self.tasks[prev_id].state = TaskState::Ready;
            self.queue.push_back(prev_id);
        }

        let prev_active = self.tasks[prev_id].active_mm.clone();
        let next = &mut self.tasks[next_id];
        match &next.mm {
            Some(mm) => {
                let unchanged = prev_active
                    .as_ref()
                    .is_some_and(|active| Arc::ptr_eq(active, mm));
                if !unchanged {
                    mm.lock().activate();
                }
                next.active_mm = Some(Arc::clone(mm));
            }
            // Kernel threads run on whatever space is already loaded.
            None => next.active_mm = prev_active,
        }
        next.state = TaskState::Running;
        self.current = next_id;
        next_id
    }

    /// Marks `id` as exited and drops its address space reference; the
    /// last owner's exit tears the space down.
    ///
    /// The exiting task keeps running on the old tables until the caller
    /// schedules away, which is safe on a single CPU because the kernel
    /// half is shared by every space.
    pub fn exit(&mut self, id: TaskId, frames: &mut dyn FrameAllocator) {
        let task = &mut self.tasks[id];
        task.state = TaskState::Zombie;
        task.active_mm = None;
        if let Some(mm) = task.mm.take() {
            AddressSpace::release(mm, frames);
        }
        self.queue.retain(|&queued| queued != id);
        log::debug!("task {id} exited");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
