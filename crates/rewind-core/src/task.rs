//! Task graph driven by the system graph once per tick.
//!
//! Systems register *units* (callbacks) once at init and enqueue *tasks*
//! (invocations of a unit) every tick from their `schedule` callback. The
//! coordinating thread then runs the whole graph to completion inside
//! [`TaskScheduler::end_frame`] before anything else happens.
//!
//! Three task shapes exist:
//!
//! - **main-thread**: runs on the coordinating thread with `&mut Frame`.
//! - **array**: a fixed item range cut into N slices, one per worker.
//! - **threaded**: workers claim fixed-size batches from an atomic counter
//!   until the range is exhausted.
//!
//! Slice units only see `&Frame`. Their writes go into a [`SliceWriter`] and
//! are applied on the coordinating thread in slice order once the task
//! finishes, so the result never depends on which worker ran which slice.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{trace, warn};
use rayon::prelude::*;

use crate::component::Component;
use crate::entity::EntityError;
use crate::event::{Event, EventType};
use crate::frame::Frame;
use crate::id::EntityRef;
use crate::system::SystemGraph;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("unknown task unit {0}")]
    UnknownUnit(u32),
    #[error("dependency on task {0} which was not added this frame")]
    UnknownDependency(u32),
    #[error("worker pool could not be built: {0}")]
    ThreadPool(String),
    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    pub fn failed(msg: impl fmt::Display) -> Self {
        TaskError::Failed(msg.to_string())
    }
}

impl From<EntityError> for TaskError {
    fn from(e: EntityError) -> Self {
        TaskError::Failed(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// A task added this frame, or no task at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(Option<u32>);

impl TaskHandle {
    pub const NONE: TaskHandle = TaskHandle(None);

    pub fn is_none(self) -> bool {
        self.0.is_none()
    }

    pub fn index(self) -> Option<usize> {
        self.0.map(|i| i as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MainThreadUnit(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SliceUnit(u32);

/// Shape of a self-balancing task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadedWork {
    pub item_count: usize,
    /// Items claimed per grab; zero is treated as one.
    pub batch_size: usize,
}

// ---------------------------------------------------------------------------
// Unit callbacks
// ---------------------------------------------------------------------------

/// What a main-thread unit gets to work with.
pub struct MainThreadContext<'a> {
    pub frame: &'a mut Frame,
    pub systems: &'a mut SystemGraph,
}

pub type MainThreadFn = Box<dyn FnMut(&mut MainThreadContext<'_>) -> Result<(), TaskError>>;

pub type SliceFn =
    Arc<dyn Fn(&Frame, Range<usize>, &mut SliceWriter) -> Result<(), TaskError> + Send + Sync>;

type DeferredWrite = Box<dyn FnOnce(&mut Frame) -> Result<(), EntityError> + Send>;

/// Writes collected by one slice, applied after the task completes.
#[derive(Default)]
pub struct SliceWriter {
    writes: Vec<DeferredWrite>,
    events: Vec<Event>,
}

impl SliceWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Component>(&mut self, entity: EntityRef, value: T) {
        self.writes
            .push(Box::new(move |f| f.entities_mut().set(entity, value).map(|_| ())));
    }

    pub fn remove<T: Component>(&mut self, entity: EntityRef) {
        self.writes.push(Box::new(move |f| {
            f.entities_mut().remove::<T>(entity);
            Ok(())
        }));
    }

    pub fn destroy(&mut self, entity: EntityRef) {
        self.writes.push(Box::new(move |f| {
            f.entities_mut().destroy(entity);
            Ok(())
        }));
    }

    pub fn raise<E: EventType>(&mut self, event: &E) -> Result<(), bitcode::Error> {
        self.events.push(Event::encode(event)?);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.writes.len() + self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply writes then events, in the order they were recorded.
    fn apply(self, frame: &mut Frame, unit: &str) -> usize {
        let mut applied = 0;
        for write in self.writes {
            match write(frame) {
                Ok(()) => applied += 1,
                Err(e) => warn!("deferred write from {unit} dropped: {e}"),
            }
        }
        for event in self.events {
            frame.push_event(event);
            applied += 1;
        }
        applied
    }
}

impl fmt::Debug for SliceWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SliceWriter")
            .field("writes", &self.writes.len())
            .field("events", &self.events.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub unit: String,
    /// Item range of the failed slice; `None` for main-thread units.
    pub slice: Option<Range<usize>>,
    pub error: TaskError,
}

/// Outcome of one frame's task graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskReport {
    pub tasks_run: usize,
    pub slices_run: usize,
    pub writes_applied: usize,
    pub failures: Vec<TaskFailure>,
}

// ---------------------------------------------------------------------------
// TaskScheduler
// ---------------------------------------------------------------------------

/// The task graph contract the system graph schedules against.
///
/// A unit that returns an error contributes nothing to the tick: a failed
/// slice's [`SliceWriter`] is dropped, and a failed main-thread unit's frame
/// mutations are rolled back. Calls it made on the [`SystemGraph`] (and the
/// enable/disable callbacks they fired) are not undone, only the enablement
/// bits stored in the frame are.
pub trait TaskScheduler {
    fn register_main_thread_unit(&mut self, name: &str, unit: MainThreadFn) -> MainThreadUnit;

    fn register_slice_unit(&mut self, name: &str, unit: SliceFn) -> SliceUnit;

    fn add_main_thread_task(
        &mut self,
        unit: MainThreadUnit,
        depends_on: TaskHandle,
    ) -> Result<TaskHandle, TaskError>;

    /// `item_count` items cut into at most `slice_count` contiguous slices.
    fn add_array_task(
        &mut self,
        unit: SliceUnit,
        item_count: usize,
        depends_on: TaskHandle,
        slice_count: usize,
    ) -> Result<TaskHandle, TaskError>;

    fn add_threaded_task(
        &mut self,
        unit: SliceUnit,
        work: ThreadedWork,
        depends_on: TaskHandle,
    ) -> Result<TaskHandle, TaskError>;

    /// Start a new tick; tasks from the previous tick are dropped.
    fn begin_frame(&mut self);

    /// Run every task added since `begin_frame` and block until done.
    fn end_frame(&mut self, frame: &mut Frame, systems: &mut SystemGraph) -> TaskReport;

    /// Tasks added since `begin_frame`.
    fn pending_tasks(&self) -> usize;

    /// Drop tasks added after the first `len`.
    fn discard_tasks_after(&mut self, len: usize);
}

/// Split `0..item_count` into at most `slices` contiguous, non-empty ranges
/// whose lengths differ by at most one.
pub fn split_ranges(item_count: usize, slices: usize) -> Vec<Range<usize>> {
    if item_count == 0 {
        return Vec::new();
    }
    let slices = slices.clamp(1, item_count);
    let base = item_count / slices;
    let extra = item_count % slices;
    let mut out = Vec::with_capacity(slices);
    let mut start = 0;
    for i in 0..slices {
        let len = base + usize::from(i < extra);
        out.push(start..start + len);
        start += len;
    }
    out
}

// ---------------------------------------------------------------------------
// RayonTaskGraph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum TaskKind {
    MainThread(MainThreadUnit),
    Array {
        unit: SliceUnit,
        item_count: usize,
        slices: usize,
    },
    Threaded {
        unit: SliceUnit,
        work: ThreadedWork,
    },
}

type SliceOutcome = (usize, Range<usize>, Result<(), TaskError>, SliceWriter);

/// Default scheduler backed by a dedicated rayon pool.
///
/// Tasks run in the order they were added. A dependency is only accepted
/// when it points at an earlier task, so insertion order already satisfies
/// all of them and the handle itself is not kept.
pub struct RayonTaskGraph {
    pool: rayon::ThreadPool,
    main_units: Vec<(String, MainThreadFn)>,
    slice_units: Vec<(String, SliceFn)>,
    tasks: Vec<TaskKind>,
}

impl RayonTaskGraph {
    /// `threads == 0` lets rayon pick.
    pub fn new(threads: usize) -> Result<Self, TaskError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("rewind-worker-{i}"))
            .build()
            .map_err(|e| TaskError::ThreadPool(e.to_string()))?;
        Ok(Self {
            pool,
            main_units: Vec::new(),
            slice_units: Vec::new(),
            tasks: Vec::new(),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn push(&mut self, kind: TaskKind, depends_on: TaskHandle) -> Result<TaskHandle, TaskError> {
        if let Some(dep) = depends_on.index()
            && dep >= self.tasks.len()
        {
            return Err(TaskError::UnknownDependency(dep as u32));
        }
        let handle = TaskHandle(Some(self.tasks.len() as u32));
        self.tasks.push(kind);
        Ok(handle)
    }

    fn check_slice_unit(&self, unit: SliceUnit) -> Result<(), TaskError> {
        if unit.0 as usize >= self.slice_units.len() {
            return Err(TaskError::UnknownUnit(unit.0));
        }
        Ok(())
    }

    fn run_array(&self, frame: &Frame, unit: SliceUnit, ranges: Vec<Range<usize>>) -> Vec<SliceOutcome> {
        let run = &self.slice_units[unit.0 as usize].1;
        self.pool.install(|| {
            ranges
                .into_par_iter()
                .enumerate()
                .map(|(i, range)| {
                    let mut writer = SliceWriter::new();
                    let result = run(frame, range.clone(), &mut writer);
                    (i, range, result, writer)
                })
                .collect()
        })
    }

    fn run_threaded(&self, frame: &Frame, unit: SliceUnit, work: ThreadedWork) -> Vec<SliceOutcome> {
        let run = &self.slice_units[unit.0 as usize].1;
        let batch = work.batch_size.max(1);
        let batches = work.item_count.div_ceil(batch);
        if batches == 0 {
            return Vec::new();
        }
        let next = AtomicUsize::new(0);
        let workers = self.worker_count().clamp(1, batches);
        let mut outcomes: Vec<SliceOutcome> = self.pool.install(|| {
            (0..workers)
                .into_par_iter()
                .flat_map_iter(|_| {
                    let mut claimed = Vec::new();
                    loop {
                        let b = next.fetch_add(1, Ordering::Relaxed);
                        if b >= batches {
                            break;
                        }
                        let range = b * batch..((b + 1) * batch).min(work.item_count);
                        let mut writer = SliceWriter::new();
                        let result = run(frame, range.clone(), &mut writer);
                        claimed.push((b, range, result, writer));
                    }
                    claimed
                })
                .collect()
        });
        outcomes.sort_by_key(|o| o.0);
        outcomes
    }

    fn apply_outcomes(
        &self,
        frame: &mut Frame,
        unit: SliceUnit,
        outcomes: Vec<SliceOutcome>,
        report: &mut TaskReport,
    ) {
        let name = &self.slice_units[unit.0 as usize].0;
        for (_, range, result, writer) in outcomes {
            report.slices_run += 1;
            match result {
                Ok(()) => report.writes_applied += writer.apply(frame, name),
                Err(error) => {
                    warn!("{name} slice {range:?} failed, its writes are discarded: {error}");
                    report.failures.push(TaskFailure {
                        unit: name.clone(),
                        slice: Some(range),
                        error,
                    });
                }
            }
        }
    }
}

impl fmt::Debug for RayonTaskGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RayonTaskGraph")
            .field("workers", &self.worker_count())
            .field("main_units", &self.main_units.len())
            .field("slice_units", &self.slice_units.len())
            .field("tasks", &self.tasks)
            .finish()
    }
}

impl TaskScheduler for RayonTaskGraph {
    fn register_main_thread_unit(&mut self, name: &str, unit: MainThreadFn) -> MainThreadUnit {
        self.main_units.push((name.to_string(), unit));
        MainThreadUnit(self.main_units.len() as u32 - 1)
    }

    fn register_slice_unit(&mut self, name: &str, unit: SliceFn) -> SliceUnit {
        self.slice_units.push((name.to_string(), unit));
        SliceUnit(self.slice_units.len() as u32 - 1)
    }

    fn add_main_thread_task(
        &mut self,
        unit: MainThreadUnit,
        depends_on: TaskHandle,
    ) -> Result<TaskHandle, TaskError> {
        if unit.0 as usize >= self.main_units.len() {
            return Err(TaskError::UnknownUnit(unit.0));
        }
        self.push(TaskKind::MainThread(unit), depends_on)
    }

    fn add_array_task(
        &mut self,
        unit: SliceUnit,
        item_count: usize,
        depends_on: TaskHandle,
        slice_count: usize,
    ) -> Result<TaskHandle, TaskError> {
        self.check_slice_unit(unit)?;
        self.push(
            TaskKind::Array {
                unit,
                item_count,
                slices: slice_count,
            },
            depends_on,
        )
    }

    fn add_threaded_task(
        &mut self,
        unit: SliceUnit,
        work: ThreadedWork,
        depends_on: TaskHandle,
    ) -> Result<TaskHandle, TaskError> {
        self.check_slice_unit(unit)?;
        self.push(TaskKind::Threaded { unit, work }, depends_on)
    }

    fn begin_frame(&mut self) {
        self.tasks.clear();
    }

    fn end_frame(&mut self, frame: &mut Frame, systems: &mut SystemGraph) -> TaskReport {
        let tasks = std::mem::take(&mut self.tasks);
        let mut report = TaskReport::default();
        for &task in &tasks {
            report.tasks_run += 1;
            match task {
                TaskKind::MainThread(unit) => {
                    let (name, run) = &mut self.main_units[unit.0 as usize];
                    let before = frame.clone();
                    let mut ctx = MainThreadContext {
                        frame: &mut *frame,
                        systems: &mut *systems,
                    };
                    if let Err(error) = run(&mut ctx) {
                        frame.copy_from(&before);
                        warn!(
                            "main-thread unit {name} failed on tick {}, frame restored: {error}",
                            frame.tick()
                        );
                        report.failures.push(TaskFailure {
                            unit: name.clone(),
                            slice: None,
                            error,
                        });
                    }
                }
                TaskKind::Array {
                    unit,
                    item_count,
                    slices,
                } => {
                    let outcomes = self.run_array(frame, unit, split_ranges(item_count, slices));
                    self.apply_outcomes(frame, unit, outcomes, &mut report);
                }
                TaskKind::Threaded { unit, work } => {
                    let outcomes = self.run_threaded(frame, unit, work);
                    self.apply_outcomes(frame, unit, outcomes, &mut report);
                }
            }
        }
        trace!(
            "tick {}: {} tasks, {} slices, {} failures",
            frame.tick(),
            report.tasks_run,
            report.slices_run,
            report.failures.len()
        );
        report
    }

    fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    fn discard_tasks_after(&mut self, len: usize) {
        self.tasks.truncate(len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Position, empty_graph, test_frame};

    #[test]
    fn split_ranges_covers_everything_evenly() {
        let ranges = split_ranges(10, 3);
        assert_eq!(ranges, vec![0..4, 4..7, 7..10]);
        assert_eq!(split_ranges(2, 8), vec![0..1, 1..2]);
        assert_eq!(split_ranges(5, 0), vec![0..5]);
        assert!(split_ranges(0, 4).is_empty());
    }

    #[test]
    fn dependency_must_exist() {
        let mut graph = RayonTaskGraph::new(1).unwrap();
        let unit = graph.register_main_thread_unit("noop", Box::new(|_: &mut MainThreadContext<'_>| Ok(())));
        let first = graph.add_main_thread_task(unit, TaskHandle::NONE).unwrap();
        assert!(graph.add_main_thread_task(unit, first).is_ok());
        assert_eq!(
            graph.add_main_thread_task(unit, TaskHandle(Some(9))),
            Err(TaskError::UnknownDependency(9))
        );
        // A task cannot depend on itself or on a later task.
        let next = graph.pending_tasks() as u32;
        assert_eq!(
            graph.add_main_thread_task(unit, TaskHandle(Some(next))),
            Err(TaskError::UnknownDependency(next))
        );
        assert_eq!(
            graph.add_main_thread_task(MainThreadUnit(4), TaskHandle::NONE),
            Err(TaskError::UnknownUnit(4))
        );
    }

    fn spawn_positions(frame: &mut Frame, n: i32) -> Vec<EntityRef> {
        (0..n)
            .map(|i| {
                let e = frame.entities_mut().create(0);
                frame.entities_mut().set(e, Position { x: i, y: 0 }).unwrap();
                e
            })
            .collect()
    }

    fn shift_unit() -> SliceFn {
        Arc::new(|frame: &Frame, range: Range<usize>, w: &mut SliceWriter| {
            for i in range {
                let (e, p) = frame
                    .entities()
                    .component_at::<Position>(i)
                    .ok_or_else(|| TaskError::failed("index out of range"))?;
                w.set(e, Position { x: p.x, y: p.x * 2 });
            }
            Ok(())
        })
    }

    #[test]
    fn array_task_applies_every_slice() {
        let mut frame = test_frame();
        let entities = spawn_positions(&mut frame, 17);
        let mut systems = empty_graph();
        let mut graph = RayonTaskGraph::new(4).unwrap();
        let unit = graph.register_slice_unit("shift", shift_unit());

        graph.begin_frame();
        graph.add_array_task(unit, 17, TaskHandle::NONE, 5).unwrap();
        let report = graph.end_frame(&mut frame, &mut systems);

        assert_eq!(report.slices_run, 5);
        assert_eq!(report.writes_applied, 17);
        assert!(report.failures.is_empty());
        for (i, e) in entities.iter().enumerate() {
            assert_eq!(frame.entities().get::<Position>(*e).unwrap().y, i as i32 * 2);
        }
    }

    #[test]
    fn threaded_task_claims_all_batches() {
        let mut frame = test_frame();
        spawn_positions(&mut frame, 23);
        let mut systems = empty_graph();
        let mut graph = RayonTaskGraph::new(3).unwrap();
        let unit = graph.register_slice_unit("shift", shift_unit());

        graph.begin_frame();
        graph
            .add_threaded_task(
                unit,
                ThreadedWork {
                    item_count: 23,
                    batch_size: 4,
                },
                TaskHandle::NONE,
            )
            .unwrap();
        let report = graph.end_frame(&mut frame, &mut systems);
        assert_eq!(report.slices_run, 6);
        assert_eq!(report.writes_applied, 23);
        assert!(frame.entities().iter::<Position>().all(|(_, p)| p.y == p.x * 2));
    }

    #[test]
    fn failed_slice_contributes_nothing() {
        let mut frame = test_frame();
        let entities = spawn_positions(&mut frame, 8);
        let mut systems = empty_graph();
        let mut graph = RayonTaskGraph::new(2).unwrap();
        let unit = graph.register_slice_unit(
            "flaky",
            Arc::new(|frame: &Frame, range: Range<usize>, w: &mut SliceWriter| {
                for i in range.clone() {
                    if let Some((e, _)) = frame.entities().component_at::<Position>(i) {
                        w.set(e, Position { x: -1, y: -1 });
                    }
                }
                if range.start == 4 {
                    return Err(TaskError::failed("second half refuses"));
                }
                Ok(())
            }),
        );

        graph.begin_frame();
        graph.add_array_task(unit, 8, TaskHandle::NONE, 2).unwrap();
        let report = graph.end_frame(&mut frame, &mut systems);

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].slice, Some(4..8));
        assert_eq!(frame.entities().get::<Position>(entities[0]).unwrap().x, -1);
        assert_eq!(frame.entities().get::<Position>(entities[7]).unwrap().x, 7);
    }

    #[test]
    fn main_thread_tasks_run_in_insertion_order() {
        let mut frame = test_frame();
        let mut systems = empty_graph();
        let mut graph = RayonTaskGraph::new(1).unwrap();
        let first = graph.register_main_thread_unit(
            "spawn",
            Box::new(|ctx: &mut MainThreadContext<'_>| {
                let tick = ctx.frame.tick();
                let e = ctx.frame.entities_mut().create(tick);
                ctx.frame.entities_mut().set(e, Position { x: 1, y: 1 })?;
                Ok(())
            }),
        );
        let second = graph.register_main_thread_unit(
            "double",
            Box::new(|ctx: &mut MainThreadContext<'_>| {
                for (_, p) in ctx.frame.entities_mut().iter_mut::<Position>() {
                    p.x *= 2;
                }
                Ok(())
            }),
        );

        graph.begin_frame();
        let h = graph.add_main_thread_task(first, TaskHandle::NONE).unwrap();
        graph.add_main_thread_task(second, h).unwrap();
        graph.end_frame(&mut frame, &mut systems);
        let xs: Vec<i32> = frame.entities().iter::<Position>().map(|(_, p)| p.x).collect();
        assert_eq!(xs, vec![2]);
    }

    #[test]
    fn failed_main_thread_unit_leaves_the_frame_untouched() {
        let mut frame = test_frame();
        let entities = spawn_positions(&mut frame, 3);
        let before = frame.calculate_checksum(false).unwrap();
        let mut systems = empty_graph();
        let mut graph = RayonTaskGraph::new(1).unwrap();
        let half_done = graph.register_main_thread_unit(
            "half-done",
            Box::new(|ctx: &mut MainThreadContext<'_>| {
                for (_, p) in ctx.frame.entities_mut().iter_mut::<Position>() {
                    p.x += 100;
                }
                let tick = ctx.frame.tick();
                ctx.frame.entities_mut().create(tick);
                let _ = ctx.frame.heap_mut().alloc(16).map_err(TaskError::failed)?;
                Err(TaskError::failed("gave up halfway"))
            }),
        );
        let bump = graph.register_main_thread_unit(
            "bump",
            Box::new(|ctx: &mut MainThreadContext<'_>| {
                for (_, p) in ctx.frame.entities_mut().iter_mut::<Position>() {
                    p.y += 1;
                }
                Ok(())
            }),
        );

        graph.begin_frame();
        let h = graph.add_main_thread_task(half_done, TaskHandle::NONE).unwrap();
        graph.add_main_thread_task(bump, h).unwrap();
        let report = graph.end_frame(&mut frame, &mut systems);

        assert_eq!(report.tasks_run, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].unit, "half-done");
        assert_eq!(frame.entities().len(), 3);
        assert_eq!(frame.heap().used(), 0);
        for (i, e) in entities.iter().enumerate() {
            assert_eq!(
                frame.entities().get::<Position>(*e),
                Some(&Position { x: i as i32, y: 1 })
            );
        }
        assert_ne!(frame.calculate_checksum(false).unwrap(), before);
    }

    #[test]
    fn discard_drops_trailing_tasks() {
        let mut graph = RayonTaskGraph::new(1).unwrap();
        let unit = graph.register_main_thread_unit("noop", Box::new(|_: &mut MainThreadContext<'_>| Ok(())));
        graph.begin_frame();
        graph.add_main_thread_task(unit, TaskHandle::NONE).unwrap();
        let mark = graph.pending_tasks();
        graph.add_main_thread_task(unit, TaskHandle::NONE).unwrap();
        graph.discard_tasks_after(mark);
        assert_eq!(graph.pending_tasks(), 1);
    }
}
