//! # Worker Threads and Jobs
//!
//! Thread pool used for multi-threaded iteration. Each worker owns one
//! mutation stage and a bounded queue of jobs; a job describes a contiguous
//! row range of one matched table to run a system function over.
//!
//! ## Protocol
//! Workers suspend in exactly two places:
//!
//! - the start condition (`thread_cond`), waiting for the schedule epoch to
//!   advance, which signals that queues are filled and the world pointer is
//!   valid;
//! - nothing else. The completion condition (`job_cond`) is waited on by
//!   the dispatching thread only, until `jobs_finished == threads_running`.
//!
//! Dispatch blocks the calling thread until every worker has drained its
//! queue and reported in, which is what makes handing workers a shared
//! world reference sound: the world cannot be mutated while any worker is
//! between wake-up and report.
//!
//! ## Cancellation
//! Setting the quit flag and advancing the epoch makes every worker return
//! from its loop at the next schedule fence. Cooperative shutdown requests
//! from systems are honoured between frames, never mid-merge.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::debug;

use crate::engine::types::{QueryId, StageId, TableId, MAX_JOBS_PER_WORKER};
use crate::engine::world::World;

/// Caller identity for world operations.
///
/// Replaces pointer tagging: a stage reference passed as a world is
/// expressed as a typed variant instead of a magic number, and the world
/// resolves it to the right stage at the API boundary.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Context {
    /// The world itself. Routes to the main stage, or to the temp stage
    /// while iteration is in progress.
    World,

    /// A worker thread, identified by its stage id.
    Worker(StageId),
}

/// System entry point invoked per job.
pub type JobFn = fn(
    world: &World,
    ctx: Context,
    query: QueryId,
    table: TableId,
    offset: usize,
    limit: usize,
);

/// A unit of work: one system over one contiguous row range of one table.
#[derive(Clone, Copy)]
pub struct Job {
    /// Query whose matched table is iterated.
    pub query: QueryId,

    /// Table holding the rows.
    pub table: TableId,

    /// First row of the range.
    pub offset: usize,

    /// Number of rows to process.
    pub limit: usize,

    /// System function to invoke.
    pub run: JobFn,
}

struct Schedule {
    /// Bumped once per dispatch; workers wake when it moves past what they
    /// have seen.
    epoch: u64,

    /// Address of the world valid for the current epoch.
    world: usize,

    /// Workers return from their loop at the next fence.
    quit: bool,
}

struct JobState {
    jobs_finished: usize,
    threads_running: usize,
}

struct ThreadCtl {
    schedule: Mutex<Schedule>,
    thread_cond: Condvar,
    jobs: Mutex<JobState>,
    job_cond: Condvar,
    queues: Vec<Mutex<Vec<Job>>>,
}

/// Pool of persistent worker threads with per-worker bounded job queues.
pub(crate) struct WorkerPool {
    ctl: Arc<ThreadCtl>,
    handles: Vec<JoinHandle<()>>,
    count: usize,
}

impl WorkerPool {
    /// Stage id of worker `index`. The main stage is 0 and the temp stage
    /// is 1, so workers start at 2.
    #[inline]
    pub fn stage_id(index: usize) -> StageId {
        index as StageId + 2
    }

    /// Arena index of the worker owning `stage_id`.
    #[inline]
    pub fn worker_index(stage_id: StageId) -> usize {
        debug_assert!(stage_id >= 2);
        (stage_id - 2) as usize
    }

    /// Spawns `count` workers, all parked on the start condition.
    pub fn spawn(count: usize) -> Self {
        let ctl = Arc::new(ThreadCtl {
            schedule: Mutex::new(Schedule {
                epoch: 0,
                world: 0,
                quit: false,
            }),
            thread_cond: Condvar::new(),
            jobs: Mutex::new(JobState {
                jobs_finished: 0,
                threads_running: 0,
            }),
            job_cond: Condvar::new(),
            queues: (0..count).map(|_| Mutex::new(Vec::new())).collect(),
        });

        let handles = (0..count)
            .map(|index| {
                let ctl = Arc::clone(&ctl);
                std::thread::spawn(move || worker_main(ctl, index))
            })
            .collect();

        debug!(workers = count, "worker pool started");
        WorkerPool {
            ctl,
            handles,
            count,
        }
    }

    /// Number of workers in the pool.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Queues a job for `worker`, failing when the bounded queue is full.
    pub fn try_push(&self, worker: usize, job: Job) -> bool {
        let mut queue = self.ctl.queues[worker].lock().expect("job queue poisoned");
        if queue.len() >= MAX_JOBS_PER_WORKER {
            return false;
        }
        queue.push(job);
        true
    }

    /// Wakes every worker against `world` and blocks until all of them have
    /// drained their queues.
    ///
    /// The world reference is handed to workers as an address. This is
    /// sound because this function does not return until every worker has
    /// reported completion, and workers never touch the address outside the
    /// wake-to-report window.
    pub fn dispatch(&self, world: &World) {
        {
            let mut jobs = self.ctl.jobs.lock().expect("job state poisoned");
            jobs.jobs_finished = 0;
            jobs.threads_running = self.count;
        }
        {
            let mut schedule = self.ctl.schedule.lock().expect("schedule poisoned");
            schedule.epoch += 1;
            schedule.world = world as *const World as usize;
        }
        self.ctl.thread_cond.notify_all();

        let mut jobs = self.ctl.jobs.lock().expect("job state poisoned");
        while jobs.jobs_finished < jobs.threads_running {
            jobs = self
                .ctl
                .job_cond
                .wait(jobs)
                .expect("job state poisoned");
        }
    }

    /// Signals quit and joins every worker.
    pub fn quit(&mut self) {
        {
            let mut schedule = self.ctl.schedule.lock().expect("schedule poisoned");
            schedule.quit = true;
        }
        self.ctl.thread_cond.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        debug!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.quit();
        }
    }
}

fn worker_main(ctl: Arc<ThreadCtl>, index: usize) {
    let stage_id = WorkerPool::stage_id(index);
    let mut seen_epoch = 0u64;

    loop {
        let (epoch, world_addr) = {
            let mut schedule = ctl.schedule.lock().expect("schedule poisoned");
            loop {
                if schedule.quit {
                    return;
                }
                if schedule.epoch != seen_epoch {
                    break;
                }
                schedule = ctl
                    .thread_cond
                    .wait(schedule)
                    .expect("schedule poisoned");
            }
            (schedule.epoch, schedule.world)
        };
        seen_epoch = epoch;

        let jobs: Vec<Job> = {
            let mut queue = ctl.queues[index].lock().expect("job queue poisoned");
            queue.drain(..).collect()
        };

        // SAFETY: the dispatching thread published this address for the
        // current epoch and blocks until this worker reports completion
        // below, so the world outlives every use here and is not mutated
        // concurrently.
        let world: &World = unsafe { &*(world_addr as *const World) };

        for job in jobs {
            (job.run)(
                world,
                Context::Worker(stage_id),
                job.query,
                job.table,
                job.offset,
                job.limit,
            );
        }

        let mut state = ctl.jobs.lock().expect("job state poisoned");
        state.jobs_finished += 1;
        if state.jobs_finished >= state.threads_running {
            ctl.job_cond.notify_one();
        }
    }
}
