//! Worker scheduler
//!
//! A fixed pool of OS threads, each running its own single-threaded tokio
//! runtime with a `LocalSet`. A request is owned by one worker from start to
//! finish, so module thread data is always the worker's own. Many requests
//! interleave on one worker at their `.await` points.
//!
//! Workers attach to every server image they serve (`thread_instantiate`)
//! and detach from a retired image once their last request on it finishes.
//! A worker that fails to set up a new image keeps serving the images it
//! already has; it is skipped for the new one.

use crate::error::{DispatchError, ResourceError};
use crate::lifecycle::{ActiveRequest, VirtualServers};
use crate::module::ModuleError;
use crate::request::Request;
use aaa_proto::RCode;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tracing::{debug, error, info, warn};

/// A finished request
#[derive(Debug)]
pub struct JobResult {
    pub request: Request,
    pub outcome: Result<RCode, DispatchError>,
}

struct Job {
    active: ActiveRequest,
    request: Request,
    timeout: Duration,
    reply: oneshot::Sender<JobResult>,
}

enum Command {
    Attach(Arc<VirtualServers>, oneshot::Sender<Result<(), ModuleError>>),
    Run(Job),
    Retire(Arc<VirtualServers>),
    Stop,
}

struct Worker {
    tx: mpsc::UnboundedSender<Command>,
    alive: Arc<AtomicBool>,
    /// Generations this worker failed to set up
    refused: Mutex<HashSet<u64>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn serves(&self, generation: u64) -> bool {
        self.alive.load(Ordering::Acquire)
            && !self
                .refused
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&generation)
    }

    fn refuse(&self, generation: u64) {
        self.refused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(generation);
    }
}

/// The worker pool
pub struct Scheduler {
    workers: Vec<Worker>,
    next: AtomicUsize,
}

impl Scheduler {
    /// Spawn `workers` threads and attach them to `image`
    ///
    /// Start fails only if no worker could set up the image.
    pub async fn start(image: &Arc<VirtualServers>, workers: usize) -> Result<Self, ResourceError> {
        if workers == 0 {
            return Err(ResourceError::NoWorkers);
        }

        let mut pool = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            let alive = Arc::new(AtomicBool::new(true));
            let flag = alive.clone();
            let thread = std::thread::Builder::new()
                .name(format!("aaa-worker-{}", index))
                .spawn(move || run_worker(index, rx, flag))?;
            pool.push(Worker {
                tx,
                alive,
                refused: Mutex::new(HashSet::new()),
                thread: Mutex::new(Some(thread)),
            });
        }

        let scheduler = Scheduler {
            workers: pool,
            next: AtomicUsize::new(0),
        };
        let attached = scheduler.attach(image).await?;
        info!(workers = attached, generation = image.generation(), "Worker pool started");
        Ok(scheduler)
    }

    /// Set up every live worker for a new image
    ///
    /// Returns the number of workers serving the image. Workers whose setup
    /// fails stay up for the images they already serve.
    pub async fn attach(&self, image: &Arc<VirtualServers>) -> Result<usize, ResourceError> {
        let mut pending = Vec::new();
        for (index, worker) in self.live_workers() {
            let (tx, rx) = oneshot::channel();
            if worker.tx.send(Command::Attach(image.clone(), tx)).is_ok() {
                pending.push((index, rx));
            }
        }

        let mut attached = 0;
        let mut first_error = None;
        for (index, rx) in pending {
            match rx.await {
                Ok(Ok(())) => attached += 1,
                Ok(Err(source)) => {
                    error!(
                        worker = index,
                        generation = image.generation(),
                        "Worker failed thread setup: {}",
                        source
                    );
                    self.workers[index].refuse(image.generation());
                    first_error.get_or_insert(ResourceError::ThreadInstantiate { worker: index, source });
                }
                Err(_) => {
                    warn!(worker = index, "Worker exited during attach");
                    self.workers[index].alive.store(false, Ordering::Release);
                }
            }
        }

        if attached == 0 {
            return Err(first_error.unwrap_or(ResourceError::NoWorkers));
        }
        Ok(attached)
    }

    /// Run a request on the next worker serving its image
    pub async fn submit(
        &self,
        active: ActiveRequest,
        request: Request,
        timeout: Duration,
    ) -> Result<JobResult, DispatchError> {
        let generation = active.image().generation();
        let count = self.workers.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        let mut command = Command::Run(Job {
            active,
            request,
            timeout,
            reply,
        });

        for offset in 0..count {
            let worker = &self.workers[(start + offset) % count];
            if !worker.serves(generation) {
                continue;
            }
            match worker.tx.send(command) {
                Ok(()) => return rx.await.map_err(|_| DispatchError::Cancelled),
                Err(mpsc::error::SendError(returned)) => {
                    worker.alive.store(false, Ordering::Release);
                    command = returned;
                }
            }
        }
        Err(DispatchError::NotRunning)
    }

    /// Tell workers an image no longer receives requests
    pub fn retire(&self, image: &Arc<VirtualServers>) {
        for worker in &self.workers {
            worker
                .refused
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&image.generation());
        }
        for (_, worker) in self.live_workers() {
            let _ = worker.tx.send(Command::Retire(image.clone()));
        }
    }

    /// Workers still accepting requests
    pub fn live(&self) -> usize {
        self.live_workers().count()
    }

    /// Stop every worker and wait for the threads to exit
    ///
    /// Requests still running are dropped; their callers see `Cancelled`.
    pub fn stop(&self) {
        for worker in &self.workers {
            let _ = worker.tx.send(Command::Stop);
            worker.alive.store(false, Ordering::Release);
        }
        for (index, worker) in self.workers.iter().enumerate() {
            let thread = worker.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(thread) = thread {
                if thread.join().is_err() {
                    error!(worker = index, "Worker thread panicked");
                }
            }
        }
    }

    fn live_workers(&self) -> impl Iterator<Item = (usize, &Worker)> {
        self.workers
            .iter()
            .enumerate()
            .filter(|(_, worker)| worker.alive.load(Ordering::Acquire))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Images a worker is attached to
struct Slot {
    image: Arc<VirtualServers>,
    in_flight: usize,
    retired: bool,
}

type Slots = Rc<RefCell<HashMap<u64, Slot>>>;

fn run_worker(index: usize, mut rx: mpsc::UnboundedReceiver<Command>, alive: Arc<AtomicBool>) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(worker = index, "Failed to build worker runtime: {}", e);
            alive.store(false, Ordering::Release);
            return;
        }
    };

    let slots: Slots = Rc::new(RefCell::new(HashMap::new()));
    let local = LocalSet::new();
    local.block_on(&runtime, async {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Attach(image, ack) => {
                    let result = image.thread_instantiate();
                    if result.is_ok() {
                        slots.borrow_mut().entry(image.generation()).or_insert(Slot {
                            image,
                            in_flight: 0,
                            retired: false,
                        });
                    }
                    let _ = ack.send(result);
                }
                Command::Run(job) => start_job(index, &slots, job),
                Command::Retire(image) => {
                    let generation = image.generation();
                    let idle = match slots.borrow_mut().get_mut(&generation) {
                        Some(slot) => {
                            slot.retired = true;
                            slot.in_flight == 0
                        }
                        None => false,
                    };
                    if idle {
                        detach(index, &slots, generation);
                    }
                }
                Command::Stop => break,
            }
        }
    });

    alive.store(false, Ordering::Release);
    let generations: Vec<u64> = slots.borrow().keys().copied().collect();
    for generation in generations {
        detach(index, &slots, generation);
    }
    debug!(worker = index, "Worker stopped");
}

fn start_job(index: usize, slots: &Slots, job: Job) {
    let generation = job.active.image().generation();
    {
        let mut slots = slots.borrow_mut();
        let slot = slots.entry(generation).or_insert_with(|| Slot {
            image: job.active.image().clone(),
            in_flight: 0,
            retired: false,
        });
        slot.in_flight += 1;
    }

    // Images attached after start are set up lazily
    if let Err(e) = job.active.image().thread_instantiate() {
        warn!(worker = index, generation, "Thread setup failed: {}", e);
    }

    let slots = slots.clone();
    tokio::task::spawn_local(async move {
        let Job {
            active,
            mut request,
            timeout,
            reply,
        } = job;
        let image = active.image().clone();

        let outcome = match tokio::time::timeout(timeout, image.process(&mut request)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(worker = index, request = request.id, "Request timed out");
                request.cancel();
                let outcome = Err(DispatchError::Timeout(timeout.as_millis() as u64));
                image.stats().record_request(&outcome);
                outcome
            }
        };
        // The last request on a retired image frees it
        drop(active);
        let _ = reply.send(JobResult { request, outcome });

        let finished = match slots.borrow_mut().get_mut(&generation) {
            Some(slot) => {
                slot.in_flight -= 1;
                slot.retired && slot.in_flight == 0
            }
            None => false,
        };
        if finished {
            detach(index, &slots, generation);
        }
    });
}

fn detach(index: usize, slots: &Slots, generation: u64) {
    let slot = slots.borrow_mut().remove(&generation);
    if let Some(slot) = slot {
        slot.image.thread_detach();
        debug!(worker = index, generation, "Detached from image");
    }
}
