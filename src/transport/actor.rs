use std::time::Duration;

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, debug_span, Instrument};

/// A unit of work executed on the actor with exclusive access to its state.
pub type Job<S> = Box<dyn FnOnce(&mut S, &ActorControl<S>) + Send>;

/// Furthest a job or deadline is ever scheduled into the future. Timeouts
/// beyond it are treated as unbounded.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// The instant `delay` from now, capped at [`FAR_FUTURE`] so huge delays such
/// as `Duration::MAX` do not overflow.
pub(crate) fn deadline_after(delay: Duration) -> Instant {
    Instant::now() + delay.min(FAR_FUTURE)
}

/// A queued job together with a handle that keeps the actor alive until the
/// job has run.
struct Envelope<S> {
    job: Job<S>,
    sender: mpsc::UnboundedSender<Envelope<S>>,
}

/// Handle used to schedule work on an actor.
///
/// All jobs of one actor run one after another on a single task, so the state
/// they receive never needs a lock. Handles can be cloned and sent anywhere;
/// calling back into the actor from a foreign task is how results get
/// delivered to its state.
pub struct ActorControl<S> {
    tx: mpsc::UnboundedSender<Envelope<S>>,
}

impl<S> Clone for ActorControl<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S: Send + 'static> ActorControl<S> {
    /// Spawns an actor owning `state` on the current tokio runtime.
    ///
    /// The actor stops once every handle to it, including the ones held by
    /// pending timers, has been dropped and every queued job has run.
    pub fn spawn(name: &'static str, mut state: S) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope<S>>();
        let span = debug_span!("actor", name);
        tokio::spawn(
            async move {
                debug!("actor started");
                while let Some(Envelope { job, sender }) = rx.recv().await {
                    job(&mut state, &ActorControl { tx: sender });
                }
                debug!("actor stopped");
            }
            .instrument(span),
        );
        Self { tx }
    }

    /// Runs `job` on the actor as soon as it gets to it. Returns `false` (and
    /// drops the job) if the actor has stopped.
    pub fn call<F>(&self, job: F) -> bool
    where
        F: FnOnce(&mut S, &ActorControl<S>) + Send + 'static,
    {
        let envelope = Envelope {
            job: Box::new(job),
            sender: self.tx.clone(),
        };
        self.tx.send(envelope).is_ok()
    }

    /// Runs `job` on the actor once `delay` has passed.
    pub fn run_delayed<F>(&self, delay: Duration, job: F) -> ScheduledTimer
    where
        F: FnOnce(&mut S, &ActorControl<S>) + Send + 'static,
    {
        self.run_at(deadline_after(delay), job)
    }

    /// Runs `job` on the actor once `deadline` has been reached.
    ///
    /// There is no way to cancel the job; it has to check for itself whether
    /// it is still relevant when it runs.
    pub fn run_at<F>(&self, deadline: Instant, job: F) -> ScheduledTimer
    where
        F: FnOnce(&mut S, &ActorControl<S>) + Send + 'static,
    {
        let actor = self.clone();
        let handle = tokio::spawn(async move {
            time::sleep_until(deadline).await;
            actor.call(job);
        });
        ScheduledTimer { deadline, handle }
    }
}

/// A job waiting for its time to come.
#[derive(Debug)]
pub struct ScheduledTimer {
    deadline: Instant,
    handle: JoinHandle<()>,
}

impl ScheduledTimer {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Whether the job has been handed to the actor.
    pub fn is_elapsed(&self) -> bool {
        self.handle.is_finished()
    }
}
