//! Inbound side: filters verified payloads, keeps one serial worker per
//! installation and feeds it webhook events and periodic ticks.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use platform_api_module::PacedRequester;
use store_module::{InstallationId, InstallationStore, IntegrationStore, StoreError};
use tracing::{error, info, warn};

use crate::config::StewardConfig;
use crate::context::EventContext;
use crate::dispatch::{DispatchEngine, DispatchReport};
use crate::payload::WebhookPayload;
use crate::verify::{self, VerifyError};

/// Builds the paced requester a new installation worker talks through.
pub type RequesterFactory =
    Arc<dyn Fn(InstallationId) -> Arc<dyn PacedRequester> + Send + Sync>;

const TICK_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to spawn worker for installation {0}: {1}")]
    Spawn(InstallationId, #[source] std::io::Error),
    #[error("worker for installation {0} is gone")]
    WorkerGone(InstallationId),
    #[error("queue for installation {0} is full")]
    QueueFull(InstallationId),
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub bot_name: String,
    pub secret: Option<String>,
    pub enabled_events: Vec<String>,
    pub queue_capacity: usize,
}

impl RunnerSettings {
    pub fn from_config(config: &StewardConfig) -> Self {
        Self {
            bot_name: config.name.clone(),
            secret: config.secret.clone(),
            enabled_events: config.enabled_events.clone(),
            queue_capacity: config.queue_capacity,
        }
    }
}

/// What became of one inbound payload.
#[derive(Debug)]
pub enum HandleOutcome {
    /// Queued on the installation's worker; the receiver yields the report
    /// once the event has been dispatched.
    Queued(Receiver<DispatchReport>),
    NewInstallation,
    DisabledEvent,
    PayloadFromSelf,
    MissingInstallation,
    /// The installation's worker is backed up; the event was dropped.
    QueueFull,
}

impl HandleOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            HandleOutcome::Queued(_) => "queued",
            HandleOutcome::NewInstallation => "installation_event",
            HandleOutcome::DisabledEvent => "disabled_event",
            HandleOutcome::PayloadFromSelf => "payload_from_self",
            HandleOutcome::MissingInstallation => "missing_installation",
            HandleOutcome::QueueFull => "queue_full",
        }
    }
}

struct Job {
    cx: EventContext,
    done: Sender<DispatchReport>,
}

pub struct Runner {
    settings: RunnerSettings,
    store: Arc<dyn IntegrationStore>,
    engine: Arc<DispatchEngine>,
    requesters: RequesterFactory,
    workers: Mutex<HashMap<InstallationId, Sender<Job>>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Runner {
    pub fn new(
        settings: RunnerSettings,
        store: Arc<dyn IntegrationStore>,
        engine: Arc<DispatchEngine>,
        requesters: RequesterFactory,
    ) -> Self {
        Self {
            settings,
            store,
            engine,
            requesters,
            workers: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn verify_payload(
        &self,
        signature_header: Option<&str>,
        raw_body: &[u8],
    ) -> Result<WebhookPayload, VerifyError> {
        verify::verify_payload(self.settings.secret.as_deref(), signature_header, raw_body)
    }

    pub fn handle_payload(
        &self,
        event_name: &str,
        payload: WebhookPayload,
    ) -> Result<HandleOutcome, RunnerError> {
        if event_name == "installation" || event_name.starts_with("installation_") {
            info!("ignoring installation event {}", event_name);
            return Ok(HandleOutcome::NewInstallation);
        }
        if !self
            .settings
            .enabled_events
            .iter()
            .any(|enabled| enabled == event_name)
        {
            info!("event {} is not enabled, skipping", event_name);
            return Ok(HandleOutcome::DisabledEvent);
        }
        let Some(installation) = payload.installation_id() else {
            warn!("{} payload carries no installation id", event_name);
            return Ok(HandleOutcome::MissingInstallation);
        };

        let bot_name = self.settings.bot_name.to_lowercase();
        let from_self = payload
            .sender
            .as_ref()
            .is_some_and(|sender| sender.login.to_lowercase().contains(&bot_name));
        if from_self {
            info!("skipping payload sent by self");
            return Ok(HandleOutcome::PayloadFromSelf);
        }

        info!(
            "received payload for installation {} (event: {}, action: {})",
            installation,
            event_name,
            payload.action.as_deref().unwrap_or("-")
        );
        let cx = EventContext::from_payload(&self.settings.bot_name, payload);
        match self.submit(installation, cx) {
            Ok(done) => Ok(HandleOutcome::Queued(done)),
            Err(RunnerError::QueueFull(_)) => {
                warn!(
                    "queue for installation {} is full, dropping {} event",
                    installation, event_name
                );
                Ok(HandleOutcome::QueueFull)
            }
            Err(err) => Err(err),
        }
    }

    /// Enqueues one event on the installation's worker, starting it if needed.
    /// Never blocks: a full queue is reported as `RunnerError::QueueFull`.
    pub fn submit(
        &self,
        installation: InstallationId,
        cx: EventContext,
    ) -> Result<Receiver<DispatchReport>, RunnerError> {
        let sender = self.worker(installation)?;
        let (done_tx, done_rx) = bounded(1);
        sender
            .try_send(Job { cx, done: done_tx })
            .map_err(|err| match err {
                TrySendError::Full(_) => RunnerError::QueueFull(installation),
                TrySendError::Disconnected(_) => RunnerError::WorkerGone(installation),
            })?;
        Ok(done_rx)
    }

    /// Starts workers for every installation the store already knows.
    pub fn bootstrap(&self) -> Result<usize, RunnerError> {
        let installations: Vec<InstallationId> = self.store.list_installations()?.collect();
        for installation in &installations {
            self.worker(*installation)?;
        }
        info!("bootstrapped {} installation(s)", installations.len());
        Ok(installations.len())
    }

    /// Installations seen in the store or through a live worker.
    pub fn known_installations(&self) -> Result<Vec<InstallationId>, RunnerError> {
        let mut known: BTreeSet<InstallationId> = self.store.list_installations()?.collect();
        known.extend(self.lock_workers().keys().copied());
        Ok(known.into_iter().collect())
    }

    /// Queues a tick for every known installation. Installations whose queue
    /// is full skip this tick.
    pub fn tick_all(&self) -> Vec<Receiver<DispatchReport>> {
        let installations = match self.known_installations() {
            Ok(installations) => installations,
            Err(err) => {
                error!("tick could not list installations: {}", err);
                return Vec::new();
            }
        };
        installations
            .into_iter()
            .filter_map(|installation| {
                match self.submit(installation, EventContext::tick(&self.settings.bot_name)) {
                    Ok(done) => Some(done),
                    Err(RunnerError::QueueFull(_)) => {
                        warn!("queue for {} is full, skipping tick", installation);
                        None
                    }
                    Err(err) => {
                        error!("failed to queue tick for {}: {}", installation, err);
                        None
                    }
                }
            })
            .collect()
    }

    /// Closes every queue and waits for the workers to drain.
    pub fn shutdown(&self) {
        let senders: Vec<Sender<Job>> = self.lock_workers().drain().map(|(_, tx)| tx).collect();
        drop(senders);
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
        info!("all installation workers stopped");
    }

    fn worker(&self, installation: InstallationId) -> Result<Sender<Job>, RunnerError> {
        let mut workers = self.lock_workers();
        if let Some(sender) = workers.get(&installation) {
            return Ok(sender.clone());
        }

        let (sender, receiver) = bounded::<Job>(self.settings.queue_capacity);
        let store = InstallationStore::new(self.store.clone(), installation);
        let engine = self.engine.clone();
        let requesters = self.requesters.clone();
        let handle = thread::Builder::new()
            .name(format!("installation-{}", installation))
            .spawn(move || {
                info!("worker started for installation {}", installation);
                let api = requesters(installation);
                for job in receiver {
                    let report = engine.dispatch(&job.cx, &store, api.as_ref());
                    let _ = job.done.send(report);
                }
                info!("worker stopped for installation {}", installation);
            })
            .map_err(|err| RunnerError::Spawn(installation, err))?;

        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
        workers.insert(installation, sender.clone());
        Ok(sender)
    }

    fn lock_workers(&self) -> MutexGuard<'_, HashMap<InstallationId, Sender<Job>>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct TickControl {
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl TickControl {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stop_and_join(&mut self) {
        self.stop();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Queues a tick for every installation once per `interval` until stopped.
pub fn start_tick_loop(runner: Arc<Runner>, interval: Duration) -> TickControl {
    let stop = Arc::new(AtomicBool::new(false));
    let tick_stop = stop.clone();
    let handle = thread::spawn(move || {
        info!("tick loop started, interval {:?}", interval);
        'ticks: loop {
            let mut waited = Duration::ZERO;
            while waited < interval {
                if tick_stop.load(Ordering::Relaxed) {
                    break 'ticks;
                }
                let step = TICK_POLL_INTERVAL.min(interval - waited);
                thread::sleep(step);
                waited += step;
            }
            if tick_stop.load(Ordering::Relaxed) {
                break;
            }
            let queued = runner.tick_all();
            info!("queued tick for {} installation(s)", queued.len());
        }
        info!("tick loop stopped");
    });

    TickControl {
        stop,
        handles: vec![handle],
    }
}
