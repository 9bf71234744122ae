// Task loop
// One worker thread owns a GraphicsContext and executes queued requests in order

use super::RendererError;
use crate::context::{Backend, ContextConfig, GpuVersion, GraphicsContext};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

/// What the loop does after a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Break,
}

/// Worker-side request handler. Lives on the worker thread only.
pub trait LoopHandler<B: Backend> {
    type Request: Send + 'static;

    /// Runs once the context is current, before the owner is told the loop is ready.
    fn on_start(&mut self, _ctx: &mut GraphicsContext<B>) {}

    fn on_request(&mut self, ctx: &mut GraphicsContext<B>, request: Self::Request) -> Flow;

    /// Runs with the context current, right before it is released.
    fn on_stop(&mut self, _ctx: &mut GraphicsContext<B>) {}
}

enum Envelope<R> {
    Request(R),
    Break,
}

type SenderSlot<R> = Arc<RwLock<Option<Sender<Envelope<R>>>>>;

/// Handle to a worker thread running a [`LoopHandler`].
pub struct TaskLoop<R: Send + 'static> {
    name: String,
    sender: SenderSlot<R>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl<R: Send + 'static> TaskLoop<R> {
    /// Starts the worker thread and blocks until it is ready.
    ///
    /// The worker initializes its context (with version fallback), runs
    /// `factory` to build the handler and then reports back. `factory`'s
    /// second value is handed to the caller. If the worker is not ready within
    /// `ready_timeout` the loop is abandoned and [`RendererError::Timeout`]
    /// is returned.
    pub fn spawn<B, H, T, F>(
        name: &str,
        backend: Arc<B>,
        max_version: GpuVersion,
        config: ContextConfig,
        share: Option<B::Share>,
        ready_timeout: Duration,
        factory: F,
    ) -> Result<(Self, T), RendererError>
    where
        B: Backend,
        H: LoopHandler<B, Request = R>,
        T: Send + 'static,
        F: FnOnce(&mut GraphicsContext<B>) -> Result<(H, T), RendererError> + Send + 'static,
    {
        let (request_tx, request_rx) = crossbeam_channel::unbounded();
        let sender: SenderSlot<R> = Arc::new(RwLock::new(Some(request_tx)));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let worker = Worker {
            name: name.to_string(),
            requests: request_rx,
            sender: sender.clone(),
        };
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                worker.run(backend, max_version, config, share, factory, ready_tx);
            })
            .map_err(|e| RendererError::InitError(format!("Failed to spawn {}: {}", name, e)))?;
        let worker_id = handle.thread().id();

        match ready_rx.recv_timeout(ready_timeout) {
            Ok(Ok(value)) => {
                log::debug!("{} ready", name);
                Ok((
                    Self {
                        name: name.to_string(),
                        sender,
                        worker: Mutex::new(Some(handle)),
                        worker_id,
                    },
                    value,
                ))
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                log::error!("{} failed to start: {}", name, e);
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => {
                // The worker shuts itself down once it notices nobody is listening
                *sender.write() = None;
                log::error!("{} not ready after {:?}", name, ready_timeout);
                Err(RendererError::Timeout(format!(
                    "{} not ready after {:?}",
                    name, ready_timeout
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                Err(RendererError::InitError(format!("{} exited during startup", name)))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.sender.read().is_some()
    }

    /// Queues a request without waiting. Returns false if the loop has stopped.
    pub fn post(&self, request: R) -> bool {
        let slot = self.sender.read();
        let sent = match slot.as_ref() {
            Some(tx) => tx.send(Envelope::Request(request)).is_ok(),
            None => false,
        };
        if !sent {
            log::debug!("{}: dropping request, loop is not running", self.name);
        }
        sent
    }

    /// Queues a request carrying a reply channel and blocks for the reply.
    pub fn call<T, F>(&self, make_request: F) -> Result<T, RendererError>
    where
        F: FnOnce(Sender<T>) -> R,
    {
        if thread::current().id() == self.worker_id {
            return Err(RendererError::WorkerThread);
        }

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        {
            let slot = self.sender.read();
            let tx = slot.as_ref().ok_or(RendererError::NotRunning)?;
            tx.send(Envelope::Request(make_request(reply_tx)))
                .map_err(|_| RendererError::NotRunning)?;
        }
        // Dropped unanswered when the loop stops first
        reply_rx.recv().map_err(|_| RendererError::NotRunning)
    }

    /// Stops the loop after everything already queued and joins the worker.
    /// Safe to call more than once, and from the worker itself (no join then).
    pub fn release(&self) {
        if let Some(tx) = self.sender.read().as_ref() {
            let _ = tx.send(Envelope::Break);
        }

        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                log::error!("{} worker panicked", self.name);
            } else {
                log::debug!("{} worker joined", self.name);
            }
        }
    }
}

impl<R: Send + 'static> Drop for TaskLoop<R> {
    fn drop(&mut self) {
        self.release();
    }
}

struct Worker<R> {
    name: String,
    requests: Receiver<Envelope<R>>,
    sender: SenderSlot<R>,
}

impl<R: Send + 'static> Worker<R> {
    fn run<B, H, T, F>(
        self,
        backend: Arc<B>,
        max_version: GpuVersion,
        config: ContextConfig,
        share: Option<B::Share>,
        factory: F,
        ready: Sender<Result<T, RendererError>>,
    ) where
        B: Backend,
        H: LoopHandler<B, Request = R>,
        F: FnOnce(&mut GraphicsContext<B>) -> Result<(H, T), RendererError>,
    {
        let mut ctx = match GraphicsContext::initialize(&*backend, max_version, &config, share.as_ref()) {
            Ok(ctx) => ctx,
            Err(e) => {
                self.close();
                let _ = ready.send(Err(e.into()));
                return;
            }
        };

        let started = ctx
            .make_current()
            .map_err(RendererError::from)
            .and_then(|_| factory(&mut ctx));
        let (mut handler, value) = match started {
            Ok(started) => started,
            Err(e) => {
                ctx.release();
                self.close();
                let _ = ready.send(Err(e));
                return;
            }
        };

        handler.on_start(&mut ctx);
        if ready.send(Ok(value)).is_err() {
            log::warn!("{}: owner stopped waiting, shutting down", self.name);
            self.shutdown(&mut ctx, &mut handler);
            return;
        }

        log::debug!("{} running", self.name);
        loop {
            let request = match self.requests.recv() {
                Ok(Envelope::Request(request)) => request,
                Ok(Envelope::Break) | Err(_) => break,
            };
            if let Err(e) = ctx.make_current() {
                log::error!("{}: context unusable, stopping: {}", self.name, e);
                break;
            }
            if handler.on_request(&mut ctx, request) == Flow::Break {
                break;
            }
        }

        self.shutdown(&mut ctx, &mut handler);
    }

    /// Refuses new requests and discards the queued ones.
    fn close(&self) {
        *self.sender.write() = None;
        let discarded = self.requests.try_iter().count();
        if discarded > 0 {
            log::debug!("{}: discarded {} queued requests", self.name, discarded);
        }
    }

    fn shutdown<B, H>(&self, ctx: &mut GraphicsContext<B>, handler: &mut H)
    where
        B: Backend,
        H: LoopHandler<B, Request = R>,
    {
        self.close();
        if let Err(e) = ctx.make_current() {
            log::warn!("{}: context not current during shutdown: {}", self.name, e);
        }
        handler.on_stop(ctx);
        ctx.release();
        log::info!("{} stopped", self.name);
    }
}
