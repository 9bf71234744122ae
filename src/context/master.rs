// Master context
// Parentless context on its own thread that every holder shares GPU objects with

use super::{Backend, ContextConfig, ContextFlags, GpuVersion, GraphicsContext};
use crate::renderer::{Flow, LoopHandler, RendererError, TaskLoop};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const MASTER_READY_TIMEOUT: Duration = Duration::from_secs(10);
const MASTER_THREAD_NAME: &str = "master-context";

enum MasterRequest {
    HasExtension(String, Sender<bool>),
}

struct MasterHandler;

impl<B: Backend> LoopHandler<B> for MasterHandler {
    type Request = MasterRequest;

    fn on_request(&mut self, ctx: &mut GraphicsContext<B>, request: MasterRequest) -> Flow {
        match request {
            MasterRequest::HasExtension(name, reply) => {
                let _ = reply.send(ctx.has_extension(&name));
            }
        }
        Flow::Continue
    }
}

/// Common ancestor context for everything that samples the shared textures.
///
/// Create one up front and pass [`context_handle`](Self::context_handle) to
/// each holder. Nothing renders on the master thread itself.
pub struct MasterContext<B: Backend> {
    task: TaskLoop<MasterRequest>,
    share: Mutex<Option<B::Share>>,
    version: GpuVersion,
}

impl<B: Backend> MasterContext<B> {
    pub fn create(backend: Arc<B>, version: GpuVersion, flags: ContextFlags) -> Result<Self, RendererError> {
        Self::create_with_timeout(backend, version, flags, MASTER_READY_TIMEOUT)
    }

    pub fn create_with_timeout(
        backend: Arc<B>,
        version: GpuVersion,
        flags: ContextFlags,
        ready_timeout: Duration,
    ) -> Result<Self, RendererError> {
        let (task, (share, actual)) = TaskLoop::spawn(
            MASTER_THREAD_NAME,
            backend,
            version,
            ContextConfig::from_flags(flags),
            None,
            ready_timeout,
            |ctx: &mut GraphicsContext<B>| Ok((MasterHandler, (ctx.share_handle()?, ctx.version()))),
        )?;
        log::info!("Master context ready (tier {})", actual);

        Ok(Self {
            task,
            share: Mutex::new(Some(share)),
            version: actual,
        })
    }

    /// Share handle for child contexts. Fails once released.
    pub fn context_handle(&self) -> Result<B::Share, RendererError> {
        self.share.lock().clone().ok_or(RendererError::NotRunning)
    }

    pub fn version(&self) -> GpuVersion {
        self.version
    }

    pub fn has_extension(&self, name: &str) -> Result<bool, RendererError> {
        let name = name.to_string();
        self.task.call(|reply| MasterRequest::HasExtension(name, reply))
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Stops the master thread. Safe to call more than once.
    pub fn release(&self) {
        if self.share.lock().take().is_some() {
            log::info!("Releasing master context");
        }
        self.task.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::headless::HeadlessBackend;

    #[test]
    fn test_master_exposes_share_handle() {
        let backend = Arc::new(HeadlessBackend::new());
        let master = MasterContext::create(backend, GpuVersion::V3, ContextFlags::DEPTH_BUFFER).unwrap();
        let a = master.context_handle().unwrap();
        let b = master.context_handle().unwrap();
        assert_eq!(a.device_id, b.device_id);
        assert_eq!(master.version(), GpuVersion::V3);
        assert!(master.is_running());
        master.release();
    }

    #[test]
    fn test_master_falls_back() {
        let backend = Arc::new(HeadlessBackend::with_max_version(Some(GpuVersion::V2)));
        let master = MasterContext::create(backend, GpuVersion::V3, ContextFlags::empty()).unwrap();
        assert_eq!(master.version(), GpuVersion::V2);
        assert_eq!(master.context_handle().unwrap().version, GpuVersion::V2);
        master.release();
    }

    #[test]
    fn test_master_has_extension() {
        let master =
            MasterContext::create(Arc::new(HeadlessBackend::new()), GpuVersion::V3, ContextFlags::empty()).unwrap();
        assert!(master.has_extension("headless_quad").unwrap());
        assert!(!master.has_extension("nope").unwrap());
        master.release();
    }

    #[test]
    fn test_master_release_is_idempotent() {
        let backend = Arc::new(HeadlessBackend::new());
        let master = MasterContext::create(backend.clone(), GpuVersion::V3, ContextFlags::empty()).unwrap();
        master.release();
        master.release();
        assert!(!master.is_running());
        assert!(matches!(master.context_handle(), Err(RendererError::NotRunning)));
        assert!(matches!(master.has_extension("headless_quad"), Err(RendererError::NotRunning)));
        assert_eq!(backend.released(), 1);
    }

    #[test]
    fn test_master_creation_failure() {
        let backend = Arc::new(HeadlessBackend::with_max_version(None));
        let result = MasterContext::create(backend, GpuVersion::V3, ContextFlags::empty());
        assert!(matches!(result, Err(RendererError::Context(_))));
    }
}
