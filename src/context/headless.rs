// Headless recording backend
// Stands in for a GPU in unit tests: every surface carries counters that
// record what was drawn into it

use super::{Backend, ContextConfig, ContextError, GpuVersion, Quad, RawContext};
use crate::matrix::Mat4;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

static NEXT_DEVICE_ID: AtomicU32 = AtomicU32::new(1);

pub(crate) struct HeadlessBackend {
    max_supported: Option<GpuVersion>,
    attempts: AtomicUsize,
    released: Arc<AtomicUsize>,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::with_max_version(Some(GpuVersion::V3))
    }

    /// `None` makes every context creation fail.
    pub fn with_max_version(max_supported: Option<GpuVersion>) -> Self {
        Self {
            max_supported,
            attempts: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct HeadlessShare {
    pub device_id: u32,
    pub version: GpuVersion,
}

/// What the tests observe about one target surface.
#[derive(Default)]
pub(crate) struct SurfaceStats {
    pub draws: AtomicUsize,
    pub clears: AtomicUsize,
    pub fail_draw: AtomicBool,
    pub frame_timeout: AtomicBool,
    pub released: AtomicBool,
    pub last_mvp: Mutex<Option<Mat4>>,
    pub last_tex_matrix: Mutex<Option<Mat4>>,
    pub last_effect: Mutex<Option<(u32, Vec<f32>)>>,
}

impl SurfaceStats {
    pub fn draws(&self) -> usize {
        self.draws.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

pub(crate) struct HeadlessNative {
    stats: Arc<SurfaceStats>,
    width: u32,
    height: u32,
    fail_create: bool,
}

impl HeadlessNative {
    pub fn new(width: u32, height: u32) -> (Self, Arc<SurfaceStats>) {
        let stats = Arc::new(SurfaceStats::default());
        let native = Self {
            stats: stats.clone(),
            width,
            height,
            fail_create: false,
        };
        (native, stats)
    }

    /// A handle the backend refuses to create a surface for.
    pub fn broken() -> Self {
        Self {
            stats: Arc::new(SurfaceStats::default()),
            width: 0,
            height: 0,
            fail_create: true,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct HeadlessInput {
    pub id: u32,
    size: Arc<Mutex<(u32, u32)>>,
}

impl HeadlessInput {
    pub fn size(&self) -> (u32, u32) {
        *self.size.lock()
    }
}

pub(crate) struct HeadlessContext {
    share: HeadlessShare,
    owner: ThreadId,
    input: Option<HeadlessInput>,
    released: Arc<AtomicUsize>,
}

pub(crate) struct HeadlessSurface {
    stats: Arc<SurfaceStats>,
    width: u32,
    height: u32,
    bound: bool,
}

impl HeadlessContext {
    fn check_thread(&self) {
        assert_eq!(
            thread::current().id(),
            self.owner,
            "headless context used off its owning thread"
        );
    }
}

impl Backend for HeadlessBackend {
    type Share = HeadlessShare;
    type Native = HeadlessNative;
    type Input = HeadlessInput;
    type Context = HeadlessContext;

    fn name(&self) -> &'static str {
        "headless"
    }

    fn create_context(
        &self,
        version: GpuVersion,
        _config: &ContextConfig,
        share: Option<&HeadlessShare>,
    ) -> Result<HeadlessContext, ContextError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let supported = match share {
            Some(parent) => Some(parent.version),
            None => self.max_supported,
        };
        match supported {
            Some(max) if version <= max => {}
            _ => {
                return Err(ContextError::InitError(format!(
                    "tier {} not supported",
                    version
                )));
            }
        }

        let share = match share {
            Some(parent) => parent.clone(),
            None => HeadlessShare {
                device_id: NEXT_DEVICE_ID.fetch_add(1, Ordering::SeqCst),
                version,
            },
        };

        Ok(HeadlessContext {
            share,
            owner: thread::current().id(),
            input: None,
            released: self.released.clone(),
        })
    }
}

impl RawContext<HeadlessBackend> for HeadlessContext {
    type Surface = HeadlessSurface;

    fn version(&self) -> GpuVersion {
        self.share.version
    }

    fn has_extension(&self, name: &str) -> bool {
        name == "headless_quad"
    }

    fn share_handle(&self) -> HeadlessShare {
        self.share.clone()
    }

    fn make_current(&mut self) -> Result<(), ContextError> {
        self.check_thread();
        Ok(())
    }

    fn create_input(&mut self, width: u32, height: u32) -> Result<(u32, HeadlessInput), ContextError> {
        self.check_thread();
        let input = HeadlessInput {
            id: 7,
            size: Arc::new(Mutex::new((width, height))),
        };
        self.input = Some(input.clone());
        Ok((input.id, input))
    }

    fn resize_input(&mut self, width: u32, height: u32) -> Result<(), ContextError> {
        self.check_thread();
        let input = self
            .input
            .as_ref()
            .ok_or_else(|| ContextError::TextureError("no input texture".to_string()))?;
        *input.size.lock() = (width, height);
        Ok(())
    }

    fn create_surface(&mut self, native: HeadlessNative) -> Result<HeadlessSurface, ContextError> {
        self.check_thread();
        if native.fail_create {
            return Err(ContextError::SurfaceError("native surface is invalid".to_string()));
        }
        Ok(HeadlessSurface {
            stats: native.stats,
            width: native.width,
            height: native.height,
            bound: false,
        })
    }

    fn surface_size(&self, surface: &HeadlessSurface) -> (u32, u32) {
        (surface.width, surface.height)
    }

    fn make_surface_current(&mut self, surface: &mut HeadlessSurface) -> Result<(), ContextError> {
        self.check_thread();
        if surface.stats.fail_draw.load(Ordering::SeqCst) {
            return Err(ContextError::SurfaceError("surface abandoned".to_string()));
        }
        if surface.stats.frame_timeout.load(Ordering::SeqCst) {
            return Err(ContextError::FrameUnavailable("timed out".to_string()));
        }
        surface.bound = true;
        Ok(())
    }

    fn draw_quad(&mut self, surface: &mut HeadlessSurface, quad: &Quad<'_>) -> Result<(), ContextError> {
        self.check_thread();
        if !surface.bound {
            return Err(ContextError::DrawError("surface is not current".to_string()));
        }
        surface.stats.clears.fetch_add(1, Ordering::SeqCst);
        *surface.stats.last_mvp.lock() = Some(*quad.mvp);
        *surface.stats.last_tex_matrix.lock() = Some(*quad.tex_matrix);
        *surface.stats.last_effect.lock() = quad.effect.map(|e| (e.kind, e.params.to_vec()));
        Ok(())
    }

    fn swap(&mut self, surface: &mut HeadlessSurface) -> Result<(), ContextError> {
        self.check_thread();
        if !surface.bound {
            return Err(ContextError::DrawError("surface is not current".to_string()));
        }
        surface.bound = false;
        surface.stats.draws.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release_surface(&mut self, surface: HeadlessSurface) {
        self.check_thread();
        surface.stats.released.store(true, Ordering::SeqCst);
    }

    fn release(&mut self) {
        self.check_thread();
        self.input = None;
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
