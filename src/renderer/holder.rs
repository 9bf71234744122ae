// Renderer holder
// Owns the shared input texture and draws it into every registered target

use super::effect::{Effect, EffectState};
use super::target::{TargetOptions, TargetRecord};
use super::task_loop::{Flow, LoopHandler, TaskLoop};
use super::{Clock, MirrorMode, MonotonicClock, RenderCallback, RendererError, TextureInfo};
use crate::config::HolderConfig;
use crate::context::{Backend, ContextError, GraphicsContext, Quad, QuadEffect, RawContext, SurfaceOf};
use crate::matrix::Mat4;
use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Optional collaborators for a holder
pub struct HolderOptions<B: Backend> {
    /// Share handle of the context the input texture must be visible to
    pub share: Option<B::Share>,
    pub callback: Option<Arc<dyn RenderCallback<B::Input>>>,
    pub clock: Arc<dyn Clock>,
}

impl<B: Backend> HolderOptions<B> {
    pub fn with_share(mut self, share: B::Share) -> Self {
        self.share = Some(share);
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn RenderCallback<B::Input>>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl<B: Backend> Default for HolderOptions<B> {
    fn default() -> Self {
        Self {
            share: None,
            callback: None,
            clock: Arc::new(MonotonicClock::new()),
        }
    }
}

/// State read by both the owner and the worker
struct HolderShared {
    tex_matrix: RwLock<Mat4>,
    texture: Mutex<TextureInfo>,
    draw_pending: AtomicBool,
    draw_passes: AtomicU64,
}

pub(crate) enum DrawStrategy {
    Plain,
    Effect(EffectState),
}

impl DrawStrategy {
    fn quad_effect(&self) -> Option<QuadEffect<'_>> {
        match self {
            DrawStrategy::Plain => None,
            DrawStrategy::Effect(state) if state.current() == Effect::None => None,
            DrawStrategy::Effect(state) => Some(QuadEffect {
                kind: state.current().kind(),
                params: state.current_params(),
            }),
        }
    }

    fn effects(&mut self) -> Result<&mut EffectState, RendererError> {
        match self {
            DrawStrategy::Effect(state) => Ok(state),
            DrawStrategy::Plain => Err(RendererError::InvalidArgument(
                "Holder was created without effects".to_string(),
            )),
        }
    }
}

pub(crate) enum HolderRequest<B: Backend> {
    Draw,
    AddTarget(B::Native, TargetOptions, Sender<Result<u32, RendererError>>),
    RemoveTarget(u32, Sender<bool>),
    ClearTargets(Sender<usize>),
    SetEnabled(u32, bool, Sender<Result<(), RendererError>>),
    SetTransform(u32, Mat4, Sender<Result<(), RendererError>>),
    SetMirror(MirrorMode, Sender<()>),
    Mirror(Sender<MirrorMode>),
    IsEnabled(u32, Sender<Option<bool>>),
    TargetIds(Sender<Vec<u32>>),
    Resize(u32, u32, Sender<Result<(), RendererError>>),
    SelectEffect(usize, Sender<Result<Effect, RendererError>>),
    SetParams(Option<usize>, Vec<f32>, Sender<Result<(), RendererError>>),
    GetParams(usize, Sender<Result<Vec<f32>, RendererError>>),
    CurrentEffect(Sender<Result<Effect, RendererError>>),
}

struct HolderWorker<B: Backend> {
    name: String,
    targets: BTreeMap<u32, TargetRecord<SurfaceOf<B>>>,
    next_id: u32,
    mirror: MirrorMode,
    shared: Arc<HolderShared>,
    callback: Option<Arc<dyn RenderCallback<B::Input>>>,
    clock: Arc<dyn Clock>,
    strategy: DrawStrategy,
}

fn draw_target<B: Backend>(
    raw: &mut B::Context,
    surface: &mut SurfaceOf<B>,
    quad: &Quad<'_>,
) -> Result<(), ContextError> {
    raw.make_surface_current(surface)?;
    raw.draw_quad(surface, quad)?;
    raw.swap(surface)
}

impl<B: Backend> HolderWorker<B> {
    fn draw_all(&mut self, ctx: &mut GraphicsContext<B>) {
        self.shared.draw_pending.store(false, Ordering::SeqCst);

        let raw = match ctx.raw_mut() {
            Ok(raw) => raw,
            Err(e) => {
                log::error!("{}: cannot draw: {}", self.name, e);
                return;
            }
        };

        let tex_matrix = *self.shared.tex_matrix.read();
        let mirror = self.mirror;
        let effect = self.strategy.quad_effect();
        let now = self.clock.now_ns();

        let mut failed = Vec::new();
        for record in self.targets.values_mut() {
            if !record.is_due(now) {
                continue;
            }
            let mvp = record.mvp(mirror);
            let quad = Quad {
                tex_matrix: &tex_matrix,
                mvp: &mvp,
                effect,
            };
            match draw_target::<B>(raw, &mut record.surface, &quad) {
                Ok(()) => record.arm(now),
                Err(ContextError::FrameUnavailable(e)) => {
                    log::debug!("{}: target {} skipped this pass: {}", self.name, record.id, e);
                }
                Err(e) => {
                    log::warn!("{}: target {} failed, removing it: {}", self.name, record.id, e);
                    failed.push(record.id);
                }
            }
        }

        for id in failed {
            if let Some(record) = self.targets.remove(&id) {
                raw.release_surface(record.surface);
            }
        }

        if let Err(e) = raw.make_current() {
            log::warn!("{}: failed to restore offscreen surface: {}", self.name, e);
        }

        self.shared.draw_passes.fetch_add(1, Ordering::SeqCst);
        if let Some(callback) = &self.callback {
            callback.on_frame_available();
        }
    }

    fn add_target(
        &mut self,
        ctx: &mut GraphicsContext<B>,
        native: B::Native,
        options: TargetOptions,
    ) -> Result<u32, RendererError> {
        let surface = ctx.raw_mut()?.create_surface(native).map_err(|e| {
            log::warn!("{}: failed to create target surface: {}", self.name, e);
            RendererError::Surface(e.to_string())
        })?;

        let id = self.next_id;
        self.next_id += 1;

        let (width, height) = ctx.raw()?.surface_size(&surface);
        let record = TargetRecord::new(id, surface, options);
        log::info!(
            "{}: target {} added ({}x{}, interval: {:?} ns, inverted: {})",
            self.name,
            id,
            width,
            height,
            record.interval_ns(),
            record.inverted
        );
        self.targets.insert(id, record);
        Ok(id)
    }

    fn remove_target(&mut self, ctx: &mut GraphicsContext<B>, id: u32) -> bool {
        let Some(record) = self.targets.remove(&id) else {
            return false;
        };
        match ctx.raw_mut() {
            Ok(raw) => raw.release_surface(record.surface),
            Err(e) => log::warn!("{}: target {} dropped without release: {}", self.name, id, e),
        }
        log::info!("{}: target {} removed", self.name, id);
        true
    }

    fn clear_targets(&mut self, ctx: &mut GraphicsContext<B>) -> usize {
        let ids: Vec<u32> = self.targets.keys().copied().collect();
        ids.into_iter().filter(|id| self.remove_target(ctx, *id)).count()
    }

    fn record_mut(&mut self, id: u32) -> Result<&mut TargetRecord<SurfaceOf<B>>, RendererError> {
        self.targets
            .get_mut(&id)
            .ok_or_else(|| RendererError::InvalidArgument(format!("Unknown target id {}", id)))
    }

    fn resize(&mut self, ctx: &mut GraphicsContext<B>, width: u32, height: u32) -> Result<(), RendererError> {
        if width == 0 || height == 0 {
            return Err(RendererError::InvalidArgument(format!(
                "Invalid size {}x{}",
                width, height
            )));
        }
        ctx.raw_mut()?.resize_input(width, height)?;

        let mut texture = self.shared.texture.lock();
        texture.width = width as i32;
        texture.height = height as i32;
        log::info!("{}: input texture resized to {}x{}", self.name, width, height);
        Ok(())
    }
}

impl<B: Backend> LoopHandler<B> for HolderWorker<B> {
    type Request = HolderRequest<B>;

    fn on_request(&mut self, ctx: &mut GraphicsContext<B>, request: HolderRequest<B>) -> Flow {
        match request {
            HolderRequest::Draw => self.draw_all(ctx),
            HolderRequest::AddTarget(native, options, reply) => {
                let _ = reply.send(self.add_target(ctx, native, options));
            }
            HolderRequest::RemoveTarget(id, reply) => {
                let _ = reply.send(self.remove_target(ctx, id));
            }
            HolderRequest::ClearTargets(reply) => {
                let _ = reply.send(self.clear_targets(ctx));
            }
            HolderRequest::SetEnabled(id, enabled, reply) => {
                let result = self.record_mut(id).map(|record| record.enabled = enabled);
                let _ = reply.send(result);
            }
            HolderRequest::SetTransform(id, transform, reply) => {
                let result = self.record_mut(id).map(|record| record.transform = transform);
                let _ = reply.send(result);
            }
            HolderRequest::SetMirror(mode, reply) => {
                self.mirror = mode;
                let _ = reply.send(());
            }
            HolderRequest::Mirror(reply) => {
                let _ = reply.send(self.mirror);
            }
            HolderRequest::IsEnabled(id, reply) => {
                let _ = reply.send(self.targets.get(&id).map(|record| record.enabled));
            }
            HolderRequest::TargetIds(reply) => {
                let _ = reply.send(self.targets.keys().copied().collect());
            }
            HolderRequest::Resize(width, height, reply) => {
                let _ = reply.send(self.resize(ctx, width, height));
            }
            HolderRequest::SelectEffect(index, reply) => {
                let result = self.strategy.effects().and_then(|state| state.select(index));
                let _ = reply.send(result);
            }
            HolderRequest::SetParams(index, params, reply) => {
                let result = self.strategy.effects().and_then(|state| match index {
                    Some(index) => state.set_params_for(index, &params),
                    None => state.set_params(&params),
                });
                let _ = reply.send(result);
            }
            HolderRequest::GetParams(index, reply) => {
                let result = self.strategy.effects().and_then(|state| state.params(index));
                let _ = reply.send(result);
            }
            HolderRequest::CurrentEffect(reply) => {
                let result = self.strategy.effects().map(|state| state.current());
                let _ = reply.send(result);
            }
        }
        Flow::Continue
    }

    fn on_stop(&mut self, ctx: &mut GraphicsContext<B>) {
        let released = self.clear_targets(ctx);
        log::debug!("{}: released {} targets", self.name, released);
        if let Some(callback) = self.callback.take() {
            callback.on_destroy();
        }
    }
}

/// Fans one shared input texture out to any number of output surfaces.
///
/// All surface work happens on a dedicated worker thread; every method here
/// only queues a request for it. Producers write into [`input`](Self::input)
/// and then call [`notify_frame_available`](Self::notify_frame_available).
pub struct RendererHolder<B: Backend> {
    task: TaskLoop<HolderRequest<B>>,
    shared: Arc<HolderShared>,
    input: B::Input,
}

impl<B: Backend> RendererHolder<B> {
    pub fn new(backend: Arc<B>, config: &HolderConfig, options: HolderOptions<B>) -> Result<Self, RendererError> {
        Self::spawn(backend, config, options, DrawStrategy::Plain)
    }

    pub(crate) fn spawn(
        backend: Arc<B>,
        config: &HolderConfig,
        options: HolderOptions<B>,
        strategy: DrawStrategy,
    ) -> Result<Self, RendererError> {
        config.validate()?;

        let shared = Arc::new(HolderShared {
            tex_matrix: RwLock::new(Mat4::IDENTITY),
            texture: Mutex::new(TextureInfo::default()),
            draw_pending: AtomicBool::new(false),
            draw_passes: AtomicU64::new(0),
        });

        let HolderOptions { share, callback, clock } = options;
        let (width, height, tex_unit) = (config.width, config.height, config.texture_unit);
        let name = config.thread_name.clone();

        let worker_shared = shared.clone();
        let worker_callback = callback.clone();
        let worker_name = name.clone();
        let (task, input) = TaskLoop::spawn(
            &name,
            backend,
            config.max_version,
            config.context_config(),
            share,
            config.ready_timeout(),
            move |ctx: &mut GraphicsContext<B>| {
                let (tex_id, input) = ctx.raw_mut()?.create_input(width, height)?;
                *worker_shared.texture.lock() = TextureInfo {
                    tex_unit,
                    tex_id: tex_id as i32,
                    width: width as i32,
                    height: height as i32,
                };
                let worker = HolderWorker {
                    name: worker_name,
                    targets: BTreeMap::new(),
                    next_id: 1,
                    mirror: MirrorMode::Normal,
                    shared: worker_shared,
                    callback: worker_callback,
                    clock,
                    strategy,
                };
                Ok((worker, input))
            },
        )?;

        let info = *shared.texture.lock();
        log::info!(
            "{} started: texture {} ({}x{}) on unit {}",
            name,
            info.tex_id,
            info.width,
            info.height,
            info.tex_unit
        );
        if let Some(callback) = &callback {
            callback.on_create(&input, info);
        }

        Ok(Self { task, shared, input })
    }

    /// Producer-facing handle to the shared input texture
    pub fn input(&self) -> &B::Input {
        &self.input
    }

    pub fn texture_info(&self) -> TextureInfo {
        *self.shared.texture.lock()
    }

    /// Texture transform applied to every target, typically supplied with each frame.
    pub fn set_tex_matrix(&self, matrix: Mat4) {
        *self.shared.tex_matrix.write() = matrix;
    }

    pub fn tex_matrix(&self) -> Mat4 {
        *self.shared.tex_matrix.read()
    }

    /// Schedules a draw pass. Notifications arriving before the worker starts
    /// the pass collapse into it. Dropped silently once released.
    pub fn notify_frame_available(&self) {
        if self.shared.draw_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.task.post(HolderRequest::Draw) {
            self.shared.draw_pending.store(false, Ordering::SeqCst);
        }
    }

    /// Registers an output surface. `max_fps` of 0 means uncapped.
    pub fn add_target(&self, native: B::Native, max_fps: u32) -> Result<u32, RendererError> {
        self.add_target_with(native, TargetOptions::with_max_fps(max_fps))
    }

    pub fn add_target_with(&self, native: B::Native, options: TargetOptions) -> Result<u32, RendererError> {
        self.task
            .call(|reply| HolderRequest::AddTarget(native, options, reply))?
    }

    /// Releases a target's surface. Returns false for an unknown id.
    pub fn remove_target(&self, id: u32) -> Result<bool, RendererError> {
        self.task.call(|reply| HolderRequest::RemoveTarget(id, reply))
    }

    /// Removes every target, returning how many there were.
    pub fn clear_targets(&self) -> Result<usize, RendererError> {
        self.task.call(HolderRequest::ClearTargets)
    }

    pub fn set_enabled(&self, id: u32, enabled: bool) -> Result<(), RendererError> {
        self.task
            .call(|reply| HolderRequest::SetEnabled(id, enabled, reply))?
    }

    pub fn is_enabled(&self, id: u32) -> Result<bool, RendererError> {
        self.task
            .call(|reply| HolderRequest::IsEnabled(id, reply))?
            .ok_or_else(|| RendererError::InvalidArgument(format!("Unknown target id {}", id)))
    }

    /// Replaces a target's own transform (rotation, scaling); mirroring is applied on top.
    pub fn set_target_transform(&self, id: u32, transform: Mat4) -> Result<(), RendererError> {
        self.task
            .call(|reply| HolderRequest::SetTransform(id, transform, reply))?
    }

    pub fn has_target(&self, id: u32) -> Result<bool, RendererError> {
        Ok(self.target_ids()?.contains(&id))
    }

    /// Live target ids in draw order.
    pub fn target_ids(&self) -> Result<Vec<u32>, RendererError> {
        self.task.call(HolderRequest::TargetIds)
    }

    pub fn target_count(&self) -> Result<usize, RendererError> {
        Ok(self.target_ids()?.len())
    }

    /// Applies to draw passes queued after this call.
    pub fn set_mirror(&self, mode: MirrorMode) -> Result<(), RendererError> {
        self.task.call(|reply| HolderRequest::SetMirror(mode, reply))
    }

    pub fn mirror(&self) -> Result<MirrorMode, RendererError> {
        self.task.call(HolderRequest::Mirror)
    }

    /// Reallocates the input texture storage; the texture id stays the same.
    pub fn resize(&self, width: u32, height: u32) -> Result<(), RendererError> {
        self.task
            .call(|reply| HolderRequest::Resize(width, height, reply))?
    }

    /// Number of draw passes run so far.
    pub fn draw_pass_count(&self) -> u64 {
        self.shared.draw_passes.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Finishes queued work, releases every target and the context, then joins
    /// the worker. Safe to call more than once.
    pub fn release(&self) {
        self.task.release();
    }

    pub(crate) fn task(&self) -> &TaskLoop<HolderRequest<B>> {
        &self.task
    }
}
