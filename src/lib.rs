// Frame Relay - fan one shared GPU texture out to many output surfaces
// Library entry point

pub mod config;
pub mod context;
pub mod logging;
pub mod matrix;
pub mod renderer;

pub use config::{ConfigError, HolderConfig};
pub use context::{
    Backend, ContextConfig, ContextError, ContextFlags, FrameInput, GpuVersion, GraphicsContext, MasterContext,
    NativeSurface, WgpuBackend,
};
pub use logging::{LoggingConfig, init_logging};
pub use matrix::Mat4;
pub use renderer::{
    EffectRendererHolder, HolderOptions, MirrorMode, RenderCallback, RendererError, RendererHolder, TargetOptions,
    TextureInfo,
};

/// Holder driving the wgpu backend
pub type WgpuRendererHolder = RendererHolder<WgpuBackend>;

/// Effect holder driving the wgpu backend
pub type WgpuEffectRendererHolder = EffectRendererHolder<WgpuBackend>;
