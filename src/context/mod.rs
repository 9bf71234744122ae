// GPU context module
// Thread-affine graphics contexts, version fallback and context sharing

#[cfg(test)]
pub(crate) mod headless;
mod master;
mod wgpu_backend;

pub use master::MasterContext;
pub use wgpu_backend::{FrameInput, NativeSurface, WgpuBackend, WgpuContext, WgpuShare, WgpuSurface};

use crate::matrix::Mat4;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Failed to initialize context: {0}")]
    InitError(String),
    #[error("No supported GPU version at or below tier {0}")]
    NoSupportedVersion(GpuVersion),
    #[error("Context has been released")]
    Released,
    #[error("Context lost: {0}")]
    Lost(String),
    #[error("Surface error: {0}")]
    SurfaceError(String),
    /// No frame this pass; the surface itself is still usable
    #[error("Frame not available: {0}")]
    FrameUnavailable(String),
    #[error("Draw failed: {0}")]
    DrawError(String),
    #[error("Texture error: {0}")]
    TextureError(String),
}

/// GPU feature tier a context is created at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum GpuVersion {
    /// Downlevel tier (GLES2/WebGL2-class limits).
    V2,
    /// Full tier.
    #[default]
    V3,
}

impl GpuVersion {
    pub fn tier(self) -> u32 {
        match self {
            GpuVersion::V2 => 2,
            GpuVersion::V3 => 3,
        }
    }

    /// Maps a numeric ceiling onto a tier; anything above 3 clamps to 3.
    pub fn from_tier(tier: u32) -> Option<Self> {
        match tier {
            0 | 1 => None,
            2 => Some(GpuVersion::V2),
            _ => Some(GpuVersion::V3),
        }
    }

    /// Next tier to try when creation at this one fails.
    pub fn lower(self) -> Option<Self> {
        match self {
            GpuVersion::V3 => Some(GpuVersion::V2),
            GpuVersion::V2 => None,
        }
    }
}

impl fmt::Display for GpuVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tier())
    }
}

bitflags! {
    /// Capability flags requested at construction.
    ///
    /// The stencil bits are a mutually exclusive choice; when several are set the
    /// largest one wins.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ContextFlags: u32 {
        const DEPTH_BUFFER = 0x0001;
        const RECORDABLE = 0x0002;
        const STENCIL_1 = 0x0010;
        const STENCIL_2 = 0x0020;
        const STENCIL_4 = 0x0040;
        const STENCIL_8 = 0x0080;
    }
}

impl Default for ContextFlags {
    fn default() -> Self {
        ContextFlags::empty()
    }
}

impl ContextFlags {
    const STENCIL_MASK: ContextFlags = ContextFlags::STENCIL_1
        .union(ContextFlags::STENCIL_2)
        .union(ContextFlags::STENCIL_4)
        .union(ContextFlags::STENCIL_8);

    pub fn stencil_bits(self) -> u8 {
        if self.contains(ContextFlags::STENCIL_8) {
            8
        } else if self.contains(ContextFlags::STENCIL_4) {
            4
        } else if self.contains(ContextFlags::STENCIL_2) {
            2
        } else if self.contains(ContextFlags::STENCIL_1) {
            1
        } else {
            0
        }
    }

    /// Replaces the stencil choice. Unsupported bit counts round up to the next
    /// available one, capped at 8.
    pub fn with_stencil_bits(self, bits: u8) -> Self {
        let stencil = match bits {
            0 => ContextFlags::empty(),
            1 => ContextFlags::STENCIL_1,
            2 => ContextFlags::STENCIL_2,
            3 | 4 => ContextFlags::STENCIL_4,
            _ => ContextFlags::STENCIL_8,
        };
        self.difference(Self::STENCIL_MASK).union(stencil)
    }
}

/// Surface/context configuration derived from the capability flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Bits per color channel: 8, or 10 when a deep-color format is wanted.
    pub color_bits: u8,
    pub flags: ContextFlags,
}

impl ContextConfig {
    pub fn from_flags(flags: ContextFlags) -> Self {
        Self {
            color_bits: 8,
            flags,
        }
    }

    pub fn depth_buffer(&self) -> bool {
        self.flags.contains(ContextFlags::DEPTH_BUFFER)
    }

    pub fn stencil_bits(&self) -> u8 {
        self.flags.stencil_bits()
    }

    pub fn recordable(&self) -> bool {
        self.flags.contains(ContextFlags::RECORDABLE)
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self::from_flags(ContextFlags::empty())
    }
}

/// Effect selection passed along with a quad.
#[derive(Debug, Clone, Copy)]
pub struct QuadEffect<'a> {
    pub kind: u32,
    pub params: &'a [f32],
}

/// One full-viewport textured quad.
#[derive(Debug, Clone, Copy)]
pub struct Quad<'a> {
    pub tex_matrix: &'a Mat4,
    pub mvp: &'a Mat4,
    pub effect: Option<QuadEffect<'a>>,
}

/// A GPU API the relay can drive.
pub trait Backend: Send + Sync + 'static {
    /// Handle other contexts use to share GPU objects with a context of this backend.
    type Share: Clone + Send + Sync + 'static;
    /// Platform surface handle accepted by `add_target`.
    type Native: Send + 'static;
    /// Producer-facing handle to the shared input texture.
    type Input: Clone + Send + Sync + 'static;
    type Context: RawContext<Self>;

    fn name(&self) -> &'static str;

    /// Creates a context at exactly `version`, on the calling thread.
    fn create_context(
        &self,
        version: GpuVersion,
        config: &ContextConfig,
        share: Option<&Self::Share>,
    ) -> Result<Self::Context, ContextError>;
}

/// Backend-side context operations. Only reachable through [`GraphicsContext`].
pub trait RawContext<B: Backend + ?Sized> {
    /// Drawing surface derived from a native handle.
    type Surface;

    fn version(&self) -> GpuVersion;

    fn has_extension(&self, name: &str) -> bool;

    fn share_handle(&self) -> B::Share;

    /// Binds the default 1x1 offscreen surface.
    fn make_current(&mut self) -> Result<(), ContextError>;

    /// Allocates the shared input texture, returning its id and the producer handle.
    fn create_input(&mut self, width: u32, height: u32) -> Result<(u32, B::Input), ContextError>;

    /// Replaces the input texture storage, keeping its id.
    fn resize_input(&mut self, width: u32, height: u32) -> Result<(), ContextError>;

    fn create_surface(&mut self, native: B::Native) -> Result<Self::Surface, ContextError>;

    fn surface_size(&self, surface: &Self::Surface) -> (u32, u32);

    fn make_surface_current(&mut self, surface: &mut Self::Surface) -> Result<(), ContextError>;

    /// Clears the bound surface and draws the quad into it.
    fn draw_quad(&mut self, surface: &mut Self::Surface, quad: &Quad<'_>) -> Result<(), ContextError>;

    fn swap(&mut self, surface: &mut Self::Surface) -> Result<(), ContextError>;

    fn release_surface(&mut self, surface: Self::Surface);

    /// Destroys objects this context owns directly.
    fn release(&mut self);
}

pub type SurfaceOf<B> = <<B as Backend>::Context as RawContext<B>>::Surface;

/// A GPU context pinned to the thread that initialized it.
///
/// The type is neither `Send` nor `Sync`, so it can only be used from its
/// owning thread. Once released every operation fails with
/// [`ContextError::Released`].
pub struct GraphicsContext<B: Backend> {
    raw: Option<B::Context>,
    version: GpuVersion,
    backend_name: &'static str,
    _not_send: PhantomData<*const ()>,
}

impl<B: Backend> GraphicsContext<B> {
    /// Creates the context at `max_version`, falling back to lower tiers.
    pub fn initialize(
        backend: &B,
        max_version: GpuVersion,
        config: &ContextConfig,
        share: Option<&B::Share>,
    ) -> Result<Self, ContextError> {
        let mut next = Some(max_version);
        while let Some(version) = next {
            match backend.create_context(version, config, share) {
                Ok(raw) => {
                    log::info!(
                        "{} context created (tier {}, shared: {})",
                        backend.name(),
                        version,
                        share.is_some()
                    );
                    return Ok(Self {
                        raw: Some(raw),
                        version,
                        backend_name: backend.name(),
                        _not_send: PhantomData,
                    });
                }
                Err(e) => {
                    log::warn!("{} tier {} unavailable: {}", backend.name(), version, e);
                    next = version.lower();
                }
            }
        }

        log::error!(
            "{}: no context could be created at or below tier {}",
            backend.name(),
            max_version
        );
        Err(ContextError::NoSupportedVersion(max_version))
    }

    pub fn make_current(&mut self) -> Result<(), ContextError> {
        self.raw_mut()?.make_current()
    }

    /// Releases the context. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(mut raw) = self.raw.take() {
            raw.release();
            log::debug!("{} context released", self.backend_name);
        }
    }

    pub fn is_released(&self) -> bool {
        self.raw.is_none()
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.raw.as_ref().is_some_and(|raw| raw.has_extension(name))
    }

    pub fn version(&self) -> GpuVersion {
        self.version
    }

    pub fn is_version3(&self) -> bool {
        self.version >= GpuVersion::V3
    }

    pub fn share_handle(&self) -> Result<B::Share, ContextError> {
        Ok(self.raw()?.share_handle())
    }

    pub fn raw(&self) -> Result<&B::Context, ContextError> {
        self.raw.as_ref().ok_or(ContextError::Released)
    }

    pub fn raw_mut(&mut self) -> Result<&mut B::Context, ContextError> {
        self.raw.as_mut().ok_or(ContextError::Released)
    }
}

impl<B: Backend> Drop for GraphicsContext<B> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::headless::HeadlessBackend;
    use super::*;

    #[test]
    fn test_initialize_uses_requested_version() {
        let backend = HeadlessBackend::new();
        let ctx = GraphicsContext::initialize(&backend, GpuVersion::V3, &ContextConfig::default(), None)
            .unwrap();
        assert!(ctx.is_version3());
    }

    #[test]
    fn test_initialize_falls_back_to_lower_version() {
        let backend = HeadlessBackend::with_max_version(Some(GpuVersion::V2));
        let ctx = GraphicsContext::initialize(&backend, GpuVersion::V3, &ContextConfig::default(), None)
            .unwrap();
        assert_eq!(ctx.version(), GpuVersion::V2);
        assert!(!ctx.is_version3());
        assert_eq!(backend.attempts(), 2);
    }

    #[test]
    fn test_initialize_fails_when_no_version_works() {
        let backend = HeadlessBackend::with_max_version(None);
        let result = GraphicsContext::initialize(&backend, GpuVersion::V3, &ContextConfig::default(), None);
        assert!(matches!(result, Err(ContextError::NoSupportedVersion(GpuVersion::V3))));
    }

    #[test]
    fn test_released_context_cannot_be_reused() {
        let backend = HeadlessBackend::new();
        let mut ctx =
            GraphicsContext::initialize(&backend, GpuVersion::V3, &ContextConfig::default(), None).unwrap();
        assert!(ctx.make_current().is_ok());

        ctx.release();
        ctx.release();
        assert!(ctx.is_released());
        assert!(matches!(ctx.make_current(), Err(ContextError::Released)));
        assert!(matches!(ctx.share_handle(), Err(ContextError::Released)));
        assert!(!ctx.has_extension("headless_quad"));
        assert_eq!(backend.released(), 1);
    }

    #[test]
    fn test_has_extension() {
        let backend = HeadlessBackend::new();
        let ctx = GraphicsContext::initialize(&backend, GpuVersion::V3, &ContextConfig::default(), None)
            .unwrap();
        assert!(ctx.has_extension("headless_quad"));
        assert!(!ctx.has_extension("made_up_extension"));
    }

    #[test]
    fn test_shared_context_inherits_parent_objects() {
        let backend = HeadlessBackend::new();
        let parent =
            GraphicsContext::initialize(&backend, GpuVersion::V3, &ContextConfig::default(), None).unwrap();
        let share = parent.share_handle().unwrap();
        let child =
            GraphicsContext::initialize(&backend, GpuVersion::V3, &ContextConfig::default(), Some(&share))
                .unwrap();
        assert_eq!(child.share_handle().unwrap().device_id, share.device_id);
    }

    #[test]
    fn test_shared_context_cannot_exceed_parent_tier() {
        let backend = HeadlessBackend::new();
        let parent =
            GraphicsContext::initialize(&backend, GpuVersion::V2, &ContextConfig::default(), None).unwrap();
        let share = parent.share_handle().unwrap();
        let child =
            GraphicsContext::initialize(&backend, GpuVersion::V3, &ContextConfig::default(), Some(&share))
                .unwrap();
        assert_eq!(child.version(), GpuVersion::V2);
    }

    #[test]
    fn test_stencil_bits_choice() {
        assert_eq!(ContextFlags::empty().stencil_bits(), 0);
        assert_eq!(ContextFlags::STENCIL_4.stencil_bits(), 4);
        assert_eq!((ContextFlags::STENCIL_1 | ContextFlags::STENCIL_8).stencil_bits(), 8);

        let flags = (ContextFlags::DEPTH_BUFFER | ContextFlags::STENCIL_8).with_stencil_bits(2);
        assert_eq!(flags.stencil_bits(), 2);
        assert!(flags.contains(ContextFlags::DEPTH_BUFFER));
        assert_eq!(flags.with_stencil_bits(0).stencil_bits(), 0);
    }

    #[test]
    fn test_version_fallback_chain() {
        assert_eq!(GpuVersion::V3.lower(), Some(GpuVersion::V2));
        assert_eq!(GpuVersion::V2.lower(), None);
        assert_eq!(GpuVersion::from_tier(4), Some(GpuVersion::V3));
        assert_eq!(GpuVersion::from_tier(1), None);
    }
}
