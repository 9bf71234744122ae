// Renderer module
// Worker-thread task loop and the holders that fan one shared texture out to targets

mod clock;
mod effect;
mod effect_holder;
mod holder;
mod target;
mod task_loop;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use effect::{COLOR_MATRIX_LEN, EFFECT_COUNT, Effect, EffectState, MAX_PARAMS};
pub use effect_holder::EffectRendererHolder;
pub use holder::{HolderOptions, RendererHolder};
pub use target::TargetOptions;
pub use task_loop::{Flow, LoopHandler, TaskLoop};

use crate::config::ConfigError;
use crate::context::ContextError;
use crate::matrix::Mat4;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RendererError {
    #[error("Failed to initialize renderer: {0}")]
    InitError(String),
    #[error("Context error: {0}")]
    Context(#[from] ContextError),
    #[error("Surface error: {0}")]
    Surface(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Renderer is not running")]
    NotRunning,
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Synchronous call issued from the worker thread")]
    WorkerThread,
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Description of the shared input texture, handed to producers.
///
/// Kept as four plain integers so it can cross a process boundary unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TextureInfo {
    pub tex_unit: i32,
    pub tex_id: i32,
    pub width: i32,
    pub height: i32,
}

impl TextureInfo {
    pub fn to_bytes(&self) -> Result<Vec<u8>, RendererError> {
        bincode::serialize(self).map_err(|e| RendererError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RendererError> {
        bincode::deserialize(bytes).map_err(|e| RendererError::Serialization(e.to_string()))
    }
}

/// Mirroring applied on top of every target transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MirrorMode {
    #[default]
    Normal,
    Horizontal,
    Vertical,
    Both,
}

impl MirrorMode {
    pub const ALL: [MirrorMode; 4] = [
        MirrorMode::Normal,
        MirrorMode::Horizontal,
        MirrorMode::Vertical,
        MirrorMode::Both,
    ];

    pub fn from_index(index: i32) -> Option<Self> {
        match index {
            0 => Some(MirrorMode::Normal),
            1 => Some(MirrorMode::Horizontal),
            2 => Some(MirrorMode::Vertical),
            3 => Some(MirrorMode::Both),
            _ => None,
        }
    }

    pub fn index(self) -> i32 {
        match self {
            MirrorMode::Normal => 0,
            MirrorMode::Horizontal => 1,
            MirrorMode::Vertical => 2,
            MirrorMode::Both => 3,
        }
    }

    /// The same mirroring as seen from a vertically inverted coordinate system.
    pub fn flip_vertical(self) -> Self {
        match self {
            MirrorMode::Normal => MirrorMode::Vertical,
            MirrorMode::Vertical => MirrorMode::Normal,
            MirrorMode::Horizontal => MirrorMode::Both,
            MirrorMode::Both => MirrorMode::Horizontal,
        }
    }

    /// Negates the X and/or Y basis of `transform`.
    pub fn apply(self, transform: &Mat4) -> Mat4 {
        let (sx, sy) = match self {
            MirrorMode::Normal => return *transform,
            MirrorMode::Horizontal => (-1.0, 1.0),
            MirrorMode::Vertical => (1.0, -1.0),
            MirrorMode::Both => (-1.0, -1.0),
        };
        *transform * Mat4::scale(sx, sy, 1.0)
    }
}

/// Notifications from a holder.
///
/// `on_create` runs on the constructing thread once the worker is ready; the
/// other two run on the worker thread.
pub trait RenderCallback<I>: Send + Sync {
    fn on_create(&self, input: &I, info: TextureInfo);

    fn on_frame_available(&self) {}

    fn on_destroy(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texture_info_bytes() {
        let info = TextureInfo {
            tex_unit: 1,
            tex_id: 42,
            width: 640,
            height: 480,
        };
        let bytes = info.to_bytes().unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(TextureInfo::from_bytes(&bytes).unwrap(), info);
    }

    #[test]
    fn test_texture_info_rejects_truncated_bytes() {
        let result = TextureInfo::from_bytes(&[1, 2, 3]);
        assert!(matches!(result, Err(RendererError::Serialization(_))));
    }

    #[test]
    fn test_mirror_is_involutive() {
        let transform = Mat4::rotation_z(90.0) * Mat4::translation(0.25, -0.5, 0.0);
        for mode in MirrorMode::ALL {
            assert_eq!(mode.apply(&mode.apply(&transform)), transform, "{:?}", mode);
            assert_eq!(mode.flip_vertical().flip_vertical(), mode);
        }
    }

    #[test]
    fn test_mirror_negates_basis() {
        let m = MirrorMode::Horizontal.apply(&Mat4::IDENTITY);
        assert_eq!(m.get(0, 0), -1.0);
        assert_eq!(m.get(1, 1), 1.0);

        let m = MirrorMode::Both.apply(&Mat4::IDENTITY);
        assert_eq!(m.get(0, 0), -1.0);
        assert_eq!(m.get(1, 1), -1.0);
        assert_eq!(MirrorMode::Normal.apply(&Mat4::IDENTITY), Mat4::IDENTITY);
    }

    #[test]
    fn test_flip_vertical_matches_extra_y_flip() {
        let vertical = MirrorMode::Vertical.apply(&Mat4::IDENTITY);
        for mode in MirrorMode::ALL {
            let flipped = mode.flip_vertical().apply(&Mat4::IDENTITY);
            assert_eq!(flipped, mode.apply(&vertical));
        }
    }

    #[test]
    fn test_mirror_index() {
        for mode in MirrorMode::ALL {
            assert_eq!(MirrorMode::from_index(mode.index()), Some(mode));
        }
        assert_eq!(MirrorMode::from_index(4), None);
        assert_eq!(MirrorMode::from_index(-1), None);
    }
}
