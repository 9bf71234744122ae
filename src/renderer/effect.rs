// Shader effects
// Effect catalogue and per-effect parameter storage

use super::RendererError;
use serde::{Deserialize, Serialize};

pub const EFFECT_COUNT: usize = 6;

/// Floats in a 3x4 color matrix (three rows of rgb coefficients plus offset)
pub const COLOR_MATRIX_LEN: usize = 12;

/// Size of the parameter block uploaded with every effect draw
pub const MAX_PARAMS: usize = 20;

const DEFAULT_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Effect {
    #[default]
    None,
    Gray,
    GrayReverse,
    Binarize,
    BinarizeReverse,
    ColorAdjust,
}

impl Effect {
    pub const ALL: [Effect; EFFECT_COUNT] = [
        Effect::None,
        Effect::Gray,
        Effect::GrayReverse,
        Effect::Binarize,
        Effect::BinarizeReverse,
        Effect::ColorAdjust,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Shader-side selector.
    pub fn kind(self) -> u32 {
        self as u32
    }

    pub fn min_params(self) -> usize {
        match self {
            Effect::None => 0,
            _ => COLOR_MATRIX_LEN,
        }
    }

    /// Identity color matrix followed by the binarize threshold.
    pub fn default_params(self) -> Vec<f32> {
        match self {
            Effect::None => Vec::new(),
            _ => vec![
                1.0, 0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0, //
                DEFAULT_THRESHOLD,
            ],
        }
    }
}

/// Selected effect plus the stored parameters of every effect.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectState {
    current: Effect,
    params: Vec<Vec<f32>>,
}

impl EffectState {
    pub fn new() -> Self {
        Self {
            current: Effect::None,
            params: Effect::ALL.iter().map(|e| e.default_params()).collect(),
        }
    }

    pub fn current(&self) -> Effect {
        self.current
    }

    pub fn select(&mut self, index: usize) -> Result<Effect, RendererError> {
        let effect = Effect::from_index(index).ok_or_else(|| {
            RendererError::InvalidArgument(format!(
                "Effect index {} out of range (0..{})",
                index, EFFECT_COUNT
            ))
        })?;
        self.current = effect;
        Ok(effect)
    }

    /// Stores `values` for the effect at `index`. Entries past the end of
    /// `values` keep their previous value. Nothing is stored on error.
    pub fn set_params_for(&mut self, index: usize, values: &[f32]) -> Result<(), RendererError> {
        let effect = Effect::from_index(index).ok_or_else(|| {
            RendererError::InvalidArgument(format!(
                "Effect index {} out of range (0..{})",
                index, EFFECT_COUNT
            ))
        })?;
        if values.len() < effect.min_params() {
            return Err(RendererError::InvalidArgument(format!(
                "{:?} needs at least {} params, got {}",
                effect,
                effect.min_params(),
                values.len()
            )));
        }
        if values.len() > MAX_PARAMS {
            return Err(RendererError::InvalidArgument(format!(
                "At most {} params are supported, got {}",
                MAX_PARAMS,
                values.len()
            )));
        }

        let stored = &mut self.params[effect.index()];
        if stored.len() < values.len() {
            stored.resize(values.len(), 0.0);
        }
        stored[..values.len()].copy_from_slice(values);
        Ok(())
    }

    pub fn set_params(&mut self, values: &[f32]) -> Result<(), RendererError> {
        self.set_params_for(self.current.index(), values)
    }

    pub fn params(&self, index: usize) -> Result<Vec<f32>, RendererError> {
        self.params.get(index).cloned().ok_or_else(|| {
            RendererError::InvalidArgument(format!(
                "Effect index {} out of range (0..{})",
                index, EFFECT_COUNT
            ))
        })
    }

    pub fn current_params(&self) -> &[f32] {
        &self.params[self.current.index()]
    }
}

impl Default for EffectState {
    fn default() -> Self {
        Self::new()
    }
}
