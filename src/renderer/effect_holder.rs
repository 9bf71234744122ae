// Effect renderer holder
// RendererHolder variant that draws through a selectable shader effect

use super::effect::{Effect, EffectState};
use super::holder::{DrawStrategy, HolderOptions, HolderRequest, RendererHolder};
use super::RendererError;
use crate::config::HolderConfig;
use crate::context::Backend;
use std::ops::Deref;
use std::sync::Arc;

/// A [`RendererHolder`] whose draw pass applies the selected [`Effect`].
///
/// Every target gets the same effect. Target management is inherited through
/// `Deref`.
pub struct EffectRendererHolder<B: Backend> {
    holder: RendererHolder<B>,
}

impl<B: Backend> EffectRendererHolder<B> {
    pub fn new(backend: Arc<B>, config: &HolderConfig, options: HolderOptions<B>) -> Result<Self, RendererError> {
        let holder = RendererHolder::spawn(backend, config, options, DrawStrategy::Effect(EffectState::new()))?;
        Ok(Self { holder })
    }

    /// Selects the effect at `index` for subsequent passes.
    pub fn set_effect(&self, index: usize) -> Result<Effect, RendererError> {
        self.holder
            .task()
            .call(|reply| HolderRequest::SelectEffect(index, reply))?
    }

    pub fn effect(&self) -> Result<Effect, RendererError> {
        self.holder.task().call(HolderRequest::CurrentEffect)?
    }

    /// Stores parameters for the effect at `index`. On error the stored
    /// parameters are left as they were.
    pub fn set_params_for(&self, index: usize, params: &[f32]) -> Result<(), RendererError> {
        let params = params.to_vec();
        self.holder
            .task()
            .call(|reply| HolderRequest::SetParams(Some(index), params, reply))?
    }

    /// Stores parameters for the currently selected effect.
    pub fn set_params(&self, params: &[f32]) -> Result<(), RendererError> {
        let params = params.to_vec();
        self.holder
            .task()
            .call(|reply| HolderRequest::SetParams(None, params, reply))?
    }

    pub fn params(&self, index: usize) -> Result<Vec<f32>, RendererError> {
        self.holder
            .task()
            .call(|reply| HolderRequest::GetParams(index, reply))?
    }
}

impl<B: Backend> Deref for EffectRendererHolder<B> {
    type Target = RendererHolder<B>;

    fn deref(&self) -> &RendererHolder<B> {
        &self.holder
    }
}
