use std::sync::Arc;

use crate::setup::GpuContext;

/// Determines whether the kernels run as compute shaders on the GPU or as
/// their reference implementations over the CPU mirrors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RendererMode {
    CpuPowered,
    GpuPowered,
}

/// Stores two different types of data depending on the renderer mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModeData<C, G> {
    Cpu(C),
    Gpu(G),
}

impl<C, G> ModeData<C, G> {
    pub fn mode(&self) -> RendererMode {
        match self {
            Self::Cpu(_) => RendererMode::CpuPowered,
            Self::Gpu(_) => RendererMode::GpuPowered,
        }
    }

    pub fn gpu(&self) -> Option<&G> {
        match self {
            Self::Gpu(g) => Some(g),
            Self::Cpu(_) => None,
        }
    }

    pub fn cpu(&self) -> Option<&C> {
        match self {
            Self::Cpu(c) => Some(c),
            Self::Gpu(_) => None,
        }
    }
}

/// The device handle every buffer and kernel holds on to. Nothing in cpu mode.
pub type HerdContext = ModeData<(), Arc<GpuContext>>;
