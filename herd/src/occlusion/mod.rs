//! Occlusion culling: the per camera Hi-Z pyramid and the strategies filling it.

use glam::UVec2;
use herd_types::{DepthConvention, OcclusionCullingMode};
use wgpu::{BindGroup, CommandEncoder, Id, TextureView};

use crate::{culling::GpuKernels, ModeData};

mod pyramid;
mod strategy;

pub use pyramid::*;
pub use strategy::*;

/// Depth values of one camera, every layer stored one after another.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthImage {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    data: Vec<f32>,
}

impl DepthImage {
    /// Returns `None` if `data` does not hold exactly `width * height * layers` values.
    pub fn from_data(width: u32, height: u32, layers: u32, data: Vec<f32>) -> Option<Self> {
        (data.len() == (width * height * layers) as usize).then_some(Self {
            width,
            height,
            layers,
            data,
        })
    }

    pub fn filled(width: u32, height: u32, layers: u32, value: f32) -> Self {
        Self {
            width,
            height,
            layers,
            data: vec![value; (width * height * layers) as usize],
        }
    }

    fn index(&self, layer: u32, x: u32, y: u32) -> usize {
        ((layer * self.height + y) * self.width + x) as usize
    }

    pub fn sample(&self, layer: u32, x: u32, y: u32) -> f32 {
        self.data[self.index(layer, x, y)]
    }

    pub fn set(&mut self, layer: u32, x: u32, y: u32, value: f32) {
        let index = self.index(layer, x, y);
        self.data[index] = value;
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

/// Where a camera's depth comes from this frame.
#[derive(Debug, Copy, Clone)]
pub enum DepthSource<'a> {
    /// No depth yet, occlusion culling is skipped.
    Unavailable,
    /// Depth read back or rendered on the CPU, for cpu mode.
    Cpu(&'a DepthImage),
    /// The host's depth texture. `view` must be a `D2Array` view with one layer per eye.
    Gpu {
        view: &'a TextureView,
        size: UVec2,
        layers: u32,
    },
}

impl DepthSource<'_> {
    /// Size of one layer and the layer count.
    pub fn layout(&self) -> Option<(UVec2, u32)> {
        match *self {
            Self::Unavailable => None,
            Self::Cpu(image) => Some((UVec2::new(image.width, image.height), image.layers)),
            Self::Gpu { size, layers, .. } => Some((size, layers)),
        }
    }

    fn key(&self) -> Option<DepthSourceKey> {
        match *self {
            Self::Unavailable => None,
            Self::Cpu(image) => Some(DepthSourceKey::Cpu {
                size: UVec2::new(image.width, image.height),
                layers: image.layers,
            }),
            Self::Gpu { view, size, layers } => Some(DepthSourceKey::Gpu {
                view: view.global_id(),
                size,
                layers,
            }),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DepthSourceKey {
    Cpu { size: UVec2, layers: u32 },
    Gpu { view: Id<TextureView>, size: UVec2, layers: u32 },
}

/// Bindings of the copy into mip 0, kept while the strategy replays them.
#[derive(Default)]
struct SourceRecording {
    key: Option<(DepthSourceKey, u64)>,
    bind_group: Option<BindGroup>,
    count: u64,
}

impl SourceRecording {
    fn record(&mut self, keep: bool, key: (DepthSourceKey, u64), create: impl FnOnce() -> Option<BindGroup>) {
        if keep && self.key == Some(key) {
            return;
        }
        self.key = Some(key);
        self.bind_group = create();
        self.count += 1;
    }
}

/// Hi-Z state of one camera.
pub struct OcclusionCullingData {
    strategy: Box<dyn HiZAcquisition>,
    depth: DepthConvention,
    eye_count: u32,
    pyramid: Option<HiZPyramid>,
    ready: bool,
    rebuild_count: u64,
    recording: SourceRecording,
}

impl OcclusionCullingData {
    /// `mode` must already be resolved, see [`HerdOptions::resolve_occlusion_mode`](crate::HerdOptions::resolve_occlusion_mode).
    ///
    /// Depth sources must carry one layer per eye.
    pub fn new(mode: OcclusionCullingMode, depth: DepthConvention, eye_count: u32) -> Self {
        Self {
            strategy: create_strategy(mode),
            depth,
            eye_count,
            pyramid: None,
            ready: false,
            rebuild_count: 0,
            recording: SourceRecording::default(),
        }
    }

    pub fn mode(&self) -> OcclusionCullingMode {
        self.strategy.mode()
    }

    pub fn begin_rendering(&mut self) {
        self.strategy.begin_rendering();
    }

    /// True once a pyramid was built for the current depth layout.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// The pyramid, if it may be used for culling.
    pub fn hi_z(&self) -> Option<&HiZPyramid> {
        self.pyramid.as_ref().filter(|_| self.ready)
    }

    pub fn pyramid(&self) -> Option<&HiZPyramid> {
        self.pyramid.as_ref()
    }

    /// Amount of times a pyramid was created from scratch.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuild_count
    }

    /// Amount of times the source bindings were recorded.
    pub fn recordings(&self) -> u64 {
        self.recording.count
    }

    /// Builds the pyramid from `depth` if the strategy builds at `trigger`.
    ///
    /// An unusable depth source tears the pyramid down. Returns true if a build happened.
    pub fn acquire(
        &mut self,
        trigger: HiZTrigger,
        depth: &DepthSource<'_>,
        kernels: &ModeData<(), GpuKernels>,
        encoder: Option<&mut CommandEncoder>,
    ) -> bool {
        if !self.strategy.should_build(trigger) {
            return false;
        }
        profiling::scope!("OcclusionCullingData::acquire");

        let layout = match (kernels, depth) {
            (_, DepthSource::Unavailable) => None,
            (ModeData::Cpu(()), DepthSource::Cpu(_)) | (ModeData::Gpu(_), DepthSource::Gpu { .. }) => depth
                .layout()
                .filter(|(size, layers)| size.x > 0 && size.y > 0 && *layers > 0),
            _ => {
                log::error!("Depth source does not match the renderer mode, occlusion culling disabled");
                None
            }
        };
        let eye_count = self.eye_count;
        let layout = layout.filter(|&(_, layers)| {
            if layers != eye_count {
                log::error!("Depth source has {layers} layers for {eye_count} eyes, occlusion culling disabled");
            }
            layers == eye_count
        });
        let (Some((layer_size, layers)), Some(key)) = (layout, depth.key()) else {
            self.tear_down();
            return false;
        };

        let rebuild = !self.pyramid.as_ref().map_or(false, |p| p.matches(layer_size, layers));
        if rebuild {
            if self.pyramid.is_some() {
                log::debug!("Depth layout changed to {layer_size}x{layers}, rebuilding hi-z pyramid");
            }
            self.pyramid = Some(HiZPyramid::new(layer_size, layers, self.depth, kernels));
            self.rebuild_count += 1;
            self.ready = false;
        }
        let Some(ref mut pyramid) = self.pyramid else {
            return false;
        };

        let keep = self.strategy.keeps_recording();
        let recording_key = (key, self.rebuild_count);
        match (kernels, *depth) {
            (ModeData::Cpu(()), DepthSource::Cpu(image)) => {
                self.recording.record(keep, recording_key, || None);
                pyramid.generate_cpu(image);
            }
            (ModeData::Gpu(kernels), DepthSource::Gpu { view, .. }) => {
                let Some(encoder) = encoder else {
                    log::error!("Hi-z generation needs a command encoder in gpu mode");
                    return false;
                };
                let gpu = pyramid.gpu();
                self.recording
                    .record(keep, recording_key, || gpu.map(|p| p.source_bind_group(kernels, view)));
                let Some(ref source) = self.recording.bind_group else {
                    return false;
                };
                pyramid.generate_gpu(kernels, encoder, source);
            }
            _ => return false,
        }

        self.ready = true;
        true
    }

    fn tear_down(&mut self) {
        if self.pyramid.take().is_some() {
            log::debug!("Depth source unavailable, hi-z pyramid released");
        }
        self.ready = false;
        self.recording.key = None;
        self.recording.bind_group = None;
    }

    pub fn release(&mut self) {
        self.tear_down();
    }
}
