//! The Hi-Z depth pyramid.

use glam::UVec2;
use herd_types::DepthConvention;
use wgpu::{
    util::{BufferInitDescriptor, DeviceExt},
    BindGroup, Buffer, BufferUsages, CommandEncoder, ComputePassDescriptor, Extent3d, Texture, TextureDescriptor,
    TextureDimension, TextureFormat, TextureUsages, TextureView, TextureViewDescriptor,
};

use crate::{
    culling::GpuKernels,
    format_sso,
    occlusion::DepthImage,
    util::{
        bind_merge::BindGroupBuilder,
        math::{mip_count, mip_size, reduction_footprint, round_up_div},
    },
    ModeData,
};

/// Workgroup edge of the Hi-Z kernels.
pub const HI_Z_WORKGROUP_SIZE: u32 = 8;

/// Format of every pyramid level.
pub const HI_Z_FORMAT: TextureFormat = TextureFormat::R32Float;

fn level_size(size: UVec2, mip: u32) -> UVec2 {
    UVec2::new(mip_size(size.x, mip), mip_size(size.y, mip))
}

/// Pyramid levels as plain arrays, used in cpu mode.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuPyramid {
    sizes: Vec<UVec2>,
    mips: Vec<Vec<f32>>,
}

impl CpuPyramid {
    pub fn new(size: UVec2, far_value: f32) -> Self {
        let sizes: Vec<UVec2> = (0..mip_count(size.x, size.y)).map(|mip| level_size(size, mip)).collect();
        let mips = sizes
            .iter()
            .map(|size| vec![far_value; (size.x * size.y) as usize])
            .collect();
        Self { sizes, mips }
    }

    pub fn mip_count(&self) -> u32 {
        self.mips.len() as u32
    }

    pub fn mip_size(&self, mip: u32) -> UVec2 {
        self.sizes[mip as usize]
    }

    pub fn mip(&self, mip: u32) -> &[f32] {
        &self.mips[mip as usize]
    }

    pub fn load(&self, mip: u32, x: u32, y: u32) -> f32 {
        let size = self.sizes[mip as usize];
        self.mips[mip as usize][(y * size.x + x) as usize]
    }

    /// Lays the layers of `image` out side by side in mip 0.
    fn copy_depth(&mut self, image: &DepthImage) {
        profiling::scope!("CpuPyramid::copy_depth");

        let size = self.sizes[0];
        let mip0 = &mut self.mips[0];
        for y in 0..size.y {
            for x in 0..size.x {
                let layer = x / image.width;
                let local_x = x % image.width;
                mip0[(y * size.x + x) as usize] = image.sample(layer, local_x, y);
            }
        }
    }

    /// Fills every level below mip 0 with the farthest depth of its footprint.
    fn reduce(&mut self, depth: DepthConvention) {
        profiling::scope!("CpuPyramid::reduce");

        for mip in 1..self.mips.len() {
            let src_size = self.sizes[mip - 1];
            let dst_size = self.sizes[mip];
            let (before, after) = self.mips.split_at_mut(mip);
            let src = &before[mip - 1];
            let dst = &mut after[0];

            for y in 0..dst_size.y {
                let rows = reduction_footprint(y, src_size.y, dst_size.y);
                for x in 0..dst_size.x {
                    let columns = reduction_footprint(x, src_size.x, dst_size.x);
                    let mut value = src[(rows.start * src_size.x + columns.start) as usize];
                    for sy in rows.clone() {
                        for sx in columns.clone() {
                            value = depth.farthest(value, src[(sy * src_size.x + sx) as usize]);
                        }
                    }
                    dst[(y * dst_size.x + x) as usize] = value;
                }
            }
        }
    }
}

/// Pyramid texture and the bindings of its reduction passes, used in gpu mode.
pub struct GpuPyramid {
    #[allow(dead_code)]
    texture: Texture,
    full_view: TextureView,
    mip_views: Vec<TextureView>,
    reduce_bind_groups: Vec<BindGroup>,
    copy_uniform: Buffer,
}

impl GpuPyramid {
    fn new(kernels: &GpuKernels, size: UVec2, layer_width: u32, layers: u32) -> Self {
        profiling::scope!("GpuPyramid::new");

        let device = &kernels.context().device;
        let mip_level_count = mip_count(size.x, size.y);
        let texture = device.create_texture(&TextureDescriptor {
            label: Some("hi-z pyramid"),
            size: Extent3d {
                width: size.x,
                height: size.y,
                depth_or_array_layers: 1,
            },
            mip_level_count,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: HI_Z_FORMAT,
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::STORAGE_BINDING,
            view_formats: &[],
        });

        let full_view = texture.create_view(&TextureViewDescriptor::default());
        let mip_views: Vec<TextureView> = (0..mip_level_count)
            .map(|mip| {
                texture.create_view(&TextureViewDescriptor {
                    label: Some(&format_sso!("hi-z mip {mip}")),
                    base_mip_level: mip,
                    mip_level_count: Some(1),
                    ..Default::default()
                })
            })
            .collect();

        let copy_uniform = device.create_buffer_init(&BufferInitDescriptor {
            label: Some("hi-z copy uniform"),
            contents: bytemuck::cast_slice(&[layer_width, size.y, layers, 0]),
            usage: BufferUsages::UNIFORM,
        });

        let reduce_bind_groups = mip_views
            .windows(2)
            .enumerate()
            .map(|(mip, views)| {
                let src = level_size(size, mip as u32);
                let dst = level_size(size, mip as u32 + 1);
                let uniform = device.create_buffer_init(&BufferInitDescriptor {
                    label: Some(&format_sso!("hi-z reduce {mip} uniform")),
                    contents: bytemuck::cast_slice(&[src.x, src.y, dst.x, dst.y]),
                    usage: BufferUsages::UNIFORM,
                });
                BindGroupBuilder::new(Some(&format_sso!("hi-z reduce {mip}")))
                    .append_texture_view(&views[0])
                    .append_texture_view(&views[1])
                    .append_buffer(&uniform)
                    .build(device, kernels.hi_z_reduce_bgl())
            })
            .collect();

        Self {
            texture,
            full_view,
            mip_views,
            reduce_bind_groups,
            copy_uniform,
        }
    }

    /// View over every level, bound by the visibility kernel.
    pub fn view(&self) -> &TextureView {
        &self.full_view
    }

    /// Bind group copying `depth` into mip 0.
    pub fn source_bind_group(&self, kernels: &GpuKernels, depth: &TextureView) -> BindGroup {
        BindGroupBuilder::new(Some("hi-z copy"))
            .append_texture_view(depth)
            .append_texture_view(&self.mip_views[0])
            .append_buffer(&self.copy_uniform)
            .build(&kernels.context().device, kernels.hi_z_copy_bgl())
    }

    fn generate(&self, kernels: &GpuKernels, encoder: &mut CommandEncoder, source: &BindGroup, size: UVec2) {
        profiling::scope!("GpuPyramid::generate");

        let mut cpass = encoder.begin_compute_pass(&ComputePassDescriptor {
            label: Some("hi-z generation"),
            timestamp_writes: None,
        });
        cpass.set_pipeline(kernels.hi_z_copy_pipeline());
        cpass.set_bind_group(0, source, &[]);
        cpass.dispatch_workgroups(
            round_up_div(size.x, HI_Z_WORKGROUP_SIZE),
            round_up_div(size.y, HI_Z_WORKGROUP_SIZE),
            1,
        );

        cpass.set_pipeline(kernels.hi_z_reduce_pipeline());
        for (mip, bind_group) in self.reduce_bind_groups.iter().enumerate() {
            let dst = level_size(size, mip as u32 + 1);
            cpass.set_bind_group(0, bind_group, &[]);
            cpass.dispatch_workgroups(
                round_up_div(dst.x, HI_Z_WORKGROUP_SIZE),
                round_up_div(dst.y, HI_Z_WORKGROUP_SIZE),
                1,
            );
        }
    }
}

/// Depth pyramid of one camera. Never resized: a new layout means a new pyramid.
pub struct HiZPyramid {
    layer_size: UVec2,
    layers: u32,
    size: UVec2,
    depth: DepthConvention,
    data: ModeData<CpuPyramid, GpuPyramid>,
}

impl HiZPyramid {
    pub fn new(layer_size: UVec2, layers: u32, depth: DepthConvention, kernels: &ModeData<(), GpuKernels>) -> Self {
        let layers = layers.max(1);
        let size = UVec2::new(layer_size.x * layers, layer_size.y);
        log::debug!(
            "Creating {}x{} hi-z pyramid with {} mips ({layers} layers)",
            size.x,
            size.y,
            mip_count(size.x, size.y)
        );
        let data = match kernels {
            ModeData::Cpu(()) => ModeData::Cpu(CpuPyramid::new(size, depth.far_value())),
            ModeData::Gpu(kernels) => ModeData::Gpu(GpuPyramid::new(kernels, size, layer_size.x, layers)),
        };
        Self {
            layer_size,
            layers,
            size,
            depth,
            data,
        }
    }

    /// Size of one eye's depth.
    pub fn layer_size(&self) -> UVec2 {
        self.layer_size
    }

    pub fn layers(&self) -> u32 {
        self.layers
    }

    /// Size of mip 0, every layer side by side.
    pub fn size(&self) -> UVec2 {
        self.size
    }

    pub fn mip_count(&self) -> u32 {
        mip_count(self.size.x, self.size.y)
    }

    pub fn matches(&self, layer_size: UVec2, layers: u32) -> bool {
        self.layer_size == layer_size && self.layers == layers.max(1)
    }

    pub fn cpu(&self) -> Option<&CpuPyramid> {
        self.data.cpu()
    }

    pub fn gpu(&self) -> Option<&GpuPyramid> {
        self.data.gpu()
    }

    /// Builds every level from a depth image. Cpu mode only.
    pub fn generate_cpu(&mut self, image: &DepthImage) {
        let depth = self.depth;
        if let ModeData::Cpu(ref mut pyramid) = self.data {
            pyramid.copy_depth(image);
            pyramid.reduce(depth);
        }
    }

    /// Records the copy and reduction passes. Gpu mode only.
    pub fn generate_gpu(&self, kernels: &GpuKernels, encoder: &mut CommandEncoder, source: &BindGroup) {
        if let ModeData::Gpu(ref pyramid) = self.data {
            pyramid.generate(kernels, encoder, source, self.size);
        }
    }
}
