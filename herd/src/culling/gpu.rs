//! Compute shader versions of the kernels, used in gpu mode.

use std::{borrow::Cow, sync::Arc};

use encase::{ShaderType, UniformBuffer};
use glam::{Mat4, UVec2, Vec3, Vec4};
use herd_types::DepthConvention;
use serde::Serialize;
use wgpu::{
    util::{BufferInitDescriptor, DeviceExt},
    BindGroupLayout, BindGroupLayoutDescriptor, BindGroupLayoutEntry, BindingResource, BindingType, Buffer,
    BufferBindingType, BufferUsages, CommandEncoder, ComputePassDescriptor, ComputePipeline,
    ComputePipelineDescriptor, Extent3d, PipelineLayout, PipelineLayoutDescriptor, ShaderModule, ShaderModuleDescriptor,
    ShaderSource, ShaderStages, StorageTextureAccess, TextureDescriptor, TextureDimension, TextureSampleType,
    TextureUsages, TextureView, TextureViewDescriptor, TextureViewDimension,
};

use crate::{
    culling::{CullingCamera, GroupDispatch, KernelConfig, PipelineVariant, WORKGROUP_SIZE},
    format_sso,
    occlusion::{HiZPyramid, HI_Z_FORMAT, HI_Z_WORKGROUP_SIZE},
    setup::GpuContext,
    util::{bind_merge::BindGroupBuilder, math::round_up_div, typedefs::FastHashMap},
    HerdError, HerdInitializationError, ShaderPreProcessor,
};

#[derive(Debug, ShaderType)]
struct CullingUniform {
    view_proj: [Mat4; 2],
    planes: [Vec4; 10],
    camera_position: Vec3,
    tan_half_fov: f32,
    ortho_height: f32,
    eye_count: u32,
    depth_reversed: u32,
    delta_time: f32,
    hi_z_size: UVec2,
    hi_z_mips: u32,
    visibility_offset: u32,
    lod_count: u32,
    buffer_size: u32,
    active_count: u32,
    profile_start: u32,
    lod_group_start: u32,
}

#[derive(Debug, ShaderType)]
struct CommandUniform {
    count: u32,
    multiplier: u32,
    _padding0: u32,
    _padding1: u32,
}

#[derive(Debug, ShaderType)]
struct CameraRelativeUniform {
    origin: Vec3,
    count: u32,
}

#[derive(Serialize)]
struct HiZConfig {
    copy: bool,
    reversed: bool,
    workgroup_size: u32,
}

/// Buffers one group's visibility dispatch binds.
pub struct GpuVisibilityArgs<'a> {
    pub camera: &'a CullingCamera,
    pub dispatch: &'a GroupDispatch,
    pub transforms: &'a Buffer,
    pub active_indexes: &'a Buffer,
    pub parameters: &'a Buffer,
    pub hi_z: Option<&'a HiZPyramid>,
    pub counters: &'a Buffer,
    pub instances: &'a Buffer,
    pub lod_states: &'a Buffer,
}

fn buffer_entry(binding: u32, ty: BufferBindingType) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage(binding: u32, read_only: bool) -> BindGroupLayoutEntry {
    buffer_entry(binding, BufferBindingType::Storage { read_only })
}

fn texture_entry(binding: u32, sample_type: TextureSampleType, view_dimension: TextureViewDimension) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: BindingType::Texture {
            sample_type,
            view_dimension,
            multisampled: false,
        },
        count: None,
    }
}

fn storage_texture_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: BindingType::StorageTexture {
            access: StorageTextureAccess::WriteOnly,
            format: HI_Z_FORMAT,
            view_dimension: TextureViewDimension::D2,
        },
        count: None,
    }
}

/// Every compiled kernel. The visibility permutation table is built up front.
pub struct GpuKernels {
    context: Arc<GpuContext>,
    visibility_bgl: BindGroupLayout,
    visibility_pipelines: FastHashMap<PipelineVariant, ComputePipeline>,
    command_bgl: BindGroupLayout,
    command_pipeline: ComputePipeline,
    camera_relative_bgl: BindGroupLayout,
    camera_relative_pipeline: ComputePipeline,
    hi_z_copy_bgl: BindGroupLayout,
    hi_z_copy_pipeline: ComputePipeline,
    hi_z_reduce_bgl: BindGroupLayout,
    hi_z_reduce_pipeline: ComputePipeline,
    empty_hi_z: TextureView,
}

impl GpuKernels {
    pub fn new(
        context: Arc<GpuContext>,
        spp: &ShaderPreProcessor,
        depth: DepthConvention,
    ) -> Result<Self, HerdInitializationError> {
        profiling::scope!("GpuKernels::new");

        let device = &context.device;

        let visibility_bgl = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("visibility bgl"),
            entries: &[
                buffer_entry(0, BufferBindingType::Uniform),
                storage(1, true),
                storage(2, true),
                storage(3, true),
                storage(4, false),
                storage(5, false),
                storage(6, false),
                texture_entry(
                    7,
                    TextureSampleType::Float { filterable: false },
                    TextureViewDimension::D2,
                ),
            ],
        });
        let visibility_pll = Self::pipeline_layout(&context, "visibility pll", &visibility_bgl);

        let mut visibility_pipelines = FastHashMap::default();
        for variant in PipelineVariant::permutations() {
            let name = format_sso!("visibility {:?}", variant);
            let sm = Self::shader_module(&context, spp, &name, "herd/visibility.wgsl", &variant.shader_config())?;
            visibility_pipelines.insert(variant, Self::pipeline(&context, &name, &visibility_pll, &sm));
        }
        log::debug!("Compiled {} visibility kernel permutations", visibility_pipelines.len());

        let command_bgl = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("command update bgl"),
            entries: &[
                buffer_entry(0, BufferBindingType::Uniform),
                storage(1, true),
                storage(2, true),
                storage(3, false),
            ],
        });
        let command_sm = Self::shader_module(
            &context,
            spp,
            "command update",
            "herd/command_update.wgsl",
            &KernelConfig {
                workgroup_size: WORKGROUP_SIZE,
            },
        )?;
        let command_pipeline = Self::pipeline(
            &context,
            "command update",
            &Self::pipeline_layout(&context, "command update pll", &command_bgl),
            &command_sm,
        );

        let camera_relative_bgl = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("camera relative bgl"),
            entries: &[buffer_entry(0, BufferBindingType::Uniform), storage(1, true), storage(2, false)],
        });
        let camera_relative_sm = Self::shader_module(
            &context,
            spp,
            "camera relative",
            "herd/camera_relative.wgsl",
            &KernelConfig {
                workgroup_size: WORKGROUP_SIZE,
            },
        )?;
        let camera_relative_pipeline = Self::pipeline(
            &context,
            "camera relative",
            &Self::pipeline_layout(&context, "camera relative pll", &camera_relative_bgl),
            &camera_relative_sm,
        );

        let hi_z_copy_bgl = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("hi-z copy bgl"),
            entries: &[
                texture_entry(0, TextureSampleType::Depth, TextureViewDimension::D2Array),
                storage_texture_entry(1),
                buffer_entry(2, BufferBindingType::Uniform),
            ],
        });
        let hi_z_reduce_bgl = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("hi-z reduce bgl"),
            entries: &[
                texture_entry(
                    0,
                    TextureSampleType::Float { filterable: false },
                    TextureViewDimension::D2,
                ),
                storage_texture_entry(1),
                buffer_entry(2, BufferBindingType::Uniform),
            ],
        });

        let reversed = depth == DepthConvention::Reversed;
        let hi_z_pipeline = |copy: bool, bgl: &BindGroupLayout| -> Result<ComputePipeline, HerdInitializationError> {
            let name = if copy { "hi-z copy" } else { "hi-z reduce" };
            let config = HiZConfig {
                copy,
                reversed,
                workgroup_size: HI_Z_WORKGROUP_SIZE,
            };
            let sm = Self::shader_module(&context, spp, name, "herd/hi_z.wgsl", &config)?;
            Ok(Self::pipeline(
                &context,
                name,
                &Self::pipeline_layout(&context, name, bgl),
                &sm,
            ))
        };
        let hi_z_copy_pipeline = hi_z_pipeline(true, &hi_z_copy_bgl)?;
        let hi_z_reduce_pipeline = hi_z_pipeline(false, &hi_z_reduce_bgl)?;

        let empty_hi_z = device
            .create_texture(&TextureDescriptor {
                label: Some("empty hi-z"),
                size: Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: TextureDimension::D2,
                format: HI_Z_FORMAT,
                usage: TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            })
            .create_view(&TextureViewDescriptor::default());

        Ok(Self {
            context,
            visibility_bgl,
            visibility_pipelines,
            command_bgl,
            command_pipeline,
            camera_relative_bgl,
            camera_relative_pipeline,
            hi_z_copy_bgl,
            hi_z_copy_pipeline,
            hi_z_reduce_bgl,
            hi_z_reduce_pipeline,
            empty_hi_z,
        })
    }

    fn shader_module<T: Serialize>(
        context: &GpuContext,
        spp: &ShaderPreProcessor,
        name: &str,
        base: &str,
        config: &T,
    ) -> Result<ShaderModule, HerdInitializationError> {
        let source = spp
            .render_shader(base, config)
            .map_err(|source| HerdInitializationError::ShaderPreprocessing {
                name: name.into(),
                source,
            })?;
        Ok(context.device.create_shader_module(ShaderModuleDescriptor {
            label: Some(&format_sso!("{name} sm")),
            source: ShaderSource::Wgsl(Cow::Owned(source)),
        }))
    }

    fn pipeline_layout(context: &GpuContext, label: &str, bgl: &BindGroupLayout) -> PipelineLayout {
        context.device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[bgl],
            push_constant_ranges: &[],
        })
    }

    fn pipeline(context: &GpuContext, label: &str, layout: &PipelineLayout, module: &ShaderModule) -> ComputePipeline {
        context.device.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(layout),
            module,
            entry_point: "main",
        })
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.context
    }

    pub fn hi_z_copy_bgl(&self) -> &BindGroupLayout {
        &self.hi_z_copy_bgl
    }

    pub fn hi_z_reduce_bgl(&self) -> &BindGroupLayout {
        &self.hi_z_reduce_bgl
    }

    pub fn hi_z_copy_pipeline(&self) -> &ComputePipeline {
        &self.hi_z_copy_pipeline
    }

    pub fn hi_z_reduce_pipeline(&self) -> &ComputePipeline {
        &self.hi_z_reduce_pipeline
    }

    pub fn dispatch_visibility(&self, encoder: &mut CommandEncoder, args: GpuVisibilityArgs<'_>) -> Result<(), HerdError> {
        profiling::scope!("GpuKernels::dispatch_visibility");

        let Some(pipeline) = self.visibility_pipelines.get(&args.dispatch.variant) else {
            log::error!("No visibility kernel for {:?}", args.dispatch.variant);
            return Ok(());
        };

        let camera = args.camera;
        let dispatch = args.dispatch;
        let mut planes = [Vec4::ZERO; 10];
        for (eye, frustum) in camera.frustums.iter().enumerate() {
            for (index, plane) in frustum.planes().iter().enumerate() {
                planes[eye * 5 + index] = plane.to_vec4();
            }
        }
        let (hi_z_size, hi_z_mips) = args.hi_z.map_or((UVec2::ZERO, 0), |p| (p.size(), p.mip_count()));

        let mut uniform = UniformBuffer::new(Vec::<u8>::new());
        uniform.write(&CullingUniform {
            view_proj: camera.view_proj,
            planes,
            camera_position: camera.position,
            tan_half_fov: camera.tan_half_fov,
            ortho_height: camera.ortho_height,
            eye_count: camera.eye_count,
            depth_reversed: (camera.depth == DepthConvention::Reversed) as u32,
            delta_time: camera.delta_time,
            hi_z_size,
            hi_z_mips,
            visibility_offset: dispatch.visibility_offset,
            lod_count: dispatch.lod_count,
            buffer_size: dispatch.buffer_size,
            active_count: dispatch.active_count,
            profile_start: dispatch.profile_start,
            lod_group_start: dispatch.lod_group_start,
        })?;
        let uniform_buffer = self.context.device.create_buffer_init(&BufferInitDescriptor {
            label: Some("visibility uniform"),
            contents: &uniform.into_inner(),
            usage: BufferUsages::UNIFORM,
        });

        let hi_z_view = args.hi_z.and_then(HiZPyramid::gpu).map_or(&self.empty_hi_z, |p| p.view());
        let bind_group = BindGroupBuilder::new(Some("visibility bg"))
            .append_buffer(&uniform_buffer)
            .append_buffer(args.transforms)
            .append_buffer(args.active_indexes)
            .append_buffer(args.parameters)
            .append_buffer(args.counters)
            .append_buffer(args.instances)
            .append_buffer(args.lod_states)
            .append(BindingResource::TextureView(hi_z_view))
            .build(&self.context.device, &self.visibility_bgl);

        let mut cpass = encoder.begin_compute_pass(&ComputePassDescriptor {
            label: Some("visibility"),
            timestamp_writes: None,
        });
        cpass.set_pipeline(pipeline);
        cpass.set_bind_group(0, &bind_group, &[]);
        cpass.dispatch_workgroups(round_up_div(dispatch.active_count, WORKGROUP_SIZE), 1, 1);
        Ok(())
    }

    /// Writes `transforms` into `relative` with `origin` subtracted from every translation.
    pub fn dispatch_camera_relative(
        &self,
        encoder: &mut CommandEncoder,
        transforms: &Buffer,
        relative: &Buffer,
        count: u32,
        origin: Vec3,
    ) -> Result<(), HerdError> {
        profiling::scope!("GpuKernels::dispatch_camera_relative");

        let mut uniform = UniformBuffer::new(Vec::<u8>::new());
        uniform.write(&CameraRelativeUniform { origin, count })?;
        let uniform_buffer = self.context.device.create_buffer_init(&BufferInitDescriptor {
            label: Some("camera relative uniform"),
            contents: &uniform.into_inner(),
            usage: BufferUsages::UNIFORM,
        });

        let bind_group = BindGroupBuilder::new(Some("camera relative bg"))
            .append_buffer(&uniform_buffer)
            .append_buffer(transforms)
            .append_buffer(relative)
            .build(&self.context.device, &self.camera_relative_bgl);

        let mut cpass = encoder.begin_compute_pass(&ComputePassDescriptor {
            label: Some("camera relative"),
            timestamp_writes: None,
        });
        cpass.set_pipeline(&self.camera_relative_pipeline);
        cpass.set_bind_group(0, &bind_group, &[]);
        cpass.dispatch_workgroups(round_up_div(count, WORKGROUP_SIZE), 1, 1);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn dispatch_command_update(
        &self,
        encoder: &mut CommandEncoder,
        commands: &Buffer,
        command_visibility_index: &Buffer,
        counters: &Buffer,
        count: u32,
        multiplier: u32,
    ) -> Result<(), HerdError> {
        profiling::scope!("GpuKernels::dispatch_command_update");

        let mut uniform = UniformBuffer::new(Vec::<u8>::new());
        uniform.write(&CommandUniform {
            count,
            multiplier,
            _padding0: 0,
            _padding1: 0,
        })?;
        let uniform_buffer = self.context.device.create_buffer_init(&BufferInitDescriptor {
            label: Some("command update uniform"),
            contents: &uniform.into_inner(),
            usage: BufferUsages::UNIFORM,
        });

        let bind_group = BindGroupBuilder::new(Some("command update bg"))
            .append_buffer(&uniform_buffer)
            .append_buffer(command_visibility_index)
            .append_buffer(counters)
            .append_buffer(commands)
            .build(&self.context.device, &self.command_bgl);

        let mut cpass = encoder.begin_compute_pass(&ComputePassDescriptor {
            label: Some("command update"),
            timestamp_writes: None,
        });
        cpass.set_pipeline(&self.command_pipeline);
        cpass.set_bind_group(0, &bind_group, &[]);
        cpass.dispatch_workgroups(round_up_div(count, WORKGROUP_SIZE), 1, 1);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use naga::valid::{Capabilities, ValidationFlags, Validator};

    use super::{HiZConfig, HI_Z_WORKGROUP_SIZE};
    use crate::{
        culling::{KernelConfig, PipelineVariant, WORKGROUP_SIZE},
        ShaderPreProcessor,
    };

    fn validate(name: &str, source: &str) {
        let module = naga::front::wgsl::parse_str(source)
            .unwrap_or_else(|e| panic!("{name} failed to parse:\n{}", e.emit_to_string(source)));
        Validator::new(ValidationFlags::all(), Capabilities::empty())
            .validate(&module)
            .unwrap_or_else(|e| panic!("{name} failed to validate: {e:?}"));
    }

    #[test]
    fn visibility_permutations_validate() {
        let spp = ShaderPreProcessor::new();
        for variant in PipelineVariant::permutations() {
            let source = spp.render_shader("herd/visibility.wgsl", &variant.shader_config()).unwrap();
            validate(&format!("visibility {variant:?}"), &source);
        }
    }

    #[test]
    fn fixed_kernels_validate() {
        let spp = ShaderPreProcessor::new();
        let source = spp
            .render_shader(
                "herd/command_update.wgsl",
                &KernelConfig {
                    workgroup_size: WORKGROUP_SIZE,
                },
            )
            .unwrap();
        validate("command update", &source);

        let source = spp
            .render_shader(
                "herd/camera_relative.wgsl",
                &KernelConfig {
                    workgroup_size: WORKGROUP_SIZE,
                },
            )
            .unwrap();
        validate("camera relative", &source);

        for copy in [true, false] {
            for reversed in [true, false] {
                let config = HiZConfig {
                    copy,
                    reversed,
                    workgroup_size: HI_Z_WORKGROUP_SIZE,
                };
                let source = spp.render_shader("herd/hi_z.wgsl", &config).unwrap();
                validate(&format!("hi-z copy={copy} reversed={reversed}"), &source);
            }
        }
    }
}
