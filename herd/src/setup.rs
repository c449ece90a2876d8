use std::sync::Arc;

use arrayvec::ArrayVec;
use wgpu::{
    Adapter, AdapterInfo, Backend, Backends, Device, DeviceDescriptor, DeviceType, DownlevelCapabilities,
    DownlevelFlags, Features, Instance, InstanceDescriptor, Limits, Queue,
};

use crate::{culling::WORKGROUP_SIZE, HerdInitializationError, LimitType, RendererMode};

/// Storage buffers bound at once by the visibility kernel.
pub const REQUIRED_STORAGE_BUFFERS: u32 = 6;

/// Limits required to run in gpu-mode.
pub fn gpu_required_limits() -> Limits {
    Limits {
        max_storage_buffers_per_shader_stage: REQUIRED_STORAGE_BUFFERS,
        max_storage_textures_per_shader_stage: 1,
        max_uniform_buffers_per_shader_stage: 1,
        max_storage_buffer_binding_size: 128 << 20,
        max_compute_invocations_per_workgroup: WORKGROUP_SIZE,
        max_compute_workgroup_size_x: WORKGROUP_SIZE,
        ..Limits::downlevel_defaults()
    }
}

fn check_limit(device: u32, required: u32, ty: LimitType) -> Result<u32, HerdInitializationError> {
    if device < required {
        Err(HerdInitializationError::LowDeviceLimit {
            ty,
            device_limit: device as u64,
            required_limit: required as u64,
        })
    } else {
        Ok(device)
    }
}

/// Check that all required limits for gpu mode are present in the given limit set.
///
/// Returns the limits to request the device with.
pub fn check_limits(device_limits: &Limits) -> Result<Limits, HerdInitializationError> {
    let required = gpu_required_limits();

    Ok(Limits {
        max_storage_buffers_per_shader_stage: check_limit(
            device_limits.max_storage_buffers_per_shader_stage,
            required.max_storage_buffers_per_shader_stage,
            LimitType::StorageBuffersPerShaderStages,
        )?,
        max_storage_textures_per_shader_stage: check_limit(
            device_limits.max_storage_textures_per_shader_stage,
            required.max_storage_textures_per_shader_stage,
            LimitType::StorageTexturesPerShaderStages,
        )?,
        max_uniform_buffers_per_shader_stage: check_limit(
            device_limits.max_uniform_buffers_per_shader_stage,
            required.max_uniform_buffers_per_shader_stage,
            LimitType::UniformBuffersPerShaderStages,
        )?,
        max_storage_buffer_binding_size: check_limit(
            device_limits.max_storage_buffer_binding_size,
            required.max_storage_buffer_binding_size,
            LimitType::MaxStorageBufferBindingSize,
        )?,
        max_compute_invocations_per_workgroup: check_limit(
            device_limits.max_compute_invocations_per_workgroup,
            required.max_compute_invocations_per_workgroup,
            LimitType::MaxComputeInvocationsPerWorkgroup,
        )?,
        max_compute_workgroup_size_x: check_limit(
            device_limits.max_compute_workgroup_size_x,
            required.max_compute_workgroup_size_x,
            LimitType::MaxComputeWorkgroupSizeX,
        )?,
        max_compute_workgroups_per_dimension: check_limit(
            device_limits.max_compute_workgroups_per_dimension,
            required.max_compute_workgroups_per_dimension,
            LimitType::MaxComputeWorkgroupsPerDimension,
        )?,
        ..required
    })
}

/// Check the adapter can run the kernels at all.
///
/// GL is turned away even with compute support, GLSL can't `textureLoad` a depth texture.
pub fn check_downlevel(info: &AdapterInfo, caps: &DownlevelCapabilities) -> Result<(), HerdInitializationError> {
    if !caps.flags.contains(DownlevelFlags::COMPUTE_SHADERS) {
        return Err(HerdInitializationError::MissingComputeSupport {
            name: info.name.clone(),
        });
    }
    if info.backend == Backend::Gl {
        return Err(HerdInitializationError::UnsupportedBackend {
            name: info.name.clone(),
            backend: info.backend,
        });
    }
    Ok(())
}

/// Validated limits and mode for a given T.
pub struct PotentialAdapter<T> {
    pub inner: T,
    pub info: AdapterInfo,
    pub limits: Limits,
    pub mode: RendererMode,
    /// Why the adapter was downgraded to cpu mode without being asked to.
    pub fallback_reason: Option<HerdInitializationError>,
}
impl<T> PotentialAdapter<T> {
    pub fn new(
        inner: T,
        info: AdapterInfo,
        inner_limits: Limits,
        downlevel: DownlevelCapabilities,
        desired_mode: Option<RendererMode>,
    ) -> Result<Self, HerdInitializationError> {
        let gpu_support = check_downlevel(&info, &downlevel).and_then(|()| check_limits(&inner_limits));

        let cpu_limits = Limits::downlevel_webgl2_defaults().using_resolution(inner_limits);
        let (limits, mode, fallback_reason) = match (gpu_support, desired_mode) {
            (Ok(limits), None | Some(RendererMode::GpuPowered)) => (limits, RendererMode::GpuPowered, None),
            (Err(e), Some(RendererMode::GpuPowered)) => return Err(e),
            (Err(e), None) => (cpu_limits, RendererMode::CpuPowered, Some(e)),
            (_, Some(RendererMode::CpuPowered)) => (cpu_limits, RendererMode::CpuPowered, None),
        };

        Ok(PotentialAdapter {
            inner,
            info,
            limits,
            mode,
            fallback_reason,
        })
    }
}

/// Device and queue shared by every gpu resource herd creates.
#[derive(Debug)]
pub struct GpuContext {
    pub device: Arc<Device>,
    pub queue: Arc<Queue>,
}

/// Container for Instance/Adapter/Device/Queue etc.
///
/// Create these yourself, or call [`create_iad`].
#[derive(Debug, Clone)]
pub struct InstanceAdapterDevice {
    pub instance: Arc<Instance>,
    pub adapter: Arc<Adapter>,
    pub device: Arc<Device>,
    pub queue: Arc<Queue>,
    pub mode: RendererMode,
    pub info: AdapterInfo,
}

impl InstanceAdapterDevice {
    pub fn context(&self) -> Arc<GpuContext> {
        Arc::new(GpuContext {
            device: Arc::clone(&self.device),
            queue: Arc::clone(&self.queue),
        })
    }
}

fn device_type_rank(ty: DeviceType) -> u8 {
    match ty {
        DeviceType::DiscreteGpu => 0,
        DeviceType::IntegratedGpu => 1,
        DeviceType::VirtualGpu => 2,
        DeviceType::Other => 3,
        DeviceType::Cpu => 4,
    }
}

/// Creates an Instance/Adapter/Device/Queue using the given choices. Tries to get the best combination.
#[cfg(not(target_arch = "wasm32"))]
pub async fn create_iad(
    desired_backend: Option<Backend>,
    desired_device: Option<String>,
    desired_mode: Option<RendererMode>,
) -> Result<InstanceAdapterDevice, HerdInitializationError> {
    profiling::scope!("create_iad");

    let default_backend_order = [Backend::Vulkan, Backend::Metal, Backend::Dx12, Backend::Gl];

    let instance = Instance::new(InstanceDescriptor {
        backends: Backends::all(),
        ..Default::default()
    });

    let desired_device = desired_device.map(|d| d.to_lowercase());

    let mut potential_adapters = Vec::new();
    for backend in default_backend_order {
        if desired_backend.map_or(false, |d| d != backend) {
            continue;
        }

        let mut backend_adapters = ArrayVec::<PotentialAdapter<Adapter>, 4>::new();
        for (idx, adapter) in instance.enumerate_adapters(Backends::from(backend)).into_iter().enumerate() {
            let info = adapter.get_info();
            let limits = adapter.limits();
            let downlevel = adapter.get_downlevel_capabilities();
            let potential = PotentialAdapter::new(adapter, info, limits, downlevel, desired_mode);

            log::debug!("{:?} Adapter {}: {:#?}", backend, idx, potential.as_ref().map(|p| &p.info));

            let desired = match desired_device {
                Some(ref desired_device) => potential
                    .as_ref()
                    .map(|p| p.info.name.to_lowercase().contains(desired_device))
                    .unwrap_or(false),
                None => true,
            };

            match (potential, desired) {
                (Ok(potential), true) if !backend_adapters.is_full() => {
                    log::debug!("Adapter usable in {:?} mode", potential.mode);
                    backend_adapters.push(potential)
                }
                _ => log::debug!("Adapter not usable"),
            }
        }
        potential_adapters.extend(backend_adapters);
    }

    // Stable sort keeps the backend order within a device type.
    potential_adapters.sort_by_key(|a| (a.mode != RendererMode::GpuPowered, device_type_rank(a.info.device_type)));

    let adapter = potential_adapters
        .into_iter()
        .next()
        .ok_or(HerdInitializationError::MissingAdapter)?;

    log::debug!("Chosen adapter: {:#?}", adapter.info);
    log::debug!("Chosen mode: {:#?}", adapter.mode);
    if let Some(ref reason) = adapter.fallback_reason {
        log::warn!(
            "Adapter {} cannot run herd's compute kernels ({reason}), falling back to cpu mode",
            adapter.info.name
        );
    }

    let (device, queue) = adapter
        .inner
        .request_device(
            &DeviceDescriptor {
                label: Some("herd device"),
                required_features: Features::empty(),
                required_limits: adapter.limits.clone(),
            },
            None,
        )
        .await
        .map_err(HerdInitializationError::RequestDeviceFailed)?;

    Ok(InstanceAdapterDevice {
        instance: Arc::new(instance),
        adapter: Arc::new(adapter.inner),
        device: Arc::new(device),
        queue: Arc::new(queue),
        mode: adapter.mode,
        info: adapter.info,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn info() -> AdapterInfo {
        AdapterInfo {
            name: String::from("test adapter"),
            vendor: 0,
            device: 0,
            device_type: DeviceType::DiscreteGpu,
            driver: String::new(),
            driver_info: String::new(),
            backend: Backend::Vulkan,
        }
    }

    #[test]
    fn small_workgroups_fall_back_to_cpu() {
        let limits = Limits {
            max_compute_invocations_per_workgroup: 32,
            ..Limits::default()
        };

        let potential = PotentialAdapter::new((), info(), limits.clone(), DownlevelCapabilities::default(), None).unwrap();
        assert_eq!(potential.mode, RendererMode::CpuPowered);
        assert!(potential.fallback_reason.is_some());

        let forced = PotentialAdapter::new(
            (),
            info(),
            limits,
            DownlevelCapabilities::default(),
            Some(RendererMode::GpuPowered),
        );
        assert!(matches!(
            forced,
            Err(HerdInitializationError::LowDeviceLimit {
                ty: LimitType::MaxComputeInvocationsPerWorkgroup,
                ..
            })
        ));
    }

    #[test]
    fn missing_compute_is_reported() {
        let downlevel = DownlevelCapabilities {
            flags: DownlevelFlags::empty(),
            ..Default::default()
        };
        let forced = PotentialAdapter::new((), info(), Limits::default(), downlevel, Some(RendererMode::GpuPowered));
        assert!(matches!(forced, Err(HerdInitializationError::MissingComputeSupport { .. })));
    }

    #[test]
    fn gl_falls_back_to_cpu() {
        let gl = AdapterInfo {
            backend: Backend::Gl,
            ..info()
        };
        let potential =
            PotentialAdapter::new((), gl.clone(), Limits::default(), DownlevelCapabilities::default(), None).unwrap();
        assert_eq!(potential.mode, RendererMode::CpuPowered);
        assert!(matches!(
            potential.fallback_reason,
            Some(HerdInitializationError::UnsupportedBackend {
                backend: Backend::Gl,
                ..
            })
        ));

        let forced = PotentialAdapter::new(
            (),
            gl,
            Limits::default(),
            DownlevelCapabilities::default(),
            Some(RendererMode::GpuPowered),
        );
        assert!(forced.is_err());
    }

    #[test]
    fn capable_adapter_is_gpu_powered() {
        let potential =
            PotentialAdapter::new((), info(), Limits::default(), DownlevelCapabilities::default(), None).unwrap();
        assert_eq!(potential.mode, RendererMode::GpuPowered);
    }
}
