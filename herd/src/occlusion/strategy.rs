//! When the depth pyramid of a camera gets built.

use herd_types::OcclusionCullingMode;

/// Points of a camera's frame the host forwards to herd.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CameraEvent {
    /// The camera's depth prepass has finished.
    AfterDepthPrepass,
    /// The host's render graph is executing the pass herd enqueued.
    RenderGraphPass,
}

/// Everything that may cause a pyramid build.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum HiZTrigger {
    /// Inside [`Herd::update_camera_data`](crate::Herd::update_camera_data).
    CameraUpdate,
    Camera(CameraEvent),
    EndOfFrame,
}

/// One way of getting a camera's depth into its pyramid.
pub trait HiZAcquisition: Send + Sync {
    fn mode(&self) -> OcclusionCullingMode;

    /// Called once per frame before the host's render graph executes.
    fn begin_rendering(&mut self) {}

    /// Whether the pyramid should be built at `trigger`.
    fn should_build(&mut self, trigger: HiZTrigger) -> bool;

    /// Whether the recorded source bindings are replayed on later builds.
    /// Strategies returning false record them again every build.
    fn keeps_recording(&self) -> bool {
        false
    }
}

/// Dispatches against the live depth texture while the camera updates.
#[derive(Debug, Default)]
pub struct DirectTextureAccess;

impl HiZAcquisition for DirectTextureAccess {
    fn mode(&self) -> OcclusionCullingMode {
        OcclusionCullingMode::DirectTextureAccess
    }

    fn should_build(&mut self, trigger: HiZTrigger) -> bool {
        trigger == HiZTrigger::CameraUpdate
    }
}

/// Recorded once and replayed every frame after the camera's depth prepass.
#[derive(Debug, Default)]
pub struct CommandBufferAddedToCamera;

impl HiZAcquisition for CommandBufferAddedToCamera {
    fn mode(&self) -> OcclusionCullingMode {
        OcclusionCullingMode::CommandBufferAddedToCamera
    }

    fn should_build(&mut self, trigger: HiZTrigger) -> bool {
        trigger == HiZTrigger::Camera(CameraEvent::AfterDepthPrepass)
    }

    fn keeps_recording(&self) -> bool {
        true
    }
}

/// Rebuilt and executed when the frame ends.
#[derive(Debug, Default)]
pub struct CommandBufferExecutedOnEndRendering;

impl HiZAcquisition for CommandBufferExecutedOnEndRendering {
    fn mode(&self) -> OcclusionCullingMode {
        OcclusionCullingMode::CommandBufferExecutedOnEndRendering
    }

    fn should_build(&mut self, trigger: HiZTrigger) -> bool {
        trigger == HiZTrigger::EndOfFrame
    }
}

/// Enqueued by [`begin_rendering`](HiZAcquisition::begin_rendering), executed by the host's graph.
#[derive(Debug, Default)]
pub struct RenderGraphPass {
    enqueued: bool,
}

impl HiZAcquisition for RenderGraphPass {
    fn mode(&self) -> OcclusionCullingMode {
        OcclusionCullingMode::RenderGraphPass
    }

    fn begin_rendering(&mut self) {
        self.enqueued = true;
    }

    fn should_build(&mut self, trigger: HiZTrigger) -> bool {
        if trigger == HiZTrigger::Camera(CameraEvent::RenderGraphPass) {
            std::mem::take(&mut self.enqueued)
        } else {
            false
        }
    }
}

/// Strategy for an already resolved mode.
pub fn create_strategy(mode: OcclusionCullingMode) -> Box<dyn HiZAcquisition> {
    match mode {
        OcclusionCullingMode::DirectTextureAccess => Box::new(DirectTextureAccess),
        OcclusionCullingMode::CommandBufferAddedToCamera => Box::new(CommandBufferAddedToCamera),
        OcclusionCullingMode::CommandBufferExecutedOnEndRendering => Box::new(CommandBufferExecutedOnEndRendering),
        OcclusionCullingMode::RenderGraphPass => Box::<RenderGraphPass>::default(),
        OcclusionCullingMode::Auto => {
            log::warn!("Occlusion culling mode was not resolved, using direct texture access");
            Box::new(DirectTextureAccess)
        }
    }
}

#[cfg(test)]
mod test {
    use herd_types::OcclusionCullingMode;

    use super::{create_strategy, CameraEvent, HiZTrigger};

    const TRIGGERS: [HiZTrigger; 4] = [
        HiZTrigger::CameraUpdate,
        HiZTrigger::Camera(CameraEvent::AfterDepthPrepass),
        HiZTrigger::Camera(CameraEvent::RenderGraphPass),
        HiZTrigger::EndOfFrame,
    ];

    fn fired(mode: OcclusionCullingMode, begin: bool) -> Vec<HiZTrigger> {
        let mut strategy = create_strategy(mode);
        assert_eq!(strategy.mode(), mode);
        if begin {
            strategy.begin_rendering();
        }
        TRIGGERS.into_iter().filter(|&t| strategy.should_build(t)).collect()
    }

    #[test]
    fn each_strategy_builds_at_its_own_point() {
        assert_eq!(
            fired(OcclusionCullingMode::DirectTextureAccess, false),
            [HiZTrigger::CameraUpdate]
        );
        assert_eq!(
            fired(OcclusionCullingMode::CommandBufferAddedToCamera, false),
            [HiZTrigger::Camera(CameraEvent::AfterDepthPrepass)]
        );
        assert_eq!(
            fired(OcclusionCullingMode::CommandBufferExecutedOnEndRendering, false),
            [HiZTrigger::EndOfFrame]
        );
        assert!(fired(OcclusionCullingMode::RenderGraphPass, false).is_empty());
        assert_eq!(
            fired(OcclusionCullingMode::RenderGraphPass, true),
            [HiZTrigger::Camera(CameraEvent::RenderGraphPass)]
        );
    }

    #[test]
    fn render_graph_pass_runs_once_per_enqueue() {
        let mut strategy = create_strategy(OcclusionCullingMode::RenderGraphPass);
        strategy.begin_rendering();
        let trigger = HiZTrigger::Camera(CameraEvent::RenderGraphPass);
        assert!(strategy.should_build(trigger));
        assert!(!strategy.should_build(trigger));
    }
}
