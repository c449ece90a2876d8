use wgpu::{BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayout, BindingResource, Device};

use crate::util::typedefs::SsoString;

/// Builds a bind group with bindings numbered in the order they are appended.
pub struct BindGroupBuilder<'a> {
    label: Option<SsoString>,
    bg_entries: Vec<BindGroupEntry<'a>>,
}
impl<'a> BindGroupBuilder<'a> {
    pub fn new(label: Option<&str>) -> Self {
        Self {
            label: label.map(SsoString::from),
            bg_entries: Vec::with_capacity(8),
        }
    }

    pub fn append(mut self, resource: BindingResource<'a>) -> Self {
        let index = self.bg_entries.len();
        self.bg_entries.push(BindGroupEntry {
            binding: index as u32,
            resource,
        });
        self
    }

    pub fn append_buffer(self, buffer: &'a wgpu::Buffer) -> Self {
        self.append(buffer.as_entire_binding())
    }

    pub fn append_texture_view(self, view: &'a wgpu::TextureView) -> Self {
        self.append(BindingResource::TextureView(view))
    }

    pub fn build(self, device: &Device, bgl: &BindGroupLayout) -> BindGroup {
        device.create_bind_group(&BindGroupDescriptor {
            label: self.label.as_deref(),
            layout: bgl,
            entries: &self.bg_entries,
        })
    }
}
