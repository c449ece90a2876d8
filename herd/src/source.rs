//! Render sources and the groups multiplexing them into one transform buffer.

use std::hash::{Hash, Hasher};

use glam::Mat4;
use herd_types::{BufferMode, OwnerId, RenderSourceGroupDescriptor};
use indexmap::IndexMap;
use wgpu::BufferUsages;

use crate::{
    buffer::{CopyRegion, GpuDataBuffer},
    format_sso,
    mode::HerdContext,
    transform::TransformBufferData,
    util::typedefs::FastHasher,
    HerdError,
};

/// Identity of a [`RenderSourceGroup`].
///
/// Hash of prototype, profile, group id and the sorted, deduplicated keyword
/// list. Keyword order never matters.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderSourceGroupKey(pub u64);

impl RenderSourceGroupKey {
    pub fn from_descriptor(descriptor: &RenderSourceGroupDescriptor) -> Self {
        let mut keywords: Vec<&str> = descriptor.shader_keywords.iter().map(String::as_str).collect();
        keywords.sort_unstable();
        keywords.dedup();

        let mut hasher = FastHasher::default();
        descriptor.prototype.hash(&mut hasher);
        descriptor.profile.hash(&mut hasher);
        descriptor.group_id.hash(&mut hasher);
        keywords.hash(&mut hasher);
        Self(hasher.finish())
    }
}

/// Identity of a [`RenderSource`]: its owner within a group.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderSourceKey(pub u64);

impl RenderSourceKey {
    pub fn new(owner: OwnerId, group: RenderSourceGroupKey) -> Self {
        let mut hasher = FastHasher::default();
        owner.hash(&mut hasher);
        group.hash(&mut hasher);
        Self(hasher.finish())
    }
}

/// One registrant's contiguous range of a group's transform buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RenderSource {
    pub key: RenderSourceKey,
    pub owner: OwnerId,
    pub group: RenderSourceGroupKey,
    pub buffer_start_index: u32,
    pub buffer_size: u32,
    /// Leading part of the range that is rendered. Never larger than `buffer_size`.
    pub instance_count: u32,
}

/// All render sources sharing a [`RenderSourceGroupKey`].
pub struct RenderSourceGroup {
    key: RenderSourceGroupKey,
    descriptor: RenderSourceGroupDescriptor,
    sources: IndexMap<RenderSourceKey, RenderSource>,
    buffer_size: u32,
    instance_count: u32,
    transforms: TransformBufferData,
    /// Slot indexes the visibility kernel runs over, one per active instance.
    active_indexes: GpuDataBuffer<u32>,
    active_dirty: bool,
}

impl RenderSourceGroup {
    pub fn new(
        descriptor: RenderSourceGroupDescriptor,
        context: HerdContext,
        buffer_mode: BufferMode,
        motion_vectors: bool,
    ) -> Self {
        let key = RenderSourceGroupKey::from_descriptor(&descriptor);
        let label = format_sso!("group {:016x}", key.0);
        log::debug!("Creating render source group {label} for prototype {:?}", descriptor.prototype);
        Self {
            key,
            transforms: TransformBufferData::new(&label, context.clone(), buffer_mode, motion_vectors),
            active_indexes: GpuDataBuffer::new(&format_sso!("{label} active indexes"), context, BufferUsages::empty()),
            active_dirty: false,
            descriptor,
            sources: IndexMap::new(),
            buffer_size: 0,
            instance_count: 0,
        }
    }

    pub fn key(&self) -> RenderSourceGroupKey {
        self.key
    }

    pub fn descriptor(&self) -> &RenderSourceGroupDescriptor {
        &self.descriptor
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn sources(&self) -> impl ExactSizeIterator<Item = &RenderSource> + '_ {
        self.sources.values()
    }

    pub fn source(&self, key: RenderSourceKey) -> Option<&RenderSource> {
        self.sources.get(&key)
    }

    pub fn transforms(&self) -> &TransformBufferData {
        &self.transforms
    }

    pub fn transforms_mut(&mut self) -> &mut TransformBufferData {
        &mut self.transforms
    }

    /// Adds an empty source for `owner`. It owns no slots until its buffer size is set.
    pub fn add_render_source(&mut self, owner: OwnerId) -> Result<RenderSourceKey, HerdError> {
        let key = RenderSourceKey::new(owner, self.key);
        if self.sources.contains_key(&key) {
            return Err(HerdError::DuplicateRenderSource { owner });
        }
        self.sources.insert(
            key,
            RenderSource {
                key,
                owner,
                group: self.key,
                buffer_start_index: self.buffer_size,
                buffer_size: 0,
                instance_count: 0,
            },
        );
        Ok(key)
    }

    fn get_source(&self, key: RenderSourceKey) -> Result<&RenderSource, HerdError> {
        self.sources.get(&key).ok_or(HerdError::UnknownRenderSource(key))
    }

    /// Reassigns start indexes by prefix sum and recomputes the totals.
    fn recompute_layout(&mut self) {
        let mut start = 0;
        let mut instance_count = 0;
        for source in self.sources.values_mut() {
            source.buffer_start_index = start;
            start += source.buffer_size;
            instance_count += source.instance_count;
        }
        self.buffer_size = start;
        self.instance_count = instance_count;
        self.active_dirty = true;
    }

    /// Changes the slot count of one source.
    ///
    /// Sources before it keep their slots, sources after it are shifted. The
    /// resized source keeps the overlap of its old and new range only when
    /// `copy_previous` is set, otherwise it starts out zeroed.
    pub fn set_buffer_size(&mut self, key: RenderSourceKey, new_size: u32, copy_previous: bool) -> Result<(), HerdError> {
        profiling::scope!("RenderSourceGroup::set_buffer_size");

        let old = *self.get_source(key)?;
        if old.buffer_size == new_size {
            return Ok(());
        }
        let old_total = self.buffer_size as usize;

        if let Some(source) = self.sources.get_mut(&key) {
            source.buffer_size = new_size;
            source.instance_count = source.instance_count.min(new_size);
        }
        self.recompute_layout();

        let start = old.buffer_start_index as usize;
        let old_size = old.buffer_size as usize;
        let new_size = new_size as usize;
        let kept = if copy_previous { old_size.min(new_size) } else { 0 };

        let regions = if self.sources.len() == 1 {
            // Sole source: grow or shrink in place.
            vec![CopyRegion::new(0, 0, kept)]
        } else {
            vec![
                CopyRegion::new(0, 0, start + kept),
                CopyRegion::new(start + old_size, start + new_size, old_total - start - old_size),
            ]
        };

        log::debug!(
            "Group {:016x}: source {:?} resized {old_size} -> {new_size}, buffer {old_total} -> {}",
            self.key.0,
            old.owner,
            self.buffer_size
        );
        self.transforms.resize(self.buffer_size as usize, &regions);
        Ok(())
    }

    /// Rendered portion of a source. Growing past the source's buffer size needs
    /// [`set_buffer_size`](Self::set_buffer_size) first.
    pub fn set_instance_count(&mut self, key: RenderSourceKey, count: u32) -> Result<(), HerdError> {
        let source = self.sources.get_mut(&key).ok_or(HerdError::UnknownRenderSource(key))?;
        if count > source.buffer_size {
            return Err(HerdError::InstanceCountTooLarge {
                count,
                buffer_size: source.buffer_size,
            });
        }
        if source.instance_count != count {
            source.instance_count = count;
            self.recompute_layout();
        }
        Ok(())
    }

    /// Writes `count` matrices from `matrices[src_offset..]` at `dst_offset` of the source's range.
    ///
    /// Grows the source, keeping its previous data, when the write ends past its buffer size.
    pub fn set_transform_buffer_data(
        &mut self,
        key: RenderSourceKey,
        matrices: &[Mat4],
        src_offset: usize,
        dst_offset: u32,
        count: usize,
        overwrite_previous: bool,
    ) -> Result<(), HerdError> {
        profiling::scope!("RenderSourceGroup::set_transform_buffer_data");

        let src_end = src_offset.checked_add(count).unwrap_or(usize::MAX);
        if src_end > matrices.len() {
            return Err(HerdError::SourceRangeOutOfBounds {
                start: src_offset,
                end: src_end,
                len: matrices.len(),
            });
        }
        let required = u32::try_from(count)
            .ok()
            .and_then(|count| dst_offset.checked_add(count))
            .ok_or(HerdError::DestinationRangeTooLarge {
                offset: dst_offset,
                count,
            })?;

        let old_size = self.get_source(key)?.buffer_size;
        if required > old_size {
            self.set_buffer_size(key, required, true)?;
        }

        // Slots this write allocated have no previous frame, they start without motion.
        let existing = (old_size.saturating_sub(dst_offset) as usize).min(count);
        let (into_existing, into_allocated) = matrices[src_offset..src_end].split_at(existing);
        let start = (self.get_source(key)?.buffer_start_index + dst_offset) as usize;
        self.transforms
            .set_transform_buffer_data(start, into_existing, overwrite_previous);
        if !into_allocated.is_empty() {
            self.transforms
                .set_transform_buffer_data(start + existing, into_allocated, true);
        }
        Ok(())
    }

    /// Removes a source and compacts the buffer. Returns true if the group is now empty
    /// and has released its buffers.
    pub fn remove_render_source(&mut self, key: RenderSourceKey) -> Result<bool, HerdError> {
        profiling::scope!("RenderSourceGroup::remove_render_source");

        let removed = self.sources.shift_remove(&key).ok_or(HerdError::UnknownRenderSource(key))?;
        self.recompute_layout();
        self.transforms
            .remove_indexes(removed.buffer_start_index as usize, removed.buffer_size as usize);

        if self.sources.is_empty() {
            log::debug!("Group {:016x}: last source removed, disposing", self.key.0);
            self.release_buffers();
            return Ok(true);
        }
        Ok(false)
    }

    /// Slot indexes of every rendered instance, rebuilt after layout changes.
    pub fn active_indexes(&mut self) -> &mut GpuDataBuffer<u32> {
        if self.active_dirty {
            self.active_dirty = false;
            let indexes: Vec<u32> = self
                .sources
                .values()
                .flat_map(|s| s.buffer_start_index..s.buffer_start_index + s.instance_count)
                .collect();
            self.active_indexes.resize(indexes.len());
            self.active_indexes.set_range(0, &indexes);
        }
        &mut self.active_indexes
    }

    /// Both the transform data and the active index list, borrowed together for dispatch.
    pub fn dispatch_parts(&mut self) -> (&mut TransformBufferData, &mut GpuDataBuffer<u32>) {
        self.active_indexes();
        (&mut self.transforms, &mut self.active_indexes)
    }

    /// Checks that source ranges tile `[0, buffer_size)` in order.
    pub fn layout_is_contiguous(&self) -> bool {
        let mut expected = 0;
        for source in self.sources.values() {
            if source.buffer_start_index != expected || source.instance_count > source.buffer_size {
                return false;
            }
            expected += source.buffer_size;
        }
        expected == self.buffer_size && self.transforms.len() == self.buffer_size as usize
    }

    pub fn release_buffers(&mut self) {
        self.transforms.release_buffers();
        self.active_indexes.release_buffers();
    }
}

#[cfg(test)]
mod test {
    use glam::{Mat4, Vec3};
    use herd_types::{BufferMode, LodGroupId, OwnerId, ProfileId, PrototypeId, RenderSourceGroupDescriptor};

    use super::{RenderSourceGroup, RenderSourceGroupKey, RenderSourceKey};
    use crate::{HerdError, ModeData};

    fn descriptor(keywords: &[&str]) -> RenderSourceGroupDescriptor {
        RenderSourceGroupDescriptor {
            prototype: PrototypeId(1),
            profile: ProfileId(2),
            lod_group: LodGroupId(3),
            group_id: 0,
            shader_keywords: keywords.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn marker(source: u64, slot: u32) -> Mat4 {
        Mat4::from_translation(Vec3::new(source as f32, slot as f32, 0.0))
    }

    fn group_with(sizes: &[u32]) -> (RenderSourceGroup, Vec<RenderSourceKey>) {
        let mut group = RenderSourceGroup::new(descriptor(&[]), ModeData::Cpu(()), BufferMode::Default, false);
        let mut keys = Vec::new();
        for (owner, &size) in sizes.iter().enumerate() {
            let key = group.add_render_source(OwnerId(owner as u64)).unwrap();
            let data: Vec<_> = (0..size).map(|slot| marker(owner as u64, slot)).collect();
            group
                .set_transform_buffer_data(key, &data, 0, 0, size as usize, true)
                .unwrap();
            keys.push(key);
        }
        (group, keys)
    }

    fn source_slots(group: &RenderSourceGroup, key: RenderSourceKey) -> Vec<Mat4> {
        let source = group.source(key).unwrap();
        let start = source.buffer_start_index as usize;
        group.transforms().transforms().data()[start..start + source.buffer_size as usize].to_vec()
    }

    #[test]
    fn keyword_order_does_not_matter() {
        let a = RenderSourceGroupKey::from_descriptor(&descriptor(&["FOG", "WIND"]));
        let b = RenderSourceGroupKey::from_descriptor(&descriptor(&["WIND", "FOG", "WIND"]));
        let c = RenderSourceGroupKey::from_descriptor(&descriptor(&["WIND"]));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn duplicate_owner_rejected() {
        let (mut group, _) = group_with(&[1]);
        assert!(group.add_render_source(OwnerId(0)).is_err());
    }

    #[test]
    fn growth_keeps_neighbours() {
        let (mut group, keys) = group_with(&[3, 4, 2]);
        let before_a = source_slots(&group, keys[0]);
        let before_c = source_slots(&group, keys[2]);

        group.set_buffer_size(keys[1], 10, true).unwrap();
        assert!(group.layout_is_contiguous());
        assert_eq!(group.buffer_size(), 15);
        assert_eq!(source_slots(&group, keys[0]), before_a);
        assert_eq!(source_slots(&group, keys[2]), before_c);

        let b = source_slots(&group, keys[1]);
        assert_eq!(&b[..4], &(0..4).map(|slot| marker(1, slot)).collect::<Vec<_>>()[..]);
        assert!(b[4..].iter().all(|m| *m == Mat4::ZERO));
    }

    #[test]
    fn resize_without_copy_zeroes_only_resized_source() {
        let (mut group, keys) = group_with(&[2, 2, 2]);
        group.set_buffer_size(keys[1], 1, false).unwrap();
        assert!(group.layout_is_contiguous());
        assert_eq!(source_slots(&group, keys[1]), vec![Mat4::ZERO]);
        assert_eq!(source_slots(&group, keys[2]), vec![marker(2, 0), marker(2, 1)]);
    }

    #[test]
    fn shrink_clamps_instance_count() {
        let (mut group, keys) = group_with(&[4]);
        group.set_instance_count(keys[0], 4).unwrap();
        group.set_buffer_size(keys[0], 2, true).unwrap();
        assert_eq!(group.source(keys[0]).unwrap().instance_count, 2);
        assert!(group.set_instance_count(keys[0], 3).is_err());
    }

    #[test]
    fn write_past_end_grows_source() {
        let (mut group, keys) = group_with(&[2, 2]);
        group
            .set_transform_buffer_data(keys[0], &[marker(9, 9)], 0, 3, 1, false)
            .unwrap();
        assert_eq!(group.source(keys[0]).unwrap().buffer_size, 4);
        assert!(group.layout_is_contiguous());
        assert_eq!(source_slots(&group, keys[0])[3], marker(9, 9));
        assert_eq!(source_slots(&group, keys[1]), vec![marker(1, 0), marker(1, 1)]);
    }

    #[test]
    fn source_range_is_checked() {
        let (mut group, keys) = group_with(&[2]);
        assert!(group
            .set_transform_buffer_data(keys[0], &[Mat4::IDENTITY], 1, 0, 1, false)
            .is_err());
        assert!(matches!(
            group.set_transform_buffer_data(keys[0], &[Mat4::IDENTITY], 1, 0, usize::MAX, false),
            Err(HerdError::SourceRangeOutOfBounds { .. })
        ));
        assert!(matches!(
            group.set_transform_buffer_data(keys[0], &[Mat4::IDENTITY], 0, u32::MAX, 1, false),
            Err(HerdError::DestinationRangeTooLarge { .. })
        ));
        assert_eq!(group.source(keys[0]).unwrap().buffer_size, 2);
    }

    #[test]
    fn removal_compacts_and_last_removal_disposes() {
        let (mut group, keys) = group_with(&[2, 3, 1]);
        assert!(!group.remove_render_source(keys[1]).unwrap());
        assert!(group.layout_is_contiguous());
        assert_eq!(group.buffer_size(), 3);
        assert_eq!(source_slots(&group, keys[2]), vec![marker(2, 0)]);

        assert!(!group.remove_render_source(keys[0]).unwrap());
        assert!(group.remove_render_source(keys[2]).unwrap());
        assert!(group.is_empty());
        assert_eq!(group.buffer_size(), 0);
    }

    #[test]
    fn active_indexes_follow_instance_counts() {
        let (mut group, keys) = group_with(&[3, 2]);
        group.set_instance_count(keys[0], 2).unwrap();
        group.set_instance_count(keys[1], 1).unwrap();
        assert_eq!(group.instance_count(), 3);
        assert_eq!(group.active_indexes().data(), &[0, 1, 3]);
    }
}
