// SPDX-License-Identifier: CEPL-1.0
use super::config::{pipeline_config, PipelineConfig};
use crate::error::{VkError, VkResult};
use ash::vk;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lumen_render::{ShaderId, Topology};
use portable_atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub shader: ShaderId,
    pub topology: Topology,
}

/// Builds the GPU objects behind a cache entry. The store only decides
/// when; the factory decides how.
pub trait PipelineFactory: Send + Sync {
    type Pipeline: Send + Sync;

    fn create(
        &self,
        key: PipelineKey,
        config: &'static PipelineConfig,
        extent: vk::Extent2D,
    ) -> VkResult<Self::Pipeline>;

    /// Releases whatever depends on the swapchain extent.
    fn destroy_swapchain_resources(&self, pipeline: &Self::Pipeline);

    /// Rebuilds it for the new extent.
    fn create_swapchain_resources(
        &self,
        pipeline: &Self::Pipeline,
        extent: vk::Extent2D,
    ) -> VkResult<()>;
}

struct StoreEntry<P> {
    pipeline: Arc<P>,
    config: &'static PipelineConfig,
}

fn pack(extent: vk::Extent2D) -> u64 {
    (u64::from(extent.width) << 32) | u64::from(extent.height)
}

fn unpack(bits: u64) -> vk::Extent2D {
    vk::Extent2D {
        width: (bits >> 32) as u32,
        height: bits as u32,
    }
}

/// One pipeline per `(shader, topology)`, created on first use.
pub struct PipelineStore<F: PipelineFactory> {
    factory: F,
    entries: DashMap<PipelineKey, StoreEntry<F::Pipeline>>,
    extent: AtomicU64,
}

impl<F: PipelineFactory> PipelineStore<F> {
    pub fn new(factory: F, extent: vk::Extent2D) -> Self {
        Self {
            factory,
            entries: DashMap::new(),
            extent: AtomicU64::new(pack(extent)),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn extent(&self) -> vk::Extent2D {
        unpack(self.extent.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the cached pipeline, creating it on a miss. Creation runs
    /// under the entry's shard lock, so racing callers share one object.
    /// A shader with no configuration is an error, never a default.
    pub fn get_or_create(&self, shader: ShaderId, topology: Topology) -> VkResult<Arc<F::Pipeline>> {
        let key = PipelineKey { shader, topology };
        if let Some(e) = self.entries.get(&key) {
            return Ok(Arc::clone(&e.pipeline));
        }
        let config = pipeline_config(shader).ok_or(VkError::UnconfiguredShader(shader))?;
        match self.entries.entry(key) {
            Entry::Occupied(e) => Ok(Arc::clone(&e.get().pipeline)),
            Entry::Vacant(v) => {
                let pipeline = Arc::new(self.factory.create(key, config, self.extent())?);
                info!("pipeline created: {shader} / {topology:?}");
                v.insert(StoreEntry {
                    pipeline: Arc::clone(&pipeline),
                    config,
                });
                Ok(pipeline)
            }
        }
    }

    /// Resize, step one. Shadow-pass pipelines are left alone.
    pub fn destroy_swapchain_resources(&self) {
        let mut n = 0;
        for e in self.entries.iter() {
            if e.config.targets_swapchain() {
                self.factory.destroy_swapchain_resources(&e.pipeline);
                n += 1;
            }
        }
        debug!("released {n} swapchain pipelines");
    }

    /// Resize, step two.
    pub fn create_swapchain_resources(&self, extent: vk::Extent2D) -> VkResult<()> {
        self.extent.store(pack(extent), Ordering::Release);
        let mut n = 0;
        for e in self.entries.iter() {
            if e.config.targets_swapchain() {
                self.factory.create_swapchain_resources(&e.pipeline, extent)?;
                n += 1;
            }
        }
        debug!(
            "rebuilt {n} swapchain pipelines at {}x{}",
            extent.width, extent.height
        );
        Ok(())
    }

    /// Drops every entry. Pipelines still held elsewhere live until released.
    pub fn destroy_all(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portable_atomic::AtomicUsize;

    struct MockPipeline {
        handle: AtomicU64,
    }

    impl MockPipeline {
        fn handle(&self) -> u64 {
            self.handle.load(Ordering::Acquire)
        }
    }

    #[derive(Default)]
    struct MockFactory {
        created: AtomicUsize,
        next_handle: AtomicU64,
    }

    impl MockFactory {
        fn fresh(&self) -> u64 {
            self.next_handle.fetch_add(1, Ordering::AcqRel) + 1
        }
    }

    impl PipelineFactory for MockFactory {
        type Pipeline = MockPipeline;

        fn create(
            &self,
            _key: PipelineKey,
            _config: &'static PipelineConfig,
            _extent: vk::Extent2D,
        ) -> VkResult<MockPipeline> {
            self.created.fetch_add(1, Ordering::AcqRel);
            // widen the race window for the concurrent test
            std::thread::sleep(std::time::Duration::from_millis(2));
            Ok(MockPipeline {
                handle: AtomicU64::new(self.fresh()),
            })
        }

        fn destroy_swapchain_resources(&self, pipeline: &MockPipeline) {
            pipeline.handle.store(0, Ordering::Release);
        }

        fn create_swapchain_resources(
            &self,
            pipeline: &MockPipeline,
            _extent: vk::Extent2D,
        ) -> VkResult<()> {
            pipeline.handle.store(self.fresh(), Ordering::Release);
            Ok(())
        }
    }

    fn store() -> PipelineStore<MockFactory> {
        PipelineStore::new(
            MockFactory::default(),
            vk::Extent2D {
                width: 1024,
                height: 768,
            },
        )
    }

    #[test]
    fn repeated_lookups_return_the_cached_pipeline() {
        let s = store();
        let a = s.get_or_create(ShaderId::Generic, Topology::TriangleList).unwrap();
        let b = s.get_or_create(ShaderId::Generic, Topology::TriangleList).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(s.factory().created.load(Ordering::Acquire), 1);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn triangle_strip_requested_twice_shares_handle() {
        let s = store();
        let a = s.get_or_create(ShaderId::Skybox, Topology::TriangleStrip).unwrap();
        let b = s.get_or_create(ShaderId::Skybox, Topology::TriangleStrip).unwrap();
        assert_eq!(a.handle(), b.handle());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn topology_is_part_of_the_key() {
        let s = store();
        let list = s.get_or_create(ShaderId::Generic, Topology::TriangleList).unwrap();
        let strip = s.get_or_create(ShaderId::Generic, Topology::TriangleStrip).unwrap();
        assert!(!Arc::ptr_eq(&list, &strip));
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn unconfigured_shader_is_a_configuration_error() {
        let s = store();
        let err = s
            .get_or_create(ShaderId::Pointviz, Topology::TriangleList)
            .err()
            .unwrap();
        assert!(matches!(err, VkError::UnconfiguredShader(ShaderId::Pointviz)));
        assert!(s.is_empty());
        assert_eq!(s.factory().created.load(Ordering::Acquire), 0);
    }

    #[test]
    fn concurrent_first_use_creates_once() {
        let s = store();
        let got: Vec<Arc<MockPipeline>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        s.get_or_create(ShaderId::Wireframe, Topology::TriangleList)
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(s.factory().created.load(Ordering::Acquire), 1);
        assert!(got.iter().all(|p| Arc::ptr_eq(p, &got[0])));
    }

    #[test]
    fn resize_rebuilds_only_swapchain_pipelines() {
        let s = store();
        let main = s.get_or_create(ShaderId::Generic, Topology::TriangleList).unwrap();
        let shadow = s
            .get_or_create(ShaderId::ShadowMapping, Topology::TriangleList)
            .unwrap();
        let (main_before, shadow_before) = (main.handle(), shadow.handle());

        s.destroy_swapchain_resources();
        assert_eq!(main.handle(), 0);
        assert_eq!(shadow.handle(), shadow_before);

        let new_extent = vk::Extent2D {
            width: 1920,
            height: 1080,
        };
        s.create_swapchain_resources(new_extent).unwrap();
        assert_ne!(main.handle(), 0);
        assert_ne!(main.handle(), main_before);
        assert_eq!(shadow.handle(), shadow_before);
        assert_eq!(s.extent(), new_extent);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn extent_packing_keeps_both_halves() {
        let e = vk::Extent2D {
            width: 3840,
            height: 2160,
        };
        assert_eq!(unpack(pack(e)), e);
    }
}
