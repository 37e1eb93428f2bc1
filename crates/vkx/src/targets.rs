//! Per-swapchain-image render targets rebuilt as a unit
//!
//! Image views and framebuffers belong to the application, not to the
//! presentation engine, and must be gone before the swapchain that owns the
//! underlying images is destroyed. `SwapchainTargets` keeps them together
//! with a generation counter so a handle taken before a rebuild cannot be
//! used after it.

use crate::error::{VkxError, VkxResult};

/// Creates and destroys the target for one swapchain image
pub trait TargetFactory<T> {
    /// Build the target for `image_index`
    fn create_target(&self, image_index: usize) -> VkxResult<T>;

    /// Release a target; no pending work may reference it
    fn destroy_target(&self, target: T);
}

/// All per-image targets of the current swapchain
#[derive(Debug)]
pub struct SwapchainTargets<T> {
    targets: Vec<T>,
    generation: u64,
}

impl<T> SwapchainTargets<T> {
    /// Build one target per swapchain image
    pub fn new(factory: &impl TargetFactory<T>, image_count: usize) -> VkxResult<Self> {
        let mut targets = Self {
            targets: Vec::new(),
            generation: 0,
        };
        targets.rebuild(factory, image_count)?;
        Ok(targets)
    }

    /// Generation of the current set, bumped by every successful rebuild
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of live targets
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether the set is empty (released, or a rebuild failed)
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Destroy every target
    pub fn release_all(&mut self, factory: &impl TargetFactory<T>) {
        if self.targets.is_empty() {
            return;
        }
        log::debug!("Releasing {} swapchain targets (generation {})", self.targets.len(), self.generation);
        for target in self.targets.drain(..) {
            factory.destroy_target(target);
        }
    }

    /// Replace the whole set
    ///
    /// Old targets are destroyed first. If any creation fails, the targets
    /// already built are destroyed again and the set is left empty.
    pub fn rebuild(&mut self, factory: &impl TargetFactory<T>, image_count: usize) -> VkxResult<()> {
        self.release_all(factory);

        let mut built = Vec::with_capacity(image_count);
        for image_index in 0..image_count {
            match factory.create_target(image_index) {
                Ok(target) => built.push(target),
                Err(err) => {
                    log::error!("Failed to build target for swapchain image {image_index}: {err}");
                    for target in built {
                        factory.destroy_target(target);
                    }
                    return Err(err);
                }
            }
        }

        self.targets = built;
        self.generation += 1;
        log::debug!("Built {image_count} swapchain targets (generation {})", self.generation);
        Ok(())
    }

    /// Target for `image_index`, checked against the caller's generation
    pub fn get(&self, image_index: u32, generation: u64) -> VkxResult<&T> {
        if generation != self.generation {
            return Err(VkxError::StaleFrame {
                frame_epoch: generation,
                current_epoch: self.generation,
            });
        }
        self.targets.get(image_index as usize).ok_or_else(|| {
            VkxError::invalid(format!(
                "no target for swapchain image {image_index} ({} built)",
                self.targets.len()
            ))
        })
    }
}
