//! Frame transforms applied by the processor before encoding.
//!
//! A transform edits a frame in place and must keep its geometry. The
//! processor restores the original pixels when a transform errors, panics
//! or changes the buffer length.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Result, TestbedError};

use super::frame::Frame;

pub trait FrameTransform: Send {
    fn name(&self) -> &str;

    fn apply(&mut self, frame: &mut Frame) -> Result<()>;

    /// Identity transforms let the processor skip the backup copy.
    fn is_identity(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
pub struct Identity;

impl FrameTransform for Identity {
    fn name(&self) -> &str {
        "identity"
    }

    fn apply(&mut self, _frame: &mut Frame) -> Result<()> {
        Ok(())
    }

    fn is_identity(&self) -> bool {
        true
    }
}

/// Replaces each `block`×`block` tile by its mean color.
#[derive(Debug)]
pub struct Pixelate {
    block: u32,
}

impl Pixelate {
    pub fn new(block: u32) -> Self {
        Self { block: block.max(1) }
    }
}

impl FrameTransform for Pixelate {
    fn name(&self) -> &str {
        "pixelate"
    }

    fn apply(&mut self, frame: &mut Frame) -> Result<()> {
        if frame.data.len() != frame.expected_len() {
            return Err(TestbedError::Transform {
                name: self.name().to_string(),
                detail: format!(
                    "buffer is {} bytes, expected {}",
                    frame.data.len(),
                    frame.expected_len()
                ),
            });
        }

        let (width, height, block) = (frame.width, frame.height, self.block);
        for ty in (0..height).step_by(block as usize) {
            for tx in (0..width).step_by(block as usize) {
                let (x_end, y_end) = ((tx + block).min(width), (ty + block).min(height));
                let mut sum = [0u64; 3];
                let mut count = 0u64;
                for y in ty..y_end {
                    for x in tx..x_end {
                        if let Some(px) = frame.pixel_mut(x, y) {
                            sum[0] += px[0] as u64;
                            sum[1] += px[1] as u64;
                            sum[2] += px[2] as u64;
                            count += 1;
                        }
                    }
                }
                let mean = sum.map(|s| (s / count.max(1)) as u8);
                for y in ty..y_end {
                    for x in tx..x_end {
                        if let Some(px) = frame.pixel_mut(x, y) {
                            px.copy_from_slice(&mean);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

type TransformFactory = Arc<dyn Fn() -> Box<dyn FrameTransform> + Send + Sync>;

/// Named transform constructors; one instance is built per stream.
#[derive(Clone)]
pub struct TransformRegistry {
    factories: BTreeMap<String, TransformFactory>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: BTreeMap::new(),
        };
        registry.register("identity", || Box::new(Identity));
        registry.register("pixelate", || Box::new(Pixelate::new(16)));
        registry
    }
}

impl TransformRegistry {
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn FrameTransform> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn FrameTransform>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| {
                TestbedError::Config(format!(
                    "unknown transform {name:?} (available: {})",
                    self.names().join(", ")
                ))
            })
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn frame(width: u32, height: u32, data: Vec<u8>) -> Frame {
        Frame::new(data, width, height, 0, NaiveDateTime::default())
    }

    #[test]
    fn pixelate_averages_tiles() {
        // 2x1 frame, one tile: pixels (0,0,0) and (10,20,30).
        let mut f = frame(2, 1, vec![0, 0, 0, 10, 20, 30]);
        Pixelate::new(2).apply(&mut f).unwrap();
        assert_eq!(f.data, vec![5, 10, 15, 5, 10, 15]);
    }

    #[test]
    fn pixelate_handles_partial_tiles() {
        let mut f = frame(3, 1, vec![0, 0, 0, 2, 2, 2, 9, 9, 9]);
        Pixelate::new(2).apply(&mut f).unwrap();
        assert_eq!(f.data, vec![1, 1, 1, 1, 1, 1, 9, 9, 9]);
    }

    #[test]
    fn pixelate_rejects_bad_buffer() {
        let mut f = frame(2, 2, vec![0; 5]);
        assert!(Pixelate::new(2).apply(&mut f).is_err());
    }

    #[test]
    fn registry_builds_named_transforms() {
        let mut registry = TransformRegistry::default();
        assert!(registry.create("identity").unwrap().is_identity());
        assert_eq!(registry.create("pixelate").unwrap().name(), "pixelate");
        assert!(matches!(registry.create("blur"), Err(TestbedError::Config(_))));

        registry.register("blur", || Box::new(Pixelate::new(4)));
        assert_eq!(registry.names(), vec!["blur", "identity", "pixelate"]);
    }
}
