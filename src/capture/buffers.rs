use std::collections::BTreeMap;

use crate::pixels::EncodedImage;

/// Captured buffers keyed by the template control that consumes them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedBufferMap {
    buffers: BTreeMap<String, EncodedImage>,
}

impl CapturedBufferMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, control_name: impl Into<String>, image: EncodedImage) {
        self.buffers.insert(control_name.into(), image);
    }

    pub fn get(&self, control_name: &str) -> Option<&EncodedImage> {
        self.buffers.get(control_name)
    }

    pub fn contains(&self, control_name: &str) -> bool {
        self.buffers.contains_key(control_name)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.buffers.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &EncodedImage)> {
        self.buffers.iter().map(|(k, v)| (k.as_str(), v))
    }
}
