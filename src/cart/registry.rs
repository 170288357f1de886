use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::RunningCart;

/// Running carts keyed by device node.
///
/// Owned by the dispatcher; holds at most one cart per device node.
#[derive(Debug, Default)]
pub struct CartRegistry {
    carts: HashMap<PathBuf, RunningCart>,
}

impl CartRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a newly spawned cart.
    ///
    /// The caller must have stopped any previous cart for the same device;
    /// a replaced entry is handed back so it is never silently dropped.
    pub fn insert(&mut self, cart: RunningCart) -> Option<RunningCart> {
        self.carts.insert(cart.device_node.clone(), cart)
    }

    #[cfg(test)]
    pub fn get(&self, device_node: &Path) -> Option<&RunningCart> {
        self.carts.get(device_node)
    }

    pub fn get_mut(&mut self, device_node: &Path) -> Option<&mut RunningCart> {
        self.carts.get_mut(device_node)
    }

    pub fn remove(&mut self, device_node: &Path) -> Option<RunningCart> {
        self.carts.remove(device_node)
    }

    pub fn contains(&self, device_node: &Path) -> bool {
        self.carts.contains_key(device_node)
    }

    pub fn device_nodes(&self) -> Vec<PathBuf> {
        let mut nodes: Vec<PathBuf> = self.carts.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    pub fn len(&self) -> usize {
        self.carts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.carts.is_empty()
    }
}
