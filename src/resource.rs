use std::collections::HashMap;

use parking_lot::Mutex;

/// A named resource with a bounded number of concurrent holders.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    pub name: String,
    pub capacity: u32,
}

impl Resource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: 1,
        }
    }

    pub fn with_capacity(name: impl Into<String>, capacity: u32) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
        }
    }
}

/// Resources a task needs for the duration of its build.
#[derive(Debug, Clone, Default)]
pub struct ResourceList {
    pub resources: Vec<Resource>,
}

impl ResourceList {
    pub fn single(resource: Resource) -> Self {
        Self {
            resources: vec![resource],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Conflict matrix of resources currently held by running builds.
///
/// The executor side reserves an item's resources when its build starts and
/// releases them when it completes; block evaluation consults this matrix.
#[derive(Debug, Default)]
pub struct ResourceController {
    in_use: Mutex<HashMap<String, u32>>,
}

impl ResourceController {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when every resource in the list still has a free slot.
    pub fn can_run(&self, list: &ResourceList) -> bool {
        let held = self.in_use.lock();
        list.resources
            .iter()
            .all(|r| held.get(&r.name).copied().unwrap_or(0) < r.capacity)
    }

    pub fn reserve(&self, list: &ResourceList) {
        let mut held = self.in_use.lock();
        for r in &list.resources {
            *held.entry(r.name.clone()).or_insert(0) += 1;
        }
    }

    pub fn release(&self, list: &ResourceList) {
        let mut held = self.in_use.lock();
        for r in &list.resources {
            match held.get_mut(&r.name) {
                Some(n) if *n > 1 => *n -= 1,
                Some(_) => {
                    held.remove(&r.name);
                }
                None => tracing::warn!(resource = %r.name, "released a resource that was not held"),
            }
        }
    }

    /// The resource, if any, that prevents the list from running.
    pub fn blocking_resource(&self, list: &ResourceList) -> Option<String> {
        let held = self.in_use.lock();
        list.resources
            .iter()
            .find(|r| held.get(&r.name).copied().unwrap_or(0) >= r.capacity)
            .map(|r| r.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_blocks_until_release() {
        let ctl = ResourceController::new();
        let list = ResourceList::single(Resource::new("db"));
        assert!(ctl.can_run(&list));
        ctl.reserve(&list);
        assert!(!ctl.can_run(&list));
        assert_eq!(ctl.blocking_resource(&list).as_deref(), Some("db"));
        ctl.release(&list);
        assert!(ctl.can_run(&list));
    }

    #[test]
    fn capacity_allows_parallel_holders() {
        let ctl = ResourceController::new();
        let list = ResourceList::single(Resource::with_capacity("pool", 2));
        ctl.reserve(&list);
        assert!(ctl.can_run(&list));
        ctl.reserve(&list);
        assert!(!ctl.can_run(&list));
    }
}
