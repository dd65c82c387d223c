// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeSet;
use std::sync::Mutex;

/// Allocator of small integer identifiers.
///
/// Always hands out the lowest identifier not currently in use, so a released
/// identifier is the next one allocated.
#[derive(Default)]
pub struct IdAllocator {
    used: Mutex<BTreeSet<u32>>,
}

impl IdAllocator {
    pub const fn new() -> Self {
        Self { used: Mutex::new(BTreeSet::new()) }
    }

    pub fn alloc(&self) -> u32 {
        let mut used = self.used.lock().unwrap();
        let id = used
            .iter()
            .enumerate()
            .find(|(idx, id)| *idx as u32 != **id)
            .map(|(idx, _)| idx as u32)
            .unwrap_or(used.len() as u32);
        used.insert(id);
        id
    }

    pub fn free(&self, id: u32) {
        let removed = self.used.lock().unwrap().remove(&id);
        debug_assert!(removed, "identifier {id} released twice");
    }

    pub fn in_use(&self, id: u32) -> bool {
        self.used.lock().unwrap().contains(&id)
    }
}
