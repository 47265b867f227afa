//! User id assignment
//!
//! User ids are a single byte; 0 and 255 are reserved. Ids are reused
//! least-recently-used first so a freshly freed id is not immediately given
//! to someone else, and a returning user gets their previous id back when
//! it is free.

use std::collections::{HashMap, VecDeque};

pub const MIN_USER_ID: u8 = 1;
pub const MAX_USER_ID: u8 = 254;

#[derive(Debug, Clone)]
pub struct IdQueue {
    ids: VecDeque<u8>,
    names: HashMap<String, u8>,
}

impl IdQueue {
    pub fn new() -> Self {
        Self {
            ids: (MIN_USER_ID..=MAX_USER_ID).collect(),
            names: HashMap::new(),
        }
    }

    /// Pick an id for `name`, skipping ids that are currently in use
    pub fn next_id(&mut self, name: &str, in_use: impl Fn(u8) -> bool) -> Option<u8> {
        if let Some(id) = self.id_for_name(name)
            && !in_use(id)
        {
            self.reserve_id(id);
            return Some(id);
        }

        let pos = self.ids.iter().position(|&id| !in_use(id))?;
        let id = self.ids.remove(pos)?;
        self.ids.push_back(id);
        Some(id)
    }

    /// Move `id` to the back of the queue
    pub fn reserve_id(&mut self, id: u8) {
        if let Some(pos) = self.ids.iter().position(|&i| i == id) {
            self.ids.remove(pos);
            self.ids.push_back(id);
        }
    }

    /// Remember which id a user had
    pub fn set_id_for_name(&mut self, id: u8, name: &str) {
        self.names.insert(name.to_lowercase(), id);
        self.reserve_id(id);
    }

    pub fn id_for_name(&self, name: &str) -> Option<u8> {
        self.names.get(&name.to_lowercase()).copied()
    }
}

impl Default for IdQueue {
    fn default() -> Self {
        Self::new()
    }
}
