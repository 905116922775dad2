/// Environment arena.
/// Frames live in a slab indexed by generation-checked `EnvId`s rather
/// than in a pointer graph: a frame holds `name -> (value, is_const)`
/// bindings and its parent id. Reference counts track the holders of a
/// frame: the executing scope that allocated it, any child frames, and
/// any closures created over it. Closures hold an `EnvTicket`; when the
/// last clone of a function value drops, the ticket lands on the dead
/// ledger and the next drain releases the captured chain.

use crate::value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvId {
    idx: u32,
    gen: u32,
}

#[derive(Clone)]
pub struct Binding {
    pub value: Value,
    pub is_const: bool,
}

struct Slot {
    gen: u32,
    live: bool,
    refs: u32,
    parent: Option<EnvId>,
    vars: HashMap<Arc<str>, Binding>,
}

#[derive(Debug)]
pub enum AssignError {
    NotFound,
    ConstBinding,
}

pub struct EnvArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    ledger: Arc<Mutex<Vec<EnvId>>>,
}

/// Keeps a captured frame alive. Dropping the ticket records the frame
/// on the dead ledger; the arena releases it at the next drain.
pub struct EnvTicket {
    env: EnvId,
    ledger: Arc<Mutex<Vec<EnvId>>>,
}

impl Drop for EnvTicket {
    fn drop(&mut self) {
        self.ledger.lock().push(self.env);
    }
}

impl EnvArena {
    pub fn new() -> Self {
        EnvArena {
            slots: Vec::new(),
            free: Vec::new(),
            ledger: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Allocate a frame. The new frame holds a reference on its parent.
    pub fn alloc(&mut self, parent: Option<EnvId>) -> EnvId {
        if let Some(p) = parent {
            self.retain(p);
        }
        match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx as usize];
                slot.live = true;
                slot.refs = 1;
                slot.parent = parent;
                EnvId { idx, gen: slot.gen }
            }
            None => {
                let idx = self.slots.len() as u32;
                self.slots.push(Slot {
                    gen: 0,
                    live: true,
                    refs: 1,
                    parent,
                    vars: HashMap::new(),
                });
                EnvId { idx, gen: 0 }
            }
        }
    }

    fn slot(&self, id: EnvId) -> Option<&Slot> {
        let slot = self.slots.get(id.idx as usize)?;
        (slot.live && slot.gen == id.gen).then_some(slot)
    }

    fn slot_mut(&mut self, id: EnvId) -> Option<&mut Slot> {
        let slot = self.slots.get_mut(id.idx as usize)?;
        (slot.live && slot.gen == id.gen).then_some(slot)
    }

    pub fn retain(&mut self, id: EnvId) {
        if let Some(slot) = self.slot_mut(id) {
            slot.refs += 1;
        }
    }

    /// Drop one reference; frames whose count reaches zero are freed and
    /// release their parent chain in turn.
    pub fn release(&mut self, id: EnvId) {
        let mut cursor = Some(id);
        while let Some(id) = cursor {
            let Some(slot) = self.slot_mut(id) else { return };
            slot.refs -= 1;
            if slot.refs > 0 {
                return;
            }
            slot.live = false;
            slot.gen = slot.gen.wrapping_add(1);
            let parent = slot.parent.take();
            // Dropping the bindings may drop the last clone of a closure,
            // which pushes its captured frame onto the ledger. Those are
            // picked up by the next drain.
            slot.vars.clear();
            self.free.push(id.idx);
            cursor = parent;
        }
    }

    /// Create a closure ticket over a frame, retaining it.
    pub fn ticket(&mut self, id: EnvId) -> EnvTicket {
        self.retain(id);
        EnvTicket { env: id, ledger: self.ledger.clone() }
    }

    /// Release every frame whose last closure holder has dropped.
    pub fn drain_dead(&mut self) {
        loop {
            let dead: Vec<EnvId> = std::mem::take(&mut *self.ledger.lock());
            if dead.is_empty() {
                break;
            }
            for id in dead {
                self.release(id);
            }
        }
    }

    /// Number of live frames; exposed for tests and engine stats.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.live).count()
    }

    // -----------------------------------------------------------------
    // Bindings
    // -----------------------------------------------------------------

    /// Define in the current frame, shadowing any outer binding.
    /// Redefining a `const` in the same frame is rejected.
    pub fn define(
        &mut self,
        id: EnvId,
        name: Arc<str>,
        value: Value,
        is_const: bool,
    ) -> Result<(), AssignError> {
        let Some(slot) = self.slot_mut(id) else { return Err(AssignError::NotFound) };
        if let Some(existing) = slot.vars.get(&name) {
            if existing.is_const {
                return Err(AssignError::ConstBinding);
            }
        }
        slot.vars.insert(name, Binding { value, is_const });
        Ok(())
    }

    /// Assign to the nearest enclosing frame that already defines the
    /// name. Fails on `const` bindings and on names never defined.
    pub fn assign(&mut self, id: EnvId, name: &str, value: Value) -> Result<(), AssignError> {
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            let (found, parent) = match self.slot(cur) {
                Some(slot) => (slot.vars.contains_key(name), slot.parent),
                None => return Err(AssignError::NotFound),
            };
            if found {
                let slot = self.slot_mut(cur).expect("slot liveness checked above");
                let binding = slot.vars.get_mut(name).expect("key presence checked above");
                if binding.is_const {
                    return Err(AssignError::ConstBinding);
                }
                binding.value = value;
                return Ok(());
            }
            cursor = parent;
        }
        Err(AssignError::NotFound)
    }

    /// Look a name up through the parent chain.
    pub fn lookup(&self, id: EnvId, name: &str) -> Option<Value> {
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            let slot = self.slot(cur)?;
            if let Some(binding) = slot.vars.get(name) {
                return Some(binding.value.clone());
            }
            cursor = slot.parent;
        }
        None
    }

    pub fn lookup_local(&self, id: EnvId, name: &str) -> Option<Value> {
        self.slot(id)
            .and_then(|slot| slot.vars.get(name))
            .map(|b| b.value.clone())
    }
}

impl Default for EnvArena {
    fn default() -> Self {
        EnvArena::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_and_lookup_through_parents() {
        let mut arena = EnvArena::new();
        let root = arena.alloc(None);
        let child = arena.alloc(Some(root));
        arena.define(root, Arc::from("x"), Value::Num(1.0), false).unwrap();
        assert!(matches!(arena.lookup(child, "x"), Some(Value::Num(n)) if n == 1.0));
        assert!(arena.lookup(child, "y").is_none());
    }

    #[test]
    fn assign_writes_defining_frame() {
        let mut arena = EnvArena::new();
        let root = arena.alloc(None);
        let child = arena.alloc(Some(root));
        arena.define(root, Arc::from("x"), Value::Num(1.0), false).unwrap();
        arena.assign(child, "x", Value::Num(2.0)).unwrap();
        assert!(matches!(arena.lookup(root, "x"), Some(Value::Num(n)) if n == 2.0));
    }

    #[test]
    fn const_rejects_assignment() {
        let mut arena = EnvArena::new();
        let root = arena.alloc(None);
        arena.define(root, Arc::from("k"), Value::Num(1.0), true).unwrap();
        assert!(matches!(
            arena.assign(root, "k", Value::Num(2.0)),
            Err(AssignError::ConstBinding)
        ));
    }

    #[test]
    fn ticket_keeps_frame_alive_until_dropped() {
        let mut arena = EnvArena::new();
        let root = arena.alloc(None);
        let frame = arena.alloc(Some(root));
        arena.define(frame, Arc::from("captured"), Value::Num(9.0), false).unwrap();

        let ticket = arena.ticket(frame);
        // Scope exits; the closure still holds the frame.
        arena.release(frame);
        assert!(matches!(arena.lookup(frame, "captured"), Some(Value::Num(n)) if n == 9.0));

        drop(ticket);
        arena.drain_dead();
        assert!(arena.lookup(frame, "captured").is_none());
    }

    #[test]
    fn stale_ids_are_rejected_after_reuse() {
        let mut arena = EnvArena::new();
        let a = arena.alloc(None);
        arena.release(a);
        let b = arena.alloc(None);
        // The slot was recycled under a fresh generation.
        assert!(arena.lookup(a, "anything").is_none());
        arena.define(b, Arc::from("z"), Value::Null, false).unwrap();
        assert!(arena.lookup(b, "z").is_some());
    }
}
