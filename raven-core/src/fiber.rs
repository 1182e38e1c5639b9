//! Fibers: cooperatively scheduled threads of VM execution.
//!
//! A fiber *is* its interpreter state — accumulator, operand stack and
//! call-frame stack. Suspending is storing it; resuming is running the
//! bytecode loop over it again. No native stack is parked anywhere.

use uuid::Uuid;

use crate::connection::ConnId;
use crate::heap::ObjRef;
use crate::value::Value;

/// Handle into the engine's fiber table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FiberId(pub(crate) u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberState {
    /// Currently executing. At most one fiber is in this state.
    Running,
    /// Runnable; queued for the next scheduling round.
    Ready,
    /// Parked on its connection's input until a full line arrives.
    BlockedOnInput,
    Finished,
    Faulted,
}

/// One activation record. `base` indexes the operand stack slot holding
/// the receiver; locals live at `base..base + max_locals`.
#[derive(Clone, Copy, Debug)]
pub struct Frame {
    pub function: ObjRef,
    pub ip: usize,
    pub base: usize,
    pub this: Value,
    /// Blueprint that defines the executing method; super-send lookup
    /// starts above it.
    pub blueprint: Option<ObjRef>,
}

#[derive(Debug)]
pub struct Fiber {
    pub id: Uuid,
    pub state: FiberState,
    pub acc: Value,
    pub stack: Vec<Value>,
    pub frames: Vec<Frame>,
    pub connection: Option<ConnId>,
}

impl Fiber {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            state: FiberState::Ready,
            acc: Value::Nil,
            stack: Vec::new(),
            frames: Vec::new(),
            connection: None,
        }
    }
}

/// Slot arena for fibers. A running fiber is checked out of its slot so
/// the VM can borrow the engine freely while it executes.
#[derive(Debug, Default)]
pub struct FiberTable {
    slots: Vec<Option<Fiber>>,
    free: Vec<u32>,
}

impl FiberTable {
    pub fn insert(&mut self, fiber: Fiber) -> FiberId {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(fiber);
                FiberId(idx)
            }
            None => {
                self.slots.push(Some(fiber));
                FiberId((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn get(&self, id: FiberId) -> Option<&Fiber> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: FiberId) -> Option<&mut Fiber> {
        self.slots.get_mut(id.0 as usize)?.as_mut()
    }

    /// Check a fiber out of its slot for execution.
    pub fn take(&mut self, id: FiberId) -> Option<Fiber> {
        self.slots.get_mut(id.0 as usize)?.take()
    }

    /// Put a checked-out fiber back.
    pub fn restore(&mut self, id: FiberId, fiber: Fiber) {
        self.slots[id.0 as usize] = Some(fiber);
    }

    /// Release a slot whose fiber ended (checked out or not).
    pub fn release(&mut self, id: FiberId) {
        if let Some(slot) = self.slots.get_mut(id.0 as usize) {
            *slot = None;
            self.free.push(id.0);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (FiberId, &Fiber)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|f| (FiberId(i as u32), f)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_checkout_and_release() {
        let mut table = FiberTable::default();
        let id = table.insert(Fiber::new(Uuid::now_v7()));
        assert!(table.get(id).is_some());

        let fiber = table.take(id).unwrap();
        assert!(table.get(id).is_none());
        table.restore(id, fiber);
        assert!(table.get(id).is_some());

        table.release(id);
        assert!(table.get(id).is_none());

        // Slot is reused.
        let id2 = table.insert(Fiber::new(Uuid::now_v7()));
        assert_eq!(id.0, id2.0);
    }
}
