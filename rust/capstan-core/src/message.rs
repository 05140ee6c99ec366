//! In-memory message arena.
//!
//! A [`Message`] owns a flat list of struct objects. Each object has a data
//! section (little-endian bytes) and a pointer section whose slots hold
//! nothing, another struct in the same message, or a capability.
//!
//! [`Struct`] is a cheap handle into a message. Resetting the message bumps its
//! generation and frees every object; handles taken before the reset go stale.
//! Reads through a stale or out-of-range handle return default values, writes
//! fail with [`ErrorKind::Failed`](crate::ErrorKind::Failed).

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Client, Error};

/// Size of a struct: data section in bytes plus number of pointer slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectSize {
    pub data_size: u32,
    pub pointer_count: u16,
}

impl ObjectSize {
    pub const fn new(data_size: u32, pointer_count: u16) -> Self {
        Self {
            data_size,
            pointer_count,
        }
    }

    pub const fn is_zero(&self) -> bool {
        self.data_size == 0 && self.pointer_count == 0
    }
}

#[derive(Clone)]
enum Slot {
    Null,
    Struct(u32),
    Capability(Client),
}

struct Object {
    data: Vec<u8>,
    pointers: Vec<Slot>,
}

#[derive(Default)]
struct Arena {
    generation: u64,
    objects: Vec<Object>,
}

/// Index of the next object in an arena holding `len` objects, if it fits.
fn object_index(len: usize) -> Option<u32> {
    u32::try_from(len).ok()
}

/// An arena holding a tree of structs.
#[derive(Clone, Default)]
pub struct Message {
    arena: Arc<Mutex<Arena>>,
}

impl Message {
    /// Create an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a struct in a fresh message and return it.
    ///
    /// The returned struct is the root of its message.
    pub fn new_root(size: ObjectSize) -> Struct {
        Message::new().alloc(size)
    }

    /// Allocate a zeroed struct in this message.
    ///
    /// A message holds at most `u32::MAX` objects. Past that the empty struct
    /// is returned, so every write to it fails.
    pub fn alloc(&self, size: ObjectSize) -> Struct {
        let mut arena = self.arena.lock();
        let Some(index) = object_index(arena.objects.len()) else {
            return Struct::default();
        };
        arena.objects.push(Object {
            data: vec![0; size.data_size as usize],
            pointers: vec![Slot::Null; size.pointer_count as usize],
        });
        Struct {
            target: Some(Target {
                message: self.clone(),
                index,
                generation: arena.generation,
            }),
        }
    }

    /// The first struct allocated in this message, if any.
    pub fn root(&self) -> Option<Struct> {
        let arena = self.arena.lock();
        if arena.objects.is_empty() {
            return None;
        }
        Some(Struct {
            target: Some(Target {
                message: self.clone(),
                index: 0,
                generation: arena.generation,
            }),
        })
    }

    /// Free every object. Existing handles into this message go stale.
    pub fn reset(&self) {
        let mut arena = self.arena.lock();
        arena.objects.clear();
        arena.generation += 1;
    }

    /// Number of live objects.
    pub fn object_count(&self) -> usize {
        self.arena.lock().objects.len()
    }

    /// Incremented on every [`reset`](Self::reset).
    pub fn generation(&self) -> u64 {
        self.arena.lock().generation
    }

    pub fn same_as(&self, other: &Message) -> bool {
        Arc::ptr_eq(&self.arena, &other.arena)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arena = self.arena.lock();
        f.debug_struct("Message")
            .field("generation", &arena.generation)
            .field("objects", &arena.objects.len())
            .finish()
    }
}

#[derive(Clone)]
struct Target {
    message: Message,
    index: u32,
    generation: u64,
}

/// The contents of a pointer slot.
#[derive(Debug, Clone)]
pub enum Ptr {
    Null,
    Struct(Struct),
    Capability(Client),
}

/// A handle to one struct inside a [`Message`].
///
/// The default value is the empty struct: it has no data and no pointers and
/// belongs to no message.
#[derive(Clone, Default)]
pub struct Struct {
    target: Option<Target>,
}

macro_rules! scalar_accessors {
    ($($get:ident, $set:ident, $ty:ty;)*) => {
        $(
            /// Read a little-endian value at `offset` bytes into the data section.
            pub fn $get(&self, offset: usize) -> $ty {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                self.read(offset, &mut buf);
                <$ty>::from_le_bytes(buf)
            }

            /// Write a little-endian value at `offset` bytes into the data section.
            pub fn $set(&self, offset: usize, value: $ty) -> Result<(), Error> {
                self.write(offset, &value.to_le_bytes())
            }
        )*
    };
}

impl Struct {
    /// The message this struct lives in, if any.
    pub fn message(&self) -> Option<&Message> {
        self.target.as_ref().map(|t| &t.message)
    }

    /// Whether the handle still points at a live object.
    pub fn is_valid(&self) -> bool {
        self.with(|_| ()).is_some()
    }

    /// Current size, or zero for stale and empty handles.
    pub fn size(&self) -> ObjectSize {
        self.with(|obj| ObjectSize::new(obj.data.len() as u32, obj.pointers.len() as u16))
            .unwrap_or_default()
    }

    pub fn pointer_count(&self) -> u16 {
        self.size().pointer_count
    }

    scalar_accessors! {
        u8, set_u8, u8;
        u16, set_u16, u16;
        u32, set_u32, u32;
        u64, set_u64, u64;
        i64, set_i64, i64;
    }

    pub fn bool(&self, offset: usize) -> bool {
        self.u8(offset) != 0
    }

    pub fn set_bool(&self, offset: usize, value: bool) -> Result<(), Error> {
        self.set_u8(offset, value as u8)
    }

    /// Read pointer slot `index`.
    pub fn ptr(&self, index: u16) -> Ptr {
        let Some(target) = &self.target else {
            return Ptr::Null;
        };
        let slot = self.with(|obj| obj.pointers.get(index as usize).cloned());
        match slot.flatten() {
            Some(Slot::Struct(child)) => Ptr::Struct(Struct {
                target: Some(Target {
                    message: target.message.clone(),
                    index: child,
                    generation: target.generation,
                }),
            }),
            Some(Slot::Capability(client)) => Ptr::Capability(client),
            Some(Slot::Null) | None => Ptr::Null,
        }
    }

    /// Allocate a new struct in the same message and store it in slot `index`.
    pub fn new_struct(&self, index: u16, size: ObjectSize) -> Result<Struct, Error> {
        let target = self.live_target()?;
        // Check the slot before allocating so a bad index does not leak an object.
        self.with_mut(index, |_| ())?;
        let child = target.message.alloc(size);
        let child_index = child
            .target
            .as_ref()
            .map(|t| t.index)
            .ok_or_else(|| Error::failed("allocation produced an empty struct"))?;
        self.with_mut(index, |slot| *slot = Slot::Struct(child_index))?;
        Ok(child)
    }

    /// Point slot `index` at `child`, which must live in the same message.
    pub fn set_struct(&self, index: u16, child: &Struct) -> Result<(), Error> {
        let target = self.live_target()?;
        let child_target = child.live_target()?;
        if !child_target.message.same_as(&target.message) {
            return Err(Error::failed("struct belongs to a different message"));
        }
        let child_index = child_target.index;
        self.with_mut(index, |slot| *slot = Slot::Struct(child_index))
    }

    /// Store a capability in slot `index`. A null client clears the slot.
    pub fn set_capability(&self, index: u16, client: Client) -> Result<(), Error> {
        let slot = if client.is_null() {
            Slot::Null
        } else {
            Slot::Capability(client)
        };
        self.with_mut(index, |s| *s = slot)
    }

    /// Read a capability from slot `index`; anything else reads as a null client.
    pub fn capability(&self, index: u16) -> Client {
        match self.ptr(index) {
            Ptr::Capability(client) => client,
            _ => Client::null(),
        }
    }

    pub fn set_null(&self, index: u16) -> Result<(), Error> {
        self.with_mut(index, |s| *s = Slot::Null)
    }

    fn live_target(&self) -> Result<&Target, Error> {
        match &self.target {
            Some(target) if self.is_valid() => Ok(target),
            Some(_) => Err(Error::failed("struct belongs to a released message")),
            None => Err(Error::failed("write to an empty struct")),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&Object) -> R) -> Option<R> {
        let target = self.target.as_ref()?;
        let arena = target.message.arena.lock();
        if arena.generation != target.generation {
            return None;
        }
        arena.objects.get(target.index as usize).map(f)
    }

    fn with_mut(&self, index: u16, f: impl FnOnce(&mut Slot)) -> Result<(), Error> {
        let target = self.live_target()?;
        let mut arena = target.message.arena.lock();
        let obj = arena
            .objects
            .get_mut(target.index as usize)
            .ok_or_else(|| Error::failed("struct belongs to a released message"))?;
        let count = obj.pointers.len();
        let slot = obj.pointers.get_mut(index as usize).ok_or_else(|| {
            Error::failed(format!(
                "pointer index {} out of bounds (struct has {} pointers)",
                index, count
            ))
        })?;
        f(slot);
        Ok(())
    }

    fn read(&self, offset: usize, buf: &mut [u8]) {
        self.with(|obj| {
            if let Some(src) = obj.data.get(offset..offset.saturating_add(buf.len())) {
                buf.copy_from_slice(src);
            }
        });
    }

    fn write(&self, offset: usize, bytes: &[u8]) -> Result<(), Error> {
        let target = self.live_target()?;
        let mut arena = target.message.arena.lock();
        let obj = arena
            .objects
            .get_mut(target.index as usize)
            .ok_or_else(|| Error::failed("struct belongs to a released message"))?;
        let len = obj.data.len();
        let dst = obj.data.get_mut(offset..offset.saturating_add(bytes.len())).ok_or_else(|| {
            Error::failed(format!(
                "data offset {} out of bounds (data section is {} bytes)",
                offset, len
            ))
        })?;
        dst.copy_from_slice(bytes);
        Ok(())
    }
}

impl fmt::Debug for Struct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            None => f.write_str("Struct(empty)"),
            Some(t) => f
                .debug_struct("Struct")
                .field("index", &t.index)
                .field("generation", &t.generation)
                .field("size", &self.size())
                .finish(),
        }
    }
}
