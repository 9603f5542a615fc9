//! Render table for enums and plain-data structs captured in messages.
//!
//! Messages only store a numeric type id next to an enum's raw value or a
//! struct's bytes. Turning those back into text on the dispatcher side needs
//! the routine registered for that id here. Ids are compile-time constants
//! chosen by the implementer of [`LogEnum`] or [`UnmanagedStruct`], so the
//! producer never consults this table.
//!
//! A process-wide registry is available through [`register_enum`],
//! [`register_struct`] and [`GlobalTypeRegistry`]; tests and embedded
//! setups can build their own [`TypeRegistry`] and hand it to the pipeline
//! instead.

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::mem::size_of;

use lazy_static::lazy_static;
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// An enum that can be captured as a `(type id, raw value)` pair.
///
/// # Examples
///
/// ```
/// # use pooled_logger::type_registry::LogEnum;
/// #[derive(Clone, Copy)]
/// enum Color { Red, Green }
///
/// impl LogEnum for Color {
///     const TYPE_ID: u32 = 0xC0_10_00_01;
///     fn to_raw(self) -> u64 { self as u64 }
///     fn name_of(raw: u64) -> Option<&'static str> {
///         match raw { 0 => Some("Red"), 1 => Some("Green"), _ => None }
///     }
/// }
/// ```
pub trait LogEnum: Copy + 'static {
    const TYPE_ID: u32;

    fn to_raw(self) -> u64;

    /// The variant name for a raw value, if it is a known variant.
    fn name_of(raw: u64) -> Option<&'static str>;
}

/// A plain-data struct copied byte-for-byte into a message.
///
/// The struct is read back with [`bytemuck::pod_read_unaligned`] on the
/// dispatcher thread and rendered with [`UnmanagedStruct::render`].
pub trait UnmanagedStruct: bytemuck::Pod {
    const TYPE_ID: u32;

    /// Writes the struct as text. `format` is the specifier passed to
    /// `append_unmanaged_formatted`, if any.
    fn render(&self, out: &mut dyn fmt::Write, format: Option<&str>) -> fmt::Result;
}

/// Looks up the variant name of a raw enum value.
pub type EnumRenderer = fn(u64) -> Option<&'static str>;

/// Renders the raw bytes of an unmanaged struct.
pub type StructRenderer = fn(&[u8], &mut dyn fmt::Write, Option<&str>) -> fmt::Result;

/// Lookup capability the decoder uses for enum and struct values.
pub trait TypeLookup: Send + Sync {
    fn lookup_enum_renderer(&self, type_id: u32) -> Option<EnumRenderer>;
    fn lookup_struct_renderer(&self, type_id: u32) -> Option<StructRenderer>;
}

#[derive(Clone, Copy)]
struct Entry<F> {
    type_name: &'static str,
    render: F,
}

/// Thread-safe table from type id to render routine.
#[derive(Default)]
pub struct TypeRegistry {
    enums: RwLock<HashMap<u32, Entry<EnumRenderer>>>,
    structs: RwLock<HashMap<u32, Entry<StructRenderer>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `E`. Registering the same type twice is a no-op; a
    /// different type with the same id is rejected.
    pub fn register_enum<E: LogEnum>(&self) -> Result<()> {
        let entry = Entry {
            type_name: type_name::<E>(),
            render: E::name_of as EnumRenderer,
        };
        insert(&mut self.enums.write(), E::TYPE_ID, entry)
    }

    /// Registers `T`. Same duplicate rules as [`register_enum`](Self::register_enum).
    pub fn register_struct<T: UnmanagedStruct>(&self) -> Result<()> {
        let entry = Entry {
            type_name: type_name::<T>(),
            render: render_struct::<T> as StructRenderer,
        };
        insert(&mut self.structs.write(), T::TYPE_ID, entry)
    }

    pub fn enum_count(&self) -> usize {
        self.enums.read().len()
    }

    pub fn struct_count(&self) -> usize {
        self.structs.read().len()
    }
}

fn insert<F: Copy>(table: &mut HashMap<u32, Entry<F>>, type_id: u32, entry: Entry<F>) -> Result<()> {
    match table.get(&type_id) {
        Some(existing) if existing.type_name == entry.type_name => Ok(()),
        Some(existing) => Err(Error::TypeIdConflict {
            type_id,
            existing: existing.type_name,
            new: entry.type_name,
        }),
        None => {
            table.insert(type_id, entry);
            Ok(())
        }
    }
}

fn render_struct<T: UnmanagedStruct>(
    bytes: &[u8],
    out: &mut dyn fmt::Write,
    format: Option<&str>,
) -> fmt::Result {
    if bytes.len() != size_of::<T>() {
        return Err(fmt::Error);
    }
    let value: T = bytemuck::pod_read_unaligned(bytes);
    value.render(out, format)
}

impl TypeLookup for TypeRegistry {
    fn lookup_enum_renderer(&self, type_id: u32) -> Option<EnumRenderer> {
        self.enums.read().get(&type_id).map(|entry| entry.render)
    }

    fn lookup_struct_renderer(&self, type_id: u32) -> Option<StructRenderer> {
        self.structs.read().get(&type_id).map(|entry| entry.render)
    }
}

lazy_static! {
    /// Registry shared by every pipeline that does not bring its own.
    static ref GLOBAL_REGISTRY: TypeRegistry = TypeRegistry::new();
}

/// Registers an enum in the process-wide registry.
///
/// ```
/// # use pooled_logger::type_registry::{register_enum, LogEnum, GlobalTypeRegistry, TypeLookup};
/// #[derive(Clone, Copy)]
/// enum Side { Buy, Sell }
/// impl LogEnum for Side {
///     const TYPE_ID: u32 = 0x5_1DE;
///     fn to_raw(self) -> u64 { self as u64 }
///     fn name_of(raw: u64) -> Option<&'static str> {
///         [Some("Buy"), Some("Sell")].get(raw as usize).copied().flatten()
///     }
/// }
///
/// register_enum::<Side>().unwrap();
/// let render = GlobalTypeRegistry.lookup_enum_renderer(Side::TYPE_ID).unwrap();
/// assert_eq!(render(1), Some("Sell"));
/// ```
pub fn register_enum<E: LogEnum>() -> Result<()> {
    GLOBAL_REGISTRY.register_enum::<E>()
}

/// Registers an unmanaged struct in the process-wide registry.
pub fn register_struct<T: UnmanagedStruct>() -> Result<()> {
    GLOBAL_REGISTRY.register_struct::<T>()
}

/// Handle to the process-wide registry, usable wherever a [`TypeLookup`]
/// is expected.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalTypeRegistry;

impl TypeLookup for GlobalTypeRegistry {
    fn lookup_enum_renderer(&self, type_id: u32) -> Option<EnumRenderer> {
        GLOBAL_REGISTRY.lookup_enum_renderer(type_id)
    }

    fn lookup_struct_renderer(&self, type_id: u32) -> Option<StructRenderer> {
        GLOBAL_REGISTRY.lookup_struct_renderer(type_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::{Pod, Zeroable};

    #[derive(Clone, Copy)]
    enum Mode {
        Fast,
    }

    impl LogEnum for Mode {
        const TYPE_ID: u32 = 77;
        fn to_raw(self) -> u64 {
            self as u64
        }
        fn name_of(raw: u64) -> Option<&'static str> {
            (raw == 0).then_some("Fast")
        }
    }

    #[derive(Clone, Copy)]
    enum Impostor {
        Other,
    }

    impl LogEnum for Impostor {
        const TYPE_ID: u32 = 77;
        fn to_raw(self) -> u64 {
            self as u64
        }
        fn name_of(_raw: u64) -> Option<&'static str> {
            None
        }
    }

    #[derive(Clone, Copy, Pod, Zeroable)]
    #[repr(C)]
    struct Point {
        x: i32,
        y: i32,
    }

    impl UnmanagedStruct for Point {
        const TYPE_ID: u32 = 9;
        fn render(&self, out: &mut dyn fmt::Write, _format: Option<&str>) -> fmt::Result {
            write!(out, "({}, {})", self.x, self.y)
        }
    }

    #[test]
    fn test_duplicate_registration_is_idempotent() {
        let registry = TypeRegistry::new();
        registry.register_enum::<Mode>().unwrap();
        registry.register_enum::<Mode>().unwrap();
        assert_eq!(registry.enum_count(), 1);
        let _ = Mode::Fast;
    }

    #[test]
    fn test_conflicting_type_id_is_rejected() {
        let registry = TypeRegistry::new();
        registry.register_enum::<Mode>().unwrap();
        let err = registry.register_enum::<Impostor>().unwrap_err();
        assert!(matches!(err, Error::TypeIdConflict { type_id: 77, .. }));
        let _ = Impostor::Other;
    }

    #[test]
    fn test_struct_renderer_checks_length() {
        let registry = TypeRegistry::new();
        registry.register_struct::<Point>().unwrap();
        let render = registry.lookup_struct_renderer(9).unwrap();

        let point = Point { x: 1, y: -2 };
        let mut out = String::new();
        render(bytemuck::bytes_of(&point), &mut out, None).unwrap();
        assert_eq!(out, "(1, -2)");

        assert!(render(&[0u8; 3], &mut out, None).is_err());
    }

    #[test]
    fn test_unknown_ids_miss() {
        let registry = TypeRegistry::new();
        assert!(registry.lookup_enum_renderer(1234).is_none());
        assert!(registry.lookup_struct_renderer(1234).is_none());
    }
}
