//! Core document model for Trellis.
//!
//! This crate provides the collaborator layer the link and attachment engine
//! is written against:
//!
//! - **Object Table**: generational ids, names and labels, plain-group membership
//! - **Property System**: typed property cells with status bits, plus the
//!   lock-protected [`Property<T>`] value cell
//! - **Document**: change dispatch through installed hooks, watches,
//!   lifecycle flags, duplication and snapshots
//! - **Signal/Slot System**: synchronous notifications
//! - **Placement Math**: rigid transforms on `glam` f64 types
//! - **Parameters**: link preferences loaded from TOML
//!
//! # Example
//!
//! ```
//! use trellis_core::{Document, PropertyCell, PropertyValue};
//!
//! let mut doc = Document::new();
//! let cube = doc.add_object("Part::Box", "Box");
//! doc.add_property(cube, "Length", PropertyCell::new(PropertyValue::Float(10.0)))
//!     .unwrap();
//!
//! let changes = doc.signals().property_changed.connect(|change| {
//!     println!("{} changed", change.name);
//! });
//! doc.set_property(cube, "Length", PropertyValue::Float(12.0)).unwrap();
//! doc.signals().property_changed.disconnect(changes);
//! ```

pub mod document;
mod error;
pub mod logging;
pub mod object;
mod params;
pub mod placement;
pub mod property;
pub mod signal;

pub use document::{
    ChangeOrigin, Document, DocumentHook, DocumentSignals, DocumentSnapshot, GROUP_PROPERTY,
    LABEL_PROPERTY, PathRename, PropertyChange, Watch,
};
pub use error::{CoreError, CoreResult};
pub use logging::{DocumentTreeDebug, TreeFormatOptions, TreeStyle};
pub use object::{ObjectData, ObjectError, ObjectId, ObjectRegistry, ObjectResult};
pub use params::LinkParams;
pub use placement::{Matrix, Placement};
pub use property::{
    Color, EditLock, LinkScope, LinkSub, Property, PropertyCell, PropertyError, PropertyKind,
    PropertyStatus, PropertyValue,
};
pub use signal::{ConnectionGuard, ConnectionId, Signal};
