//! Link arrays, copy-on-change cloning and geometric attachment for Trellis
//! documents.
//!
//! This crate extends [`trellis_core::Document`] objects with:
//!
//! - **Links**: single links, link arrays with per-element placement, scale
//!   and visibility, and link groups ([`link`])
//! - **Sub-name resolution**: dotted paths through links, arrays and
//!   flattened groups ([`subname`], [`LinkRef::extension_get_sub_object`])
//! - **Copy-on-change**: private clones of configurable link targets that
//!   track their source ([`copy_on_change`])
//! - **Attachment**: placements computed from references to other objects'
//!   geometry ([`attach`])
//!
//! The extensions react to document changes through hooks, installed once
//! per document with [`install`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use trellis_core::Document;
//! use trellis_link::{LinkDocumentExt, MemoryKernel, make_link_array};
//!
//! let mut doc = Document::new();
//! trellis_link::install(&mut doc, Arc::new(MemoryKernel::new()));
//!
//! let cube = doc.add_object("Part::Box", "Box");
//! let array = make_link_array(&mut doc, "Array", Some(cube), 3).unwrap();
//!
//! let link = doc.link(array).unwrap();
//! assert_eq!(link.element_count(), 3);
//! assert_eq!(link.linked_object(), Some(cube));
//! ```

pub mod attach;
pub mod copy_on_change;
mod error;
mod hooks;
pub mod kernel;
pub mod link;
pub mod rename;
pub mod subname;

pub use attach::{
    AttachDocumentExt, AttachEngine, AttachExtension, AttachRef, AttachMut, AttachRole,
    AttachState, EngineKind, MapMode, add_attach_extension, remove_attach_extension,
};
pub use copy_on_change::{CopyOnChangeMode, CopyOnChangeState};
pub use error::{AttachError, AttachResult, KernelError, LinkError, LinkResult};
pub use hooks::{AttachHook, CopyOnChangeHook, Hooks, LinkHook, install};
pub use kernel::{ElementGeometry, GeometryKernel, MemoryKernel, ResolvedElement};
pub use link::{
    ElementState, LabelCache, LinkDocumentExt, LinkExtension, LinkMode, LinkMut, LinkRef,
    LinkShape, NewLinkElements, SubObject, make_link, make_link_array, make_link_group,
};
pub use rename::{SubElementRename, rename_sub_element};
