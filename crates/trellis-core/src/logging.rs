//! Logging and debugging facilities for Trellis.
//!
//! This module provides:
//! - `tracing` target names used throughout the workspace
//! - Debug visualization for the object/group tree of a document
//!
//! # Tracing Integration
//!
//! Trellis uses the `tracing` crate for instrumentation. Install a
//! subscriber in the application to see the output:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("trellis_link::attach=debug")
//!     .init();
//! ```
//!
//! # Debug Visualization
//!
//! ```
//! use trellis_core::Document;
//! use trellis_core::logging::DocumentTreeDebug;
//!
//! let mut doc = Document::new();
//! let group = doc.add_group("Group");
//! let cube = doc.add_object("Part::Box", "Box");
//! doc.add_to_group(group, cube, None).unwrap();
//!
//! let text = DocumentTreeDebug::new().format_all(&doc).unwrap();
//! assert!(text.contains("Box"));
//! ```

use std::fmt::Write as FmtWrite;

use crate::document::Document;
use crate::error::CoreResult;
use crate::object::ObjectId;

/// Target names for log filtering.
pub mod targets {
    /// Document dispatch.
    pub const DOCUMENT: &str = "trellis_core::document";
    /// Property writes.
    pub const PROPERTY: &str = "trellis_core::property";
    /// Object table.
    pub const OBJECT: &str = "trellis_core::object";
    /// Signal emission.
    pub const SIGNAL: &str = "trellis_core::signal";
    /// Link arrays and sub-name resolution.
    pub const LINK: &str = "trellis_link::link";
    /// Attachment engine.
    pub const ATTACH: &str = "trellis_link::attach";
    /// Copy-on-change synchronizer.
    pub const COPY_ON_CHANGE: &str = "trellis_link::copy_on_change";
}

/// Style options for tree visualization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TreeStyle {
    /// ASCII characters for tree branches.
    Ascii,
    /// Unicode box-drawing characters.
    #[default]
    Unicode,
    /// Compact single-line prefixes.
    Compact,
}

/// Configuration for tree debug output.
#[derive(Debug, Clone)]
pub struct TreeFormatOptions {
    pub style: TreeStyle,
    /// Show object ids.
    pub show_ids: bool,
    /// Show type names.
    pub show_types: bool,
    /// Show property names and values.
    pub show_properties: bool,
    /// Maximum depth to traverse (`None` for unlimited).
    pub max_depth: Option<usize>,
    pub indent_size: usize,
}

impl Default for TreeFormatOptions {
    fn default() -> Self {
        Self {
            style: TreeStyle::default(),
            show_ids: false,
            show_types: true,
            show_properties: false,
            max_depth: None,
            indent_size: 2,
        }
    }
}

impl TreeFormatOptions {
    /// Options for detailed debugging output.
    pub fn detailed() -> Self {
        Self {
            show_ids: true,
            show_properties: true,
            ..Default::default()
        }
    }

    /// Options for minimal output.
    pub fn minimal() -> Self {
        Self {
            show_types: false,
            ..Default::default()
        }
    }
}

/// Renders the group tree of a [`Document`].
#[derive(Debug, Clone, Default)]
pub struct DocumentTreeDebug {
    options: TreeFormatOptions,
}

impl DocumentTreeDebug {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: TreeFormatOptions) -> Self {
        Self { options }
    }

    /// Format every root object and its members.
    pub fn format_all(&self, doc: &Document) -> CoreResult<String> {
        let registry = doc.registry();
        let roots: Vec<ObjectId> = registry.root_objects().collect();

        let mut output = String::new();
        let _ = writeln!(output, "Document ({} objects):", registry.object_count());
        if roots.is_empty() {
            output.push_str("  (empty)\n");
        }
        for root in roots {
            self.format_subtree_into(doc, root, 0, true, &mut output)?;
        }
        Ok(output)
    }

    /// Format a subtree starting from `root`.
    pub fn format_subtree(&self, doc: &Document, root: ObjectId) -> CoreResult<String> {
        let mut output = String::new();
        self.format_subtree_into(doc, root, 0, true, &mut output)?;
        Ok(output)
    }

    fn format_subtree_into(
        &self,
        doc: &Document,
        id: ObjectId,
        depth: usize,
        is_last: bool,
        output: &mut String,
    ) -> CoreResult<()> {
        if self.options.max_depth.is_some_and(|max| depth > max) {
            return Ok(());
        }

        let data = doc.object(id)?;
        output.push_str(&self.build_prefix(depth, is_last));
        output.push_str(data.name());
        if data.label() != data.name() {
            let _ = write!(output, " \"{}\"", data.label());
        }
        if self.options.show_ids {
            let _ = write!(output, " [{id:?}]");
        }
        if self.options.show_types {
            let short_type = data.type_name().rsplit("::").next().unwrap_or(data.type_name());
            let _ = write!(output, " ({short_type})");
        }
        output.push('\n');

        if self.options.show_properties {
            let prop_prefix = self.build_property_prefix(depth);
            for (name, cell) in data.properties() {
                let _ = writeln!(output, "{prop_prefix}  .{name} = {:?}", cell.value());
            }
        }

        let children = data.children();
        let count = children.len();
        for (i, &child) in children.iter().enumerate() {
            self.format_subtree_into(doc, child, depth + 1, i + 1 == count, output)?;
        }
        Ok(())
    }

    fn build_prefix(&self, depth: usize, is_last: bool) -> String {
        if depth == 0 {
            return String::new();
        }
        let (branch, tee, corner) = match self.options.style {
            TreeStyle::Ascii => ("|", "+-- ", "`-- "),
            TreeStyle::Unicode => ("\u{2502}", "\u{251c}\u{2500}\u{2500} ", "\u{2514}\u{2500}\u{2500} "),
            TreeStyle::Compact => ("", "- ", "- "),
        };

        let mut prefix = String::new();
        for _ in 0..(depth - 1) {
            prefix.push_str(branch);
            prefix.push_str(&" ".repeat(self.options.indent_size));
        }
        prefix.push_str(if is_last { corner } else { tee });
        prefix
    }

    fn build_property_prefix(&self, depth: usize) -> String {
        let branch = match self.options.style {
            TreeStyle::Ascii => "|",
            TreeStyle::Unicode => "\u{2502}",
            TreeStyle::Compact => "",
        };
        let mut prefix = String::new();
        for _ in 0..depth {
            prefix.push_str(branch);
            prefix.push_str(&" ".repeat(self.options.indent_size));
        }
        prefix
    }
}
