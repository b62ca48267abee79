//! Link related preferences.
//!
//! [`LinkParams`] is handed to a [`Document`](crate::Document) when it is
//! created. The engine reads its knobs from there and never from process-wide
//! state, so a document can be exercised without a running application.
//!
//! Parameters are usually loaded from the `[link]` table of a TOML preference
//! file:
//!
//! ```
//! use trellis_core::LinkParams;
//!
//! let params = LinkParams::from_toml_str(r#"
//! [link]
//! show_element = false
//! max_link_depth = 16
//! "#).unwrap();
//! assert!(!params.show_element);
//! assert_eq!(params.max_link_depth, 16);
//! assert!(params.copy_on_change_apply_to_all);
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Preferences consumed by link arrays and copy-on-change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkParams {
    /// Default of the `ShowElement` property of new link arrays: whether
    /// array elements are materialized as individual objects.
    pub show_element: bool,
    /// Apply a copy-on-change setup to every link that points at the same
    /// configurable object.
    pub copy_on_change_apply_to_all: bool,
    /// Hide the `ScaleVector` property of new links.
    pub hide_scale_vector: bool,
    /// Create new links at the position of the linked object.
    pub create_in_place: bool,
    /// Recursion bound when resolving chains of links.
    pub max_link_depth: usize,
}

impl Default for LinkParams {
    fn default() -> Self {
        Self {
            show_element: true,
            copy_on_change_apply_to_all: true,
            hide_scale_vector: true,
            create_in_place: true,
            max_link_depth: 100,
        }
    }
}

#[derive(Deserialize)]
struct ParamFile {
    #[serde(default)]
    link: LinkParams,
}

impl LinkParams {
    /// Parse parameters from the `[link]` table of a TOML document.
    ///
    /// Missing keys keep their defaults; unknown keys and tables are ignored.
    pub fn from_toml_str(text: &str) -> CoreResult<Self> {
        let file: ParamFile = toml::from_str(text).map_err(|e| CoreError::Config(e.to_string()))?;
        tracing::debug!(target: "trellis_core::params", params = ?file.link, "loaded link parameters");
        Ok(file.link)
    }

    /// Load parameters from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Serialize back into a `[link]` TOML table.
    pub fn to_toml_string(&self) -> CoreResult<String> {
        #[derive(Serialize)]
        struct Out<'a> {
            link: &'a LinkParams,
        }
        toml::to_string(&Out { link: self }).map_err(|e| CoreError::Config(e.to_string()))
    }
}
