//! Sub-name parsing.
//!
//! A sub-name addresses something inside an object: a chain of sub-object
//! segments, each terminated by `.`, optionally followed by a geometry
//! element name.
//!
//! ```text
//! Group.Box.Face1     objects ["Group", "Box"], element "Face1"
//! 2.Edge3             array element 2, element "Edge3"
//! 1-3,5.Face1         index ranges, expanded into four sub-names
//! $Bracket.           element addressed by label
//! ```
//!
//! Everything here is purely syntactic. Resolving segments against a document
//! happens in [`crate::link`].

use crate::error::{LinkError, LinkResult};

/// A sub-name split into its object segments and trailing element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubnamePath<'a> {
    /// Sub-object segments, outermost first.
    pub objects: Vec<&'a str>,
    /// Geometry element name, empty when the path ends with `.`.
    pub element: &'a str,
}

impl<'a> SubnamePath<'a> {
    /// Split a sub-name, rejecting empty object segments (`..` or a leading
    /// `.`).
    pub fn parse(subname: &'a str) -> LinkResult<Self> {
        let mut segments: Vec<&str> = subname.split('.').collect();
        let element = segments.pop().unwrap_or_default();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(LinkError::InvalidSubname(subname.to_string()));
        }
        Ok(Self {
            objects: segments,
            element,
        })
    }

    /// Whether the path addresses the object itself.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.element.is_empty()
    }
}

/// The first object segment and everything after its dot.
///
/// Returns `None` when the sub-name has no object segment.
pub fn split_first(subname: &str) -> Option<(&str, &str)> {
    subname.split_once('.')
}

/// Parse a leading array index.
///
/// `"3.Face1"` gives `Some((3, "Face1"))`; `"3"` gives `Some((3, ""))`.
/// Anything that does not start with a purely numeric segment gives `None`.
pub fn get_array_index(subname: &str) -> Option<(usize, &str)> {
    let (head, rest) = match subname.split_once('.') {
        Some((head, rest)) => (head, rest),
        None => (subname, ""),
    };
    if head.is_empty() || !head.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    head.parse().ok().map(|index| (index, rest))
}

/// Parse the `<Host>_i<N>` element naming scheme.
pub fn parse_element_name(host_name: &str, segment: &str) -> Option<usize> {
    let digits = segment.strip_prefix(host_name)?.strip_prefix("_i")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Name of array element `index` of `host_name`.
pub fn element_object_name(host_name: &str, index: usize) -> String {
    format!("{host_name}_i{index}")
}

/// The label form of a segment (`$Label`), if it is one.
pub fn label_segment(segment: &str) -> Option<&str> {
    segment.strip_prefix('$').filter(|label| !label.is_empty())
}

/// Expand index ranges in the first segment.
///
/// `"1-3,5.Face1"` becomes `["1.Face1", "2.Face1", "3.Face1", "5.Face1"]`.
/// A first segment without `,` or `-` is returned unchanged.
pub fn expand_index_ranges(subname: &str) -> LinkResult<Vec<String>> {
    let (head, rest) = match subname.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (subname, None),
    };
    if !head.contains([',', '-']) || !head.bytes().all(|b| b.is_ascii_digit() || b == b',' || b == b'-') {
        return Ok(vec![subname.to_string()]);
    }

    let invalid = || LinkError::InvalidSubname(subname.to_string());
    let mut out = Vec::new();
    for part in head.split(',') {
        let (start, end) = match part.split_once('-') {
            Some((a, b)) => (a, b),
            None => (part, part),
        };
        let start: usize = start.parse().map_err(|_| invalid())?;
        let end: usize = end.parse().map_err(|_| invalid())?;
        if end < start {
            return Err(invalid());
        }
        for index in start..=end {
            out.push(match rest {
                Some(rest) => format!("{index}.{rest}"),
                None => index.to_string(),
            });
        }
    }
    Ok(out)
}

/// Join object segments and an element into a sub-name.
pub fn join(objects: &[&str], element: &str) -> String {
    let mut out = String::new();
    for object in objects {
        out.push_str(object);
        out.push('.');
    }
    out.push_str(element);
    out
}
