//! Decoded request descriptor.

use serde::{Deserialize, Serialize};

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

/// A single transformation filter, `name(args)` in the path.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub args: String,
}

impl Filter {
    pub fn new(name: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: args.into(),
        }
    }
}

/// Decoded request descriptor.
///
/// `path` is the canonical operation string (everything after the signature
/// segment, verbatim) and doubles as the default result-storage key.
/// `image` is the free-form source identifier left after all recognized
/// operation tokens are consumed.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(rename = "unsafe", skip_serializing_if = "is_false")]
    pub unsafe_: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hash: String,
    #[serde(skip_serializing_if = "is_false")]
    pub meta: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub trim: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub trim_by: String,
    #[serde(skip_serializing_if = "is_false")]
    pub fit_in: bool,
    #[serde(skip_serializing_if = "is_zero")]
    pub width: i32,
    #[serde(skip_serializing_if = "is_zero")]
    pub height: i32,
    #[serde(skip_serializing_if = "is_false")]
    pub h_flip: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub v_flip: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub h_align: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub v_align: String,
    #[serde(skip_serializing_if = "is_false")]
    pub smart: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
}

impl Params {
    /// True when an explicit `format(...)` filter is present, in which
    /// case Accept-header format negotiation must not override it.
    pub fn has_format_filter(&self) -> bool {
        self.filters.iter().any(|f| f.name == "format")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_omits_defaults() {
        let p = Params {
            path: "foo.jpg".to_string(),
            image: "foo.jpg".to_string(),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_string(&p).unwrap(),
            r#"{"path":"foo.jpg","image":"foo.jpg"}"#
        );
    }

    #[test]
    fn test_serialize_unsafe_rename() {
        let p = Params {
            unsafe_: true,
            ..Default::default()
        };
        assert_eq!(serde_json::to_string(&p).unwrap(), r#"{"unsafe":true}"#);
    }

    #[test]
    fn test_has_format_filter() {
        let mut p = Params::default();
        assert!(!p.has_format_filter());
        p.filters.push(Filter::new("quality", "80"));
        assert!(!p.has_format_filter());
        p.filters.push(Filter::new("format", "webp"));
        assert!(p.has_format_filter());
    }
}
