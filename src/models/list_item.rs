//! Entries returned by a listing and references accepted for deletion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry of a folder listing.
///
/// Folders are synthesized from the common prefixes of a delimited listing
/// and therefore carry neither size nor timestamp.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ListItem {
    #[serde(rename_all = "camelCase")]
    File {
        /// Full object key.
        id: String,
        name: String,
        size: i64,
        last_modified: Option<DateTime<Utc>>,
        url: String,
    },
    #[serde(rename_all = "camelCase")]
    Folder {
        /// Full prefix, including the trailing separator.
        id: String,
        name: String,
        url: String,
    },
}

impl ListItem {
    pub fn file(
        key: String,
        prefix: &str,
        size: i64,
        last_modified: Option<DateTime<Utc>>,
        url: String,
    ) -> Self {
        let name = display_name(&key, prefix);
        ListItem::File {
            id: key,
            name,
            size,
            last_modified,
            url,
        }
    }

    pub fn folder(common_prefix: String, prefix: &str, url: String) -> Self {
        let name = display_name(&common_prefix, prefix);
        ListItem::Folder {
            id: common_prefix,
            name,
            url,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ListItem::File { id, .. } | ListItem::Folder { id, .. } => id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ListItem::File { name, .. } | ListItem::Folder { name, .. } => name,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, ListItem::Folder { .. })
    }
}

/// Name shown for `key` when listed under `prefix`.
///
/// The key relative to the prefix without surrounding separators, or the
/// last path segment when the key does not extend the prefix.
pub fn display_name(key: &str, prefix: &str) -> String {
    let relative = key.strip_prefix(prefix).unwrap_or(key).trim_matches('/');
    if !relative.is_empty() {
        return relative.to_string();
    }
    key.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// An item the caller asks to delete.
#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ItemRef {
    /// A single object, deleted by key.
    File { id: String },
    /// A prefix; every object below it is deleted.
    Folder { id: String },
}

/// Outcome of a delete request as reported by the backend.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteSummary {
    pub deleted: Vec<String>,
    pub failed: Vec<DeleteFailure>,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DeleteFailure {
    pub key: String,
    pub code: String,
    pub message: String,
}

impl DeleteSummary {
    pub fn absorb(&mut self, other: DeleteSummary) {
        self.deleted.extend(other.deleted);
        self.failed.extend(other.failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn display_name_is_relative_to_prefix() {
        assert_eq!(display_name("a/x.txt", "a/"), "x.txt");
        assert_eq!(display_name("a/b/", "a/"), "b");
        assert_eq!(display_name("top.txt", ""), "top.txt");
        assert_eq!(display_name("a/", "a"), "a");
        assert_eq!(display_name("photos/2025/", "photos/2025/"), "2025");
    }

    #[test]
    fn serializes_with_type_tag() {
        let folder = ListItem::folder("a/b/".into(), "a/", "http://cdn/a/b/".into());
        assert_eq!(
            serde_json::to_value(&folder).unwrap(),
            json!({"type": "FOLDER", "id": "a/b/", "name": "b", "url": "http://cdn/a/b/"})
        );

        let file = ListItem::file("a/x.txt".into(), "a/", 3, None, "http://cdn/a/x.txt".into());
        let value = serde_json::to_value(&file).unwrap();
        assert_eq!(value["type"], "FILE");
        assert_eq!(value["name"], "x.txt");
        assert_eq!(value["size"], 3);
        assert!(value.get("lastModified").is_some());
    }

    #[test]
    fn item_refs_deserialize_by_type() {
        let refs: Vec<ItemRef> = serde_json::from_value(json!([
            {"id": "a/x.txt", "type": "FILE"},
            {"id": "a/b/", "type": "FOLDER"}
        ]))
        .unwrap();
        assert_eq!(
            refs,
            vec![
                ItemRef::File { id: "a/x.txt".into() },
                ItemRef::Folder { id: "a/b/".into() },
            ]
        );
    }
}
