//! Mailbox tree types
//!
//! The server's flat LIST response is turned into an owned tree of
//! [`MailboxNode`]s. Children are owned by their parent; the parent is
//! referenced by path only.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// RFC 6154 special-use role of a mailbox. `INBOX` is tagged by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialUse {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Archive,
    Junk,
    All,
    Flagged,
}

impl SpecialUse {
    /// Map a LIST attribute such as `\Sent` to its role.
    #[must_use]
    pub fn from_attribute(attribute: &str) -> Option<Self> {
        match attribute.to_ascii_lowercase().as_str() {
            "\\inbox" => Some(Self::Inbox),
            "\\sent" => Some(Self::Sent),
            "\\drafts" => Some(Self::Drafts),
            "\\trash" => Some(Self::Trash),
            "\\archive" => Some(Self::Archive),
            "\\junk" => Some(Self::Junk),
            "\\all" => Some(Self::All),
            "\\flagged" => Some(Self::Flagged),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_attribute(self) -> &'static str {
        match self {
            Self::Inbox => "\\Inbox",
            Self::Sent => "\\Sent",
            Self::Drafts => "\\Drafts",
            Self::Trash => "\\Trash",
            Self::Archive => "\\Archive",
            Self::Junk => "\\Junk",
            Self::All => "\\All",
            Self::Flagged => "\\Flagged",
        }
    }
}

impl fmt::Display for SpecialUse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_attribute())
    }
}

/// One entry of a LIST response, before the tree is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedMailbox {
    pub path: String,
    pub delimiter: Option<String>,
    pub attributes: Vec<String>,
}

impl ListedMailbox {
    #[must_use]
    pub fn new(path: impl Into<String>, delimiter: Option<&str>) -> Self {
        Self {
            path: path.into(),
            delimiter: delimiter.map(str::to_string),
            attributes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attributes.push(attribute.into());
        self
    }
}

/// A mailbox as discovered on the server, without its subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxInfo {
    pub path: String,
    pub name: String,
    pub delimiter: Option<String>,
    pub flags: Vec<String>,
    pub special_use: Option<SpecialUse>,
    /// Listed but not selectable (`\Noselect` or `\NonExistent`).
    pub disabled: bool,
    pub parent: Option<String>,
}

impl MailboxInfo {
    /// Info for a mailbox that is only known by path, e.g. one that
    /// disappeared from the server.
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        Self {
            path: path.to_string(),
            name: path.to_string(),
            delimiter: None,
            flags: Vec::new(),
            special_use: None,
            disabled: false,
            parent: None,
        }
    }
}

/// A node of the mailbox tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailboxNode {
    pub info: MailboxInfo,
    pub children: Vec<Self>,
}

impl MailboxNode {
    #[must_use]
    pub fn path(&self) -> &str {
        &self.info.path
    }

    /// Depth-first iterator over this node and its descendants.
    pub fn walk(&self) -> impl Iterator<Item = &Self> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            stack.extend(node.children.iter().rev());
            Some(node)
        })
    }
}

fn parent_path(path: &str, delimiter: Option<&str>) -> Option<String> {
    let delimiter = delimiter.filter(|d| !d.is_empty())?;
    path.rfind(delimiter).map(|idx| path[..idx].to_string())
}

fn leaf_name(path: &str, delimiter: Option<&str>) -> String {
    delimiter
        .filter(|d| !d.is_empty())
        .and_then(|d| path.rsplit(d).next())
        .unwrap_or(path)
        .to_string()
}

fn info_from_listed(listed: ListedMailbox) -> MailboxInfo {
    let delimiter = listed.delimiter.as_deref();
    let special_use = if listed.path.eq_ignore_ascii_case("INBOX") {
        Some(SpecialUse::Inbox)
    } else {
        listed
            .attributes
            .iter()
            .find_map(|a| SpecialUse::from_attribute(a))
    };
    let disabled = listed.attributes.iter().any(|a| {
        a.eq_ignore_ascii_case("\\Noselect") || a.eq_ignore_ascii_case("\\NonExistent")
    });

    MailboxInfo {
        name: leaf_name(&listed.path, delimiter),
        parent: parent_path(&listed.path, delimiter),
        delimiter: listed.delimiter,
        flags: listed.attributes,
        special_use,
        disabled,
        path: listed.path,
    }
}

/// Build the mailbox tree from a flat LIST response.
///
/// Listing order is preserved among siblings. A node whose parent was
/// not listed becomes a root.
#[must_use]
pub fn build_tree(listed: Vec<ListedMailbox>) -> Vec<MailboxNode> {
    let infos: Vec<MailboxInfo> = listed.into_iter().map(info_from_listed).collect();
    let known: HashSet<String> = infos.iter().map(|i| i.path.clone()).collect();

    let mut roots = Vec::new();
    let mut children: HashMap<String, Vec<MailboxInfo>> = HashMap::new();
    for info in infos {
        match info.parent.as_ref().filter(|p| known.contains(*p)) {
            Some(parent) => children.entry(parent.clone()).or_default().push(info),
            None => roots.push(info),
        }
    }

    roots
        .into_iter()
        .map(|info| attach(info, &mut children))
        .collect()
}

fn attach(info: MailboxInfo, children: &mut HashMap<String, Vec<MailboxInfo>>) -> MailboxNode {
    let own = children.remove(&info.path).unwrap_or_default();
    MailboxNode {
        children: own.into_iter().map(|c| attach(c, children)).collect(),
        info,
    }
}
