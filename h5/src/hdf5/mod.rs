//! A small HDF5 subset: groups, contiguous numeric or string datasets and
//! string attributes, in the layout the reference library reads back
//! (version 0 superblock, version 1 object headers, symbol-table groups).
//!
//! Files are built in memory as a [`Group`] tree, then written at once.
use crate::internal::*;

pub mod reader;
pub mod writer;

pub use reader::{read, read_bytes};
pub use writer::{write, write_bytes};

pub(crate) const SIGNATURE: &[u8; 8] = b"\x89HDF\r\n\x1a\n";
pub(crate) const UNDEFINED_ADDRESS: u64 = u64::MAX;
/// Group leaf node K: symbol table nodes hold up to `2 * K` entries.
pub(crate) const GROUP_LEAF_K: usize = 4;
/// Group internal node K: B-tree nodes hold up to `2 * K` children.
pub(crate) const GROUP_INTERNAL_K: usize = 16;
pub(crate) const SUPERBLOCK_SIZE: usize = 96;
pub(crate) const SYMBOL_ENTRY_SIZE: usize = 40;
pub(crate) const SYMBOL_NODE_SIZE: usize = 8 + 2 * GROUP_LEAF_K * SYMBOL_ENTRY_SIZE;
pub(crate) const BTREE_NODE_SIZE: usize = 24 + 2 * GROUP_INTERNAL_K * 8 + (2 * GROUP_INTERNAL_K + 1) * 8;

pub(crate) mod msg {
    pub const NIL: u16 = 0x0000;
    pub const DATASPACE: u16 = 0x0001;
    pub const DATATYPE: u16 = 0x0003;
    pub const FILL_VALUE: u16 = 0x0005;
    pub const LAYOUT: u16 = 0x0008;
    pub const ATTRIBUTE: u16 = 0x000C;
    pub const CONTINUATION: u16 = 0x0010;
    pub const SYMBOL_TABLE: u16 = 0x0011;
    pub const MODIFICATION_TIME: u16 = 0x0012;
}

pub(crate) fn pad8(n: usize) -> usize {
    n.div_ceil(8) * 8
}

/// Content of a dataset.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Tensor(Tensor),
    /// A scalar fixed-length UTF-8 string.
    String(String),
}

#[derive(Clone, Debug, PartialEq, new)]
pub struct Dataset {
    pub value: Value,
    #[new(default)]
    pub attrs: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Member {
    Group(Group),
    Dataset(Dataset),
}

/// Members are kept sorted by name, as symbol tables store them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Group {
    pub attrs: BTreeMap<String, String>,
    pub members: BTreeMap<String, Member>,
}

fn check_name(name: &str) -> PortResult<()> {
    ensure!(!name.is_empty() && name != "." && !name.contains(['/', '\0']), "Invalid HDF5 link name {name:?}");
    Ok(())
}

impl Group {
    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        self.attrs.insert(name.to_string(), value.into());
    }

    pub fn attr(&self, name: &str) -> PortResult<&str> {
        self.attrs.get(name).map(|s| s.as_str()).with_context(|| format!("Missing attribute {name}"))
    }

    pub fn add_group(&mut self, name: &str) -> PortResult<&mut Group> {
        check_name(name)?;
        ensure!(!self.members.contains_key(name), "{name} already exists");
        let member = self.members.entry(name.to_string()).or_insert(Member::Group(Group::default()));
        match member {
            Member::Group(g) => Ok(g),
            Member::Dataset(_) => bail!("{name} is a dataset"),
        }
    }

    pub fn add_dataset(&mut self, name: &str, dataset: Dataset) -> PortResult<()> {
        check_name(name)?;
        ensure!(!self.members.contains_key(name), "{name} already exists");
        self.members.insert(name.to_string(), Member::Dataset(dataset));
        Ok(())
    }

    /// Looks up a member by `/`-separated path.
    pub fn member(&self, path: &str) -> PortResult<&Member> {
        let mut parts = path.split('/').filter(|p| !p.is_empty());
        let first = parts.next().with_context(|| format!("Empty path {path:?}"))?;
        let mut current = self.members.get(first).with_context(|| format!("No member {first} (in {path})"))?;
        for part in parts {
            current = match current {
                Member::Group(g) => g.members.get(part).with_context(|| format!("No member {part} (in {path})"))?,
                Member::Dataset(_) => bail!("{path} goes through a dataset"),
            };
        }
        Ok(current)
    }

    pub fn group(&self, path: &str) -> PortResult<&Group> {
        match self.member(path)? {
            Member::Group(g) => Ok(g),
            Member::Dataset(_) => bail!("{path} is a dataset, not a group"),
        }
    }

    pub fn dataset(&self, path: &str) -> PortResult<&Dataset> {
        match self.member(path)? {
            Member::Dataset(d) => Ok(d),
            Member::Group(_) => bail!("{path} is a group, not a dataset"),
        }
    }

    pub fn datasets(&self) -> impl Iterator<Item = (&str, &Dataset)> {
        self.members.iter().filter_map(|(k, m)| match m {
            Member::Dataset(d) => Some((k.as_str(), d)),
            Member::Group(_) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths() {
        let mut root = Group::default();
        root.add_group("a").unwrap().add_dataset("x", Dataset::new(Value::String("hi".into()))).unwrap();
        assert!(root.dataset("a/x").is_ok());
        assert!(root.group("a").is_ok());
        assert!(root.group("a/x").is_err());
        assert!(root.dataset("a/x/y").is_err());
        assert!(root.add_group("a").is_err());
        assert!(root.add_group("b/c").is_err());
    }

    #[test]
    fn sizes() {
        assert_eq!(SYMBOL_NODE_SIZE, 328);
        assert_eq!(BTREE_NODE_SIZE, 544);
    }
}
