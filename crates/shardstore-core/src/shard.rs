//! Client-side shard routing
//!
//! A static binary tree describes how the id space is split between shards.
//! [`ShardIndex::build`] flattens it into a table of `2^height` slots so that
//! routing an id is a single mask-and-index:
//!
//! ```text
//!        [[A, B], C]             slot  path  shard
//!          /    \                 0     00    A
//!       [A, B]   C                1     01    B
//!       /   \                     2     10    C
//!      A     B                    3     11    C   (filled from slot 2)
//! ```

use crate::{CoreError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::debug;

/// Deepest routing tree a table can be built for
pub const MAX_SHARD_DEPTH: usize = 31;

/// Static routing tree; leaves are shard descriptors
#[derive(Clone, Debug, PartialEq)]
pub enum ShardTree<T> {
    Leaf(T),
    Branch(Box<ShardTree<T>>, Box<ShardTree<T>>),
}

impl<T> ShardTree<T> {
    pub fn leaf(value: T) -> Self {
        Self::Leaf(value)
    }

    pub fn branch(left: ShardTree<T>, right: ShardTree<T>) -> Self {
        Self::Branch(Box::new(left), Box::new(right))
    }

    /// Depth of the deepest leaf; a lone leaf has height 0
    pub fn height(&self) -> usize {
        match self {
            Self::Leaf(_) => 0,
            Self::Branch(left, right) => 1 + left.height().max(right.height()),
        }
    }

    /// Leaves in pre-order
    pub fn leaves(&self) -> Vec<&T> {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a T>) {
        match self {
            Self::Leaf(value) => out.push(value),
            Self::Branch(left, right) => {
                left.collect_leaves(out);
                right.collect_leaves(out);
            }
        }
    }
}

impl<T: DeserializeOwned> ShardTree<T> {
    /// Parse the nested pair-array form: `[left, right]` is a branch and any
    /// non-array value is a leaf.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Array(items) if items.is_empty() => Err(CoreError::EmptyShardTree),
            _ => Self::parse_node(value, 0),
        }
    }

    fn parse_node(value: &Value, depth: usize) -> Result<Self> {
        if depth > MAX_SHARD_DEPTH {
            return Err(CoreError::ShardTreeTooDeep {
                depth,
                max: MAX_SHARD_DEPTH,
            });
        }
        match value {
            Value::Array(items) => match items.as_slice() {
                [left, right] => Ok(Self::branch(
                    Self::parse_node(left, depth + 1)?,
                    Self::parse_node(right, depth + 1)?,
                )),
                other => Err(CoreError::Validation(format!(
                    "shard tree branch must have exactly two children, got {}",
                    other.len()
                ))),
            },
            leaf => Ok(Self::Leaf(T::deserialize(leaf)?)),
        }
    }
}

/// Where a shard lives
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "DescriptorRepr")]
pub struct ShardDescriptor {
    /// Node name, unique within the infrastructure
    pub name: String,
    /// Base URL of the node, if reachable remotely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ShardDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

impl fmt::Display for ShardDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.url {
            Some(url) => write!(f, "{} ({})", self.name, url),
            None => f.write_str(&self.name),
        }
    }
}

/// Leaves may be written as a bare URL/name string or as an object
#[derive(Deserialize)]
#[serde(untagged)]
enum DescriptorRepr {
    Named(String),
    Full {
        name: String,
        #[serde(default)]
        url: Option<String>,
    },
}

impl From<DescriptorRepr> for ShardDescriptor {
    fn from(repr: DescriptorRepr) -> Self {
        match repr {
            DescriptorRepr::Named(text) if text.contains("://") => Self {
                name: text.clone(),
                url: Some(text),
            },
            DescriptorRepr::Named(name) => Self::new(name),
            DescriptorRepr::Full { name, url } => Self { name, url },
        }
    }
}

/// Flat id -> shard table
#[derive(Clone, Debug, PartialEq)]
pub struct ShardIndex<T> {
    table: Vec<T>,
    bits: u32,
    mask: u64,
}

impl<T: Clone> ShardIndex<T> {
    /// Flatten `tree` into a fully populated table of `2^height` slots.
    ///
    /// Each leaf lands on the slot spelled by its path (right = 1, root bit
    /// most significant, padded to the height). Slots under a shallow leaf
    /// are then filled, highest first, from the nearest populated ancestor
    /// slot, found by clearing the lowest set bit.
    pub fn build(tree: &ShardTree<T>) -> Result<Self> {
        let height = tree.height();
        if height > MAX_SHARD_DEPTH {
            return Err(CoreError::ShardTreeTooDeep {
                depth: height,
                max: MAX_SHARD_DEPTH,
            });
        }

        let mut slots: Vec<Option<T>> = vec![None; 1usize << height];
        place(tree, 0, 0, height, &mut slots);

        for slot in (0..slots.len()).rev() {
            if slots[slot].is_some() {
                continue;
            }
            let mut ancestor = slot;
            while ancestor != 0 && slots[ancestor].is_none() {
                ancestor &= ancestor - 1;
            }
            slots[slot] = slots[ancestor].clone();
        }

        let table = slots
            .into_iter()
            .enumerate()
            .map(|(slot, value)| {
                value.ok_or_else(|| {
                    CoreError::Validation(format!("shard slot {} has no covering leaf", slot))
                })
            })
            .collect::<Result<Vec<T>>>()?;

        let bits = table_bits(table.len());
        let mask = (1u64 << bits) - 1;
        debug!(slots = table.len(), bits, "built shard index");
        Ok(Self { table, bits, mask })
    }

    /// Shard owning `id`: `table[id & mask]`
    pub fn find_server(&self, id: u64) -> Result<&T> {
        let out_of_range = || CoreError::RoutingRange {
            id,
            bits: self.bits,
        };
        let slot = usize::try_from(id & self.mask).map_err(|_| out_of_range())?;
        self.table.get(slot).ok_or_else(out_of_range)
    }
}

impl<T> ShardIndex<T> {
    pub fn table(&self) -> &[T] {
        &self.table
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    /// Slots held by shards matching `owns`, ascending
    pub fn slots_where(&self, mut owns: impl FnMut(&T) -> bool) -> Vec<u64> {
        (0u64..)
            .zip(&self.table)
            .filter(|(_, shard)| owns(shard))
            .map(|(slot, _)| slot)
            .collect()
    }

    /// Id for the `sequence`-th value of a shard's counter: the sequence in
    /// the high bits, one of `slots` (round-robin) in the low bits. Every
    /// result routes back to one of `slots`, and distinct sequences never
    /// share an id.
    pub fn compose_id(&self, sequence: u64, slots: &[u64]) -> Result<u64> {
        if slots.is_empty() {
            return Err(CoreError::Validation("no slot to place the id in".to_string()));
        }
        let slot = slots[(sequence % slots.len() as u64) as usize];
        if slot > self.mask {
            return Err(CoreError::RoutingRange { id: slot, bits: self.bits });
        }
        sequence
            .checked_mul(1u64 << self.bits)
            .map(|high| high | slot)
            .ok_or(CoreError::RoutingRange {
                id: sequence,
                bits: self.bits,
            })
    }
}

fn place<T: Clone>(node: &ShardTree<T>, depth: usize, path: usize, height: usize, slots: &mut [Option<T>]) {
    match node {
        ShardTree::Leaf(value) => slots[path << (height - depth)] = Some(value.clone()),
        ShardTree::Branch(left, right) => {
            place(left, depth + 1, path << 1, height, slots);
            place(right, depth + 1, (path << 1) | 1, height, slots);
        }
    }
}

/// `ceil(log2(len))`
fn table_bits(len: usize) -> u32 {
    if len <= 1 {
        0
    } else {
        usize::BITS - (len - 1).leading_zeros()
    }
}

/// Build the flat routing table for `tree`
pub fn build_index<T: Clone>(tree: &ShardTree<T>) -> Result<ShardIndex<T>> {
    ShardIndex::build(tree)
}
