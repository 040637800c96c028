//! Batch composition.
//!
//! Items of one tier are grouped by control family so a call can cite
//! cross-control patterns. Each family is cut into full batches first and
//! the remainders of small families are packed together, so no batch
//! exceeds `max_size` and every item lands in exactly one batch.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::catalog::{ControlFamily, ControlId};
use crate::prioritize::{ControlTier, Depth};

/// One external reasoning call's worth of work.
#[derive(Debug, Clone, Serialize)]
pub struct Batch<T> {
    pub id: String,
    pub tier: Option<ControlTier>,
    pub depth: Depth,
    pub items: Vec<T>,
}

impl<T> Batch<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Batch-shaping knobs for one pass.
#[derive(Debug, Clone, Copy)]
pub struct BatchShape {
    pub max_size: usize,
    pub group_by_family: bool,
}

/// Split `items` into batches. `Depth::Individual` forces one item per
/// batch; `Depth::Skip` yields nothing.
pub fn build_batches<T>(
    label: &str,
    tier: Option<ControlTier>,
    depth: Depth,
    items: Vec<T>,
    key: impl Fn(&T) -> ControlId,
    shape: BatchShape,
) -> Vec<Batch<T>> {
    let max_size = match depth {
        Depth::Skip => return Vec::new(),
        Depth::Individual => 1,
        Depth::Batched => shape.max_size.max(1),
    };

    let chunks = if shape.group_by_family && max_size > 1 {
        family_chunks(items, &key, max_size)
    } else {
        plain_chunks(items, max_size)
    };

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, items)| Batch {
            id: format!("{label}-{:03}", i + 1),
            tier,
            depth,
            items,
        })
        .collect()
}

fn plain_chunks<T>(items: Vec<T>, max_size: usize) -> Vec<Vec<T>> {
    let mut out = Vec::new();
    let mut current = Vec::with_capacity(max_size);
    for item in items {
        current.push(item);
        if current.len() == max_size {
            out.push(std::mem::replace(&mut current, Vec::with_capacity(max_size)));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn family_chunks<T>(items: Vec<T>, key: &impl Fn(&T) -> ControlId, max_size: usize) -> Vec<Vec<T>> {
    let mut by_family: BTreeMap<ControlFamily, Vec<T>> = BTreeMap::new();
    for item in items {
        by_family.entry(key(&item).family()).or_default().push(item);
    }

    let mut out = Vec::new();
    let mut leftovers = Vec::new();
    for (_, members) in by_family {
        let mut chunks = plain_chunks(members, max_size);
        if chunks.last().is_some_and(|c| c.len() < max_size) {
            if let Some(tail) = chunks.pop() {
                leftovers.extend(tail);
            }
        }
        out.extend(chunks);
    }
    out.extend(plain_chunks(leftovers, max_size));
    out
}
