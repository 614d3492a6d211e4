//! Augmented AVL tree over arena-resident entities.
//!
//! The timeline orders entities by `(deadline, seq)`, where `seq` is a
//! per-queue insertion counter, so equal deadlines keep FIFO order and
//! every key is unique. Each node caches two subtree aggregates:
//!
//! - `min_deadline`: the smallest deadline below it (the leftmost key).
//! - `links.min_vruntime`: the smallest vruntime below it.
//!
//! Eligibility is monotone in vruntime (an entity is eligible iff its
//! vruntime is at or below the queue average), so the vruntime aggregate
//! tells whether a subtree holds *any* eligible entity. That turns "earliest
//! deadline among eligible entities" into a single root-to-leaf descent.
//!
//! Links live inside [`SchedEntity`](crate::entity::SchedEntity); the tree
//! itself only stores the root handle.

use crate::entity::EntityArena;
use crate::types::{EntityId, Vtime};

#[derive(Debug, Default)]
pub(crate) struct Timeline {
    root: Option<EntityId>,
    len: usize,
}

fn key(arena: &EntityArena, id: EntityId) -> (Vtime, u64) {
    let se = &arena[id];
    (se.deadline, se.seq)
}

fn height(arena: &EntityArena, node: Option<EntityId>) -> i32 {
    node.map_or(0, |n| arena[n].links.height as i32)
}

fn balance_factor(arena: &EntityArena, n: EntityId) -> i32 {
    height(arena, arena[n].links.left) - height(arena, arena[n].links.right)
}

/// Recompute height and aggregates of `n` from its children.
fn update(arena: &mut EntityArena, n: EntityId) {
    let links = arena[n].links;
    let mut min_deadline = arena[n].deadline;
    let mut min_vruntime = arena[n].vruntime;
    for child in [links.left, links.right].into_iter().flatten() {
        min_deadline = min_deadline.min(arena[child].min_deadline);
        min_vruntime = min_vruntime.min(arena[child].links.min_vruntime);
    }
    let h = 1 + height(arena, links.left).max(height(arena, links.right));

    let se = &mut arena[n];
    se.min_deadline = min_deadline;
    se.links.min_vruntime = min_vruntime;
    se.links.height = h as u8;
}

fn rotate_right(arena: &mut EntityArena, n: EntityId) -> EntityId {
    let Some(l) = arena[n].links.left else {
        return n;
    };
    arena[n].links.left = arena[l].links.right;
    arena[l].links.right = Some(n);
    update(arena, n);
    update(arena, l);
    l
}

fn rotate_left(arena: &mut EntityArena, n: EntityId) -> EntityId {
    let Some(r) = arena[n].links.right else {
        return n;
    };
    arena[n].links.right = arena[r].links.left;
    arena[r].links.left = Some(n);
    update(arena, n);
    update(arena, r);
    r
}

fn rebalance(arena: &mut EntityArena, n: EntityId) -> EntityId {
    update(arena, n);
    let bf = balance_factor(arena, n);
    if bf > 1 {
        if let Some(l) = arena[n].links.left {
            if balance_factor(arena, l) < 0 {
                arena[n].links.left = Some(rotate_left(arena, l));
            }
        }
        return rotate_right(arena, n);
    }
    if bf < -1 {
        if let Some(r) = arena[n].links.right {
            if balance_factor(arena, r) > 0 {
                arena[n].links.right = Some(rotate_right(arena, r));
            }
        }
        return rotate_left(arena, n);
    }
    n
}

fn insert_at(arena: &mut EntityArena, node: Option<EntityId>, id: EntityId) -> EntityId {
    let Some(n) = node else {
        arena[id].links.left = None;
        arena[id].links.right = None;
        update(arena, id);
        return id;
    };
    let links = arena[n].links;
    if key(arena, id) < key(arena, n) {
        let left = insert_at(arena, links.left, id);
        arena[n].links.left = Some(left);
    } else {
        let right = insert_at(arena, links.right, id);
        arena[n].links.right = Some(right);
    }
    rebalance(arena, n)
}

/// Detach the leftmost node of the subtree at `n`. Returns the new subtree
/// root and the detached node.
fn take_min(arena: &mut EntityArena, n: EntityId) -> (Option<EntityId>, EntityId) {
    match arena[n].links.left {
        None => (arena[n].links.right, n),
        Some(l) => {
            let (left, min) = take_min(arena, l);
            arena[n].links.left = left;
            (Some(rebalance(arena, n)), min)
        }
    }
}

fn remove_at(
    arena: &mut EntityArena,
    node: Option<EntityId>,
    target: (Vtime, u64),
    id: EntityId,
) -> (Option<EntityId>, bool) {
    let Some(n) = node else {
        return (None, false);
    };
    if n == id {
        let links = arena[n].links;
        let replacement = match (links.left, links.right) {
            (None, None) => None,
            (Some(child), None) | (None, Some(child)) => Some(child),
            (Some(left), Some(right)) => {
                let (right, succ) = take_min(arena, right);
                arena[succ].links.left = Some(left);
                arena[succ].links.right = right;
                Some(rebalance(arena, succ))
            }
        };
        arena[n].links.left = None;
        arena[n].links.right = None;
        return (replacement, true);
    }
    let links = arena[n].links;
    let found = if target < key(arena, n) {
        let (left, found) = remove_at(arena, links.left, target, id);
        arena[n].links.left = left;
        found
    } else {
        let (right, found) = remove_at(arena, links.right, target, id);
        arena[n].links.right = right;
        found
    };
    (Some(rebalance(arena, n)), found)
}

impl Timeline {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Insert `id` keyed by its current `(deadline, seq)`. The key must not
    /// change while the entity is in the tree.
    pub fn insert(&mut self, arena: &mut EntityArena, id: EntityId) {
        self.root = Some(insert_at(arena, self.root, id));
        self.len += 1;
    }

    /// Remove `id`. Returns false if it was not in the tree.
    pub fn remove(&mut self, arena: &mut EntityArena, id: EntityId) -> bool {
        let target = key(arena, id);
        let (root, found) = remove_at(arena, self.root, target, id);
        self.root = root;
        if found {
            self.len -= 1;
        }
        found
    }

    /// Entity with the earliest deadline.
    pub fn first(&self, arena: &EntityArena) -> Option<EntityId> {
        let mut node = self.root?;
        while let Some(left) = arena[node].links.left {
            node = left;
        }
        Some(node)
    }

    pub fn min_deadline(&self, arena: &EntityArena) -> Option<Vtime> {
        self.root.map(|r| arena[r].min_deadline)
    }

    pub fn min_vruntime(&self, arena: &EntityArena) -> Option<Vtime> {
        self.root.map(|r| arena[r].links.min_vruntime)
    }

    /// Earliest-deadline entity whose vruntime satisfies `eligible`.
    ///
    /// `eligible` must be monotone: if it holds for a vruntime it holds for
    /// every smaller one.
    pub fn first_eligible(
        &self,
        arena: &EntityArena,
        eligible: impl Fn(Vtime) -> bool,
    ) -> Option<EntityId> {
        let mut node = self.root.filter(|&r| eligible(arena[r].links.min_vruntime));
        while let Some(n) = node {
            let links = arena[n].links;
            if let Some(left) = links.left {
                if eligible(arena[left].links.min_vruntime) {
                    node = Some(left);
                    continue;
                }
            }
            if eligible(arena[n].vruntime) {
                return Some(n);
            }
            node = links
                .right
                .filter(|&r| eligible(arena[r].links.min_vruntime));
        }
        None
    }

    /// All entities in deadline order.
    pub fn in_order(&self, arena: &EntityArena) -> Vec<EntityId> {
        let mut out = Vec::with_capacity(self.len);
        let mut stack = Vec::new();
        let mut node = self.root;
        while node.is_some() || !stack.is_empty() {
            while let Some(n) = node {
                stack.push(n);
                node = arena[n].links.left;
            }
            if let Some(n) = stack.pop() {
                out.push(n);
                node = arena[n].links.right;
            }
        }
        out
    }

    /// Panics unless keys are ordered, the tree is balanced and every
    /// cached aggregate is exact.
    #[cfg(test)]
    pub fn check_invariants(&self, arena: &EntityArena) {
        fn walk(arena: &EntityArena, node: Option<EntityId>) -> (i32, usize) {
            let Some(n) = node else {
                return (0, 0);
            };
            let links = arena[n].links;
            let (hl, cl) = walk(arena, links.left);
            let (hr, cr) = walk(arena, links.right);
            assert!((hl - hr).abs() <= 1, "unbalanced at {n}");
            assert_eq!(links.height as i32, 1 + hl.max(hr), "stale height at {n}");
            let mut min_d = arena[n].deadline;
            let mut min_v = arena[n].vruntime;
            if let Some(l) = links.left {
                assert!(key(arena, l) < key(arena, n));
                min_d = min_d.min(arena[l].min_deadline);
                min_v = min_v.min(arena[l].links.min_vruntime);
            }
            if let Some(r) = links.right {
                assert!(key(arena, r) > key(arena, n));
                min_d = min_d.min(arena[r].min_deadline);
                min_v = min_v.min(arena[r].links.min_vruntime);
            }
            assert_eq!(arena[n].min_deadline, min_d, "stale min_deadline at {n}");
            assert_eq!(links.min_vruntime, min_v, "stale min_vruntime at {n}");
            (1 + hl.max(hr), 1 + cl + cr)
        }
        let (_, count) = walk(arena, self.root);
        assert_eq!(count, self.len);
        let order = self.in_order(arena);
        for pair in order.windows(2) {
            assert!(key(arena, pair[0]) < key(arena, pair[1]));
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::entity::{EntityKind, SchedEntity};
    use crate::types::{GroupId, RqIdx};
    use crate::weight::LoadWeight;

    fn spawn(arena: &mut EntityArena, seq: u64, deadline: u64, vruntime: u64) -> EntityId {
        let mut se = SchedEntity::new(
            EntityKind::Group(GroupId(seq + 2)),
            LoadWeight::default(),
            RqIdx(0),
            0,
        );
        se.seq = seq;
        se.deadline = Vtime(deadline);
        se.vruntime = Vtime(vruntime);
        arena.insert(se)
    }

    #[test]
    fn test_fifo_on_equal_deadline() {
        let mut arena = EntityArena::default();
        let mut tl = Timeline::default();
        let ids: Vec<_> = (0..5).map(|i| spawn(&mut arena, i, 100, 0)).collect();
        for &id in &ids {
            tl.insert(&mut arena, id);
        }
        tl.check_invariants(&arena);
        assert_eq!(tl.in_order(&arena), ids);
        assert_eq!(tl.first(&arena), Some(ids[0]));
    }

    #[test]
    fn test_first_eligible() {
        let mut arena = EntityArena::default();
        let mut tl = Timeline::default();
        // (deadline, vruntime)
        let a = spawn(&mut arena, 0, 10, 50);
        let b = spawn(&mut arena, 1, 20, 5);
        let c = spawn(&mut arena, 2, 30, 1);
        for id in [a, b, c] {
            tl.insert(&mut arena, id);
        }
        assert_eq!(tl.first_eligible(&arena, |v| v <= Vtime(100)), Some(a));
        assert_eq!(tl.first_eligible(&arena, |v| v <= Vtime(10)), Some(b));
        assert_eq!(tl.first_eligible(&arena, |v| v <= Vtime(1)), Some(c));
        assert_eq!(tl.first_eligible(&arena, |v| v < Vtime(1)), None);
        assert_eq!(tl.min_deadline(&arena), Some(Vtime(10)));
        assert_eq!(tl.min_vruntime(&arena), Some(Vtime(1)));
    }

    #[test]
    fn test_randomized_against_sorted_vec() {
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        let mut arena = EntityArena::default();
        let mut tl = Timeline::default();
        let mut live: Vec<EntityId> = Vec::new();

        for seq in 0..2_000u64 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let id = spawn(
                    &mut arena,
                    seq,
                    rng.gen_range(0..200),
                    rng.gen_range(0..1_000),
                );
                tl.insert(&mut arena, id);
                live.push(id);
            } else {
                let victim = live.swap_remove(rng.gen_range(0..live.len()));
                assert!(tl.remove(&mut arena, victim));
                assert!(!tl.remove(&mut arena, victim));
            }

            if seq % 50 == 0 {
                tl.check_invariants(&arena);
            }

            let mut expected = live.clone();
            expected.sort_by_key(|&id| key(&arena, id));
            assert_eq!(tl.first(&arena), expected.first().copied());

            let bound = Vtime(rng.gen_range(0..1_000));
            let brute = expected
                .iter()
                .copied()
                .find(|&id| arena[id].vruntime <= bound);
            assert_eq!(tl.first_eligible(&arena, |v| v <= bound), brute);
        }
        tl.check_invariants(&arena);
        assert_eq!(tl.len(), live.len());
    }
}
