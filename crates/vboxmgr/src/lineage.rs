//! Disk medium lineage.
//!
//! Media form a parent → child forest.  The first machine id on a medium is
//! its owner; a medium owned by a different machine than its parent is where
//! that machine's linked clone enters the tree.

use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use vboxmgr_endpoint::{HypervisorSession, MediumRecord};

use crate::error::VboxResult;

#[derive(Debug, Clone, Default)]
pub struct MediumGraph {
    nodes: HashMap<Uuid, MediumRecord>,
}

impl MediumGraph {
    pub fn from_records(records: impl IntoIterator<Item = MediumRecord>) -> Self {
        Self {
            nodes: records.into_iter().map(|m| (m.id, m)).collect(),
        }
    }

    /// Loads `start` and every ancestor above it.
    pub async fn ancestry(session: &dyn HypervisorSession, start: Uuid) -> VboxResult<Self> {
        let mut graph = Self::default();
        let mut next = Some(start);
        while let Some(id) = next {
            if graph.nodes.contains_key(&id) {
                break;
            }
            let medium = session.medium(id).await?;
            next = medium.parent;
            graph.nodes.insert(id, medium);
        }
        Ok(graph)
    }

    /// Loads every medium below `root`.
    pub async fn load_subtree(&mut self, session: &dyn HypervisorSession, root: Uuid) -> VboxResult<()> {
        let mut pending = vec![root];
        while let Some(id) = pending.pop() {
            let medium = match self.nodes.get(&id) {
                Some(known) => known.clone(),
                None => {
                    let fetched = session.medium(id).await?;
                    self.nodes.insert(id, fetched.clone());
                    fetched
                }
            };
            pending.extend(medium.children.iter().filter(|c| !self.nodes.contains_key(*c)));
        }
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<&MediumRecord> {
        self.nodes.get(&id)
    }

    pub fn parent(&self, id: Uuid) -> Option<Uuid> {
        self.nodes.get(&id).and_then(|m| m.parent)
    }

    pub fn owner(&self, id: Uuid) -> Option<Uuid> {
        self.nodes.get(&id).and_then(MediumRecord::owner)
    }

    /// Topmost loaded ancestor of `id`.
    pub fn base(&self, id: Uuid) -> Uuid {
        let mut current = id;
        let mut seen = HashSet::new();
        while let Some(parent) = self.parent(current) {
            if !self.nodes.contains_key(&parent) || !seen.insert(parent) {
                break;
            }
            current = parent;
        }
        current
    }

    /// Climbs from `id` while the parent is still owned by `machine`.
    pub fn climb_while_owned(&self, id: Uuid, machine: Uuid) -> Uuid {
        let mut current = id;
        let mut seen = HashSet::new();
        while let Some(parent) = self.parent(current) {
            if self.owner(parent) != Some(machine) || !seen.insert(parent) {
                break;
            }
            current = parent;
        }
        current
    }

    /// Descendants of `root`, children before their parents.  `root` itself
    /// is not included.
    pub fn post_order(&self, root: Uuid) -> Vec<Uuid> {
        let mut order = Vec::new();
        let mut visited = HashSet::from([root]);
        let mut stack: Vec<(Uuid, bool)> = self.children(root).map(|c| (c, false)).collect();
        stack.reverse();

        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            stack.push((id, true));
            let mut children: Vec<(Uuid, bool)> = self
                .children(id)
                .filter(|c| !visited.contains(c))
                .map(|c| (c, false))
                .collect();
            children.reverse();
            stack.extend(children);
        }
        order
    }

    /// Machines other than `target` whose disks enter the subtree under
    /// `root`, deepest first, each listed once.
    pub fn dependents(&self, root: Uuid, target: Uuid) -> Vec<Uuid> {
        let mut machines = Vec::new();
        for id in self.post_order(root) {
            let owner = self.owner(id);
            let parent_owner = self.parent(id).and_then(|p| self.owner(p));
            match owner {
                Some(machine) if owner != parent_owner && machine != target => {
                    if !machines.contains(&machine) {
                        machines.push(machine);
                    }
                }
                _ => {}
            }
        }
        machines
    }

    fn children(&self, id: Uuid) -> impl Iterator<Item = Uuid> + '_ {
        self.nodes
            .get(&id)
            .into_iter()
            .flat_map(|m| m.children.iter().copied())
            .filter(|c| self.nodes.contains_key(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn medium(id: Uuid, parent: Option<Uuid>, children: &[Uuid], owner: Uuid) -> MediumRecord {
        MediumRecord {
            id,
            parent,
            children: children.to_vec(),
            machine_ids: vec![owner],
            logical_size: 10,
            size: 1,
        }
    }

    /// base: m0 ─┬─ m0d (base)
    ///           └─ l1 (c1) ─┬─ l1d (c1)
    ///                       └─ x (c2) ── y (c3)
    struct Fixture {
        graph: MediumGraph,
        base: Uuid,
        c1: Uuid,
        c2: Uuid,
        c3: Uuid,
        m0: Uuid,
        l1: Uuid,
        l1d: Uuid,
        x: Uuid,
        y: Uuid,
    }

    fn fixture() -> Fixture {
        let [base, c1, c2, c3] = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let [m0, m0d, l1, l1d, x, y] = [
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
        ];
        let graph = MediumGraph::from_records([
            medium(m0, None, &[m0d, l1], base),
            medium(m0d, Some(m0), &[], base),
            medium(l1, Some(m0), &[l1d, x], c1),
            medium(l1d, Some(l1), &[], c1),
            medium(x, Some(l1), &[y], c2),
            medium(y, Some(x), &[], c3),
        ]);
        Fixture { graph, base, c1, c2, c3, m0, l1, l1d, x, y }
    }

    #[test]
    fn base_is_topmost_ancestor() {
        let f = fixture();
        assert_eq!(f.graph.base(f.y), f.m0);
        assert_eq!(f.graph.base(f.m0), f.m0);
        assert_eq!(f.graph.owner(f.m0), Some(f.base));
    }

    #[test]
    fn climb_stops_at_foreign_parent() {
        let f = fixture();
        assert_eq!(f.graph.climb_while_owned(f.l1d, f.c1), f.l1);
        assert_eq!(f.graph.climb_while_owned(f.y, f.c3), f.y);
        assert_eq!(f.graph.parent(f.l1), Some(f.m0));
    }

    #[test]
    fn post_order_visits_children_first() {
        let f = fixture();
        let order = f.graph.post_order(f.l1);
        assert_eq!(order, vec![f.l1d, f.y, f.x]);
        assert!(f.graph.post_order(f.y).is_empty());
    }

    #[test]
    fn dependents_are_deepest_first() {
        let f = fixture();
        assert_eq!(f.graph.dependents(f.l1, f.c1), vec![f.c3, f.c2]);
        assert_eq!(f.graph.dependents(f.m0, f.base), vec![f.c3, f.c2, f.c1]);
        assert!(f.graph.dependents(f.y, f.c3).is_empty());
    }

    #[test]
    fn cycles_do_not_hang() {
        let [a, b, owner] = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let graph = MediumGraph::from_records([
            medium(a, Some(b), &[b], owner),
            medium(b, Some(a), &[a], owner),
        ]);
        assert_eq!(graph.post_order(a), vec![b]);
        let _ = graph.base(a);
        let _ = graph.climb_while_owned(a, owner);
    }
}
