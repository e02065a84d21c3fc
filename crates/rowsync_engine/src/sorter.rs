//! Parent-first ordering of tables.
//!
//! Kahn's algorithm over child → parent relations. Ties are broken by
//! declaration order. When only cycles remain, the dependencies of the
//! earliest-declared remaining table are dropped so sorting always
//! completes. Self-references are ignored.

use rowsync_protocol::{SyncRelation, SyncTable};

/// Returns the indexes of `names` in parent-first order.
pub fn dependency_order(names: &[String], relations: &[SyncRelation]) -> Vec<usize> {
    let count = names.len();
    let position = |name: &str| names.iter().position(|n| n == name);

    // parents[i] = tables that must precede table i
    let mut parents: Vec<Vec<usize>> = vec![Vec::new(); count];
    for relation in relations {
        let (Some(child), Some(parent)) = (
            position(&relation.child_table),
            position(&relation.parent_table),
        ) else {
            continue;
        };
        if child != parent && !parents[child].contains(&parent) {
            parents[child].push(parent);
        }
    }

    let mut placed = vec![false; count];
    let mut order = Vec::with_capacity(count);

    while order.len() < count {
        let ready = (0..count).find(|&i| !placed[i] && parents[i].iter().all(|&p| placed[p]));

        let next = match ready {
            Some(i) => i,
            None => {
                // Only cycles remain.
                let Some(i) = (0..count).find(|&i| !placed[i]) else {
                    break;
                };
                tracing::debug!(table = %names[i], "dependency cycle broken");
                parents[i].retain(|&p| placed[p]);
                i
            }
        };

        placed[next] = true;
        order.push(next);
    }

    order
}

/// Sorts tables parent-first.
pub fn sort_tables(tables: Vec<SyncTable>, relations: &[SyncRelation]) -> Vec<SyncTable> {
    let names: Vec<String> = tables.iter().map(|t| t.name.clone()).collect();
    let order = dependency_order(&names, relations);

    let mut slots: Vec<Option<SyncTable>> = tables.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|i| slots.get_mut(i).and_then(Option::take))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn fk(child: &str, parent: &str) -> SyncRelation {
        SyncRelation::new(format!("fk_{child}_{parent}"), child, "parent_id", parent, "id")
    }

    fn ordered(list: &[&str], relations: &[SyncRelation]) -> Vec<String> {
        let names = names(list);
        dependency_order(&names, relations)
            .into_iter()
            .map(|i| names[i].clone())
            .collect()
    }

    #[test]
    fn parents_come_first() {
        let order = ordered(
            &["product", "customer", "product_category"],
            &[fk("product", "product_category")],
        );
        assert_eq!(order, vec!["customer", "product_category", "product"]);
    }

    #[test]
    fn declaration_order_breaks_ties() {
        let order = ordered(&["c", "a", "b"], &[]);
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn self_references_are_ignored() {
        let order = ordered(&["employee", "dept"], &[fk("employee", "employee")]);
        assert_eq!(order, vec!["employee", "dept"]);
    }

    #[test]
    fn cycles_do_not_fail() {
        let order = ordered(&["a", "b", "c"], &[fk("a", "b"), fk("b", "a"), fk("c", "a")]);
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn unknown_tables_are_ignored() {
        let order = ordered(&["a"], &[fk("a", "missing")]);
        assert_eq!(order, vec!["a"]);
    }

    proptest! {
        #[test]
        fn acyclic_relations_are_respected(
            count in 1usize..12,
            edges in proptest::collection::vec((0usize..12, 0usize..12), 0..30),
        ) {
            let list: Vec<String> = (0..count).map(|i| format!("t{i}")).collect();
            // Only keep edges pointing to an earlier-numbered table: acyclic by construction.
            let relations: Vec<SyncRelation> = edges
                .into_iter()
                .filter(|(c, p)| *c < count && *p < count && p < c)
                .map(|(c, p)| fk(&list[c], &list[p]))
                .collect();

            // Shuffle declaration order by reversing.
            let declared: Vec<String> = list.iter().rev().cloned().collect();
            let order = dependency_order(&declared, &relations);

            let mut seen = order.clone();
            seen.sort_unstable();
            prop_assert_eq!(seen, (0..count).collect::<Vec<_>>());

            let rank = |name: &str| {
                order.iter().position(|&i| declared[i] == name).unwrap()
            };
            for r in &relations {
                prop_assert!(rank(&r.parent_table) < rank(&r.child_table));
            }
        }
    }
}
