//! Identity matching between local entities and remote observations.
//!
//! Matching precedence:
//! 1. exact external identifier equality;
//! 2. for locals without an external identifier, natural key (kind and
//!    name) equality within the same scope.
//!
//! An observation matches at most one local. When several observations
//! share a natural key, the first in listing order is paired and the rest
//! are reported as external-only.

use std::collections::HashMap;

use crate::provider::ExternalObservation;
use crate::state::{Entity, ScopeRef};

/// Output of [`IdentityMatcher::match_sets`].
#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    /// Matched pairs, in local order.
    pub pairs: Vec<(Entity, ExternalObservation)>,
    /// Locals with no counterpart, in local order.
    pub local_only: Vec<Entity>,
    /// Observations with no counterpart, in listing order.
    pub external_only: Vec<ExternalObservation>,
}

/// Pure matcher over caller-supplied snapshots.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityMatcher;

impl IdentityMatcher {
    /// Partitions `local` and `external` observed in `scope`.
    #[must_use]
    pub fn match_sets(
        scope: &ScopeRef,
        local: Vec<Entity>,
        external: Vec<ExternalObservation>,
    ) -> MatchOutcome {
        let mut by_external_id: HashMap<&str, usize> = HashMap::new();
        for (idx, obs) in external.iter().enumerate() {
            by_external_id.entry(obs.external_id.as_str()).or_insert(idx);
        }

        let mut taken = vec![false; external.len()];
        let mut paired_with: Vec<Option<usize>> = vec![None; local.len()];

        // Pass 1: external identifiers.
        for (li, entity) in local.iter().enumerate() {
            let Some(ext) = entity.external_id.as_deref() else {
                continue;
            };
            if let Some(&xi) = by_external_id.get(ext) {
                if !taken[xi] {
                    taken[xi] = true;
                    paired_with[li] = Some(xi);
                }
            }
        }

        // Pass 2: natural key, only for locals never bound remotely.
        for (li, entity) in local.iter().enumerate() {
            if entity.external_id.is_some() || &entity.scope != scope {
                continue;
            }
            let candidate = external.iter().enumerate().position(|(xi, obs)| {
                !taken[xi] && obs.kind == entity.kind && obs.name == entity.name
            });
            if let Some(xi) = candidate {
                taken[xi] = true;
                paired_with[li] = Some(xi);
            }
        }
        drop(by_external_id);

        let mut slots: Vec<Option<ExternalObservation>> = external.into_iter().map(Some).collect();
        let mut outcome = MatchOutcome::default();

        for (entity, pair) in local.into_iter().zip(paired_with) {
            match pair.and_then(|xi| slots[xi].take()) {
                Some(obs) => outcome.pairs.push((entity, obs)),
                None => outcome.local_only.push(entity),
            }
        }
        outcome.external_only = slots.into_iter().flatten().collect();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ProviderKind, ResourceKind};

    fn scope() -> ScopeRef {
        ScopeRef::new(ProviderKind::Aws, "acct", "us-east-1")
    }

    fn local(name: &str, ext: Option<&str>) -> Entity {
        let mut e = Entity::new(ResourceKind::Network, scope(), name);
        e.external_id = ext.map(String::from);
        e
    }

    fn remote(ext: &str, name: &str) -> ExternalObservation {
        ExternalObservation::new(ResourceKind::Network, ext, name)
    }

    #[test]
    fn test_external_id_partition() {
        let x = local("x", Some("e1"));
        let y = local("y", Some("e2"));
        let outcome = IdentityMatcher::match_sets(
            &scope(),
            vec![x.clone(), y.clone()],
            vec![remote("e1", "x"), remote("e3", "z")],
        );

        assert_eq!(outcome.local_only.len(), 1);
        assert_eq!(outcome.local_only[0].id, y.id);
        assert_eq!(outcome.pairs.len(), 1);
        assert_eq!(outcome.pairs[0].0.id, x.id);
        assert_eq!(outcome.pairs[0].1.external_id, "e1");
        assert_eq!(outcome.external_only.len(), 1);
        assert_eq!(outcome.external_only[0].external_id, "e3");
    }

    #[test]
    fn test_natural_key_tie_takes_first_listed() {
        let pending = local("web", None);
        let outcome = IdentityMatcher::match_sets(
            &scope(),
            vec![pending.clone()],
            vec![remote("e7", "web"), remote("e8", "web")],
        );

        assert_eq!(outcome.pairs.len(), 1);
        assert_eq!(outcome.pairs[0].1.external_id, "e7");
        assert_eq!(outcome.external_only.len(), 1);
        assert_eq!(outcome.external_only[0].external_id, "e8");
        assert!(outcome.local_only.is_empty());
    }

    #[test]
    fn test_bound_local_never_falls_back_to_name() {
        let bound = local("web", Some("gone"));
        let outcome =
            IdentityMatcher::match_sets(&scope(), vec![bound], vec![remote("e1", "web")]);
        assert!(outcome.pairs.is_empty());
        assert_eq!(outcome.local_only.len(), 1);
        assert_eq!(outcome.external_only.len(), 1);
    }

    #[test]
    fn test_external_id_wins_over_name() {
        let by_name = local("db", None);
        let by_id = local("other", Some("e1"));
        let outcome = IdentityMatcher::match_sets(
            &scope(),
            vec![by_name.clone(), by_id.clone()],
            vec![remote("e1", "db")],
        );
        assert_eq!(outcome.pairs.len(), 1);
        assert_eq!(outcome.pairs[0].0.id, by_id.id);
        assert_eq!(outcome.local_only[0].id, by_name.id);
    }

    #[test]
    fn test_partition_is_complete_and_disjoint() {
        let names = ["a", "b", "c", "d", "e", "f"];
        for mask in 0u32..64 {
            let locals: Vec<Entity> = names
                .iter()
                .enumerate()
                .map(|(i, n)| {
                    let ext = format!("e{i}");
                    if mask & (1 << i) == 0 {
                        local(n, Some(&ext))
                    } else {
                        local(n, None)
                    }
                })
                .collect();
            let externals: Vec<ExternalObservation> = names
                .iter()
                .enumerate()
                .filter(|(i, _)| (mask >> i) % 3 != 0)
                .map(|(i, n)| remote(&format!("e{i}"), n))
                .chain(std::iter::once(remote("extra", "a")))
                .collect();

            let outcome =
                IdentityMatcher::match_sets(&scope(), locals.clone(), externals.clone());

            let mut seen_local: Vec<&str> = outcome
                .local_only
                .iter()
                .map(|e| e.id.as_str())
                .chain(outcome.pairs.iter().map(|(e, _)| e.id.as_str()))
                .collect();
            seen_local.sort_unstable();
            let mut expected_local: Vec<&str> = locals.iter().map(|e| e.id.as_str()).collect();
            expected_local.sort_unstable();
            assert_eq!(seen_local, expected_local);

            let mut seen_ext: Vec<&str> = outcome
                .external_only
                .iter()
                .map(|o| o.external_id.as_str())
                .chain(outcome.pairs.iter().map(|(_, o)| o.external_id.as_str()))
                .collect();
            seen_ext.sort_unstable();
            let mut expected_ext: Vec<&str> =
                externals.iter().map(|o| o.external_id.as_str()).collect();
            expected_ext.sort_unstable();
            assert_eq!(seen_ext, expected_ext);
        }
    }
}
