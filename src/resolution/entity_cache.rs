// src/resolution/entity_cache.rs
use std::collections::HashMap;
use uuid::Uuid;

use crate::matching::similarity::similarity;
use crate::models::core::{EntityKind, NamedEntity};

/// Fuzzy name matches must score strictly above this.
pub const FUZZY_NAME_FLOOR: f64 = 0.7;

/// Per-run arena of one entity kind with a lowercase-name index.
#[derive(Debug)]
pub struct NameCache {
    kind: EntityKind,
    entries: Vec<NamedEntity>,
    by_name: HashMap<String, Vec<usize>>,
    by_id: HashMap<Uuid, usize>,
}

impl NameCache {
    pub fn new(kind: EntityKind, rows: Vec<NamedEntity>) -> Self {
        let mut cache = Self {
            kind,
            entries: Vec::with_capacity(rows.len()),
            by_name: HashMap::new(),
            by_id: HashMap::new(),
        };
        for row in rows {
            cache.insert(row);
        }
        cache
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, entity: NamedEntity) -> usize {
        let idx = self.entries.len();
        self.by_name
            .entry(index_key(&entity.name))
            .or_default()
            .push(idx);
        self.by_id.insert(entity.id, idx);
        self.entries.push(entity);
        idx
    }

    pub fn get(&self, id: &Uuid) -> Option<&NamedEntity> {
        self.by_id.get(id).map(|idx| &self.entries[*idx])
    }

    pub fn name_of(&self, id: &Uuid) -> Option<&str> {
        self.get(id).map(|e| e.name.as_str())
    }

    /// Exact case-insensitive name first, then the best fuzzy match above the floor
    /// (first in arena order on ties). Rows whose secondary key conflicts with the one
    /// supplied are never returned.
    pub fn lookup(&self, name: &str, secondary_key: Option<&str>) -> Option<&NamedEntity> {
        let key = index_key(name);
        if key.is_empty() {
            return None;
        }

        let exact = self.by_name.get(&key).and_then(|indices| {
            indices
                .iter()
                .map(|idx| &self.entries[*idx])
                .find(|entry| secondary_key_compatible(entry, secondary_key))
        });
        if exact.is_some() {
            return exact;
        }

        let mut best: Option<(f64, &NamedEntity)> = None;
        for entry in &self.entries {
            if !secondary_key_compatible(entry, secondary_key) {
                continue;
            }
            let score = similarity(name, &entry.name);
            if score <= FUZZY_NAME_FLOOR {
                continue;
            }
            if best.map_or(true, |(top, _)| score > top) {
                best = Some((score, entry));
            }
        }
        best.map(|(_, entry)| entry)
    }
}

fn index_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn secondary_key_compatible(entry: &NamedEntity, wanted: Option<&str>) -> bool {
    match (wanted.map(str::trim), entry.secondary_key.as_deref().map(str::trim)) {
        (Some(wanted), Some(stored)) if !wanted.is_empty() && !stored.is_empty() => {
            wanted.eq_ignore_ascii_case(stored)
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(name: &str, key: Option<&str>) -> NamedEntity {
        NamedEntity {
            id: Uuid::new_v4(),
            group_id: Uuid::nil(),
            kind: EntityKind::Surgeon,
            name: name.to_string(),
            secondary_key: key.map(str::to_string),
        }
    }

    #[test]
    fn test_exact_lookup_is_case_insensitive() {
        let stored = entity("Carlos Almeida", None);
        let cache = NameCache::new(EntityKind::Surgeon, vec![stored.clone()]);
        assert_eq!(cache.lookup("CARLOS  ALMEIDA", None).map(|e| e.id), Some(stored.id));
        assert_eq!(cache.name_of(&stored.id), Some("Carlos Almeida"));
    }

    #[test]
    fn test_fuzzy_lookup_respects_floor_and_prefers_best() {
        let close = entity("Carlos Almeida", None);
        let closer = entity("Carlos Almeidaa", None);
        let cache = NameCache::new(
            EntityKind::Surgeon,
            vec![entity("Roberto Nunes", None), close.clone(), closer.clone()],
        );
        assert_eq!(cache.lookup("Carlos Almeid", None).map(|e| e.id), Some(close.id));
        assert!(cache.lookup("Fernanda Dias", None).is_none());
        assert!(cache.lookup("   ", None).is_none());
    }

    #[test]
    fn test_conflicting_secondary_key_disqualifies() {
        let licensed = entity("Carlos Almeida", Some("CRM-1234"));
        let unlicensed = entity("Carlos Almeida", None);
        let cache = NameCache::new(
            EntityKind::Surgeon,
            vec![licensed.clone(), unlicensed.clone()],
        );

        assert_eq!(
            cache.lookup("Carlos Almeida", Some("crm-1234")).map(|e| e.id),
            Some(licensed.id)
        );
        assert_eq!(
            cache.lookup("Carlos Almeida", Some("CRM-9999")).map(|e| e.id),
            Some(unlicensed.id)
        );
        assert_eq!(
            cache.lookup("Carlos Almeida", None).map(|e| e.id),
            Some(licensed.id)
        );
    }

    #[test]
    fn test_insert_makes_entity_visible() {
        let mut cache = NameCache::new(EntityKind::Hospital, Vec::new());
        assert!(cache.is_empty());
        let created = entity("Hospital Santa Clara", None);
        cache.insert(created.clone());
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.lookup("hospital santa clara", None).map(|e| e.id),
            Some(created.id)
        );
    }
}
