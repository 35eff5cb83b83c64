// src/resolution/resolvers.rs
use anyhow::{Context, Result};
use log::{debug, info};
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::core::{EntityKind, EntityRefs, NamedEntity};
use crate::models::guide::Guide;
use crate::resolution::entity_cache::NameCache;
use crate::store::ReconcileStore;

/// Find-or-create for the four named entity kinds of one tenant. Caches are loaded once per
/// run; anything created is written immediately and joins the cache.
pub struct EntityResolver {
    group_id: Uuid,
    caches: HashMap<EntityKind, NameCache>,
    created: HashMap<EntityKind, usize>,
}

impl EntityResolver {
    pub async fn load(store: &dyn ReconcileStore, group_id: Uuid) -> Result<Self> {
        let mut caches = HashMap::new();
        for kind in EntityKind::ALL {
            let rows = store
                .load_entities(group_id, kind)
                .await
                .with_context(|| format!("Failed to load {} cache", kind.label()))?;
            let cache = NameCache::new(kind, rows);
            debug!(
                "Loaded {} {} rows for group {}",
                cache.len(),
                cache.kind().label(),
                group_id
            );
            caches.insert(kind, cache);
        }
        Ok(Self {
            group_id,
            caches,
            created: HashMap::new(),
        })
    }

    fn cache(&self, kind: EntityKind) -> Option<&NameCache> {
        self.caches.get(&kind)
    }

    pub fn name_of(&self, kind: EntityKind, id: &Uuid) -> Option<&str> {
        self.cache(kind).and_then(|cache| cache.name_of(id))
    }

    pub fn created_counts(&self) -> &HashMap<EntityKind, usize> {
        &self.created
    }

    /// Resolves `name` to an entity id, creating the entity when nothing matches.
    /// Blank or absent names resolve to `None` and create nothing.
    pub async fn resolve(
        &mut self,
        store: &dyn ReconcileStore,
        kind: EntityKind,
        name: Option<&str>,
        secondary_key: Option<&str>,
    ) -> Result<Option<Uuid>> {
        let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        let secondary_key = secondary_key.map(str::trim).filter(|k| !k.is_empty());

        let cache = self
            .caches
            .entry(kind)
            .or_insert_with(|| NameCache::new(kind, Vec::new()));
        if let Some(found) = cache.lookup(name, secondary_key) {
            return Ok(Some(found.id));
        }

        let entity = NamedEntity {
            id: Uuid::new_v4(),
            group_id: self.group_id,
            kind,
            name: name.to_string(),
            secondary_key: secondary_key.map(str::to_string),
        };
        store
            .insert_entity(&entity)
            .await
            .with_context(|| format!("Failed to create {} '{}'", kind.label(), name))?;
        info!("Created {} '{}' ({})", kind.label(), name, entity.id);

        let id = entity.id;
        cache.insert(entity);
        *self.created.entry(kind).or_insert(0) += 1;
        Ok(Some(id))
    }

    /// Resolves every entity a guide names, limited to the kinds `wanted` accepts.
    pub async fn resolve_guide<F>(
        &mut self,
        store: &dyn ReconcileStore,
        guide: &Guide,
        wanted: F,
    ) -> Result<EntityRefs>
    where
        F: Fn(EntityKind) -> bool + Send,
    {
        let mut refs = EntityRefs::default();
        if wanted(EntityKind::Surgeon) {
            refs.surgeon = self
                .resolve(
                    store,
                    EntityKind::Surgeon,
                    guide.surgeon_name.as_deref(),
                    guide.surgeon_license.as_deref(),
                )
                .await?;
        }
        if wanted(EntityKind::Hospital) {
            refs.hospital = self
                .resolve(store, EntityKind::Hospital, guide.hospital_name.as_deref(), None)
                .await?;
        }
        if wanted(EntityKind::Anesthesiologist) {
            refs.cooperating_clinician = self
                .resolve(
                    store,
                    EntityKind::Anesthesiologist,
                    guide.cooperating_clinician_name.as_deref(),
                    None,
                )
                .await?;
        }
        if wanted(EntityKind::ProcedureDetail) {
            refs.principal_procedure = self
                .resolve(
                    store,
                    EntityKind::ProcedureDetail,
                    guide.procedure_name(),
                    guide.procedure_code.as_deref(),
                )
                .await?;
        }
        Ok(refs)
    }
}
