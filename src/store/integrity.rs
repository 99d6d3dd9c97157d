// ============================================================================
// Reference Integrity
// ============================================================================
//
// Assigning a reference field through the store keeps the other side of the
// relation in step: a target that gains the entity is told `retained`, one
// that loses it is told `released`. Each notice rewrites the back-reference
// fields on the target with raw setters and re-saves the target if it was
// persisted. Raw setters never notify anyone, so a cascade is exactly one
// level deep.
//
// ============================================================================

use super::Store;
use crate::core::{LogicalId, Result, StoreError};
use crate::entity::{Entity, GetOptions};
use crate::schema::{EntitySchema, FieldDef, FieldKind};
use std::sync::Arc;
use std::collections::HashSet;
use tracing::{Level, event};

/// One pending cascade step.
enum Notice<'t> {
    /// Caller-held target that now references back.
    Retain(&'t mut Entity),
    /// Stored target that no longer does; loaded when processed.
    Release { entity_type: String, id: LogicalId },
}

/// Who the notices are about.
#[derive(Clone, Copy)]
struct Origin<'a> {
    entity_type: &'a str,
    id: LogicalId,
}

impl Store {
    /// Point a single reference field at `target` (or clear it), notifying
    /// the previous and the new target.
    ///
    /// The entity itself is only modified in memory; the targets are saved.
    /// On failure the entity and the target are restored.
    pub fn assign_reference(
        &self,
        entity: &mut Entity,
        field: &str,
        target: Option<&mut Entity>,
    ) -> Result<()> {
        let def = entity.schema().field(field)?.clone();
        let FieldKind::Reference { target: target_type } = def.kind() else {
            return Err(StoreError::InvalidArgument(format!(
                "{}.{} is not a reference field",
                entity.entity_type(),
                field
            )));
        };

        let mut target = target;
        let new_id = match target.as_deref() {
            Some(t) => Some(Self::target_id(entity, &def, target_type, t)?),
            None => None,
        };
        let old_id = entity.reference_id(field)?;
        if old_id == new_id {
            return Ok(());
        }
        let origin_type = entity.entity_type().to_string();
        let origin = Origin {
            entity_type: &origin_type,
            id: Self::origin_id(entity)?,
        };

        let saved_entity = entity.clone();
        let saved_target = target.as_deref().cloned();
        entity.set_reference_id(field, new_id)?;

        let mut notices = Vec::new();
        if let Some(old) = old_id {
            notices.push(Notice::Release {
                entity_type: target_type.clone(),
                id: old,
            });
        }
        if let Some(t) = target.as_deref_mut() {
            notices.push(Notice::Retain(t));
        }

        if let Err(err) = self.propagate(origin, notices) {
            *entity = saved_entity;
            if let (Some(t), Some(saved)) = (target, saved_target) {
                *t = saved;
            }
            return Err(err);
        }
        Ok(())
    }

    /// Replace a reference-list field with `targets`, notifying every target
    /// that enters or leaves the list.
    pub fn assign_reference_list(
        &self,
        entity: &mut Entity,
        field: &str,
        targets: &mut [Entity],
    ) -> Result<()> {
        let def = entity.schema().field(field)?.clone();
        let FieldKind::ReferenceList { target: target_type } = def.kind() else {
            return Err(StoreError::InvalidArgument(format!(
                "{}.{} is not a reference list field",
                entity.entity_type(),
                field
            )));
        };

        let mut new_ids = Vec::with_capacity(targets.len());
        for t in targets.iter() {
            let id = Self::target_id(entity, &def, target_type, t)?;
            if !new_ids.contains(&id) {
                new_ids.push(id);
            }
        }
        let old_ids = entity.reference_ids(field)?.to_vec();
        if old_ids == new_ids {
            return Ok(());
        }

        let old_set: HashSet<LogicalId> = old_ids.iter().copied().collect();
        let new_set: HashSet<LogicalId> = new_ids.iter().copied().collect();

        let origin_type = entity.entity_type().to_string();
        let origin = Origin {
            entity_type: &origin_type,
            id: Self::origin_id(entity)?,
        };

        let saved_entity = entity.clone();
        let saved_targets = targets.to_vec();
        entity.set_reference_ids(field, new_ids)?;

        let mut notices: Vec<Notice<'_>> = old_ids
            .iter()
            .filter(|id| !new_set.contains(id))
            .map(|id| Notice::Release {
                entity_type: target_type.clone(),
                id: *id,
            })
            .collect();
        let mut entering = HashSet::new();
        for t in targets.iter_mut() {
            let Some(id) = t.logical_id() else { continue };
            if !old_set.contains(&id) && entering.insert(id) {
                notices.push(Notice::Retain(t));
            }
        }

        if let Err(err) = self.propagate(origin, notices) {
            *entity = saved_entity;
            targets.clone_from_slice(&saved_targets);
            return Err(err);
        }
        Ok(())
    }

    /// `target` now references `by`: fill every non-manual back-reference
    /// field of `target` that points at `by`'s type, then re-save `target`
    /// if it was persisted.
    pub fn retained(&self, target: &mut Entity, by: &Entity) -> Result<()> {
        let origin = Origin {
            entity_type: by.entity_type(),
            id: Self::origin_id(by)?,
        };
        self.apply_retain(target, origin)
    }

    /// `target` no longer references `by`: clear `by` out of every
    /// non-manual back-reference field, then re-save `target` if it was
    /// persisted.
    pub fn released(&self, target: &mut Entity, by: &Entity) -> Result<()> {
        let origin = Origin {
            entity_type: by.entity_type(),
            id: Self::origin_id(by)?,
        };
        self.apply_release(target, origin)
    }

    // ========================================================================
    // Cascade
    // ========================================================================

    fn propagate(&self, origin: Origin<'_>, notices: Vec<Notice<'_>>) -> Result<()> {
        if notices.is_empty() {
            return Ok(());
        }
        self.transaction(|| {
            for notice in notices {
                match notice {
                    Notice::Release { entity_type, id } => {
                        let stored =
                            self.get(&entity_type, id, GetOptions::current().uncached())?;
                        match stored {
                            Some(mut target) => self.apply_release(&mut target, origin)?,
                            None => {
                                event!(
                                    Level::DEBUG,
                                    entity = %entity_type,
                                    logical_id = %id,
                                    "released target no longer live"
                                );
                            }
                        }
                    }
                    Notice::Retain(target) => self.apply_retain(target, origin)?,
                }
            }
            Ok(())
        })
    }

    fn apply_retain(&self, target: &mut Entity, origin: Origin<'_>) -> Result<()> {
        let was_persisted = target.is_persisted();
        let schema = Arc::clone(target.schema());
        let mut changed = false;

        for def in Self::back_references(&schema, origin) {
            match def.kind() {
                FieldKind::Reference { .. } => {
                    if target.reference_id(def.name())? != Some(origin.id) {
                        target.set_reference_id(def.name(), Some(origin.id))?;
                        changed = true;
                    }
                }
                FieldKind::ReferenceList { .. } => {
                    let ids = target.reference_ids(def.name())?;
                    if !ids.contains(&origin.id) {
                        let mut ids = ids.to_vec();
                        ids.push(origin.id);
                        target.set_reference_ids(def.name(), ids)?;
                        changed = true;
                    }
                }
                _ => {}
            }
        }

        self.finish_notice(target, was_persisted, changed, "retained")
    }

    fn apply_release(&self, target: &mut Entity, origin: Origin<'_>) -> Result<()> {
        let was_persisted = target.is_persisted();
        let schema = Arc::clone(target.schema());
        let mut changed = false;

        for def in Self::back_references(&schema, origin) {
            match def.kind() {
                FieldKind::Reference { .. } => {
                    if target.reference_id(def.name())? == Some(origin.id) {
                        target.set_reference_id(def.name(), None)?;
                        changed = true;
                    }
                }
                FieldKind::ReferenceList { .. } => {
                    let ids = target.reference_ids(def.name())?;
                    if ids.contains(&origin.id) {
                        let kept = ids.iter().copied().filter(|id| *id != origin.id).collect();
                        target.set_reference_ids(def.name(), kept)?;
                        changed = true;
                    }
                }
                _ => {}
            }
        }

        self.finish_notice(target, was_persisted, changed, "released")
    }

    fn finish_notice(
        &self,
        target: &mut Entity,
        was_persisted: bool,
        changed: bool,
        notice: &str,
    ) -> Result<()> {
        if changed {
            event!(Level::TRACE, target = %target, notice, "back reference updated");
        }
        if was_persisted && changed {
            self.save(target)?;
        }
        Ok(())
    }

    fn back_references<'s>(
        schema: &'s EntitySchema,
        origin: Origin<'s>,
    ) -> impl Iterator<Item = &'s FieldDef> + 's {
        schema
            .reference_fields_to(origin.entity_type)
            .filter(|def| !def.is_manual())
    }

    fn origin_id(entity: &Entity) -> Result<LogicalId> {
        entity.logical_id().ok_or_else(|| {
            StoreError::InvalidState(format!("{} has no logical id", entity))
        })
    }

    fn target_id(
        entity: &Entity,
        def: &FieldDef,
        target_type: &str,
        target: &Entity,
    ) -> Result<LogicalId> {
        if target.entity_type() != target_type {
            return Err(StoreError::validation(
                entity.entity_type(),
                def.name(),
                format!("expected a {}, got a {}", target_type, target.entity_type()),
            ));
        }
        Self::origin_id(target)
    }
}
