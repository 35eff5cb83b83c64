// src/reconciliation/batch.rs
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchKind {
    NewProcedures,
    UpdatedProcedures,
    NewBillingRecords,
    UpdatedBillingRecords,
}

impl BatchKind {
    /// Flush order. New procedures come first so billing rows can reference them.
    pub const FLUSH_ORDER: [BatchKind; 4] = [
        BatchKind::NewProcedures,
        BatchKind::UpdatedProcedures,
        BatchKind::NewBillingRecords,
        BatchKind::UpdatedBillingRecords,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            BatchKind::NewProcedures => "new procedures",
            BatchKind::UpdatedProcedures => "updated procedures",
            BatchKind::NewBillingRecords => "new billing records",
            BatchKind::UpdatedBillingRecords => "updated billing records",
        }
    }

    fn writes_billing(&self) -> bool {
        matches!(
            self,
            BatchKind::NewBillingRecords | BatchKind::UpdatedBillingRecords
        )
    }
}

/// Insertion-ordered set of ids waiting to be written.
#[derive(Debug, Default)]
pub struct PendingIds {
    order: Vec<Uuid>,
    members: HashSet<Uuid>,
}

impl PendingIds {
    pub fn push(&mut self, id: Uuid) -> bool {
        if self.members.insert(id) {
            self.order.push(id);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn take(&mut self) -> Vec<Uuid> {
        self.members.clear();
        std::mem::take(&mut self.order)
    }
}

/// The four pending mutation lists of a run. Rows are tracked by id; the orchestrator
/// owns the rows themselves so a flush always writes their latest state.
#[derive(Debug)]
pub struct MutationBatches {
    batch_size: usize,
    new_procedures: PendingIds,
    updated_procedures: PendingIds,
    new_billing_records: PendingIds,
    updated_billing_records: PendingIds,
}

impl MutationBatches {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            new_procedures: PendingIds::default(),
            updated_procedures: PendingIds::default(),
            new_billing_records: PendingIds::default(),
            updated_billing_records: PendingIds::default(),
        }
    }

    pub fn record_new_procedure(&mut self, id: Uuid) {
        self.new_procedures.push(id);
    }

    /// A procedure still waiting to be inserted is written with its latest state anyway.
    pub fn record_updated_procedure(&mut self, id: Uuid) {
        if !self.new_procedures.contains(&id) {
            self.updated_procedures.push(id);
        }
    }

    pub fn record_new_billing_record(&mut self, id: Uuid) {
        self.new_billing_records.push(id);
    }

    pub fn record_updated_billing_record(&mut self, id: Uuid) {
        if !self.new_billing_records.contains(&id) {
            self.updated_billing_records.push(id);
        }
    }

    fn list(&self, kind: BatchKind) -> &PendingIds {
        match kind {
            BatchKind::NewProcedures => &self.new_procedures,
            BatchKind::UpdatedProcedures => &self.updated_procedures,
            BatchKind::NewBillingRecords => &self.new_billing_records,
            BatchKind::UpdatedBillingRecords => &self.updated_billing_records,
        }
    }

    fn list_mut(&mut self, kind: BatchKind) -> &mut PendingIds {
        match kind {
            BatchKind::NewProcedures => &mut self.new_procedures,
            BatchKind::UpdatedProcedures => &mut self.updated_procedures,
            BatchKind::NewBillingRecords => &mut self.new_billing_records,
            BatchKind::UpdatedBillingRecords => &mut self.updated_billing_records,
        }
    }

    pub fn pending(&self, kind: BatchKind) -> usize {
        self.list(kind).len()
    }

    /// Lists to flush now, in flush order. With `force` every non-empty list is due;
    /// otherwise a list is due once it reaches the batch size. Pending new procedures are
    /// pulled in whenever a billing list is due.
    pub fn due(&self, force: bool) -> Vec<BatchKind> {
        let is_due = |kind: BatchKind| {
            let pending = self.pending(kind);
            pending > 0 && (force || pending >= self.batch_size)
        };
        let billing_due = BatchKind::FLUSH_ORDER
            .iter()
            .any(|kind| kind.writes_billing() && is_due(*kind));

        BatchKind::FLUSH_ORDER
            .into_iter()
            .filter(|kind| {
                is_due(*kind)
                    || (*kind == BatchKind::NewProcedures
                        && billing_due
                        && !self.new_procedures.is_empty())
            })
            .collect()
    }

    pub fn take(&mut self, kind: BatchKind) -> Vec<Uuid> {
        self.list_mut(kind).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_ids_dedupe_and_keep_order() {
        let mut ids = PendingIds::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(ids.push(a));
        assert!(ids.push(b));
        assert!(!ids.push(a));
        assert_eq!(ids.take(), vec![a, b]);
        assert!(ids.is_empty());
        assert!(ids.push(a));
    }

    #[test]
    fn test_due_respects_batch_size_and_force() {
        let mut batches = MutationBatches::new(2);
        batches.record_updated_procedure(Uuid::new_v4());
        assert!(batches.due(false).is_empty());
        assert_eq!(batches.due(true), vec![BatchKind::UpdatedProcedures]);

        batches.record_updated_procedure(Uuid::new_v4());
        assert_eq!(batches.due(false), vec![BatchKind::UpdatedProcedures]);
    }

    #[test]
    fn test_new_procedures_flush_before_billing() {
        let mut batches = MutationBatches::new(2);
        batches.record_new_procedure(Uuid::new_v4());
        batches.record_new_billing_record(Uuid::new_v4());
        batches.record_new_billing_record(Uuid::new_v4());
        assert_eq!(
            batches.due(false),
            vec![BatchKind::NewProcedures, BatchKind::NewBillingRecords]
        );
    }

    #[test]
    fn test_unflushed_new_rows_are_not_queued_as_updates() {
        let mut batches = MutationBatches::new(10);
        let procedure = Uuid::new_v4();
        let record = Uuid::new_v4();
        batches.record_new_procedure(procedure);
        batches.record_updated_procedure(procedure);
        batches.record_new_billing_record(record);
        batches.record_updated_billing_record(record);
        assert_eq!(batches.pending(BatchKind::UpdatedProcedures), 0);
        assert_eq!(batches.pending(BatchKind::UpdatedBillingRecords), 0);

        // Once inserted, later changes are updates.
        batches.take(BatchKind::NewProcedures);
        batches.record_updated_procedure(procedure);
        assert_eq!(batches.pending(BatchKind::UpdatedProcedures), 1);
    }
}
