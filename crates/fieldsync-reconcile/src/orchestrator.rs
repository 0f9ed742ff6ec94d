use crate::error::ReconcileError;
use crate::resolver::{merge, ConflictResolver};
use fieldsync_core::identity::reset_layer_from_template;
use fieldsync_core::model::{LayerId, Owner, Partition, PartitionKind, Strategy, UserId};
use fieldsync_core::store::{PartitionStore, StoreError};
use std::collections::HashSet;
use std::sync::Arc;

/// Snapshot of the three partition slices for one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileInput {
    pub private_data: Vec<Partition>,
    pub public_data: Vec<Partition>,
    pub template_data: Vec<Partition>,
}

impl ReconcileInput {
    /// Snapshot all three slices of `store`.
    pub async fn load(store: &dyn PartitionStore) -> Result<Self, StoreError> {
        Ok(Self {
            private_data: store.read_partitions(PartitionKind::Private).await?,
            public_data: store.read_partitions(PartitionKind::Public).await?,
            template_data: store.read_partitions(PartitionKind::Template).await?,
        })
    }

    /// Distinct layer ids: private-derived first, then public, then template.
    pub fn layer_ids(&self) -> Vec<LayerId> {
        let mut seen = HashSet::new();
        self.private_data
            .iter()
            .chain(&self.public_data)
            .chain(&self.template_data)
            .filter(|p| seen.insert(p.layer_id.as_str()))
            .map(|p| p.layer_id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub layers: Vec<LayerId>,
    pub writes: usize,
}

/// Drives the per-layer merge over all three slices and writes the results
/// back to the store.
///
/// Layers are processed one at a time and each layer's writes go out in the
/// order private, public, own-clear, template. A conflict nobody answers
/// stalls the pass; use [`reconcile_until_shutdown`](Self::reconcile_until_shutdown)
/// to bound it.
pub struct DatasetOrchestrator {
    store: Arc<dyn PartitionStore>,
    resolver: Arc<dyn ConflictResolver>,
    own_user_id: UserId,
    strategy: Strategy,
}

impl DatasetOrchestrator {
    pub fn new(
        store: Arc<dyn PartitionStore>,
        resolver: Arc<dyn ConflictResolver>,
        own_user_id: impl Into<UserId>,
    ) -> Self {
        Self {
            store,
            resolver,
            own_user_id: own_user_id.into(),
            strategy: Strategy::Manual,
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn own_user_id(&self) -> &str {
        &self.own_user_id
    }

    pub async fn reconcile(&self, input: &ReconcileInput) -> Result<ReconcileSummary, ReconcileError> {
        let mut summary = ReconcileSummary::default();
        for layer_id in input.layer_ids() {
            self.reconcile_layer(input, &layer_id, &mut summary).await?;
            summary.layers.push(layer_id);
        }
        tracing::info!(
            layers = summary.layers.len(),
            writes = summary.writes,
            "Reconciliation finished"
        );
        Ok(summary)
    }

    /// Read all three slices from the store and reconcile them.
    pub async fn reconcile_from_store(&self) -> Result<ReconcileSummary, ReconcileError> {
        let input = ReconcileInput::load(self.store.as_ref()).await?;
        self.reconcile(&input).await
    }

    /// Run a pass, abandoning it when `shutdown` fires. Layers finished before
    /// the signal keep their writes.
    pub async fn reconcile_until_shutdown(
        &self,
        input: &ReconcileInput,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<ReconcileSummary, ReconcileError> {
        tokio::select! {
            result = self.reconcile(input) => result,
            _ = shutdown.recv() => {
                tracing::warn!("Reconciliation cancelled");
                Err(ReconcileError::Cancelled)
            }
        }
    }

    /// Replace the private partition of `layer_id` with unclaimed copies of
    /// its template records. Returns false when the layer has no template.
    pub async fn reset_layer(&self, layer_id: &str) -> Result<bool, ReconcileError> {
        let templates = self.store.read_partitions(PartitionKind::Template).await?;
        let Some(template) = templates
            .iter()
            .find(|p| p.layer_id == layer_id && p.is_template())
        else {
            tracing::warn!(layer = layer_id, "No template to reset from");
            return Ok(false);
        };
        let reset = reset_layer_from_template(template);
        tracing::info!(layer = layer_id, records = reset.records.len(), "Layer reset to template");
        self.store
            .write_partitions(PartitionKind::Private, vec![reset])
            .await?;
        Ok(true)
    }

    async fn reconcile_layer(
        &self,
        input: &ReconcileInput,
        layer_id: &str,
        summary: &mut ReconcileSummary,
    ) -> Result<(), ReconcileError> {
        let template_item = input.template_data.iter().find(|p| p.layer_id == layer_id);
        let private_items = for_layer(&input.private_data, layer_id);
        let public_items = for_layer(&input.public_data, layer_id);

        if !private_items.is_empty() {
            let merged = merge(
                &private_items,
                template_item,
                &self.own_user_id,
                self.strategy,
                Some(self.resolver.as_ref()),
            )
            .await?;
            self.write(PartitionKind::Private, merged.user_partitions, summary)
                .await?;
            if template_item.is_some() {
                self.write(PartitionKind::Template, merged.template.into_iter().collect(), summary)
                    .await?;
            }
        }

        if !public_items.is_empty() {
            let merged = merge(
                &public_items,
                template_item,
                &self.own_user_id,
                self.strategy,
                Some(self.resolver.as_ref()),
            )
            .await?;
            let own_survived = merged
                .user_partitions
                .iter()
                .any(|p| p.is_owned_by(&self.own_user_id));
            self.write(PartitionKind::Public, merged.user_partitions, summary)
                .await?;

            // The public merge is authoritative for shared state: a stale own
            // copy must be cleared unless it is already empty.
            if !own_survived && !self.own_already_cleared(&public_items) {
                let cleared = Partition::cleared(layer_id, Owner::user(self.own_user_id.as_str()));
                self.write(PartitionKind::Public, vec![cleared], summary)
                    .await?;
            }
            if template_item.is_some() {
                self.write(PartitionKind::Template, merged.template.into_iter().collect(), summary)
                    .await?;
            }
        }

        if private_items.is_empty() && public_items.is_empty() {
            if let Some(template) = template_item {
                self.write(PartitionKind::Template, vec![template.clone()], summary)
                    .await?;
            }
        }

        Ok(())
    }

    fn own_already_cleared(&self, public_items: &[Partition]) -> bool {
        public_items
            .iter()
            .any(|p| p.is_owned_by(&self.own_user_id) && p.records.is_empty())
    }

    async fn write(
        &self,
        kind: PartitionKind,
        partitions: Vec<Partition>,
        summary: &mut ReconcileSummary,
    ) -> Result<(), ReconcileError> {
        let Some(first) = partitions.first() else {
            return Ok(());
        };
        tracing::info!(
            layer = %first.layer_id,
            kind = %kind,
            partitions = partitions.len(),
            records = partitions.iter().map(|p| p.records.len()).sum::<usize>(),
            "Writing merged partitions"
        );
        self.store.write_partitions(kind, partitions).await?;
        summary.writes += 1;
        Ok(())
    }
}

fn for_layer(partitions: &[Partition], layer_id: &str) -> Vec<Partition> {
    partitions
        .iter()
        .filter(|p| p.layer_id == layer_id)
        .cloned()
        .collect()
}
