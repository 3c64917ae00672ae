use async_trait::async_trait;

use crate::action::backup::class::list_secret;
use crate::action::{
    GroupResource, ResourceSelector, RestoreItemAction, RestoreItemInput, RestoreItemOutput,
};
use crate::error::SnapshotError;

/// Restores the class's list secret along with it.
#[derive(Default)]
pub struct ClassRestorer;

impl ClassRestorer {
    /// Registration name.
    pub const NAME: &'static str = "velero.io/csi-volumesnapshotclass-restorer";
}

#[async_trait]
impl RestoreItemAction for ClassRestorer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn applies_to(&self) -> ResourceSelector {
        ResourceSelector::resource(GroupResource::VOLUME_SNAPSHOT_CLASSES)
    }

    async fn execute(&self, input: RestoreItemInput) -> Result<RestoreItemOutput, SnapshotError> {
        let secret = list_secret(&input.item)?;
        let mut output = RestoreItemOutput::passthrough(input.item);
        output.additional_items.extend(secret);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::action::ResourceIdentifier;
    use crate::labels;
    use crate::testutil::Fixture;

    #[tokio::test]
    async fn list_secret_is_restored() {
        let fx = Fixture::new();
        let item = json!({
            "metadata": {
                "name": "csi-hostpath",
                "annotations": {
                    (labels::SNAPSHOTTER_LIST_SECRET_NAME): "lister",
                    (labels::SNAPSHOTTER_LIST_SECRET_NAMESPACE): "kube-system"
                }
            },
            "driver": "hostpath.csi.k8s.io"
        });
        let out = ClassRestorer
            .execute(RestoreItemInput {
                item: item.clone(),
                item_from_backup: item,
                restore: fx.restore(),
            })
            .await
            .unwrap();
        assert_eq!(
            out.additional_items,
            vec![ResourceIdentifier::new(GroupResource::SECRETS, "kube-system", "lister")]
        );
    }
}
