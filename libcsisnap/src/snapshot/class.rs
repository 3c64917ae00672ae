//! Snapshot class resolution for a claim's provisioner.

use tracing::{debug, instrument};

use crate::client::{Clients, Selector};
use crate::error::SnapshotError;
use crate::labels;
use crate::types::{Backup, PersistentVolumeClaim, VolumeSnapshotClass};

/// Pick the snapshot class for `driver`.
///
/// Priority: the claim's class annotation, then the backup's per-driver
/// annotation, then a scan of all classes. A scan prefers the class carrying
/// the selector label and accepts a sole driver match without it. Named
/// classes must belong to `driver`.
#[instrument(skip_all, fields(driver = %driver))]
pub async fn resolve(
    clients: &Clients,
    driver: &str,
    claim: &PersistentVolumeClaim,
    backup: &Backup,
) -> Result<VolumeSnapshotClass, SnapshotError> {
    if let Some(name) = labels::annotation(&claim.metadata, labels::SNAPSHOT_CLASS_SELECTOR) {
        debug!(class = %name, "using class from claim annotation");
        return named(clients, driver, name).await;
    }

    let backup_key = format!(
        "{}{}",
        labels::BACKUP_SNAPSHOT_CLASS_PREFIX,
        driver.to_lowercase()
    );
    if let Some(name) = labels::annotation(&backup.metadata, &backup_key) {
        debug!(class = %name, "using class from backup annotation");
        return named(clients, driver, name).await;
    }

    let classes = clients.snapshot_classes.list("", &Selector::new()).await?;
    pick(driver, classes)
}

async fn named(
    clients: &Clients,
    driver: &str,
    name: &str,
) -> Result<VolumeSnapshotClass, SnapshotError> {
    let class = clients.snapshot_classes.get("", name).await?;
    if class.driver != driver {
        return Err(SnapshotError::NoSnapshotClass {
            driver: driver.to_owned(),
            reason: format!("class {name} belongs to driver {}", class.driver),
        });
    }
    Ok(class)
}

fn pick(driver: &str, classes: Vec<VolumeSnapshotClass>) -> Result<VolumeSnapshotClass, SnapshotError> {
    let mut matching: Vec<VolumeSnapshotClass> =
        classes.into_iter().filter(|c| c.driver == driver).collect();

    if let Some(i) = matching.iter().position(|c| {
        labels::label(&c.metadata, labels::SNAPSHOT_CLASS_SELECTOR).is_some()
    }) {
        return Ok(matching.swap_remove(i));
    }

    match matching.len() {
        1 => Ok(matching.swap_remove(0)),
        0 => Err(SnapshotError::NoSnapshotClass {
            driver: driver.to_owned(),
            reason: "no class uses this driver".to_owned(),
        }),
        n => Err(SnapshotError::NoSnapshotClass {
            driver: driver.to_owned(),
            reason: format!(
                "{n} classes use this driver, label the desired one with {}",
                labels::SNAPSHOT_CLASS_SELECTOR
            ),
        }),
    }
}
